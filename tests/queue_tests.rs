//! Single-worker queue tests

mod common;

use candle_core::Tensor;
use candle_magictime::graph::ModelGraph;
use candle_magictime::pipeline::{SampleRequest, SamplingPipeline};
use candle_magictime::{Error, GenerationQueue, GifWriter, Job, JobOutput, RequestHandler};
use common::*;
use crossbeam_channel::{Receiver, Sender};

/// Signals when sampling starts, then blocks until released
struct GatedPipeline {
    started: Sender<()>,
    release: Receiver<()>,
}

impl SamplingPipeline for GatedPipeline {
    fn sample(
        &mut self,
        graph: &ModelGraph,
        request: &SampleRequest,
    ) -> candle_core::Result<Tensor> {
        let _ = self.started.send(());
        let _ = self.release.recv();
        Tensor::full(0.25f32, (1, 3, request.video_length, 8, 8), graph.device())
    }
}

#[test]
fn test_jobs_run_in_submission_order() {
    let fx = fixture();
    let session = loaded_session(&fx);
    let pipeline = RecordingPipeline::default();
    let handler = RequestHandler::from_config(pipeline.clone(), GifWriter::default(), &fx.config);
    let queue = GenerationQueue::spawn(session, handler, 4).unwrap();

    let swap = queue.submit(Job::SwapStyle(TOON.to_string())).unwrap();
    let generate = queue
        .submit(Job::Generate(request(TOON, MOTION, "5")))
        .unwrap();

    match swap.wait().unwrap() {
        JobOutput::Swapped(report) => assert_eq!(report.id, TOON),
        other => panic!("unexpected output: {other:?}"),
    }
    match generate.wait().unwrap() {
        JobOutput::Generated(result) => {
            // the explicit swap already brought the session in sync
            assert_eq!(result.sync.swaps(), 0);
            assert_eq!(result.config.dreambooth, TOON);
            assert_eq!(result.resolved_seed, 5);
        }
        other => panic!("unexpected output: {other:?}"),
    }
    assert_eq!(pipeline.calls().len(), 1);
    queue.shutdown().unwrap();
}

#[test]
fn test_failed_job_does_not_stop_worker() {
    let fx = fixture();
    let session = loaded_session(&fx);
    let handler =
        RequestHandler::from_config(RecordingPipeline::default(), GifWriter::default(), &fx.config);
    let queue = GenerationQueue::spawn(session, handler, 4).unwrap();

    let err = queue
        .submit(Job::SwapStyle("missing".to_string()))
        .unwrap()
        .wait()
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let output = queue
        .submit(Job::SwapMotion(MOTION.to_string()))
        .unwrap()
        .wait()
        .unwrap();
    assert!(matches!(output, JobOutput::Swapped(ref report) if report.id == MOTION));
}

#[test]
fn test_full_queue_rejects_submission() {
    let fx = fixture();
    let session = loaded_session(&fx);
    let (started_tx, started_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    let pipeline = GatedPipeline {
        started: started_tx,
        release: release_rx,
    };
    let handler = RequestHandler::from_config(pipeline, GifWriter::default(), &fx.config);
    let queue = GenerationQueue::spawn(session, handler, 1).unwrap();

    let running = queue
        .submit(Job::Generate(request(REALISTIC, MOTION, "1")))
        .unwrap();
    started_rx.recv().unwrap();

    // one slot behind the running job
    let waiting = queue
        .submit(Job::Generate(request(REALISTIC, MOTION, "2")))
        .unwrap();
    assert_eq!(queue.pending(), 1);
    let err = queue
        .submit(Job::Generate(request(REALISTIC, MOTION, "3")))
        .err()
        .unwrap();
    assert!(matches!(err, Error::QueueFull));

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
    assert!(matches!(running.wait().unwrap(), JobOutput::Generated(ref r) if r.resolved_seed == 1));
    assert!(matches!(waiting.wait().unwrap(), JobOutput::Generated(ref r) if r.resolved_seed == 2));
    queue.shutdown().unwrap();
}

#[test]
fn test_shutdown_drains_pending_jobs() {
    let fx = fixture();
    let session = loaded_session(&fx);
    let handler =
        RequestHandler::from_config(RecordingPipeline::default(), GifWriter::default(), &fx.config);
    let queue = GenerationQueue::spawn(session, handler, 8).unwrap();

    let tickets: Vec<_> = [TOON, REALISTIC, TOON]
        .into_iter()
        .map(|id| queue.submit(Job::SwapStyle(id.to_string())).unwrap())
        .collect();
    queue.shutdown().unwrap();

    let ids: Vec<String> = tickets
        .into_iter()
        .map(|ticket| match ticket.wait().unwrap() {
            JobOutput::Swapped(report) => report.id,
            other => panic!("unexpected output: {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec![TOON, REALISTIC, TOON]);
}
