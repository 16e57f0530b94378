//! Single-worker job queue
//!
//! The worker thread owns the [`ModelSession`] and the [`RequestHandler`];
//! every swap and generation runs there, one at a time, in submission order.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handler::{GenerationRequest, GenerationResult, RequestHandler};
use crate::pipeline::SamplingPipeline;
use crate::session::{ModelSession, SwapReport};
use crate::video::VideoWriter;

/// Default number of jobs that may wait behind the running one
pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, Clone)]
pub enum Job {
    /// Style dropdown changed
    SwapStyle(String),
    /// Motion dropdown changed
    SwapMotion(String),
    Generate(GenerationRequest),
}

#[derive(Debug, Clone)]
pub enum JobOutput {
    Swapped(SwapReport),
    Generated(GenerationResult),
}

struct Envelope {
    job: Job,
    reply: Sender<Result<JobOutput>>,
}

/// Handle to a submitted job's eventual output
pub struct Ticket {
    rx: Receiver<Result<JobOutput>>,
}

impl Ticket {
    /// Block until the worker has run the job
    pub fn wait(self) -> Result<JobOutput> {
        self.rx.recv().map_err(|_| Error::QueueClosed)?
    }
}

pub struct GenerationQueue {
    tx: Option<Sender<Envelope>>,
    worker: Option<JoinHandle<()>>,
}

impl GenerationQueue {
    /// Move the session and handler onto a new worker thread
    pub fn spawn<P, W>(
        mut session: ModelSession,
        mut handler: RequestHandler<P, W>,
        capacity: usize,
    ) -> Result<Self>
    where
        P: SamplingPipeline + 'static,
        W: VideoWriter + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded::<Envelope>(capacity.max(1));

        let worker = thread::Builder::new()
            .name("magictime-worker".to_string())
            .spawn(move || {
                for Envelope { job, reply } in rx.iter() {
                    let output = run_job(&mut session, &mut handler, job);
                    // the submitter may have dropped its ticket
                    let _ = reply.send(output);
                }
                debug!("generation worker stopped");
            })?;

        info!(capacity, "generation queue started");
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Enqueue a job without blocking
    pub fn submit(&self, job: Job) -> Result<Ticket> {
        let tx = self.tx.as_ref().ok_or(Error::QueueClosed)?;
        let (reply, rx) = crossbeam_channel::bounded(1);
        tx.try_send(Envelope { job, reply }).map_err(|err| match err {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Disconnected(_) => Error::QueueClosed,
        })?;
        Ok(Ticket { rx })
    }

    /// Jobs waiting behind the running one
    pub fn pending(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    /// Stop accepting jobs, drain the queue and join the worker
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.tx.take();
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| Error::QueueClosed),
            None => Ok(()),
        }
    }
}

impl Drop for GenerationQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_job<P: SamplingPipeline, W: VideoWriter>(
    session: &mut ModelSession,
    handler: &mut RequestHandler<P, W>,
    job: Job,
) -> Result<JobOutput> {
    match job {
        Job::SwapStyle(id) => session.swap_style(&id).map(JobOutput::Swapped),
        Job::SwapMotion(id) => session.swap_motion(&id).map(JobOutput::Swapped),
        Job::Generate(request) => handler.handle(session, &request).map(JobOutput::Generated),
    }
}
