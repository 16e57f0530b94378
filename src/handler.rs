//! Generation request handler
//!
//! One request runs through `Idle → Syncing → Sampling → Done`, or stops in
//! `Failed` with the triggering error returned unchanged. Checkpoint swaps
//! happen only when the request names a checkpoint other than the one the
//! session currently holds, style before motion.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{InferenceConfig, MagicTimeConfig};
use crate::error::{Error, Result};
use crate::pipeline::{SampleRequest, SamplingPipeline};
use crate::session::{ModelSession, SwapReport};
use crate::store::CheckpointFamily;
use crate::video::VideoWriter;

/// Upper bound of randomly drawn seeds
pub const MAX_RANDOM_SEED: u64 = 10_000_000_000_000_000;

/// Width and height accepted by the UI sliders
pub const MIN_SIDE: usize = 256;
pub const MAX_SIDE: usize = 1024;
pub const SIDE_STEP: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    /// Seed as typed; zero or negative draws a random seed
    pub seed: String,
    pub style_id: String,
    pub motion_id: String,
}

impl GenerationRequest {
    fn validate(&self) -> Result<()> {
        for (name, side) in [("width", self.width), ("height", self.height)] {
            if !(MIN_SIDE..=MAX_SIDE).contains(&side) || side % SIDE_STEP != 0 {
                return Err(Error::InvalidRequest(format!(
                    "{name} must be a multiple of {SIDE_STEP} in {MIN_SIDE}..={MAX_SIDE}, got {side}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandlerState {
    Idle,
    Syncing,
    Sampling,
    Done,
    Failed,
}

/// Request parameters echoed back with the result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoedConfig {
    pub prompt: String,
    pub n_prompt: String,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
    pub dreambooth: String,
}

/// Swaps performed while syncing; `None` means the slot was already current
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub style: Option<SwapReport>,
    pub motion: Option<SwapReport>,
}

impl SyncReport {
    pub fn swaps(&self) -> usize {
        usize::from(self.style.is_some()) + usize::from(self.motion.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub video_path: PathBuf,
    pub resolved_seed: u64,
    pub config: EchoedConfig,
    pub sync: SyncReport,
}

/// Parse a seed field
///
/// Positive integers are used verbatim. Zero or negative draws uniformly from
/// `1..=MAX_RANDOM_SEED`.
pub fn resolve_seed<R: Rng + ?Sized>(text: &str, rng: &mut R) -> Result<u64> {
    let value: i128 = text
        .trim()
        .parse()
        .map_err(|_| Error::InvalidSeed(text.to_string()))?;
    if value > 0 {
        u64::try_from(value).map_err(|_| Error::InvalidSeed(text.to_string()))
    } else {
        Ok(rng.gen_range(1..=MAX_RANDOM_SEED))
    }
}

/// Bring the session in line with the request's checkpoints
pub fn sync_session(session: &mut ModelSession, request: &GenerationRequest) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    if !session.is_current(CheckpointFamily::Style, &request.style_id) {
        report.style = Some(session.swap_style(&request.style_id)?);
    }
    if !session.is_current(CheckpointFamily::Motion, &request.motion_id) {
        report.motion = Some(session.swap_motion(&request.motion_id)?);
    }
    Ok(report)
}

pub struct RequestHandler<P, W> {
    pipeline: P,
    writer: W,
    inference: InferenceConfig,
    output_dir: PathBuf,
    rng: StdRng,
    history: Vec<HandlerState>,
}

impl<P: SamplingPipeline, W: VideoWriter> RequestHandler<P, W> {
    pub fn new(
        pipeline: P,
        writer: W,
        inference: InferenceConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            writer,
            inference,
            output_dir: output_dir.into(),
            rng: StdRng::from_entropy(),
            history: Vec::new(),
        }
    }

    pub fn from_config(pipeline: P, writer: W, config: &MagicTimeConfig) -> Self {
        Self::new(
            pipeline,
            writer,
            config.inference.clone(),
            config.resolve(&config.output_dir),
        )
    }

    /// Seed the generator used for random seeds
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Fixed artifact path, overwritten by every generation
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("sample.{}", self.writer.extension()))
    }

    /// State of the last handled request
    pub fn state(&self) -> HandlerState {
        self.history.last().copied().unwrap_or(HandlerState::Idle)
    }

    /// States the last request passed through
    pub fn history(&self) -> &[HandlerState] {
        &self.history
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn handle(
        &mut self,
        session: &mut ModelSession,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        self.history.clear();
        self.enter(HandlerState::Idle);

        match self.run(session, request) {
            Ok(result) => {
                self.enter(HandlerState::Done);
                Ok(result)
            }
            Err(err) => {
                self.enter(HandlerState::Failed);
                warn!(error = %err, "generation failed");
                Err(err)
            }
        }
    }

    fn run(
        &mut self,
        session: &mut ModelSession,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        request.validate()?;
        let seed = resolve_seed(&request.seed, &mut self.rng)?;
        info!(seed, "resolved seed");

        self.enter(HandlerState::Syncing);
        let sync = sync_session(session, request)?;

        self.enter(HandlerState::Sampling);
        let sample = SampleRequest::with_inference(
            request.prompt.clone(),
            request.negative_prompt.clone(),
            request.width,
            request.height,
            seed,
            &self.inference,
        );
        let frames = self.pipeline.sample(session.graph(), &sample)?;

        let video_path = self.persist(&frames)?;
        Ok(GenerationResult {
            video_path,
            resolved_seed: seed,
            config: EchoedConfig {
                prompt: request.prompt.clone(),
                n_prompt: request.negative_prompt.clone(),
                width: request.width,
                height: request.height,
                seed,
                dreambooth: request.style_id.clone(),
            },
            sync,
        })
    }

    /// Write to a sibling file first so a failed encode leaves no artifact
    fn persist(&self, frames: &candle_core::Tensor) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.artifact_path();
        let partial = partial_path(&path);

        if let Err(err) = self.writer.write(frames, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
        fs::rename(&partial, &path)?;
        info!(path = %path.display(), "saved generation");
        Ok(path)
    }

    fn enter(&mut self, state: HandlerState) {
        info!(state = ?state, "handler state");
        self.history.push(state);
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}
