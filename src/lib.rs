//! Candle-MagicTime: checkpoint hot-swap and generation control for the
//! MagicTime time-lapse video diffusion stack.
//!
//! The crate keeps a live text encoder, VAE and 3D U-Net in memory and lets
//! callers swap style ("DreamBooth") and motion checkpoints into them before
//! sampling. Style checkpoints arrive in the single-file LDM layout and are
//! rewritten into the diffusers layout by rule tables; motion checkpoints
//! already use the live naming and are merged strictly.

pub mod config;
pub mod convert;
pub mod error;
pub mod graph;
pub mod handler;
pub mod loader;
pub mod merge;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod store;
pub mod utils;
pub mod video;

pub use config::MagicTimeConfig;
pub use error::{Error, Result};
pub use graph::{Architecture, Component, ManifestArchitecture, ModelGraph, TextEncoderTemplate};
pub use handler::{GenerationRequest, GenerationResult, RequestHandler};
pub use pipeline::{PreviewPipeline, SamplingPipeline};
pub use queue::{GenerationQueue, Job, JobOutput};
pub use session::{AdapterInjector, ModelSession, NoAdapters};
pub use store::{CheckpointFamily, CheckpointStore};
pub use video::{GifWriter, VideoWriter};
