//! Configuration structures for the MagicTime controller

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::loader::{LoaderError, load_model_config};

/// Hugging Face repo holding the base CLIP text model
pub const DEFAULT_TEXT_MODEL_REPO: &str = "openai/clip-vit-large-patch14";

/// Top-level configuration: filesystem layout, inference parameters, and the
/// block layouts the checkpoint translator is generated from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MagicTimeConfig {
    /// Root directory all relative paths are resolved against
    pub base_dir: PathBuf,
    /// Diffusers-layout Stable Diffusion 1.5 directory (unet/, vae/)
    pub pretrained_model_path: PathBuf,
    /// Motion checkpoints (`*.ckpt`, `*.safetensors`)
    pub motion_module_dir: PathBuf,
    /// Style ("DreamBooth") checkpoints (`*.safetensors`)
    pub dreambooth_dir: PathBuf,
    /// Where the generated artifact is written
    pub output_dir: PathBuf,
    /// Source of the base text encoder template
    pub text_model: TextModelSource,
    /// Spatial low-rank adapter merged into the U-Net at startup
    pub magic_adapter_s_path: PathBuf,
    /// Temporal adapter handed to the adapter injector
    pub magic_adapter_t_path: PathBuf,
    /// Text encoder adapter handed to the adapter injector
    pub magic_text_encoder_path: PathBuf,
    /// Maximum number of queued jobs
    pub queue_capacity: usize,
    pub inference: InferenceConfig,
    pub unet: UnetLayout,
    pub vae: VaeLayout,
}

impl Default for MagicTimeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            pretrained_model_path: PathBuf::from("ckpts/Base_Model/stable-diffusion-v1-5"),
            motion_module_dir: PathBuf::from("ckpts/Base_Model/motion_module"),
            dreambooth_dir: PathBuf::from("ckpts/DreamBooth"),
            output_dir: PathBuf::from("outputs"),
            text_model: TextModelSource::default(),
            magic_adapter_s_path: PathBuf::from(
                "ckpts/Magic_Weights/magic_adapter_s/magic_adapter_s.ckpt",
            ),
            magic_adapter_t_path: PathBuf::from("ckpts/Magic_Weights/magic_adapter_t"),
            magic_text_encoder_path: PathBuf::from("ckpts/Magic_Weights/magic_text_encoder"),
            queue_capacity: 20,
            inference: InferenceConfig::default(),
            unet: UnetLayout::default(),
            vae: VaeLayout::default(),
        }
    }
}

impl MagicTimeConfig {
    /// Defaults rooted at `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, LoaderError> {
        load_model_config(path)
    }

    /// Resolve a configured path against `base_dir` (absolute paths pass through)
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn unet_dir(&self) -> PathBuf {
        self.resolve(&self.pretrained_model_path).join("unet")
    }

    pub fn vae_dir(&self) -> PathBuf {
        self.resolve(&self.pretrained_model_path).join("vae")
    }
}

/// Where the base text encoder weights come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextModelSource {
    /// A local safetensors file (resolved against `base_dir`)
    Local(PathBuf),
    /// A Hugging Face hub repo; `model.safetensors` is fetched and cached
    Hub(String),
}

impl Default for TextModelSource {
    fn default() -> Self {
        TextModelSource::Hub(DEFAULT_TEXT_MODEL_REPO.to_string())
    }
}

/// Fixed sampling parameters handed to the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Number of denoising steps
    pub num_inference_steps: usize,
    /// Classifier-free guidance scale
    pub guidance_scale: f64,
    /// Number of frames per video
    pub video_length: usize,
    /// Playback rate of the written artifact
    pub fps: u32,
    pub scheduler: SchedulerConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: 25,
            guidance_scale: 8.0,
            video_length: 16,
            fps: 8,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// DDIM noise scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of training timesteps (typically 1000)
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    /// "linear" or "scaled_linear"
    pub beta_schedule: String,
    pub steps_offset: usize,
    pub clip_sample: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "linear".to_string(),
            steps_offset: 1,
            clip_sample: false,
        }
    }
}

/// Block layout of the diffusion backbone, used to generate U-Net rewrite rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnetLayout {
    /// Number of down (and up) blocks
    pub num_blocks: usize,
    /// Resnets per down block; up blocks carry one more
    pub layers_per_block: usize,
}

impl Default for UnetLayout {
    fn default() -> Self {
        Self {
            num_blocks: 4,
            layers_per_block: 2,
        }
    }
}

/// Block layout of the image autoencoder, used to generate VAE rewrite rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaeLayout {
    /// Number of encoder down blocks (and decoder up blocks)
    pub num_blocks: usize,
}

impl Default for VaeLayout {
    fn default() -> Self {
        Self { num_blocks: 4 }
    }
}
