//! Sampling pipeline collaborator
//!
//! The diffusion sampler is external: the handler hands it the live graph
//! and a [`SampleRequest`] and gets frames back. [`PreviewPipeline`] is a
//! stand-in that needs no network code; its output depends only on the
//! seed, the prompt and the current backbone parameters.

use candle_core::{DType, Device, Tensor};

use crate::config::{InferenceConfig, SchedulerConfig};
use crate::graph::{Component, ModelGraph};
use crate::utils::rng::Pcg32;

/// VAE spatial downsampling factor
pub const LATENT_SCALE: usize = 8;

/// Everything the sampler is called with
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub video_length: usize,
    pub seed: u64,
    pub scheduler: SchedulerConfig,
}

impl SampleRequest {
    /// Request with the fixed sampling parameters from `inference`
    pub fn with_inference(
        prompt: impl Into<String>,
        negative_prompt: impl Into<String>,
        width: usize,
        height: usize,
        seed: u64,
        inference: &InferenceConfig,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: negative_prompt.into(),
            width,
            height,
            num_inference_steps: inference.num_inference_steps,
            guidance_scale: inference.guidance_scale,
            video_length: inference.video_length,
            seed,
            scheduler: inference.scheduler.clone(),
        }
    }
}

/// External text-to-video sampler
pub trait SamplingPipeline: Send {
    /// Produce frames `[B, C, F, H, W]` with values in `[0, 1]`. The same
    /// request against the same graph must yield the same frames.
    fn sample(&mut self, graph: &ModelGraph, request: &SampleRequest) -> candle_core::Result<Tensor>;
}

/// Seeded noise preview
///
/// Two keyframes of latent-resolution noise are blended across the clip,
/// upsampled to the requested size and shifted by a fingerprint of the
/// backbone, so swapping checkpoints visibly changes the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewPipeline;

impl PreviewPipeline {
    pub fn new() -> Self {
        Self
    }
}

impl SamplingPipeline for PreviewPipeline {
    fn sample(&mut self, graph: &ModelGraph, request: &SampleRequest) -> candle_core::Result<Tensor> {
        let device = graph.device();
        let frames = request.video_length.max(1);
        let lat_h = (request.height / LATENT_SCALE).max(1);
        let lat_w = (request.width / LATENT_SCALE).max(1);

        let mut rng = Pcg32::new(request.seed, prompt_stream(&request.prompt));
        let first = rng.randn((1, 3, lat_h, lat_w), device)?;
        let last = rng.randn((1, 3, lat_h, lat_w), device)?;

        let shift = unet_fingerprint(graph)?;
        // larger guidance gives a higher-contrast preview
        let contrast = (request.guidance_scale / 8.0).clamp(0.25, 4.0) * 0.5;

        let mut video = Vec::with_capacity(frames);
        for t in 0..frames {
            let alpha = if frames > 1 {
                t as f64 / (frames - 1) as f64
            } else {
                0.0
            };
            let frame = ((first.affine(1.0 - alpha, 0.0)? + last.affine(alpha, 0.0)?)?
                .affine(contrast, shift)?)
            .upsample_nearest2d(request.height, request.width)?;
            video.push(candle_nn::ops::sigmoid(&frame)?);
        }

        Tensor::stack(&video, 2)
    }
}

/// Mean of the per-parameter means of the backbone, in name order
pub fn unet_fingerprint(graph: &ModelGraph) -> candle_core::Result<f64> {
    let vars = graph
        .params(Component::Unet)
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("parameter map lock poisoned".to_string()))?;

    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    let mut total = 0.0f64;
    for name in &names {
        let mean = vars[name.as_str()]
            .as_tensor()
            .to_dtype(DType::F32)?
            .mean_all()?
            .to_scalar::<f32>()?;
        total += f64::from(mean);
    }
    Ok(if names.is_empty() {
        0.0
    } else {
        total / names.len() as f64
    })
}

/// FNV-1a hash of the prompt, used as the PCG stream selector
fn prompt_stream(prompt: &str) -> u64 {
    prompt
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
        })
}

/// Frames tensor on the CPU as `f32`, for writers
pub(crate) fn frames_to_cpu(frames: &Tensor) -> candle_core::Result<Tensor> {
    frames.to_device(&Device::Cpu)?.to_dtype(DType::F32)
}
