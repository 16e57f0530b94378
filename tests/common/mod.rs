//! Shared on-disk fixtures: a miniature MagicTime checkpoint tree with tiny
//! tensors under a temp dir.

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use candle_magictime::config::TextModelSource;
use candle_magictime::convert::StyleTranslators;
use candle_magictime::graph::{GraphSchema, ModelGraph};
use candle_magictime::loader::StateDict;
use candle_magictime::pipeline::{SampleRequest, SamplingPipeline};
use candle_magictime::{
    CheckpointStore, Component, GenerationRequest, MagicTimeConfig, ManifestArchitecture,
    ModelSession, NoAdapters, TextEncoderTemplate,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const REALISTIC: &str = "RealisticVisionV60B1_v51VAE";
pub const TOON: &str = "ToonYou_beta6";
pub const MOTION: &str = "motion_module";

/// Value every base parameter starts with
pub const BASE: f32 = 0.25;
pub const REALISTIC_VALUE: f32 = 1.0;
pub const TOON_VALUE: f32 = 2.0;
pub const MOTION_VALUE: f32 = 3.0;
pub const TEXT_BASE: f32 = 0.5;

pub const MOTION_KEYS: &[(&str, &[usize])] = &[
    (
        "down_blocks.0.motion_modules.0.temporal_transformer.proj_in.weight",
        &[4, 4],
    ),
    (
        "down_blocks.0.motion_modules.0.temporal_transformer.proj_in.bias",
        &[4],
    ),
];

pub const UNET_KEYS: &[(&str, &[usize])] = &[
    ("conv_in.weight", &[4, 4]),
    ("conv_in.bias", &[4]),
    ("down_blocks.0.resnets.0.norm1.weight", &[4]),
    (
        "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight",
        &[4, 4],
    ),
    ("mid_block.resnets.0.conv1.weight", &[4, 4]),
    ("up_blocks.0.upsamplers.0.conv.weight", &[4, 4]),
    ("conv_out.weight", &[4, 4]),
];

pub const VAE_KEYS: &[(&str, &[usize])] = &[
    ("encoder.mid_block.attentions.0.to_q.weight", &[4, 4]),
    ("decoder.up_blocks.3.resnets.0.conv1.weight", &[4, 4]),
    ("post_quant_conv.weight", &[4, 4]),
];

pub const TEXT_KEYS: &[(&str, &[usize])] = &[
    ("text_model.final_layer_norm.weight", &[4]),
    ("text_model.embeddings.token_embedding.weight", &[8, 4]),
];

/// LDM-layout keys of a style checkpoint. Together they touch part of every
/// sub-model; `conv_in.bias`, `mid_block…` and `post_quant_conv` are left out
/// on purpose.
pub const STYLE_KEYS: &[(&str, &[usize])] = &[
    ("model.diffusion_model.input_blocks.0.0.weight", &[4, 4]),
    ("model.diffusion_model.input_blocks.1.0.in_layers.0.weight", &[4]),
    (
        "model.diffusion_model.input_blocks.1.1.transformer_blocks.0.attn1.to_q.weight",
        &[4, 4],
    ),
    ("model.diffusion_model.output_blocks.2.1.conv.weight", &[4, 4]),
    ("model.diffusion_model.out.2.weight", &[4, 4]),
    ("first_stage_model.encoder.mid.attn_1.q.weight", &[4, 4, 1, 1]),
    ("first_stage_model.decoder.up.0.block.0.conv1.weight", &[4, 4]),
    (
        "cond_stage_model.transformer.text_model.final_layer_norm.weight",
        &[4],
    ),
    ("alphas_cumprod", &[10]),
];

pub struct Fixture {
    pub dir: TempDir,
    pub config: MagicTimeConfig,
}

impl Fixture {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn style_dir(&self) -> std::path::PathBuf {
        self.config.resolve(&self.config.dreambooth_dir)
    }

    pub fn motion_dir(&self) -> std::path::PathBuf {
        self.config.resolve(&self.config.motion_module_dir)
    }

    pub fn output_dir(&self) -> std::path::PathBuf {
        self.config.resolve(&self.config.output_dir)
    }
}

pub fn write_tensors(path: &Path, entries: &[(&str, &[usize])], value: f32) {
    let tensors: HashMap<String, Tensor> = entries
        .iter()
        .map(|(name, shape)| {
            let tensor = Tensor::full(value, *shape, &Device::Cpu).unwrap();
            (name.to_string(), tensor)
        })
        .collect();
    write_state_dict(path, &tensors);
}

pub fn write_state_dict(path: &Path, tensors: &HashMap<String, Tensor>) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    candle_core::safetensors::save(tensors, path).unwrap();
}

/// Checkpoint tree with two styles, one motion module and base weights
pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MagicTimeConfig::with_base_dir(dir.path());
    config.text_model = TextModelSource::Local("clip/model.safetensors".into());

    let unet_dir = config.unet_dir();
    let vae_dir = config.vae_dir();
    write_tensors(
        &unet_dir.join("diffusion_pytorch_model.safetensors"),
        UNET_KEYS,
        BASE,
    );
    write_tensors(
        &vae_dir.join("diffusion_pytorch_model.safetensors"),
        VAE_KEYS,
        BASE,
    );

    let mut clip: Vec<(&str, &[usize])> = TEXT_KEYS.to_vec();
    clip.push(("vision_model.post_layernorm.weight", &[4]));
    write_tensors(
        &dir.path().join("clip/model.safetensors"),
        &clip,
        TEXT_BASE,
    );

    let style_dir = config.resolve(&config.dreambooth_dir);
    write_tensors(
        &style_dir.join(format!("{REALISTIC}.safetensors")),
        STYLE_KEYS,
        REALISTIC_VALUE,
    );
    write_tensors(
        &style_dir.join(format!("{TOON}.safetensors")),
        STYLE_KEYS,
        TOON_VALUE,
    );

    let motion_dir = config.resolve(&config.motion_module_dir);
    write_tensors(
        &motion_dir.join(format!("{MOTION}.safetensors")),
        MOTION_KEYS,
        MOTION_VALUE,
    );

    Fixture { dir, config }
}

/// Schemas of the fixture's live graph: the base model plus the motion
/// module skeleton
pub fn schemas() -> GraphSchema {
    let mut schemas = GraphSchema::default();
    for (name, shape) in UNET_KEYS.iter().chain(MOTION_KEYS) {
        schemas.unet.insert(*name, shape.to_vec());
    }
    for (name, shape) in VAE_KEYS {
        schemas.vae.insert(*name, shape.to_vec());
    }
    for (name, shape) in TEXT_KEYS {
        schemas.text_encoder.insert(*name, shape.to_vec());
    }
    schemas
}

pub fn template(fx: &Fixture) -> TextEncoderTemplate {
    TextEncoderTemplate::fetch(&fx.config, &Device::Cpu).unwrap()
}

/// Full startup: base weights, default checkpoints, adapters
pub fn loaded_session(fx: &Fixture) -> ModelSession {
    ModelSession::load(
        &fx.config,
        Box::new(ManifestArchitecture::new(schemas())),
        template(fx),
        &NoAdapters,
        &Device::Cpu,
        DType::F32,
    )
    .unwrap()
}

/// Base weights only; no style or motion checkpoint applied yet
pub fn fresh_session(fx: &Fixture) -> ModelSession {
    let architecture = ManifestArchitecture::new(schemas());
    let graph = ModelGraph::declare(&architecture, &Device::Cpu, DType::F32).unwrap();
    graph.load_base_weights(&fx.config).unwrap();
    ModelSession::new(
        CheckpointStore::from_config(&fx.config),
        Box::new(architecture),
        graph,
        template(fx),
        StyleTranslators::from_config(&fx.config),
    )
}

/// Every value of a live parameter
pub fn param(session: &ModelSession, component: Component, name: &str) -> Vec<f32> {
    let vars = session.graph().params(component).data().lock().unwrap();
    vars[name]
        .as_tensor()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

/// Deep copy of every component, flattened for comparison
pub fn snapshot(session: &ModelSession) -> Vec<(Component, String, Vec<f32>)> {
    let mut out = Vec::new();
    for component in Component::ALL {
        let dict: StateDict = session.graph().snapshot(component).unwrap();
        let mut names: Vec<_> = dict.keys().cloned().collect();
        names.sort();
        for name in names {
            let values = dict[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            out.push((component, name, values));
        }
    }
    out
}

pub fn request(style: &str, motion: &str, seed: &str) -> GenerationRequest {
    GenerationRequest {
        prompt: "Cherry blossoms transitioning from tightly closed buds to a peak state of bloom."
            .to_string(),
        negative_prompt: "worst quality, low quality".to_string(),
        width: 512,
        height: 512,
        seed: seed.to_string(),
        style_id: style.to_string(),
        motion_id: motion.to_string(),
    }
}

/// Records every call and returns small constant frames
#[derive(Clone, Default)]
pub struct RecordingPipeline {
    pub calls: Arc<Mutex<Vec<SampleRequest>>>,
}

impl RecordingPipeline {
    pub fn calls(&self) -> Vec<SampleRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl SamplingPipeline for RecordingPipeline {
    fn sample(
        &mut self,
        graph: &ModelGraph,
        request: &SampleRequest,
    ) -> candle_core::Result<Tensor> {
        self.calls.lock().unwrap().push(request.clone());
        Tensor::full(0.5f32, (1, 3, request.video_length, 8, 8), graph.device())
    }
}
