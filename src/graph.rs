//! Live model graph
//!
//! The three sub-models are held as [`VarMap`]s. Modules built from them with
//! [`ModelGraph::var_builder`] share storage with the maps, so merges done by
//! the session are visible to every module without rebuilding it.
//!
//! Architectures are opaque: an [`Architecture`] only declares the parameter
//! names and shapes each sub-model owns.

use candle_core::{DType, Device};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::{MagicTimeConfig, TextModelSource};
use crate::error::{Error, Result};
use crate::loader::{StateDict, TensorInfo, find_weights_file, get_tensor_info, read_state_dict};
use crate::merge;
use crate::store::{CheckpointFamily, CheckpointStore};

/// Weight files tried, in order, inside each diffusers component directory
pub const DIFFUSERS_WEIGHT_FILES: &[&str] = &[
    "diffusion_pytorch_model.safetensors",
    "diffusion_pytorch_model.fp16.safetensors",
];

/// Root of the text model inside a full CLIP checkpoint
pub const TEXT_MODEL_PREFIX: &str = "text_model.";

/// Sub-models of the live graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    TextEncoder,
    Vae,
    Unet,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::TextEncoder, Component::Vae, Component::Unet];
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::TextEncoder => "text_encoder",
            Component::Vae => "vae",
            Component::Unet => "unet",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Parameter Schemas
// =============================================================================

/// Parameter names and shapes a sub-model expects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSchema(BTreeMap<String, Vec<usize>>);

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, shape: Vec<usize>) {
        self.0.insert(name.into(), shape);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.0.get(name).map(|s| s.as_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn extend(&mut self, other: ParamSchema) {
        self.0.extend(other.0);
    }

    /// Schema of the parameters currently declared in `varmap`
    pub fn from_varmap(varmap: &VarMap) -> Result<Self> {
        let vars = varmap.data().lock().map_err(|_| Error::Poisoned)?;
        Ok(vars
            .iter()
            .map(|(name, var)| (name.clone(), var.dims().to_vec()))
            .collect())
    }

    pub fn from_state_dict(tensors: &StateDict) -> Self {
        tensors
            .iter()
            .map(|(name, t)| (name.clone(), t.dims().to_vec()))
            .collect()
    }

    pub fn from_tensor_info(info: HashMap<String, TensorInfo>) -> Self {
        info.into_iter().map(|(name, i)| (name, i.shape)).collect()
    }
}

impl FromIterator<(String, Vec<usize>)> for ParamSchema {
    fn from_iter<I: IntoIterator<Item = (String, Vec<usize>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One schema per sub-model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSchema {
    pub text_encoder: ParamSchema,
    pub vae: ParamSchema,
    pub unet: ParamSchema,
}

impl GraphSchema {
    pub fn get(&self, component: Component) -> &ParamSchema {
        match component {
            Component::TextEncoder => &self.text_encoder,
            Component::Vae => &self.vae,
            Component::Unet => &self.unet,
        }
    }

    pub fn get_mut(&mut self, component: Component) -> &mut ParamSchema {
        match component {
            Component::TextEncoder => &mut self.text_encoder,
            Component::Vae => &mut self.vae,
            Component::Unet => &mut self.unet,
        }
    }
}

// =============================================================================
// Architectures
// =============================================================================

/// Declares the parameters of each sub-model
pub trait Architecture: Send {
    /// Create every parameter of `component` through `vb`
    fn declare(&self, component: Component, vb: VarBuilder) -> candle_core::Result<()>;
}

/// Architecture described by explicit parameter schemas
#[derive(Debug, Clone)]
pub struct ManifestArchitecture {
    schemas: GraphSchema,
}

impl ManifestArchitecture {
    pub fn new(schemas: GraphSchema) -> Self {
        Self { schemas }
    }

    pub fn schemas(&self) -> &GraphSchema {
        &self.schemas
    }

    /// Build schemas from the base model files on disk: the diffusers U-Net
    /// and VAE headers, the text template, and the motion-module skeleton
    /// taken from every motion checkpoint
    pub fn scan(config: &MagicTimeConfig, text_template: &TextEncoderTemplate) -> Result<Self> {
        let unet_file = find_weights_file(config.unet_dir(), DIFFUSERS_WEIGHT_FILES)?;
        let vae_file = find_weights_file(config.vae_dir(), DIFFUSERS_WEIGHT_FILES)?;

        let mut unet = ParamSchema::from_tensor_info(get_tensor_info(&unet_file)?);
        let store = CheckpointStore::from_config(config);
        for desc in store.list(CheckpointFamily::Motion)? {
            let motion = read_state_dict(&desc.path, &Device::Cpu)?;
            unet.extend(ParamSchema::from_state_dict(&motion));
        }

        let schemas = GraphSchema {
            text_encoder: text_template.schema(),
            vae: ParamSchema::from_tensor_info(get_tensor_info(&vae_file)?),
            unet,
        };
        info!(
            text_encoder = schemas.text_encoder.len(),
            vae = schemas.vae.len(),
            unet = schemas.unet.len(),
            "scanned model manifest"
        );
        Ok(Self::new(schemas))
    }
}

impl Architecture for ManifestArchitecture {
    fn declare(&self, component: Component, vb: VarBuilder) -> candle_core::Result<()> {
        for (name, shape) in self.schemas.get(component).iter() {
            vb.get_with_hints(shape, name, Init::Const(0.0))?;
        }
        Ok(())
    }
}

/// Declare one sub-model into a fresh [`VarMap`]
pub fn declare_component(
    architecture: &dyn Architecture,
    component: Component,
    device: &Device,
    dtype: DType,
) -> Result<VarMap> {
    let varmap = VarMap::new();
    architecture.declare(component, VarBuilder::from_varmap(&varmap, dtype, device))?;
    Ok(varmap)
}

// =============================================================================
// Model Graph
// =============================================================================

/// Live parameters of the text encoder, VAE and diffusion backbone
pub struct ModelGraph {
    text_encoder: VarMap,
    vae: VarMap,
    unet: VarMap,
    device: Device,
    dtype: DType,
}

impl ModelGraph {
    /// Declare all three sub-models with the architecture's initial values
    pub fn declare(architecture: &dyn Architecture, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            text_encoder: declare_component(architecture, Component::TextEncoder, device, dtype)?,
            vae: declare_component(architecture, Component::Vae, device, dtype)?,
            unet: declare_component(architecture, Component::Unet, device, dtype)?,
            device: device.clone(),
            dtype,
        })
    }

    pub fn params(&self, component: Component) -> &VarMap {
        match component {
            Component::TextEncoder => &self.text_encoder,
            Component::Vae => &self.vae,
            Component::Unet => &self.unet,
        }
    }

    /// Builder for constructing modules that share the live parameters
    pub fn var_builder(&self, component: Component) -> VarBuilder<'static> {
        VarBuilder::from_varmap(self.params(component), self.dtype, &self.device)
    }

    pub(crate) fn replace_text_encoder(&mut self, text_encoder: VarMap) {
        self.text_encoder = text_encoder;
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn schema(&self) -> Result<GraphSchema> {
        Ok(GraphSchema {
            text_encoder: ParamSchema::from_varmap(&self.text_encoder)?,
            vae: ParamSchema::from_varmap(&self.vae)?,
            unet: ParamSchema::from_varmap(&self.unet)?,
        })
    }

    /// Deep copy of a sub-model's current parameter values
    pub fn snapshot(&self, component: Component) -> Result<StateDict> {
        let vars = self
            .params(component)
            .data()
            .lock()
            .map_err(|_| Error::Poisoned)?;
        vars.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    /// Overlay diffusers-layout base weights for the VAE and U-Net from
    /// `pretrained_model_path`
    pub fn load_base_weights(&self, config: &MagicTimeConfig) -> Result<()> {
        for (component, dir) in [
            (Component::Vae, config.vae_dir()),
            (Component::Unet, config.unet_dir()),
        ] {
            let file = find_weights_file(&dir, DIFFUSERS_WEIGHT_FILES)?;
            let weights = read_state_dict(&file, &self.device)?;
            let report = merge::overlay(self.params(component), &weights)?;
            info!(
                component = %component,
                file = %file.display(),
                applied = report.applied,
                "loaded base weights"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Text Encoder Template
// =============================================================================

/// Frozen base text-encoder weights. Style swaps build a fresh text encoder
/// from this template and patch the copy; the template itself never changes.
#[derive(Debug, Clone)]
pub struct TextEncoderTemplate {
    weights: Arc<StateDict>,
}

impl TextEncoderTemplate {
    /// Keep the `text_model.*` entries of a CLIP checkpoint
    pub fn new(weights: StateDict) -> Self {
        let weights = weights
            .into_iter()
            .filter(|(name, _)| name.starts_with(TEXT_MODEL_PREFIX))
            .collect();
        Self {
            weights: Arc::new(weights),
        }
    }

    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        Ok(Self::new(read_state_dict(path, device)?))
    }

    /// Load the template from a local file or the Hugging Face hub
    pub fn fetch(config: &MagicTimeConfig, device: &Device) -> Result<Self> {
        let path = match &config.text_model {
            TextModelSource::Local(path) => config.resolve(path),
            TextModelSource::Hub(repo) => {
                let api = hf_hub::api::sync::Api::new()?;
                api.model(repo.clone()).get("model.safetensors")?
            }
        };
        info!(path = %path.display(), "loading text encoder template");
        Self::load(path, device)
    }

    pub fn weights(&self) -> &StateDict {
        &self.weights
    }

    pub fn schema(&self) -> ParamSchema {
        ParamSchema::from_state_dict(&self.weights)
    }

    /// Fresh text encoder: declared, filled from the template, then patched
    pub fn instantiate_patched(
        &self,
        architecture: &dyn Architecture,
        patch: &StateDict,
        device: &Device,
        dtype: DType,
    ) -> Result<VarMap> {
        let varmap = declare_component(architecture, Component::TextEncoder, device, dtype)?;
        merge::overlay(&varmap, &self.weights)?;
        merge::overlay(&varmap, patch)?;
        Ok(varmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    fn tiny_schemas() -> GraphSchema {
        let mut schemas = GraphSchema::default();
        schemas
            .text_encoder
            .insert("text_model.final_layer_norm.weight", vec![2]);
        schemas.vae.insert("post_quant_conv.weight", vec![2, 2]);
        schemas.unet.insert("conv_in.weight", vec![2, 2]);
        schemas.unet.insert("conv_in.bias", vec![2]);
        schemas
    }

    #[test]
    fn test_manifest_declares_schema() -> Result<()> {
        let arch = ManifestArchitecture::new(tiny_schemas());
        let graph = ModelGraph::declare(&arch, &Device::Cpu, DType::F32)?;
        assert_eq!(graph.schema()?, tiny_schemas());
        Ok(())
    }

    #[test]
    fn test_template_is_not_mutated_by_patch() -> Result<()> {
        let device = Device::Cpu;
        let arch = ManifestArchitecture::new(tiny_schemas());

        let mut base = StateDict::new();
        base.insert(
            "text_model.final_layer_norm.weight".to_string(),
            Tensor::full(1f32, 2, &device)?,
        );
        base.insert(
            "vision_model.post_layernorm.weight".to_string(),
            Tensor::full(9f32, 2, &device)?,
        );
        let template = TextEncoderTemplate::new(base);
        assert_eq!(template.weights().len(), 1);

        let mut patch = StateDict::new();
        patch.insert(
            "text_model.final_layer_norm.weight".to_string(),
            Tensor::full(5f32, 2, &device)?,
        );
        let patched = template.instantiate_patched(&arch, &patch, &device, DType::F32)?;

        let patched_value = patched.data().lock().unwrap()["text_model.final_layer_norm.weight"]
            .as_tensor()
            .to_vec1::<f32>()?;
        assert_eq!(patched_value, vec![5.0, 5.0]);

        let template_value =
            template.weights()["text_model.final_layer_norm.weight"].to_vec1::<f32>()?;
        assert_eq!(template_value, vec![1.0, 1.0]);
        Ok(())
    }
}
