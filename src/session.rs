//! Model session: the only owner and writer of the live model graph.

use candle_core::{DType, Device};
use candle_nn::VarMap;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::MagicTimeConfig;
use crate::convert::StyleTranslators;
use crate::error::Result;
use crate::graph::{Architecture, Component, ModelGraph, TextEncoderTemplate};
use crate::loader::{StateDict, read_state_dict};
use crate::merge::{self, OverlayPlan};
use crate::store::{CheckpointDescriptor, CheckpointFamily, CheckpointStore};

/// Injects the temporal and text adapters into a freshly loaded graph
pub trait AdapterInjector {
    /// Patch the diffusion backbone with the temporal adapter at `adapter_dir`
    fn inject_unet(&self, unet: &VarMap, adapter_dir: &Path) -> Result<()>;

    /// Patch the text encoder with the adapter at `adapter_dir`
    fn inject_text_encoder(&self, text_encoder: &VarMap, adapter_dir: &Path) -> Result<()>;
}

/// Injector that leaves the graph as loaded
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdapters;

impl AdapterInjector for NoAdapters {
    fn inject_unet(&self, _unet: &VarMap, adapter_dir: &Path) -> Result<()> {
        debug!(dir = %adapter_dir.display(), "temporal adapter injection disabled");
        Ok(())
    }

    fn inject_text_encoder(&self, _text_encoder: &VarMap, adapter_dir: &Path) -> Result<()> {
        debug!(dir = %adapter_dir.display(), "text adapter injection disabled");
        Ok(())
    }
}

/// What a successful swap changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapReport {
    pub family: CheckpointFamily,
    pub id: String,
    /// Live parameters written
    pub applied: usize,
    /// Translated keys the live graph does not declare
    pub skipped: Vec<String>,
    /// Checkpoint keys no target could place
    pub unresolved: Vec<String>,
}

pub struct ModelSession {
    store: CheckpointStore,
    architecture: Box<dyn Architecture>,
    graph: ModelGraph,
    text_template: TextEncoderTemplate,
    translators: StyleTranslators,
    current_style: Option<CheckpointDescriptor>,
    current_motion: Option<CheckpointDescriptor>,
}

impl ModelSession {
    /// Session over an already declared graph with no checkpoint applied
    pub fn new(
        store: CheckpointStore,
        architecture: Box<dyn Architecture>,
        graph: ModelGraph,
        text_template: TextEncoderTemplate,
        translators: StyleTranslators,
    ) -> Self {
        Self {
            store,
            architecture,
            graph,
            text_template,
            translators,
            current_style: None,
            current_motion: None,
        }
    }

    /// Startup sequence: base weights, default checkpoints, then adapters
    pub fn load(
        config: &MagicTimeConfig,
        architecture: Box<dyn Architecture>,
        text_template: TextEncoderTemplate,
        adapters: &dyn AdapterInjector,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let mut graph = ModelGraph::declare(architecture.as_ref(), device, dtype)?;
        graph.load_base_weights(config)?;
        let text_encoder = text_template.instantiate_patched(
            architecture.as_ref(),
            &StateDict::new(),
            device,
            dtype,
        )?;
        graph.replace_text_encoder(text_encoder);

        let mut session = Self::new(
            CheckpointStore::from_config(config),
            architecture,
            graph,
            text_template,
            StyleTranslators::from_config(config),
        );

        if let Some(id) = session.store.default_id(CheckpointFamily::Style)? {
            session.swap_style(&id)?;
        }
        if let Some(id) = session.store.default_id(CheckpointFamily::Motion)? {
            session.swap_motion(&id)?;
        }

        let adapter_s = config.resolve(&config.magic_adapter_s_path);
        if adapter_s.is_file() {
            let lora = read_state_dict(&adapter_s, device)?;
            let merged = merge::add_lora_deltas(session.graph.params(Component::Unet), &lora, 1.0)?;
            info!(path = %adapter_s.display(), merged, "merged spatial adapter");
        } else {
            warn!(path = %adapter_s.display(), "spatial adapter not found, skipping");
        }

        adapters.inject_unet(
            session.graph.params(Component::Unet),
            &config.resolve(&config.magic_adapter_t_path),
        )?;
        adapters.inject_text_encoder(
            session.graph.params(Component::TextEncoder),
            &config.resolve(&config.magic_text_encoder_path),
        )?;

        info!(
            style = session.current_style_id().unwrap_or("<none>"),
            motion = session.current_motion_id().unwrap_or("<none>"),
            "model session ready"
        );
        Ok(session)
    }

    /// Overlay a style checkpoint onto the VAE and backbone and rebuild the
    /// text encoder from the template
    ///
    /// All three targets are validated before the first write; on error the
    /// graph and `current_style_id` are unchanged.
    pub fn swap_style(&mut self, id: &str) -> Result<SwapReport> {
        let desc = self.store.resolve(CheckpointFamily::Style, id)?;
        info!(id = %desc.id, path = %desc.path.display(), "swapping style checkpoint");

        let raw = read_state_dict(&desc.path, self.graph.device())?;
        let schemas = self.graph.schema()?;

        let vae = self.translators.vae.translate(&raw, &schemas.vae)?;
        let unet = self.translators.unet.translate(&raw, &schemas.unet)?;
        let text = self
            .translators
            .text_encoder
            .translate(&raw, &schemas.text_encoder)?;

        let vae_plan = OverlayPlan::prepare(self.graph.params(Component::Vae), &vae.tensors)?;
        let unet_plan = OverlayPlan::prepare(self.graph.params(Component::Unet), &unet.tensors)?;
        let text_encoder = self.text_template.instantiate_patched(
            self.architecture.as_ref(),
            &text.tensors,
            self.graph.device(),
            self.graph.dtype(),
        )?;

        let vae_report = vae_plan.commit()?;
        let unet_report = unet_plan.commit()?;
        self.graph.replace_text_encoder(text_encoder);
        self.current_style = Some(desc.clone());

        let mut unresolved = vae.unresolved;
        unresolved.extend(unet.unresolved);
        unresolved.extend(text.unresolved);
        unresolved.sort();
        if !unresolved.is_empty() {
            warn!(
                id = %desc.id,
                count = unresolved.len(),
                "style checkpoint keys left unresolved"
            );
        }

        let mut skipped = vae_report.skipped;
        skipped.extend(unet_report.skipped);

        let report = SwapReport {
            family: CheckpointFamily::Style,
            id: desc.id,
            applied: vae_report.applied + unet_report.applied + text.tensors.len(),
            skipped,
            unresolved,
        };
        info!(id = %report.id, applied = report.applied, "style checkpoint applied");
        Ok(report)
    }

    /// Merge a motion checkpoint into the backbone. Every key must already be
    /// a backbone parameter.
    pub fn swap_motion(&mut self, id: &str) -> Result<SwapReport> {
        let desc = self.store.resolve(CheckpointFamily::Motion, id)?;
        info!(id = %desc.id, path = %desc.path.display(), "swapping motion checkpoint");

        let raw = read_state_dict(&desc.path, self.graph.device())?;
        let merged = merge::strict_additive(self.graph.params(Component::Unet), &raw, &desc.id)?;
        self.current_motion = Some(desc.clone());

        info!(id = %desc.id, applied = merged.applied, "motion checkpoint applied");
        Ok(SwapReport {
            family: CheckpointFamily::Motion,
            id: desc.id,
            applied: merged.applied,
            skipped: Vec::new(),
            unresolved: Vec::new(),
        })
    }

    pub fn current_style_id(&self) -> Option<&str> {
        self.current_style.as_ref().map(|desc| desc.id.as_str())
    }

    pub fn current_motion_id(&self) -> Option<&str> {
        self.current_motion.as_ref().map(|desc| desc.id.as_str())
    }

    /// True if the checkpoint named `id` (stem or file name) is the one
    /// currently applied to `family`'s slot
    pub fn is_current(&self, family: CheckpointFamily, id: &str) -> bool {
        let current = match family {
            CheckpointFamily::Style => &self.current_style,
            CheckpointFamily::Motion => &self.current_motion,
        };
        current.as_ref().is_some_and(|desc| desc.matches(id))
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    pub fn text_template(&self) -> &TextEncoderTemplate {
        &self.text_template
    }

    pub fn translators(&self) -> &StyleTranslators {
        &self.translators
    }
}
