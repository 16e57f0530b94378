//! Style checkpoint translation
//!
//! Style checkpoints are single-file LDM archives holding the backbone, the
//! autoencoder and the text encoder under three prefixes. Each target
//! sub-model gets a [`Translator`] driven by a [`RuleTable`]; translation is
//! pure and partial: keys the target schema does not know are reported, not
//! fatal. The merge step decides what to do with the result.

pub mod ldm;
pub mod rules;

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::{MagicTimeConfig, UnetLayout, VaeLayout};
use crate::error::Result;
use crate::graph::{Component, GraphSchema, ParamSchema};
use crate::loader::StateDict;

pub use rules::{KeyPattern, Reshape, Rewrite, RewriteRule, RuleTable};

/// Top-level keys of LDM checkpoints that have no live counterpart
pub const OMITTED_KEYS: &[&str] = &[
    "betas",
    "alphas_cumprod",
    "alphas_cumprod_prev",
    "sqrt_alphas_cumprod",
    "sqrt_one_minus_alphas_cumprod",
    "log_one_minus_alphas_cumprod",
    "sqrt_recip_alphas_cumprod",
    "sqrt_recipm1_alphas_cumprod",
    "posterior_variance",
    "posterior_log_variance_clipped",
    "posterior_mean_coef1",
    "posterior_mean_coef2",
    "logvar",
    // buffer, not a parameter
    "cond_stage_model.transformer.text_model.embeddings.position_ids",
    "cond_stage_model.transformer.embeddings.position_ids",
];

/// Prefixes of LDM checkpoint keys that have no live counterpart
pub const OMITTED_PREFIXES: &[&str] = &["model_ema.", "conditioner."];

/// True if `key` is on the reviewed omission list
pub fn is_known_omission(key: &str) -> bool {
    OMITTED_KEYS.contains(&key) || OMITTED_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Output of one translation
#[derive(Debug, Default)]
pub struct Translation {
    /// Tensors keyed in the target's naming convention
    pub tensors: StateDict,
    /// In-scope source keys whose rewritten name the target does not have
    pub unresolved: Vec<String>,
}

/// Rewrites a raw checkpoint into one target sub-model's layout
#[derive(Debug, Clone)]
pub struct Translator {
    target: Component,
    table: RuleTable,
}

impl Translator {
    pub fn new(target: Component, table: RuleTable) -> Self {
        Self { target, table }
    }

    pub fn target(&self) -> Component {
        self.target
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    /// Rewrite a single key; `None` if it is out of scope or the target
    /// has no parameter of that name
    pub fn resolve(&self, key: &str, schema: &ParamSchema) -> Option<Rewrite> {
        self.table
            .apply(key)
            .filter(|rewrite| schema.contains(&rewrite.key))
    }

    /// Translate every in-scope tensor of `raw` that `schema` can accept
    pub fn translate(&self, raw: &StateDict, schema: &ParamSchema) -> Result<Translation> {
        let mut keys: Vec<&String> = raw.keys().filter(|k| self.table.in_scope(k)).collect();
        keys.sort();

        let mut translation = Translation::default();
        for key in keys {
            match self.resolve(key, schema) {
                Some(rewrite) => {
                    let mut tensor = raw[key].clone();
                    for reshape in &rewrite.reshapes {
                        tensor = reshape.apply(key, &tensor)?;
                    }
                    translation.tensors.insert(rewrite.key, tensor);
                }
                None => translation.unresolved.push(key.clone()),
            }
        }

        debug!(
            target_model = %self.target,
            translated = translation.tensors.len(),
            unresolved = translation.unresolved.len(),
            "translated checkpoint"
        );
        Ok(translation)
    }
}

/// Key accounting for a whole style checkpoint
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoverageReport {
    /// Keys that land on a live parameter
    pub mapped: usize,
    /// Keys dropped on purpose
    pub omitted: Vec<String>,
    /// Keys that neither map nor are on the omission list
    pub unaccounted: Vec<String>,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.unaccounted.is_empty()
    }
}

/// The three translators a style swap runs
#[derive(Debug, Clone)]
pub struct StyleTranslators {
    pub unet: Translator,
    pub vae: Translator,
    pub text_encoder: Translator,
}

impl StyleTranslators {
    pub fn new(unet: &UnetLayout, vae: &VaeLayout) -> Self {
        Self {
            unet: Translator::new(Component::Unet, ldm::unet_rules(unet)),
            vae: Translator::new(Component::Vae, ldm::vae_rules(vae)),
            text_encoder: Translator::new(Component::TextEncoder, ldm::clip_rules()),
        }
    }

    pub fn from_config(config: &MagicTimeConfig) -> Self {
        Self::new(&config.unet, &config.vae)
    }

    pub fn get(&self, component: Component) -> &Translator {
        match component {
            Component::Unet => &self.unet,
            Component::Vae => &self.vae,
            Component::TextEncoder => &self.text_encoder,
        }
    }

    /// Account for every key of a style checkpoint against the live schemas
    pub fn coverage<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        schemas: &GraphSchema,
    ) -> CoverageReport {
        let keys: BTreeSet<&str> = keys.into_iter().collect();
        let mut report = CoverageReport::default();

        for key in keys {
            let mapped = Component::ALL.iter().any(|&component| {
                self.get(component)
                    .resolve(key, schemas.get(component))
                    .is_some()
            });
            if mapped {
                report.mapped += 1;
            } else if is_known_omission(key) {
                report.omitted.push(key.to_string());
            } else {
                report.unaccounted.push(key.to_string());
            }
        }
        report
    }
}
