//! On-disk checkpoint enumeration for the two swappable weight families.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::MagicTimeConfig;
use crate::error::{Error, Result};
use crate::loader::find_files;

/// The two hot-swappable weight families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFamily {
    /// Appearance checkpoints overlaid on the VAE, backbone and text encoder
    Style,
    /// Temporal weights merged additively into the backbone
    Motion,
}

impl CheckpointFamily {
    /// File extensions accepted for this family
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            CheckpointFamily::Style => &["safetensors"],
            CheckpointFamily::Motion => &["ckpt", "pt", "safetensors"],
        }
    }
}

impl fmt::Display for CheckpointFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointFamily::Style => f.write_str("style"),
            CheckpointFamily::Motion => f.write_str("motion"),
        }
    }
}

/// A checkpoint file found during a directory scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointDescriptor {
    /// File stem, e.g. `RealisticVisionV60B1_v51VAE`
    pub id: String,
    pub family: CheckpointFamily,
    pub path: PathBuf,
}

impl CheckpointDescriptor {
    fn from_path(family: CheckpointFamily, path: PathBuf) -> Option<Self> {
        let id = path.file_stem()?.to_str()?.to_string();
        Some(Self { id, family, path })
    }

    /// True if `id` names this checkpoint by stem or by full file name
    pub fn matches(&self, id: &str) -> bool {
        self.id == id
            || self
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name == id)
    }
}

/// Read-only view of the checkpoint directories. Every call rescans.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    style_dir: PathBuf,
    motion_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(style_dir: impl Into<PathBuf>, motion_dir: impl Into<PathBuf>) -> Self {
        Self {
            style_dir: style_dir.into(),
            motion_dir: motion_dir.into(),
        }
    }

    pub fn from_config(config: &MagicTimeConfig) -> Self {
        Self::new(
            config.resolve(&config.dreambooth_dir),
            config.resolve(&config.motion_module_dir),
        )
    }

    /// Directory scanned for `family`
    pub fn dir(&self, family: CheckpointFamily) -> &Path {
        match family {
            CheckpointFamily::Style => &self.style_dir,
            CheckpointFamily::Motion => &self.motion_dir,
        }
    }

    /// List checkpoints of `family`, sorted by file name
    pub fn list(&self, family: CheckpointFamily) -> Result<Vec<CheckpointDescriptor>> {
        let files = find_files(self.dir(family), family.extensions())?;
        Ok(files
            .into_iter()
            .filter_map(|path| CheckpointDescriptor::from_path(family, path))
            .collect())
    }

    /// Find the checkpoint named `id` (stem or file name)
    pub fn resolve(&self, family: CheckpointFamily, id: &str) -> Result<CheckpointDescriptor> {
        self.list(family)?
            .into_iter()
            .find(|desc| desc.matches(id))
            .ok_or_else(|| Error::NotFound {
                family,
                id: id.to_string(),
                dir: self.dir(family).to_path_buf(),
            })
    }

    /// The first listed checkpoint id, used as the startup default
    pub fn default_id(&self, family: CheckpointFamily) -> Result<Option<String>> {
        Ok(self.list(family)?.into_iter().next().map(|desc| desc.id))
    }
}
