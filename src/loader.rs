//! Checkpoint file loading
//!
//! This module reads weight files from disk into flat tensor dictionaries:
//!
//! - Safetensors archives (`.safetensors`)
//! - PyTorch pickle archives (`.ckpt`, `.pt`, `.pth`, `.bin`)
//! - JSON config parsing
//! - Tensor name and shape listing without keeping the data around

use candle_core::{Device, Tensor};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Flat tensor dictionary keyed by parameter name
pub type StateDict = HashMap<String, Tensor>;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while reading checkpoint files
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid safetensors file: {path}")]
    InvalidSafetensors {
        path: String,
        #[source]
        source: safetensors::SafeTensorError,
    },

    #[error("Unsupported checkpoint format: {path}")]
    UnsupportedFormat { path: String },

    #[error("No weights file found in {dir}, tried {candidates:?}")]
    NoWeightsFound {
        dir: String,
        candidates: Vec<String>,
    },

    #[error("Failed to load tensors from {path}")]
    Tensors {
        path: String,
        #[source]
        source: candle_core::Error,
    },
}

// =============================================================================
// Archive Formats
// =============================================================================

/// On-disk tensor archive formats understood by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Safetensors single-file archive
    Safetensors,
    /// PyTorch pickle (zip) archive
    Pickle,
}

impl ArchiveFormat {
    /// Detect the archive format from the file extension
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "safetensors" => Some(ArchiveFormat::Safetensors),
            "ckpt" | "pt" | "pth" | "bin" => Some(ArchiveFormat::Pickle),
            _ => None,
        }
    }
}

/// Read every tensor of a checkpoint file onto `device`
pub fn read_state_dict(
    path: impl AsRef<Path>,
    device: &Device,
) -> std::result::Result<StateDict, LoaderError> {
    let path = path.as_ref();
    let tensors_err = |source| LoaderError::Tensors {
        path: path.display().to_string(),
        source,
    };

    match ArchiveFormat::detect(path) {
        Some(ArchiveFormat::Safetensors) => {
            candle_core::safetensors::load(path, device).map_err(tensors_err)
        }
        Some(ArchiveFormat::Pickle) => {
            let entries = candle_core::pickle::read_all(path).map_err(tensors_err)?;
            entries
                .into_iter()
                .map(|(name, tensor)| tensor.to_device(device).map(|t| (name, t)))
                .collect::<candle_core::Result<StateDict>>()
                .map_err(tensors_err)
        }
        None => Err(LoaderError::UnsupportedFormat {
            path: path.display().to_string(),
        }),
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Find all files in `dir` whose extension is one of `extensions`
///
/// Files are sorted by name to ensure consistent ordering. A missing
/// directory yields an empty list.
pub fn find_files(
    dir: impl AsRef<Path>,
    extensions: &[&str],
) -> std::result::Result<Vec<PathBuf>, LoaderError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let read_err = |source| LoaderError::FileRead {
        path: dir.display().to_string(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.is_file()
            && let Some(ext) = path.extension().and_then(|e| e.to_str())
            && extensions.iter().any(|want| want.eq_ignore_ascii_case(ext))
        {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Return the first candidate file that exists under `dir`
pub fn find_weights_file(
    dir: impl AsRef<Path>,
    candidates: &[&str],
) -> std::result::Result<PathBuf, LoaderError> {
    let dir = dir.as_ref();
    candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| LoaderError::NoWeightsFound {
            dir: dir.display().to_string(),
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
        })
}

/// Load a JSON configuration file and deserialize it
///
/// # Example
/// ```no_run
/// use candle_magictime::loader::load_model_config;
/// use candle_magictime::config::MagicTimeConfig;
///
/// let config: MagicTimeConfig = load_model_config("magictime.json").unwrap();
/// ```
pub fn load_model_config<T: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> std::result::Result<T, LoaderError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| LoaderError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })
}

/// List all tensor names in a safetensors file
pub fn list_tensor_names(path: impl AsRef<Path>) -> std::result::Result<Vec<String>, LoaderError> {
    let mut names: Vec<String> = get_tensor_info(path)?.into_keys().collect();
    names.sort();
    Ok(names)
}

/// Get tensor metadata (dtype, shape) of a safetensors file without
/// materializing tensors
pub fn get_tensor_info(
    path: impl AsRef<Path>,
) -> std::result::Result<HashMap<String, TensorInfo>, LoaderError> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;

    let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
        LoaderError::InvalidSafetensors {
            path: path.display().to_string(),
            source: e,
        }
    })?;

    Ok(tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let info = TensorInfo {
                dtype: format!("{:?}", view.dtype()),
                shape: view.shape().to_vec(),
            };
            (name, info)
        })
        .collect())
}

/// Information about a tensor (without the actual data)
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    /// Data type as a string
    pub dtype: String,
    /// Shape of the tensor
    pub shape: Vec<usize>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(
            ArchiveFormat::detect(Path::new("ToonYou_beta6.safetensors")),
            Some(ArchiveFormat::Safetensors)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("motion_module.ckpt")),
            Some(ArchiveFormat::Pickle)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("adapter.PT")),
            Some(ArchiveFormat::Pickle)
        );
        assert_eq!(ArchiveFormat::detect(Path::new("README.md")), None);
        assert_eq!(ArchiveFormat::detect(Path::new("noext")), None);
    }

    #[test]
    fn test_unsupported_format_is_rejected() {
        let err = read_state_dict("weights.onnx", &Device::Cpu).unwrap_err();
        assert!(matches!(err, LoaderError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_find_files_missing_dir_is_empty() {
        let files = find_files("/definitely/not/a/dir", &["safetensors"]).unwrap();
        assert!(files.is_empty());
    }
}
