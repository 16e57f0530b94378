//! Checkpoint loader tests
//!
//! Tests cover:
//! - Safetensors reading and header-only inspection
//! - Weights file discovery
//! - Directory scans
//! - JSON config parsing

use candle_core::{DType, Device};
use candle_magictime::config::MagicTimeConfig;
use candle_magictime::loader::*;
use std::fs;
use tempfile::tempdir;

// =============================================================================
// Test Data Setup Helpers
// =============================================================================

/// Writes a safetensors file with f32 tensors
fn create_test_safetensors(path: &std::path::Path, tensors: &[(&str, Vec<f32>, Vec<usize>)]) {
    use safetensors::serialize;
    use safetensors::tensor::TensorView;

    let buffers: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, data, _)| data.iter().flat_map(|v| v.to_le_bytes()).collect())
        .collect();
    let views: Vec<(String, TensorView)> = tensors
        .iter()
        .zip(&buffers)
        .map(|((name, _, shape), bytes)| {
            let view = TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes).unwrap();
            (name.to_string(), view)
        })
        .collect();

    let data = serialize(views, &None).unwrap();
    fs::write(path, data).unwrap();
}

// =============================================================================
// State Dict Tests
// =============================================================================

#[test]
fn test_read_safetensors_state_dict() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("motion_module.safetensors");
    create_test_safetensors(
        &path,
        &[
            ("proj_in.weight", vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]),
            ("proj_in.bias", vec![0.5, -0.5], vec![2]),
        ],
    );

    let dict = read_state_dict(&path, &Device::Cpu).unwrap();
    assert_eq!(dict.len(), 2);
    assert_eq!(dict["proj_in.weight"].dims(), &[2, 2]);
    assert_eq!(dict["proj_in.weight"].dtype(), DType::F32);
    assert_eq!(
        dict["proj_in.bias"].to_vec1::<f32>().unwrap(),
        vec![0.5, -0.5]
    );
}

#[test]
fn test_corrupt_safetensors_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.safetensors");
    fs::write(&path, b"definitely not a safetensors header").unwrap();

    assert!(matches!(
        read_state_dict(&path, &Device::Cpu),
        Err(LoaderError::Tensors { .. })
    ));
    assert!(matches!(
        get_tensor_info(&path),
        Err(LoaderError::InvalidSafetensors { .. })
    ));
}

#[test]
fn test_tensor_info_reads_header_only() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("unet.safetensors");
    create_test_safetensors(
        &path,
        &[
            ("conv_in.weight", vec![0.0; 12], vec![2, 2, 3]),
            ("conv_in.bias", vec![0.0; 2], vec![2]),
        ],
    );

    let info = get_tensor_info(&path).unwrap();
    assert_eq!(info["conv_in.weight"].shape, vec![2, 2, 3]);
    assert_eq!(info["conv_in.weight"].dtype, "F32");

    let names = list_tensor_names(&path).unwrap();
    assert_eq!(names, vec!["conv_in.bias", "conv_in.weight"]);
}

#[test]
fn test_missing_file_is_read_error() {
    let err = get_tensor_info("/definitely/not/here.safetensors").unwrap_err();
    assert!(matches!(err, LoaderError::FileRead { .. }));
}

// =============================================================================
// Discovery Tests
// =============================================================================

#[test]
fn test_find_weights_file_prefers_first_candidate() {
    let dir = tempdir().unwrap();
    let candidates = [
        "diffusion_pytorch_model.safetensors",
        "diffusion_pytorch_model.fp16.safetensors",
    ];

    let err = find_weights_file(dir.path(), &candidates).unwrap_err();
    assert!(matches!(err, LoaderError::NoWeightsFound { ref candidates, .. } if candidates.len() == 2));

    fs::write(dir.path().join(candidates[1]), b"").unwrap();
    assert_eq!(
        find_weights_file(dir.path(), &candidates).unwrap(),
        dir.path().join(candidates[1])
    );

    fs::write(dir.path().join(candidates[0]), b"").unwrap();
    assert_eq!(
        find_weights_file(dir.path(), &candidates).unwrap(),
        dir.path().join(candidates[0])
    );
}

#[test]
fn test_find_files_filters_and_sorts() {
    let dir = tempdir().unwrap();
    for name in ["b.ckpt", "a.SAFETENSORS", "c.safetensors", "notes.md"] {
        fs::write(dir.path().join(name), b"").unwrap();
    }
    fs::create_dir(dir.path().join("nested.safetensors")).unwrap();

    let files = find_files(dir.path(), &["safetensors", "ckpt"]).unwrap();
    let names: Vec<_> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["a.SAFETENSORS", "b.ckpt", "c.safetensors"]);
}

// =============================================================================
// Config Tests
// =============================================================================

#[test]
fn test_load_model_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("magictime.json");
    fs::write(
        &path,
        r#"{
            "dreambooth_dir": "styles",
            "queue_capacity": 4,
            "inference": { "num_inference_steps": 30 },
            "text_model": { "hub": "openai/clip-vit-large-patch14" }
        }"#,
    )
    .unwrap();

    let config: MagicTimeConfig = load_model_config(&path).unwrap();
    assert_eq!(config.queue_capacity, 4);
    assert_eq!(config.inference.num_inference_steps, 30);
    assert_eq!(config.inference.guidance_scale, 8.0);
    assert_eq!(config.dreambooth_dir, std::path::PathBuf::from("styles"));
}

#[test]
fn test_load_model_config_rejects_bad_json() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("magictime.json");
    fs::write(&path, "{ not json").unwrap();

    let err = MagicTimeConfig::load(&path).unwrap_err();
    assert!(matches!(err, LoaderError::JsonParse { .. }));
}
