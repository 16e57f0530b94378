//! Video artifact writers

use candle_core::{Device, Tensor};
use image::RgbImage;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};
use crate::pipeline::frames_to_cpu;

/// Persists sampled frames `[B, C, F, H, W]` (values in `[0, 1]`)
pub trait VideoWriter: Send {
    /// File extension of the artifact, without the dot
    fn extension(&self) -> &'static str;

    fn write(&self, frames: &Tensor, path: &Path) -> Result<()>;
}

/// Animated GIF with the batch tiled into a grid
#[derive(Debug, Clone, Copy)]
pub struct GifWriter {
    pub fps: u32,
    /// Grid columns; the batch wraps onto further rows
    pub columns: usize,
}

impl Default for GifWriter {
    fn default() -> Self {
        Self { fps: 8, columns: 6 }
    }
}

impl GifWriter {
    pub fn new(fps: u32) -> Self {
        Self {
            fps,
            ..Default::default()
        }
    }

    /// One grid image per video frame
    pub fn grid_frames(&self, frames: &Tensor) -> Result<Vec<RgbImage>> {
        let (batch, channels, count, height, width) = frames.dims5()?;
        if channels != 3 {
            return Err(Error::InvalidRequest(format!(
                "expected RGB frames, got {channels} channels"
            )));
        }

        let columns = self.columns.clamp(1, batch.max(1));
        let rows = batch.div_ceil(columns);

        // [B, C, F, H, W] -> [B, F, H, W, C] bytes
        let pixels = (frames_to_cpu(frames)?.clamp(0f32, 1f32)? * 255.0)?
            .round()?
            .permute((0, 2, 3, 4, 1))?
            .to_dtype(candle_core::DType::U8)?
            .flatten_all()?
            .to_vec1::<u8>()?;
        let tile_len = height * width * 3;

        let mut grids = Vec::with_capacity(count);
        for t in 0..count {
            let mut grid = RgbImage::new((columns * width) as u32, (rows * height) as u32);
            for b in 0..batch {
                let start = (b * count + t) * tile_len;
                let Some(tile) = RgbImage::from_raw(
                    width as u32,
                    height as u32,
                    pixels[start..start + tile_len].to_vec(),
                ) else {
                    continue;
                };
                let x = (b % columns) * width;
                let y = (b / columns) * height;
                image::imageops::replace(&mut grid, &tile, x as i64, y as i64);
            }
            grids.push(grid);
        }
        Ok(grids)
    }
}

impl VideoWriter for GifWriter {
    fn extension(&self) -> &'static str {
        "gif"
    }

    fn write(&self, frames: &Tensor, path: &Path) -> Result<()> {
        let grids = self.grid_frames(frames)?;
        let Some(first) = grids.first() else {
            return Err(Error::InvalidRequest("no frames to encode".to_string()));
        };
        let (width, height) = first.dimensions();
        let (Ok(width), Ok(height)) = (u16::try_from(width), u16::try_from(height)) else {
            return Err(Error::InvalidRequest(format!(
                "{width}x{height} exceeds the GIF size limit"
            )));
        };

        let file = BufWriter::new(File::create(path)?);
        let mut encoder = gif::Encoder::new(file, width, height, &[])?;
        encoder.set_repeat(gif::Repeat::Infinite)?;

        // hundredths of a second
        let delay = (100 / self.fps.max(1)).max(1) as u16;
        for grid in &grids {
            let mut frame = gif::Frame::from_rgb_speed(width, height, grid.as_raw(), 10);
            frame.delay = delay;
            encoder.write_frame(&frame)?;
        }

        info!(path = %path.display(), frames = grids.len(), "wrote gif");
        Ok(())
    }
}

/// Raw tensor dump: little-endian `ndims: u64`, `dims: [u64]`, `data: [f32]`
#[derive(Debug, Clone, Copy, Default)]
pub struct TensorDumpWriter;

impl VideoWriter for TensorDumpWriter {
    fn extension(&self) -> &'static str {
        "bin"
    }

    fn write(&self, frames: &Tensor, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);

        file.write_all(&(frames.rank() as u64).to_le_bytes())?;
        for dim in frames.dims() {
            file.write_all(&(*dim as u64).to_le_bytes())?;
        }
        for value in frames_to_cpu(frames)?.flatten_all()?.to_vec1::<f32>()? {
            file.write_all(&value.to_le_bytes())?;
        }
        file.flush()?;
        Ok(())
    }
}

/// Read a file written by [`TensorDumpWriter`]
pub fn read_tensor_dump(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let mut file = BufReader::new(File::open(path)?);

    let mut word = [0u8; 8];
    file.read_exact(&mut word)?;
    let rank = u64::from_le_bytes(word) as usize;

    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        file.read_exact(&mut word)?;
        dims.push(u64::from_le_bytes(word) as usize);
    }

    let mut bytes = vec![0u8; dims.iter().product::<usize>() * 4];
    file.read_exact(&mut bytes)?;
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(Tensor::from_vec(data, dims, device)?)
}
