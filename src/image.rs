//! Image decode/normalize and tensor→PNG save.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;

use crate::Result;

/// Decode an image file into RGB.
pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    let img = image::ImageReader::open(path.as_ref())?
        .with_guessed_format()?
        .decode()?;
    Ok(img)
}

/// Decode an in-memory image (an HTTP upload) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let img = image::load_from_memory(bytes)?;
    Ok(img)
}

/// Convert an image to a normalized `(3, size, size)` f32 tensor.
///
/// The image is center-crop resized to `size` × `size`, then each channel
/// is mapped through `(x / 255 - mean) / std`. The vision encoder expects
/// mean = std = 0.5, which lands pixels in [-1, 1].
pub fn normalized_square_tensor(
    img: &DynamicImage,
    size: usize,
    mean: f32,
    std: f32,
    device: &Device,
) -> Result<Tensor> {
    let img = img
        .resize_to_fill(
            size as u32,
            size as u32,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();
    let data = img.into_raw();
    let data = Tensor::from_vec(data, (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean_t = Tensor::new(&[mean, mean, mean], &Device::Cpu)?.reshape((3, 1, 1))?;
    let std_t = Tensor::new(&[std, std, std], &Device::Cpu)?.reshape((3, 1, 1))?;
    let normalized = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean_t)?
        .broadcast_div(&std_t)?;
    Ok(normalized.to_device(device)?)
}

/// Convert an image to a `(1, 3, height, width)` tensor in [-1, 1].
///
/// Exact resize (no crop) — this feeds the diffusion VAE, which wants the
/// requested latent geometry.
pub fn diffusion_input_tensor(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let img = img
        .resize_exact(
            width as u32,
            height as u32,
            image::imageops::FilterType::CatmullRom,
        )
        .to_rgb8();
    let data = img.into_raw();
    let data = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let scaled = ((data.to_dtype(DType::F32)? / 255.)? * 2.)?;
    let centered = (scaled - 1.)?;
    Ok(centered.unsqueeze(0)?.to_device(device)?)
}

/// Save a `(3, height, width)` f32 tensor with values in [0, 1] as PNG.
pub fn save_tensor_png(tensor: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let (channels, height, width) = tensor.dims3()?;
    if channels != 3 {
        return Err(crate::Error::Image(format!(
            "expected 3 channels, got {channels}"
        )));
    }
    let bytes = (tensor.clamp(0f32, 1f32)? * 255.)?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let img = image::RgbImage::from_raw(width as u32, height as u32, bytes)
        .ok_or_else(|| crate::Error::Image("tensor does not fit image buffer".into()))?;
    img.save(path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(w: u32, h: u32) -> DynamicImage {
        let img = image::RgbImage::from_fn(w, h, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([255, 255, 255])
            } else {
                image::Rgb([0, 0, 0])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_normalized_square_tensor_shape_and_range() {
        let t = normalized_square_tensor(&checker(10, 6), 8, 0.5, 0.5, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 8, 8]);
        let vals: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_diffusion_input_tensor_shape() {
        let t = diffusion_input_tensor(&checker(5, 5), 16, 8, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 3, 8, 16]);
    }

    #[test]
    fn test_save_tensor_png_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let t = Tensor::zeros((3usize, 4usize, 4usize), DType::F32, &Device::Cpu).unwrap();
        save_tensor_png(&t, &path).unwrap();
        let back = load_image(&path).unwrap().to_rgb8();
        assert_eq!(back.dimensions(), (4, 4));
        assert!(back.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_save_tensor_png_rejects_bad_channels() {
        let dir = tempfile::tempdir().unwrap();
        let t = Tensor::zeros((4usize, 4usize, 4usize), DType::F32, &Device::Cpu).unwrap();
        assert!(save_tensor_png(&t, dir.path().join("x.png")).is_err());
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        assert!(decode_image(b"definitely not an image").is_err());
    }
}
