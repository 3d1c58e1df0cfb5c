//! Image preprocessing ahead of inference: grayscale conversion plus
//! histogram equalization, which lifts OCR accuracy on under- and over-exposed
//! doorstep photos. Pure function of the input bytes.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat};

/// Decode, normalize, and re-encode an image as PNG for the inference
/// backend. Fails on bytes that are not a decodable image.
pub fn preprocess(bytes: &[u8]) -> Result<Vec<u8>, PreprocessError> {
    let decoded = image::load_from_memory(bytes)?;
    let equalized = equalize_histogram(&decoded.to_luma8());

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(equalized).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Classic histogram equalization: remap each gray level through the
/// normalized cumulative distribution of the image.
fn equalize_histogram(gray: &GrayImage) -> GrayImage {
    let total = (gray.width() * gray.height()) as f64;
    if total == 0.0 {
        return gray.clone();
    }

    let mut histogram = [0u64; 256];
    for pixel in gray.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let mut lut = [0u8; 256];
    let mut cumulative = 0u64;
    for (level, count) in histogram.iter().enumerate() {
        cumulative += count;
        lut[level] = ((cumulative as f64 / total) * 255.0).round() as u8;
    }

    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        image::Luma([lut[gray.get_pixel(x, y).0[0] as usize]])
    })
}

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("image decode/encode failed: {0}")]
    Image(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_png(img: &GrayImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img.clone())
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn preprocess_produces_decodable_png() {
        let input = GrayImage::from_fn(8, 8, |x, _| image::Luma([(x * 16) as u8]));
        let output = preprocess(&encode_png(&input)).unwrap();
        let reloaded = image::load_from_memory(&output).unwrap();
        assert_eq!(reloaded.to_luma8().dimensions(), (8, 8));
    }

    #[test]
    fn equalization_stretches_low_contrast_input() {
        // All pixels clustered in a narrow band spread toward the full range.
        let narrow = GrayImage::from_fn(16, 16, |x, _| image::Luma([100 + (x % 4) as u8]));
        let equalized = equalize_histogram(&narrow);
        let max = equalized.pixels().map(|p| p.0[0]).max().unwrap();
        let min = equalized.pixels().map(|p| p.0[0]).min().unwrap();
        assert!(max > 200, "expected brightest level to stretch up, got {max}");
        assert!(max - min > 100, "expected contrast to widen, got {min}..{max}");
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(preprocess(b"definitely not an image").is_err());
    }
}
