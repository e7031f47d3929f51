//! Image decoding and the upload preprocessing shared by hosted backends.
//!
//! Hosted providers reject large request bodies, so images above the upload
//! ceiling are re-encoded before they are embedded as a base64 data URL.
//! All re-encoding happens in memory; no temporary file is ever created.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder, ImageFormat};
use std::path::Path;
use std::sync::Once;

use crate::error::CaptionError;

/// Upload ceiling for the raw (pre-base64) image bytes.
pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

const START_QUALITY: u8 = 90;
const MIN_QUALITY: u8 = 10;
const QUALITY_STEP: u8 = 10;
const SCALE_FACTOR: f64 = 0.9;
const MIN_DIMENSION: u32 = 100;
const RESIZE_FILTER: FilterType = FilterType::Lanczos3;
const FALLBACK_MIME: &str = "application/octet-stream";

static JXL_DECODER_HOOK: Once = Once::new();

pub fn ensure_jxl_decoder_registered() {
    JXL_DECODER_HOOK.call_once(|| {
        if jxl_oxide::integration::register_image_decoding_hook() {
            log::info!("Registered JPEG XL decoder hook");
        }
    });
}

pub fn open_image(path: &Path) -> Result<DynamicImage, CaptionError> {
    ensure_jxl_decoder_registered();
    Ok(image::open(path)?)
}

/// Image bytes ready for upload plus their MIME type.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

impl EncodedImage {
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime,
            BASE64_STANDARD.encode(&self.bytes)
        )
    }
}

/// Reads `path` and returns a data URL whose payload is at most
/// [`MAX_UPLOAD_BYTES`] whenever the image can be shrunk that far.
pub fn image_to_data_url(path: &Path) -> Result<String, CaptionError> {
    let encoded = encode_within_limit(path, MAX_UPLOAD_BYTES)?;
    log::debug!(
        "Encoded {} as {} ({} bytes)",
        path.display(),
        encoded.mime,
        encoded.bytes.len()
    );
    Ok(encoded.to_data_url())
}

/// Returns the file unchanged when it fits in `max_bytes`; otherwise
/// re-encodes it.
///
/// Opaque images are re-encoded as JPEG at quality 90, 80, …, 10. Images with
/// an alpha channel stay PNG, where quality has no effect. When quality is
/// exhausted the dimensions shrink by 10%, never below 100px on either side,
/// and the quality sweep restarts at 90 for the new size. If that floor is reached first, the last encoding is used
/// even though it is still over the limit.
pub fn encode_within_limit(path: &Path, max_bytes: u64) -> Result<EncodedImage, CaptionError> {
    let file_size = std::fs::metadata(path)
        .map_err(|e| CaptionError::io(path, e))?
        .len();

    if file_size <= max_bytes {
        let bytes = std::fs::read(path).map_err(|e| CaptionError::io(path, e))?;
        let mime = mime_for(path, &bytes);
        return Ok(EncodedImage { bytes, mime });
    }

    log::info!(
        "Image {} is too large ({:.2} MB), re-encoding",
        path.display(),
        file_size as f64 / (1024.0 * 1024.0)
    );

    let mut img = open_image(path)?;
    let keep_alpha = img.color().has_alpha();

    let mut quality = START_QUALITY;
    let mut encoded = encode(&img, keep_alpha, quality)?;
    while !fits(&encoded, max_bytes) {
        if !keep_alpha && quality > MIN_QUALITY {
            quality -= QUALITY_STEP;
        } else {
            let new_width = (img.width() as f64 * SCALE_FACTOR) as u32;
            let new_height = (img.height() as f64 * SCALE_FACTOR) as u32;
            if new_width < MIN_DIMENSION || new_height < MIN_DIMENSION {
                log::warn!(
                    "{} could not be shrunk under {} bytes without going below {}px; sending {} bytes",
                    path.display(),
                    max_bytes,
                    MIN_DIMENSION,
                    encoded.bytes.len()
                );
                break;
            }
            img = img.resize_exact(new_width, new_height, RESIZE_FILTER);
            quality = START_QUALITY;
        }
        encoded = encode(&img, keep_alpha, quality)?;
    }

    log::debug!(
        "Re-encoded {} to {}x{} at quality {} ({} bytes)",
        path.display(),
        img.width(),
        img.height(),
        quality,
        encoded.bytes.len()
    );
    Ok(encoded)
}

fn fits(encoded: &EncodedImage, max_bytes: u64) -> bool {
    encoded.bytes.len() as u64 <= max_bytes
}

fn encode(img: &DynamicImage, keep_alpha: bool, quality: u8) -> Result<EncodedImage, CaptionError> {
    let mut bytes = Vec::new();
    if keep_alpha {
        let rgba = img.to_rgba8();
        let encoder =
            PngEncoder::new_with_quality(&mut bytes, CompressionType::Best, PngFilter::Adaptive);
        encoder.write_image(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            image::ExtendedColorType::Rgba8,
        )?;
        return Ok(EncodedImage {
            bytes,
            mime: "image/png",
        });
    }

    let rgb = img.to_rgb8();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder.encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(EncodedImage {
        bytes,
        mime: "image/jpeg",
    })
}

fn mime_for(path: &Path, bytes: &[u8]) -> &'static str {
    ImageFormat::from_path(path)
        .or_else(|_| image::guess_format(bytes))
        .map(|format| format.to_mime_type())
        .unwrap_or(FALLBACK_MIME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{RgbImage, RgbaImage};
    use std::fs;
    use std::path::PathBuf;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("captioner_encoding_{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Deterministic noise compresses badly, which is what these tests need.
    fn noise_bytes(len: usize, mut seed: u32) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (seed >> 24) as u8
            })
            .collect()
    }

    fn write_noise_png(path: &Path, width: u32, height: u32) {
        let data = noise_bytes((width * height * 3) as usize, 7);
        RgbImage::from_raw(width, height, data).unwrap().save(path).unwrap();
    }

    fn dir_entries(dir: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        entries.sort();
        entries
    }

    #[test]
    fn small_file_is_sent_unchanged() {
        let dir = test_dir("small");
        let path = dir.join("tiny.png");
        write_noise_png(&path, 16, 16);
        let original = fs::read(&path).unwrap();

        let encoded = encode_within_limit(&path, MAX_UPLOAD_BYTES).unwrap();
        assert_eq!(encoded.bytes, original);
        assert_eq!(encoded.mime, "image/png");
        assert!(encoded.to_data_url().starts_with("data:image/png;base64,"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn eight_megabyte_image_is_shrunk_under_ceiling() {
        let dir = test_dir("large");
        let path = dir.join("large.png");
        write_noise_png(&path, 1700, 1700);
        assert!(fs::metadata(&path).unwrap().len() > 8 * 1024 * 1024);
        let before = dir_entries(&dir);

        let encoded = encode_within_limit(&path, MAX_UPLOAD_BYTES).unwrap();

        assert!(encoded.bytes.len() as u64 <= MAX_UPLOAD_BYTES);
        assert_eq!(encoded.mime, "image/jpeg");
        assert_eq!(dir_entries(&dir), before);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn shrinks_dimensions_once_quality_is_exhausted() {
        let dir = test_dir("scale");
        let path = dir.join("noise.png");
        write_noise_png(&path, 600, 600);

        let limit = 4 * 1024;
        let encoded = encode_within_limit(&path, limit).unwrap();
        assert!(encoded.bytes.len() as u64 <= limit);

        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert!(decoded.width() < 600);
        assert!(decoded.width() >= MIN_DIMENSION);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn quality_restarts_after_each_downscale() {
        let dir = test_dir("quality_reset");
        let path = dir.join("noise.png");
        write_noise_png(&path, 600, 600);

        // Fits once shrunk a single step at quality 90, but not at 600px.
        let shrunk = image::open(&path)
            .unwrap()
            .resize_exact(540, 540, RESIZE_FILTER);
        let limit = encode(&shrunk, false, START_QUALITY).unwrap().bytes.len() as u64;
        assert!(encode(&image::open(&path).unwrap(), false, MIN_QUALITY).unwrap().bytes.len() as u64 > limit);

        let encoded = encode_within_limit(&path, limit).unwrap();
        assert_eq!(encoded.bytes.len() as u64, limit);
        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert_eq!(decoded.width(), 540);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn gives_up_at_minimum_dimension_and_returns_last_encoding() {
        let dir = test_dir("floor");
        let path = dir.join("alpha.png");
        let data = noise_bytes(300 * 300 * 4, 11);
        RgbaImage::from_raw(300, 300, data).unwrap().save(&path).unwrap();

        let encoded = encode_within_limit(&path, 1024).unwrap();
        assert_eq!(encoded.mime, "image/png");
        assert!(encoded.bytes.len() > 1024);

        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert!(decoded.width() >= MIN_DIMENSION && decoded.height() >= MIN_DIMENSION);
        assert!((decoded.width() as f64 * SCALE_FACTOR) < MIN_DIMENSION as f64);

        fs::remove_dir_all(&dir).ok();
    }
}
