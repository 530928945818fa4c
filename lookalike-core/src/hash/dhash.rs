//! Difference hash (dhash) over orientation-corrected luma samples.

use super::HashBits;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageDecoder, ImageReader, Luma};
use std::path::Path;
use std::time::Duration;

/// Per-file hashing failure. Never escapes the per-file boundary.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("cannot open image: {0}")]
    Open(#[from] std::io::Error),

    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image has no pixels")]
    Empty,

    #[error("hashing timed out after {0:?}")]
    Timeout(Duration),

    #[error("hasher panicked: {0}")]
    Panicked(String),
}

impl HashError {
    /// Whether the failure describes the file itself (and should be cached as
    /// Unreadable) rather than a transient condition.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, HashError::Timeout(_))
    }
}

/// Anything that can turn an image file into hash bits.
pub trait ImageHasher: Send + Sync {
    fn hash_file(&self, path: &Path, hash_size: u32) -> Result<HashBits, HashError>;
}

/// The one hashing routine shared by ad-hoc matching and directory indexing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DHasher;

impl ImageHasher for DHasher {
    fn hash_file(&self, path: &Path, hash_size: u32) -> Result<HashBits, HashError> {
        let mut decoder = ImageReader::open(path)?
            .with_guessed_format()?
            .into_decoder()?;
        let orientation = decoder.orientation()?;
        let mut img = DynamicImage::from_decoder(decoder)?;
        img.apply_orientation(orientation);

        if img.width() == 0 || img.height() == 0 {
            return Err(HashError::Empty);
        }
        Ok(dhash_image(&img, hash_size))
    }
}

/// Compute the dhash of a decoded image.
///
/// The image is normalized to RGB, reduced to 8-bit luma with ITU-R 601-2
/// weights, resized to `(hash_size + 1) x hash_size`, and each row yields
/// `hash_size` bits of `right > left`.
pub fn dhash_image(img: &DynamicImage, hash_size: u32) -> HashBits {
    let gray = luma_601(img);
    let small = imageops::resize(&gray, hash_size + 1, hash_size, FilterType::Lanczos3);

    let mut bits = Vec::with_capacity((hash_size * hash_size) as usize);
    for y in 0..hash_size {
        for x in 0..hash_size {
            let left = small.get_pixel(x, y)[0];
            let right = small.get_pixel(x + 1, y)[0];
            bits.push(right > left);
        }
    }
    HashBits::from_bits(bits)
}

fn luma_601(img: &DynamicImage) -> GrayImage {
    let rgb = img.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16;
        Luma([l as u8])
    })
}
