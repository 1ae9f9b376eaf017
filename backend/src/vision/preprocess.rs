use image::imageops::FilterType;
use image::{ImageFormat, ImageReader};
use ndarray::{Array3, ArrayView3};
use sha2::{Digest, Sha256};
use std::io::Cursor;

use super::filters;
use crate::config::{ConfigError, PreprocessingConfig};

/// Side length of the square network input.
pub const INPUT_SIZE: usize = 224;
pub const INPUT_CHANNELS: usize = 3;
pub const DEFAULT_MAX_PIXELS: u64 = 40_000_000;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Invalid image format: {0}")]
    InvalidImageFormat(String),
    #[error("Image too large: {size} bytes exceeds the {limit} byte limit")]
    ImageTooLarge { size: usize, limit: usize },
}

/// Encodings the service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Bmp,
}

impl ImageKind {
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        match mime_type.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(ImageKind::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageKind::Jpeg),
            "image/bmp" | "image/x-bmp" | "image/x-ms-bmp" => Some(ImageKind::Bmp),
            _ => None,
        }
    }

    pub fn from_extension(file_name: &str) -> Option<Self> {
        let ext = std::path::Path::new(file_name).extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageKind::Png),
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "bmp" => Some(ImageKind::Bmp),
            _ => None,
        }
    }

    fn from_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Png => Some(ImageKind::Png),
            ImageFormat::Jpeg => Some(ImageKind::Jpeg),
            ImageFormat::Bmp => Some(ImageKind::Bmp),
            _ => None,
        }
    }

    fn format(self) -> ImageFormat {
        match self {
            ImageKind::Png => ImageFormat::Png,
            ImageKind::Jpeg => ImageFormat::Jpeg,
            ImageKind::Bmp => ImageFormat::Bmp,
        }
    }
}

/// Raw upload as received from the transport. Never mutated.
#[derive(Debug, Clone)]
pub struct ImageBytes {
    data: Vec<u8>,
    mime_type: Option<String>,
    file_name: Option<String>,
}

impl ImageBytes {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            mime_type: None,
            file_name: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        hex::encode(hasher.finalize())
    }

    /// Kind the producer claims, from the MIME type or else the file name.
    /// `Ok(None)` means nothing usable was declared.
    fn declared_kind(&self) -> Result<Option<ImageKind>, PreprocessError> {
        match self.mime_type() {
            Some(mime) if !is_undeclared_mime(mime) => ImageKind::from_mime(mime)
                .map(Some)
                .ok_or_else(|| {
                    PreprocessError::InvalidImageFormat(format!("unsupported type '{}'", mime))
                }),
            _ => match self.file_name() {
                Some(name) if std::path::Path::new(name).extension().is_some() => {
                    ImageKind::from_extension(name).map(Some).ok_or_else(|| {
                        PreprocessError::InvalidImageFormat(format!(
                            "unsupported file type '{}'",
                            name
                        ))
                    })
                }
                _ => Ok(None),
            },
        }
    }
}

fn is_undeclared_mime(mime: &str) -> bool {
    let mime = mime.trim();
    mime.is_empty() || mime.eq_ignore_ascii_case("application/octet-stream")
}

/// Normalized HWC input of shape `(224, 224, 3)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedTensor {
    data: Array3<f32>,
}

impl PreprocessedTensor {
    pub(crate) fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }
}

/// Bytes -> decode -> circular mask -> blur -> resize -> normalize.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    max_bytes: usize,
    max_pixels: u64,
    blur_sigma: f32,
    filter: FilterType,
}

impl Preprocessor {
    pub fn new(max_bytes: usize, blur_sigma: f32, filter: FilterType) -> Self {
        Self {
            max_bytes,
            max_pixels: DEFAULT_MAX_PIXELS,
            blur_sigma,
            filter,
        }
    }

    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = max_pixels;
        self
    }

    pub fn from_config(config: &PreprocessingConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.max_upload_bytes,
            config.blur_sigma,
            config.filter()?,
        )
        .with_max_pixels(config.max_image_pixels))
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Size, type and dimension checks. Only the image header is read.
    pub fn validate(&self, image: &ImageBytes) -> Result<ImageKind, PreprocessError> {
        if image.len() > self.max_bytes {
            return Err(PreprocessError::ImageTooLarge {
                size: image.len(),
                limit: self.max_bytes,
            });
        }
        if image.is_empty() {
            return Err(PreprocessError::InvalidImageFormat(
                "empty file uploaded".to_string(),
            ));
        }

        let declared = image.declared_kind()?;
        let detected = image::guess_format(image.data())
            .ok()
            .and_then(ImageKind::from_format)
            .ok_or_else(|| {
                PreprocessError::InvalidImageFormat(
                    "content is not a PNG, JPEG or BMP image".to_string(),
                )
            })?;

        if let Some(kind) = declared.filter(|kind| *kind != detected) {
            return Err(PreprocessError::InvalidImageFormat(format!(
                "declared {:?} but content is {:?}",
                kind, detected
            )));
        }

        let (w, h) = ImageReader::with_format(Cursor::new(image.data()), detected.format())
            .into_dimensions()
            .map_err(|e| PreprocessError::InvalidImageFormat(e.to_string()))?;
        if u64::from(w) * u64::from(h) > self.max_pixels {
            return Err(PreprocessError::InvalidImageFormat(format!(
                "{}x{} image exceeds the {} pixel limit",
                w, h, self.max_pixels
            )));
        }
        Ok(detected)
    }

    pub fn prepare(&self, image: &ImageBytes) -> Result<PreprocessedTensor, PreprocessError> {
        let kind = self.validate(image)?;

        let decoded = image::load_from_memory_with_format(image.data(), kind.format())
            .map_err(|e| PreprocessError::InvalidImageFormat(e.to_string()))?;
        let rgb = decoded.to_rgb8();
        let (w, h) = rgb.dimensions();
        if w == 0 || h == 0 {
            return Err(PreprocessError::InvalidImageFormat(
                "image has no pixels".to_string(),
            ));
        }

        let masked = filters::circular_mask(&rgb);
        let blurred = filters::gaussian_blur(&masked, self.blur_sigma);
        let resized = filters::resize(&blurred, INPUT_SIZE as u32, self.filter);
        let tensor = filters::normalize(&resized);

        log::debug!(
            "Preprocessed {:?} image {}x{} -> {:?}",
            kind,
            w,
            h,
            tensor.shape()
        );
        Ok(PreprocessedTensor::new(tensor))
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(10 * 1024 * 1024, 10.0, FilterType::Triangle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    fn encode(img: RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn fundus_like(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                (x * 255 / w.max(1)) as u8,
                (y * 255 / h.max(1)) as u8,
                ((x ^ y) & 0xff) as u8,
            ])
        })
    }

    fn fast() -> Preprocessor {
        Preprocessor::new(10 * 1024 * 1024, 2.0, FilterType::Triangle)
    }

    #[test]
    fn oversized_upload_is_rejected_before_decoding() {
        let bytes = ImageBytes::new(vec![0u8; 15 * 1024 * 1024]).with_mime_type("image/png");
        match Preprocessor::default().prepare(&bytes) {
            Err(PreprocessError::ImageTooLarge { size, limit }) => {
                assert_eq!(size, 15 * 1024 * 1024);
                assert_eq!(limit, 10 * 1024 * 1024);
            }
            other => panic!("expected ImageTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn text_renamed_to_png_is_invalid() {
        let bytes = ImageBytes::new(b"patient notes, not an image\n".to_vec())
            .with_file_name("scan.png");
        assert!(matches!(
            fast().prepare(&bytes),
            Err(PreprocessError::InvalidImageFormat(_))
        ));
    }

    #[test]
    fn unsupported_or_mismatched_types_are_invalid() {
        let png = encode(fundus_like(32, 32), ImageFormat::Png);

        let gif = ImageBytes::new(png.clone()).with_mime_type("image/gif");
        assert!(matches!(
            fast().validate(&gif),
            Err(PreprocessError::InvalidImageFormat(_))
        ));

        let mislabeled = ImageBytes::new(png.clone()).with_mime_type("image/jpeg");
        assert!(matches!(
            fast().validate(&mislabeled),
            Err(PreprocessError::InvalidImageFormat(_))
        ));

        let empty = ImageBytes::new(Vec::new()).with_mime_type("image/png");
        assert!(matches!(
            fast().validate(&empty),
            Err(PreprocessError::InvalidImageFormat(_))
        ));

        let sniffed = ImageBytes::new(png).with_mime_type("application/octet-stream");
        assert_eq!(fast().validate(&sniffed).unwrap(), ImageKind::Png);
    }

    #[test]
    fn pixel_ceiling_rejects_large_dimensions() {
        let bytes = ImageBytes::new(encode(fundus_like(120, 90), ImageFormat::Png));
        let capped = fast().with_max_pixels(100 * 100);
        match capped.validate(&bytes) {
            Err(PreprocessError::InvalidImageFormat(msg)) => {
                assert!(msg.contains("120x90"), "{}", msg)
            }
            other => panic!("expected InvalidImageFormat, got {:?}", other),
        }
        assert!(fast().with_max_pixels(120 * 90).validate(&bytes).is_ok());
    }

    #[test]
    fn huge_declared_dimensions_are_rejected_from_the_header() {
        // A 4x4 bitmap whose header claims 20000x20000.
        let mut bmp = encode(fundus_like(4, 4), ImageFormat::Bmp);
        bmp[18..22].copy_from_slice(&20_000i32.to_le_bytes());
        bmp[22..26].copy_from_slice(&20_000i32.to_le_bytes());
        let bytes = ImageBytes::new(bmp).with_mime_type("image/bmp");

        assert!(matches!(
            Preprocessor::default().validate(&bytes),
            Err(PreprocessError::InvalidImageFormat(_))
        ));
    }

    #[test]
    fn truncated_png_fails_decoding() {
        let mut png = encode(fundus_like(64, 64), ImageFormat::Png);
        png.truncate(png.len() / 2);
        let bytes = ImageBytes::new(png).with_mime_type("image/png");
        assert!(matches!(
            fast().prepare(&bytes),
            Err(PreprocessError::InvalidImageFormat(_))
        ));
    }

    #[test]
    fn prepare_is_bit_identical_across_calls() {
        for format in [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Bmp] {
            let bytes = ImageBytes::new(encode(fundus_like(120, 90), format));
            let first = fast().prepare(&bytes).unwrap();
            let second = fast().prepare(&bytes).unwrap();
            assert_eq!(first.shape(), &[INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS]);
            let a: Vec<u32> = first.view().iter().map(|v| v.to_bits()).collect();
            let b: Vec<u32> = second.view().iter().map(|v| v.to_bits()).collect();
            assert_eq!(a, b, "{:?}", format);
        }
    }

    #[test]
    fn black_image_masks_to_zero_and_resizes_to_input() {
        let black = RgbImage::new(300, 300);
        let masked = filters::circular_mask(&black);
        for (x, y) in [(0, 0), (299, 0), (0, 299), (299, 299), (10, 290)] {
            assert_eq!(masked.get_pixel(x, y), &Rgb([0, 0, 0]));
        }

        let bytes = ImageBytes::new(encode(black, ImageFormat::Png)).with_mime_type("image/png");
        let tensor = fast().prepare(&bytes).unwrap();
        assert_eq!(tensor.shape(), &[224, 224, 3]);
        assert!(tensor.view().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn masked_corners_stay_dark_after_pipeline() {
        let white = RgbImage::from_pixel(256, 256, Rgb([255, 255, 255]));
        let bytes = ImageBytes::new(encode(white, ImageFormat::Png));
        let tensor = fast().prepare(&bytes).unwrap();
        let view = tensor.view();
        assert!(view[[0, 0, 0]] < 0.05);
        assert!(view[[112, 112, 0]] > 0.95);
        assert!(view.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn digest_is_content_addressed() {
        let a = ImageBytes::new(vec![1, 2, 3]).with_mime_type("image/png");
        let b = ImageBytes::new(vec![1, 2, 3]).with_file_name("other.bmp");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
