use crate::error::AppError;
use crate::services::exif_service;
use base64::Engine;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;
use std::path::Path;

/// Extensions offered by the file picker. Nothing else filters the input.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// A picked file, ready both for display and for the classifier.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub file_name: String,
    pub data_uri: String,
    pub image: DynamicImage,
}

pub trait ImageDecoder: Send + Sync + 'static {
    fn decode(&self, path: &Path) -> Result<DecodedImage, AppError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageDecoder;

impl ImageDecoder for FileImageDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage, AppError> {
        let bytes = std::fs::read(path).map_err(|e| {
            AppError::decode(format!("Failed to read image {}: {}", path.display(), e))
        })?;

        let file_name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        decode_bytes(file_name, &bytes)
    }
}

/// Decodes an encoded image held in memory.
///
/// The data URI carries the original bytes untouched, so the webview applies
/// its own EXIF handling. The bitmap handed to the classifier is rotated here.
pub fn decode_bytes(file_name: String, bytes: &[u8]) -> Result<DecodedImage, AppError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AppError::decode(format!("Failed to inspect {}: {}", file_name, e)))?;

    let format = reader
        .format()
        .ok_or_else(|| AppError::decode(format!("Unrecognized image format: {}", file_name)))?;

    let img = reader
        .decode()
        .map_err(|e| AppError::decode(format!("Failed to decode image {}: {}", file_name, e)))?;

    let orientation = exif_service::read_orientation(bytes);
    let img = exif_service::apply_orientation(img, orientation);

    Ok(DecodedImage {
        data_uri: to_data_uri(format.to_mime_type(), bytes),
        file_name,
        image: img,
    })
}

pub fn to_data_uri(mime: &str, bytes: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{};base64,{}", mime, b64)
}
