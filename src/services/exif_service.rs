use exif::{In, Tag, Value};
use image::DynamicImage;
use std::io::Cursor;

// EXIF lives in the file header; 128KB covers every camera we have seen.
const HEADER_LIMIT: usize = 128 * 1024;

/// Reads the EXIF orientation tag from an encoded image, defaulting to 1 (upright).
pub fn read_orientation(bytes: &[u8]) -> u32 {
    let header = &bytes[..bytes.len().min(HEADER_LIMIT)];

    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(header)) {
        Ok(e) => e,
        Err(_) => return 1,
    };

    match exif.get_field(Tag::Orientation, In::PRIMARY).map(|f| &f.value) {
        Some(Value::Short(v)) => v.first().map(|&x| x as u32).unwrap_or(1),
        Some(Value::Long(v)) => v.first().copied().unwrap_or(1),
        _ => 1,
    }
}

/// Rotates/flips a decoded image so it is shown the way the camera held it.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.fliph().rotate90(),
        6 => img.rotate90(),
        7 => img.fliph().rotate270(),
        8 => img.rotate270(),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn bytes_without_exif_are_upright() {
        assert_eq!(read_orientation(b"not an image at all"), 1);
        assert_eq!(read_orientation(&[]), 1);
    }

    #[test]
    fn quarter_turns_swap_dimensions() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(40, 10));

        let rotated = apply_orientation(img.clone(), 6);
        assert_eq!((rotated.width(), rotated.height()), (10, 40));

        let flipped = apply_orientation(img.clone(), 3);
        assert_eq!((flipped.width(), flipped.height()), (40, 10));

        let untouched = apply_orientation(img, 1);
        assert_eq!((untouched.width(), untouched.height()), (40, 10));
    }
}
