use std::io::Cursor;

use image::{GenericImageView, ImageFormat, ImageReader};

const THUMBNAIL_WIDTH: u32 = 256;
const THUMBNAIL_HEIGHT: u32 = 256;

#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub png_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decodes an image and encodes a PNG preview no larger than 256x256.
pub fn generate_thumbnail(bytes: &[u8]) -> Result<Thumbnail, String> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| err.to_string())?;
    let image = reader.decode().map_err(|err| err.to_string())?;

    let thumbnail = if image.width() > THUMBNAIL_WIDTH || image.height() > THUMBNAIL_HEIGHT {
        image.thumbnail(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT)
    } else {
        image
    };

    let (width, height) = thumbnail.dimensions();
    let mut cursor = Cursor::new(Vec::new());
    thumbnail
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|err| err.to_string())?;

    Ok(Thumbnail {
        png_bytes: cursor.into_inner(),
        width,
        height,
    })
}
