//! Renders protocol QR payloads into PNG images.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;

/// A rendered image ready to send.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// QR renderer with a bounded output size.
#[derive(Debug, Clone)]
pub struct QrRenderer {
    max_size: u32,
    quiet_zone: bool,
}

impl QrRenderer {
    pub fn new(max_size: u32) -> Self {
        Self {
            max_size,
            quiet_zone: true,
        }
    }

    pub fn render(&self, payload: &str) -> Result<ImageArtifact, String> {
        let code = QrCode::new(payload.as_bytes()).map_err(|e| format!("Failed to encode QR: {e}"))?;

        let image = code
            .render::<Luma<u8>>()
            .quiet_zone(self.quiet_zone)
            .max_dimensions(self.max_size, self.max_size)
            .build();
        let (width, height) = image.dimensions();

        let mut png = Vec::new();
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| format!("Failed to encode PNG: {e}"))?;

        Ok(ImageArtifact { png, width, height })
    }
}

impl Default for QrRenderer {
    fn default() -> Self {
        Self::new(512)
    }
}
