//! Visible signature image: the role label centered above the user's
//! handwritten signature, on a single PNG canvas.

use std::io::Write;
use std::path::{Path, PathBuf};

use ab_glyph::{point, Font, FontVec, GlyphId, PxScale, ScaleFont};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use tempfile::NamedTempFile;

use crate::bitmap_font;
use crate::config::SigningConfig;
use crate::error::CredentialError;

const CAPTION_MARGIN: u32 = 10;

/// Fonts tried after the configured ones.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "arial.ttf",
    "/usr/share/fonts/truetype/msttcorefonts/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// A composed PNG on disk. The file is removed when this value is dropped,
/// whichever way the signing call ends.
pub struct SignatureImage {
    file: NamedTempFile,
    width: u32,
    height: u32,
}

impl SignatureImage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

enum CaptionFont {
    TrueType(FontVec),
    Bitmap,
}

pub struct ImageComposer {
    font_paths: Vec<PathBuf>,
    max_width: u32,
    caption_px: f32,
}

impl Default for ImageComposer {
    fn default() -> Self {
        Self::from_config(&SigningConfig::default())
    }
}

impl ImageComposer {
    pub fn from_config(config: &SigningConfig) -> Self {
        let mut font_paths = config.font_paths.clone();
        font_paths.extend(SYSTEM_FONTS.iter().map(PathBuf::from));
        Self {
            font_paths,
            max_width: config.max_image_width,
            caption_px: config.caption_px,
        }
    }

    fn load_font(&self) -> CaptionFont {
        for path in &self.font_paths {
            let Ok(bytes) = std::fs::read(path) else {
                continue;
            };
            match FontVec::try_from_vec(bytes) {
                Ok(font) => {
                    log::debug!("caption font {}", path.display());
                    return CaptionFont::TrueType(font);
                }
                Err(e) => log::debug!("skipping font {}: {e}", path.display()),
            }
        }
        log::debug!("no TrueType font found, using the bitmap font");
        CaptionFont::Bitmap
    }

    /// Builds the canvas and writes it to a temporary PNG file.
    pub fn compose(
        &self,
        base_image: &[u8],
        label: &str,
        opaque_background: bool,
    ) -> Result<SignatureImage, CredentialError> {
        let canvas = self.compose_canvas(base_image, label, opaque_background)?;

        let mut file = tempfile::Builder::new()
            .prefix("signature-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| CredentialError::InvalidImage(e.to_string()))?;
        let mut png = std::io::Cursor::new(Vec::new());
        canvas
            .write_to(&mut png, image::ImageFormat::Png)
            .map_err(|e| CredentialError::InvalidImage(e.to_string()))?;
        file.write_all(png.get_ref())
            .and_then(|_| file.flush())
            .map_err(|e| CredentialError::InvalidImage(e.to_string()))?;

        Ok(SignatureImage {
            file,
            width: canvas.width(),
            height: canvas.height(),
        })
    }

    pub fn compose_canvas(
        &self,
        base_image: &[u8],
        label: &str,
        opaque_background: bool,
    ) -> Result<RgbaImage, CredentialError> {
        if base_image.is_empty() {
            return Err(CredentialError::MissingImage);
        }
        let mut img = image::load_from_memory(base_image)
            .map_err(|e| CredentialError::InvalidImage(e.to_string()))?
            .to_rgba8();

        if img.width() > self.max_width {
            let height = (img.height() as u64 * self.max_width as u64 / img.width() as u64).max(1);
            img = imageops::resize(&img, self.max_width, height as u32, FilterType::Lanczos3);
        }

        if opaque_background {
            img = flatten_on_white(&img);
        }

        if label.is_empty() {
            return Ok(img);
        }

        let font = self.load_font();
        let (text_w, text_h) = match &font {
            CaptionFont::TrueType(font) => truetype_size(font, self.caption_px, label),
            CaptionFont::Bitmap => bitmap_font::text_size(label),
        };

        let width = img.width().max(text_w + 20);
        let height = img.height() + text_h + CAPTION_MARGIN * 2;
        let background = if opaque_background {
            Rgba([255, 255, 255, 255])
        } else {
            Rgba([255, 255, 255, 0])
        };
        let mut canvas = RgbaImage::from_pixel(width, height, background);

        let text_x = (width - text_w) / 2;
        let text_y = CAPTION_MARGIN;
        match &font {
            CaptionFont::TrueType(font) => {
                draw_truetype(&mut canvas, font, self.caption_px, label, text_x, text_y)
            }
            CaptionFont::Bitmap => bitmap_font::render(label, |x, y| {
                blend_black(&mut canvas, text_x + x, text_y + y, 1.0)
            }),
        }

        let image_x = ((width - img.width()) / 2) as i64;
        let image_y = (text_h + CAPTION_MARGIN * 2) as i64;
        if opaque_background {
            imageops::replace(&mut canvas, &img, image_x, image_y);
        } else {
            imageops::overlay(&mut canvas, &img, image_x, image_y);
        }

        Ok(canvas)
    }
}

/// Removes transparency by painting the image over opaque white.
fn flatten_on_white(img: &RgbaImage) -> RgbaImage {
    let mut flat = RgbaImage::from_pixel(img.width(), img.height(), Rgba([255, 255, 255, 255]));
    imageops::overlay(&mut flat, img, 0, 0);
    flat
}

fn truetype_size(font: &FontVec, px: f32, text: &str) -> (u32, u32) {
    let scaled = font.as_scaled(PxScale::from(px));
    let mut width = 0.0;
    let mut previous: Option<GlyphId> = None;
    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(prev) = previous {
            width += scaled.kern(prev, id);
        }
        width += scaled.h_advance(id);
        previous = Some(id);
    }
    let height = scaled.ascent() - scaled.descent();
    (width.ceil() as u32, height.ceil() as u32)
}

fn draw_truetype(canvas: &mut RgbaImage, font: &FontVec, px: f32, text: &str, x: u32, y: u32) {
    let scale = PxScale::from(px);
    let scaled = font.as_scaled(scale);
    let mut caret = x as f32;
    let baseline = y as f32 + scaled.ascent();
    let mut previous: Option<GlyphId> = None;

    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(prev) = previous {
            caret += scaled.kern(prev, id);
        }
        let glyph = id.with_scale_and_position(scale, point(caret, baseline));
        caret += scaled.h_advance(id);
        previous = Some(id);

        let Some(outlined) = font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        outlined.draw(|gx, gy, coverage| {
            let px = bounds.min.x as i64 + gx as i64;
            let py = bounds.min.y as i64 + gy as i64;
            if px >= 0 && py >= 0 {
                blend_black(canvas, px as u32, py as u32, coverage);
            }
        });
    }
}

/// Paints black with the given coverage over the pixel (source over).
fn blend_black(canvas: &mut RgbaImage, x: u32, y: u32, coverage: f32) {
    if x >= canvas.width() || y >= canvas.height() {
        return;
    }
    let src_a = coverage.clamp(0.0, 1.0);
    let pixel = canvas.get_pixel_mut(x, y);
    let dst_a = pixel[3] as f32 / 255.0;
    let out_a = src_a + dst_a * (1.0 - src_a);
    if out_a > 0.0 {
        for channel in 0..3 {
            let dst = pixel[channel] as f32;
            pixel[channel] = (dst * dst_a * (1.0 - src_a) / out_a).round() as u8;
        }
    }
    pixel[3] = (out_a * 255.0).round() as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::signature_png;

    fn bitmap_only() -> ImageComposer {
        ImageComposer {
            font_paths: Vec::new(),
            max_width: 300,
            caption_px: 10.0,
        }
    }

    #[test]
    fn wide_images_are_scaled_down() {
        let canvas = bitmap_only()
            .compose_canvas(&signature_png(600, 200), "Aprobado por:", false)
            .unwrap();
        // 300x100 image, 7px caption, two 10px margins.
        assert_eq!(canvas.width(), 300);
        assert_eq!(canvas.height(), 100 + 7 + 20);
    }

    #[test]
    fn caption_wider_than_image() {
        let label = "Contabilizado y revisado por:";
        let canvas = bitmap_only()
            .compose_canvas(&signature_png(40, 20), label, false)
            .unwrap();
        let (text_w, _) = bitmap_font::text_size(label);
        assert_eq!(canvas.width(), text_w + 20);
        assert_eq!(canvas.height(), 20 + 7 + 20);
    }

    #[test]
    fn background_alpha() {
        let transparent = bitmap_only()
            .compose_canvas(&signature_png(120, 60), "Revisado por:", false)
            .unwrap();
        assert_eq!(transparent.get_pixel(0, 0)[3], 0);
        // Caption pixels are drawn in black.
        assert!(transparent.pixels().any(|p| p[3] == 255 && p[0] == 0));

        let opaque = bitmap_only()
            .compose_canvas(&signature_png(120, 60), "Revisado por:", true)
            .unwrap();
        assert!(opaque.pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn temporary_file_is_removed_on_drop() {
        let image = bitmap_only()
            .compose(&signature_png(80, 40), "Aprobado por:", true)
            .unwrap();
        let path = image.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "png");
        assert_eq!(image.height(), 40 + 7 + 20);
        drop(image);
        assert!(!path.exists());
    }

    #[test]
    fn rejects_missing_or_broken_images() {
        assert!(matches!(
            bitmap_only().compose_canvas(b"", "x", false),
            Err(CredentialError::MissingImage)
        ));
        assert!(matches!(
            bitmap_only().compose_canvas(b"not a png", "x", false),
            Err(CredentialError::InvalidImage(_))
        ));
    }
}
