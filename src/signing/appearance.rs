//! The visible part of a signature: the composed PNG as an image XObject
//! wrapped in a form XObject sized to the widget.

use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::RgbaImage;
use lopdf::{dictionary, Object, ObjectId, Stream};

use super::serialize::format_real;
use crate::error::DocumentError;

pub struct Appearance {
    width: u32,
    height: u32,
    /// zlib compressed RGB samples.
    rgb: Vec<u8>,
    /// zlib compressed alpha channel, absent when the image is fully opaque.
    alpha: Option<Vec<u8>>,
}

impl Appearance {
    pub fn from_png_file(path: &Path) -> Result<Self, DocumentError> {
        let img = image::open(path)
            .map_err(|e| DocumentError::SignFailure(format!("signature image: {e}")))?
            .to_rgba8();
        Self::from_rgba(&img)
    }

    pub fn from_rgba(img: &RgbaImage) -> Result<Self, DocumentError> {
        let mut rgb = Vec::with_capacity(img.len() / 4 * 3);
        let mut alpha = Vec::with_capacity(img.len() / 4);
        for pixel in img.pixels() {
            rgb.extend_from_slice(&pixel.0[..3]);
            alpha.push(pixel.0[3]);
        }
        let opaque = alpha.iter().all(|&a| a == 255);

        Ok(Self {
            width: img.width(),
            height: img.height(),
            rgb: deflate(&rgb)?,
            alpha: if opaque { None } else { Some(deflate(&alpha)?) },
        })
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha.is_some()
    }

    /// Objects making up the appearance stream of a widget with `rect`.
    ///
    /// `next_id` hands out fresh object numbers. The first returned object is
    /// the form XObject to reference from `/AP /N`.
    pub fn objects(
        &self,
        rect: [f32; 4],
        mut next_id: impl FnMut() -> ObjectId,
    ) -> Vec<(ObjectId, Object)> {
        let form_id = next_id();
        let image_id = next_id();
        let mut objects = Vec::with_capacity(3);

        let mut image = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => self.width as i64,
            "Height" => self.height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        };
        let mut smask = None;
        if let Some(alpha) = &self.alpha {
            let smask_id = next_id();
            image.set("SMask", smask_id);
            smask = Some((
                smask_id,
                Object::Stream(Stream::new(
                    dictionary! {
                        "Type" => "XObject",
                        "Subtype" => "Image",
                        "Width" => self.width as i64,
                        "Height" => self.height as i64,
                        "ColorSpace" => "DeviceGray",
                        "BitsPerComponent" => 8,
                        "Filter" => "FlateDecode",
                    },
                    alpha.clone(),
                )),
            ));
        }

        let width = (rect[2] - rect[0]).abs();
        let height = (rect[3] - rect[1]).abs();
        let content = format!(
            "q {} 0 0 {} 0 0 cm /Img Do Q",
            format_real(width),
            format_real(height)
        );
        let form = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => vec![0.into(), 0.into(), Object::Real(width), Object::Real(height)],
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Img" => image_id },
            },
        };

        objects.push((form_id, Object::Stream(Stream::new(form, content.into_bytes()))));
        objects.push((image_id, Object::Stream(Stream::new(image, self.rgb.clone()))));
        objects.extend(smask);
        objects
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, DocumentError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| DocumentError::SignFailure(format!("compressing signature image: {e}")))
}
