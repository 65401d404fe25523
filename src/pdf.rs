//! PDF page rasterization.
//!
//! Scanned PDFs carry each page as an embedded image. [`EmbeddedImageRasterizer`]
//! pulls the largest image XObject out of every page instead of rendering the
//! page content stream.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use thiserror::Error;
use tracing::debug;

const MAX_TREE_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("Failed to load PDF: {0}")]
    Load(String),

    #[error("PDF has no pages")]
    NoPages,

    #[error("No recognizable page images in the first {0} page(s)")]
    NoImages(usize),
}

/// One rasterized page, encoded as an image file (PNG or JPEG).
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    /// 1-based page number.
    pub page: u32,
    pub bytes: Vec<u8>,
}

/// Turns a PDF into page images. CPU bound; call from a blocking context.
pub trait PageRasterizer: Send + Sync {
    fn rasterize(&self, pdf: &[u8], max_pages: usize) -> Result<Vec<PageImage>, PdfError>;
}

/// Rasterizer that extracts embedded page images with lopdf.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedImageRasterizer;

impl PageRasterizer for EmbeddedImageRasterizer {
    fn rasterize(&self, pdf: &[u8], max_pages: usize) -> Result<Vec<PageImage>, PdfError> {
        let doc = Document::load_mem(pdf).map_err(|e| PdfError::Load(e.to_string()))?;

        let pages = doc.get_pages();
        if pages.is_empty() {
            return Err(PdfError::NoPages);
        }

        let mut images = Vec::new();
        for (page_num, page_id) in pages.into_iter().take(max_pages) {
            match largest_page_image(&doc, page_id) {
                Some(bytes) => images.push(PageImage {
                    page: page_num,
                    bytes,
                }),
                None => debug!("Page {} has no usable embedded image", page_num),
            }
        }

        if images.is_empty() {
            return Err(PdfError::NoImages(max_pages));
        }
        Ok(images)
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Page resources, following `Parent` links for inherited entries.
fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(resources) = node.get(b"Resources") {
            return resolve(doc, resources)?.as_dict().ok();
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn largest_page_image(doc: &Document, page_id: ObjectId) -> Option<Vec<u8>> {
    let resources = page_resources(doc, page_id)?;
    let xobjects = resolve(doc, resources.get(b"XObject").ok()?)?.as_dict().ok()?;

    let mut best: Option<(i64, &Stream)> = None;
    for (_, obj) in xobjects.iter() {
        let Some(stream) = resolve(doc, obj).and_then(|o| o.as_stream().ok()) else {
            continue;
        };
        if stream.dict.get(b"Subtype").and_then(Object::as_name).ok() != Some(b"Image".as_slice()) {
            continue;
        }
        let area = dimension(stream, b"Width").saturating_mul(dimension(stream, b"Height"));
        if best.map_or(true, |(a, _)| area > a) {
            best = Some((area, stream));
        }
    }

    let (_, stream) = best?;
    encode_image_stream(doc, stream)
}

fn dimension(stream: &Stream, key: &[u8]) -> i64 {
    stream.dict.get(key).and_then(Object::as_i64).unwrap_or(0)
}

fn filter_names(stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().ok().map(|n| n.to_vec()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Number of color components, for the color spaces we can rebuild.
fn components(doc: &Document, stream: &Stream) -> Option<u32> {
    let color_space = resolve(doc, stream.dict.get(b"ColorSpace").ok()?)?;
    match color_space {
        Object::Name(name) => match name.as_slice() {
            b"DeviceGray" | b"CalGray" => Some(1),
            b"DeviceRGB" | b"CalRGB" => Some(3),
            _ => None,
        },
        Object::Array(items) if items.first().and_then(|o| o.as_name().ok()) == Some(b"ICCBased".as_slice()) => {
            let profile = resolve(doc, items.get(1)?)?.as_stream().ok()?;
            match profile.dict.get(b"N").and_then(Object::as_i64).ok()? {
                1 => Some(1),
                3 => Some(3),
                _ => None,
            }
        }
        _ => None,
    }
}

fn encode_image_stream(doc: &Document, stream: &Stream) -> Option<Vec<u8>> {
    let filters = filter_names(stream);

    if filters.iter().any(|f| f == b"DCTDecode") {
        // Only a bare DCT stream is a standalone JPEG file
        return (filters.len() == 1).then(|| stream.content.clone());
    }

    let raw = match filters.as_slice() {
        [] => stream.content.clone(),
        [f] if f == b"FlateDecode" => stream.decompressed_content().ok()?,
        _ => {
            debug!("Unsupported image filters: {:?}", filters);
            return None;
        }
    };

    if stream.dict.get(b"BitsPerComponent").and_then(Object::as_i64).ok()? != 8 {
        return None;
    }
    let width = u32::try_from(dimension(stream, b"Width")).ok()?;
    let height = u32::try_from(dimension(stream, b"Height")).ok()?;

    let image = match components(doc, stream)? {
        1 => DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, raw)?),
        _ => DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, raw)?),
    };

    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .ok()?;
    Some(buf)
}
