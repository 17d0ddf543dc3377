//! Artifact assembly: screenshots → one captioned PDF page each.
//!
//! ## Why a PDF?
//!
//! The engine takes one uploaded document per request. A paginated PDF keeps
//! every screenshot at its native aspect ratio and lets each page carry its
//! file name as a caption, which is how the model learns which name to put
//! in a step's `screenshotRef`.
//!
//! ## Why spawn_blocking?
//!
//! Decoding and re-encoding full-resolution screenshots is CPU-bound and
//! would stall a Tokio worker for hundreds of milliseconds per page.

use crate::error::JobError;
use crate::pipeline::fetch::ResourceHandle;
use image::codecs::jpeg::JpegEncoder;
use lopdf::{dictionary, Document, Object, Stream};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// US Letter, in points.
pub const PAGE_WIDTH: f64 = 612.0;
pub const PAGE_HEIGHT: f64 = 792.0;

/// Horizontal and vertical room left around the image.
const H_MARGIN: f64 = 40.0;
const V_MARGIN: f64 = 60.0;

/// Distance from the image's bottom edge to the caption baseline.
const CAPTION_GAP: f64 = 20.0;
const CAPTION_FONT_SIZE: u32 = 12;

const JPEG_QUALITY: u8 = 90;

/// Placement of one image on a page, in points from the bottom-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageLayout {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl PageLayout {
    pub fn caption_y(&self) -> f64 {
        self.y - CAPTION_GAP
    }
}

/// Scale `(w, h)` to fit the page margins, preserving aspect ratio, centred.
pub fn fit_to_page(w: u32, h: u32) -> PageLayout {
    let (w, h) = (f64::from(w.max(1)), f64::from(h.max(1)));
    let scale = ((PAGE_WIDTH - H_MARGIN) / w).min((PAGE_HEIGHT - V_MARGIN) / h);
    let (width, height) = (w * scale, h * scale);
    PageLayout {
        x: (PAGE_WIDTH - width) / 2.0,
        y: (PAGE_HEIGHT - height) / 2.0,
        width,
        height,
    }
}

/// Contents of the event-log file, or why it could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPayload {
    Text(String),
    Unreadable(String),
}

impl DataPayload {
    /// Non-blank text, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            DataPayload::Text(t) if !t.trim().is_empty() => Some(t),
            _ => None,
        }
    }
}

/// The document uploaded to the engine plus the event log that accompanies it.
#[derive(Debug, Clone)]
pub struct AssembledArtifact {
    /// Serialized PDF.
    pub document: Vec<u8>,
    pub page_count: usize,
    pub data: DataPayload,
}

/// Build the paginated document from `images` and read `data`.
///
/// Pages follow display-name order. An individual undecodable image is
/// skipped with a warning; `EmptyInput` when nothing usable remains.
pub async fn build(images: &[ResourceHandle], data: &ResourceHandle) -> Result<AssembledArtifact, JobError> {
    if images.is_empty() {
        return Err(JobError::EmptyInput {
            detail: "no screenshots to assemble".into(),
        });
    }
    let mut pages: Vec<(PathBuf, String)> = images
        .iter()
        .map(|h| (h.local_path().to_path_buf(), h.display_name().to_string()))
        .collect();
    pages.sort_by(|a, b| a.1.cmp(&b.1));

    let (document, page_count) = tokio::task::spawn_blocking(move || render_document(&pages))
        .await
        .map_err(|e| JobError::Internal(format!("Assembly task panicked: {e}")))??;

    let data = read_data(data).await;
    info!("Assembled {} pages ({} bytes)", page_count, document.len());
    Ok(AssembledArtifact {
        document,
        page_count,
        data,
    })
}

/// Read the event log as opaque text. Never fails; see [`DataPayload`].
pub async fn read_data(handle: &ResourceHandle) -> DataPayload {
    match tokio::fs::read(handle.local_path()).await {
        Err(e) => DataPayload::Unreadable(format!("{}: {e}", handle.display_name())),
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => DataPayload::Text(text),
            Err(e) => DataPayload::Unreadable(format!("{}: not UTF-8 ({e})", handle.display_name())),
        },
    }
}

fn render_document(pages: &[(PathBuf, String)]) -> Result<(Vec<u8>, usize), JobError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for (path, name) in pages {
        let (jpeg, w, h) = match encode_page_image(path) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping screenshot {}: {}", name, e);
                continue;
            }
        };
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(w),
                "Height" => i64::from(h),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));

        let layout = fit_to_page(w, h);
        let content = format!(
            "q\n{:.2} 0 0 {:.2} {:.2} {:.2} cm\n/Im1 Do\nQ\nBT\n/F1 {} Tf\n{:.2} {:.2} Td\n({}) Tj\nET\n",
            layout.width,
            layout.height,
            layout.x,
            layout.y,
            CAPTION_FONT_SIZE,
            layout.x,
            layout.caption_y(),
            escape_pdf_text(&format!("page_name: {name}")),
        );
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), (PAGE_WIDTH as i64).into(), (PAGE_HEIGHT as i64).into()],
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
                "XObject" => dictionary! { "Im1" => image_id },
            },
            "Contents" => content_id,
        });
        kids.push(page_id.into());
        debug!("Added page {} for {} ({}x{})", kids.len(), name, w, h);
    }

    if kids.is_empty() {
        return Err(JobError::EmptyInput {
            detail: format!("none of {} screenshots could be decoded", pages.len()),
        });
    }

    let page_count = kids.len();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| JobError::Internal(format!("PDF serialisation failed: {e}")))?;
    Ok((buffer, page_count))
}

/// Decode any supported screenshot and re-encode it as baseline JPEG.
fn encode_page_image(path: &std::path::Path) -> Result<(Vec<u8>, u32, u32), String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let img = image::load_from_memory(&bytes).map_err(|e| e.to_string())?;
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    if w == 0 || h == 0 {
        return Err("image has no pixels".into());
    }
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| e.to_string())?;
    Ok((jpeg, w, h))
}

/// Escape a caption for a PDF literal string; non-Latin-1 becomes `?`.
fn escape_pdf_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}
