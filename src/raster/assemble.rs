//! PDF inspection and reassembly from processed page rasters.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::ImageReader;
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};

use super::RasterError;

/// Points per inch in PDF user space.
const POINTS_PER_INCH: f32 = 72.0;

/// One processed page ready for reassembly.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub page_index: usize,
    /// JPEG produced by the transform stage.
    pub raster_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Number of pages in the PDF at `path`.
///
/// # Errors
///
/// [`RasterError::InvalidDocument`] if the file cannot be parsed or has no pages.
pub fn page_count(path: &Path) -> Result<usize, RasterError> {
    let document = Document::load(path).map_err(|e| RasterError::InvalidDocument {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    match document.get_pages().len() {
        0 => Err(RasterError::InvalidDocument {
            path: path.to_path_buf(),
            reason: "document has no pages".to_string(),
        }),
        n => Ok(n),
    }
}

/// Writes `pages`, in slice order, as a PDF with one full-page image each.
///
/// Page size in points is derived from pixel size and `dpi`.
///
/// # Errors
///
/// [`RasterError::Io`] reading rasters,
/// [`RasterError::Assemble`] on PDF encoding or write failure.
#[allow(clippy::cast_precision_loss)]
pub fn assemble_pdf(pages: &[PageResult], dpi: u32, output: &Path) -> Result<(), RasterError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let scale = POINTS_PER_INCH / dpi.max(1) as f32;
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

    for page in pages {
        let jpeg = std::fs::read(&page.raster_path).map_err(|e| RasterError::io(&page.raster_path, e))?;
        let color_space = jpeg_color_space(&jpeg);

        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(page.width),
                "Height" => i64::from(page.height),
                "ColorSpace" => color_space,
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        )
        .with_compression(false);
        let image_id = doc.add_object(image);

        let width_pt = page.width as f32 * scale;
        let height_pt = page.height as f32 * scale;
        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        width_pt.into(),
                        0.into(),
                        0.into(),
                        height_pt.into(),
                        0.into(),
                        0.into(),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content
            .encode()
            .map_err(|e| RasterError::Assemble(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width_pt.into(), height_pt.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        kids.push(page_id.into());
    }

    let count = i64::try_from(kids.len()).map_err(|e| RasterError::Assemble(e.to_string()))?;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    doc.save(output)
        .map_err(|e| RasterError::Assemble(format!("{}: {e}", output.display())))?;
    Ok(())
}

fn jpeg_color_space(jpeg: &[u8]) -> &'static str {
    let grey = ImageReader::new(Cursor::new(jpeg))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_decoder().ok())
        .is_some_and(|decoder| {
            use image::ImageDecoder;
            decoder.color_type() == image::ColorType::L8
        });
    if grey { "DeviceGray" } else { "DeviceRGB" }
}
