//! Raster de-watermark engine.
//!
//! A PDF is rendered page by page by an external renderer, each page is
//! enhanced with a fixed [`TransformConfig`], and the pages are reassembled
//! into a new PDF. Pages are processed concurrently by up to
//! `max(1, cpus - 1)` workers; reassembly is always in page order. Any page
//! failure fails the whole document, so partial output is never produced.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use rehoster_core::raster::{Dewatermarker, GhostscriptRasterizer, RasterEngine, TransformConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let renderer = GhostscriptRasterizer::discover(None)?;
//! let engine = RasterEngine::new(Arc::new(renderer), TransformConfig::default());
//! engine.clean_pdf(Path::new("in.pdf"), Path::new("out.pdf")).await?;
//! # Ok(())
//! # }
//! ```

mod assemble;
mod tool;
mod transform;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::ImageReader;
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

pub use assemble::{PageResult, assemble_pdf, page_count};
pub use tool::{GhostscriptRasterizer, PageRasterizer};
pub use transform::{CenterRegion, ColorMode, TransformConfig, apply as apply_transform};

/// JPEG quality for processed page rasters.
const PAGE_JPEG_QUALITY: u8 = 90;

/// Raster engine errors.
#[derive(Debug, Error)]
pub enum RasterError {
    /// No renderer executable could be found.
    #[error("rendering tool unavailable (searched: {})", searched.join(", "))]
    RenderingToolUnavailable {
        /// Everything that was probed
        searched: Vec<String>,
    },

    /// A page failed to render or transform; the document is abandoned.
    #[error("page {} failed: {cause}", page_index + 1)]
    PageProcessingFailed {
        /// Zero-based page index
        page_index: usize,
        /// What went wrong
        cause: String,
    },

    /// The renderer exited unsuccessfully.
    #[error("renderer failed (exit {status:?}): {stderr}")]
    Renderer {
        /// Exit code, if any
        status: Option<i32>,
        /// Captured stderr
        stderr: String,
    },

    /// The input could not be parsed as a PDF.
    #[error("invalid document {path}: {reason}")]
    InvalidDocument {
        /// Input file
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// Image decode or encode failure.
    #[error("image error at {path}: {source}")]
    Image {
        /// File being decoded or encoded
        path: PathBuf,
        /// Underlying error
        #[source]
        source: image::ImageError,
    },

    /// A page worker panicked or was cancelled.
    #[error("page worker failed: {0}")]
    Worker(String),

    /// PDF reassembly failure.
    #[error("failed to assemble PDF: {0}")]
    Assemble(String),

    /// Filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl RasterError {
    /// Creates an IO error for `path`.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    fn page(page_index: usize, cause: impl std::fmt::Display) -> Self {
        Self::PageProcessingFailed {
            page_index,
            cause: cause.to_string(),
        }
    }
}

/// Removes watermarks from documents and images.
#[async_trait]
pub trait Dewatermarker: Send + Sync {
    /// Cleans the PDF at `input`, writing the result to `output`.
    async fn clean_pdf(&self, input: &Path, output: &Path) -> Result<(), RasterError>;

    /// Cleans a single image, writing the result to `output`.
    async fn clean_image(&self, input: &Path, output: &Path) -> Result<(), RasterError>;
}

/// Work for one page of one conversion job.
#[derive(Debug, Clone)]
pub struct PageWorkItem {
    pub page_index: usize,
    pub total_pages: usize,
    pub source_raster_path: PathBuf,
    pub dest_raster_path: PathBuf,
    pub transform_config: Arc<TransformConfig>,
}

/// Default worker count: one less than the CPU count, at least one.
#[must_use]
pub fn default_max_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Renders, transforms and reassembles PDFs.
#[derive(Clone)]
pub struct RasterEngine {
    rasterizer: Arc<dyn PageRasterizer>,
    config: Arc<TransformConfig>,
    max_workers: usize,
}

impl std::fmt::Debug for RasterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterEngine")
            .field("config", &self.config)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl RasterEngine {
    #[must_use]
    pub fn new(rasterizer: Arc<dyn PageRasterizer>, config: TransformConfig) -> Self {
        Self {
            rasterizer,
            config: Arc::new(config),
            max_workers: default_max_workers(),
        }
    }

    /// Overrides the worker count (minimum one).
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    #[must_use]
    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Renders and transforms every page, returning results in page order.
    ///
    /// # Errors
    ///
    /// [`RasterError::PageProcessingFailed`] for the first page that fails.
    #[instrument(skip(self, pdf, scratch), fields(pdf = %pdf.display(), workers = self.max_workers))]
    pub async fn process_pages(
        &self,
        pdf: &Path,
        total_pages: usize,
        scratch: &Path,
    ) -> Result<Vec<PageResult>, RasterError> {
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut workers = JoinSet::new();

        for page_index in 0..total_pages {
            let item = PageWorkItem {
                page_index,
                total_pages,
                source_raster_path: scratch.join(format!("page-{page_index:05}.png")),
                dest_raster_path: scratch.join(format!("page-{page_index:05}.jpg")),
                transform_config: Arc::clone(&self.config),
            };
            let rasterizer = Arc::clone(&self.rasterizer);
            let permits = Arc::clone(&permits);
            let pdf = pdf.to_path_buf();

            workers.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| RasterError::page(item.page_index, e))?;
                process_page(rasterizer.as_ref(), &pdf, item).await
            });
        }

        let mut results = Vec::with_capacity(total_pages);
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(RasterError::Worker(e.to_string())),
            };
            match result {
                Ok(page) => results.push(page),
                Err(e) => {
                    warn!(error = %e, "page failed, abandoning document");
                    workers.abort_all();
                    return Err(e);
                }
            }
        }

        results.sort_by_key(|page| page.page_index);
        Ok(results)
    }
}

async fn process_page(
    rasterizer: &dyn PageRasterizer,
    pdf: &Path,
    item: PageWorkItem,
) -> Result<PageResult, RasterError> {
    let page_number = item.page_index + 1;
    rasterizer
        .rasterize(
            pdf,
            page_number,
            item.transform_config.dpi,
            &item.source_raster_path,
        )
        .await
        .map_err(|e| RasterError::page(item.page_index, e))?;

    let page_index = item.page_index;
    let total_pages = item.total_pages;
    let result = tokio::task::spawn_blocking(move || transform_page(&item))
        .await
        .map_err(|e| RasterError::page(page_index, e))?
        .map_err(|e| RasterError::page(page_index, e))?;

    debug!(page = page_number, total = total_pages, "page processed");
    Ok(result)
}

fn transform_page(item: &PageWorkItem) -> Result<PageResult, RasterError> {
    let source = &item.source_raster_path;
    let page = ImageReader::open(source)
        .map_err(|e| RasterError::io(source, e))?
        .with_guessed_format()
        .map_err(|e| RasterError::io(source, e))?
        .decode()
        .map_err(|e| RasterError::Image {
            path: source.clone(),
            source: e,
        })?;

    let processed = transform::apply(&page, &item.transform_config);
    write_jpeg(&processed, &item.dest_raster_path)?;
    let _ = std::fs::remove_file(source);

    Ok(PageResult {
        page_index: item.page_index,
        raster_path: item.dest_raster_path.clone(),
        width: processed.width(),
        height: processed.height(),
    })
}

fn write_jpeg(image: &image::RgbImage, dest: &Path) -> Result<(), RasterError> {
    let file = std::fs::File::create(dest).map_err(|e| RasterError::io(dest, e))?;
    let encoder = JpegEncoder::new_with_quality(std::io::BufWriter::new(file), PAGE_JPEG_QUALITY);
    image
        .write_with_encoder(encoder)
        .map_err(|e| RasterError::Image {
            path: dest.to_path_buf(),
            source: e,
        })
}

#[async_trait]
impl Dewatermarker for RasterEngine {
    #[instrument(skip(self, input, output), fields(input = %input.display()))]
    async fn clean_pdf(&self, input: &Path, output: &Path) -> Result<(), RasterError> {
        let counted = input.to_path_buf();
        let total_pages = tokio::task::spawn_blocking(move || page_count(&counted))
            .await
            .map_err(|e| RasterError::Assemble(e.to_string()))??;

        let scratch_parent = output.parent().unwrap_or_else(|| Path::new("."));
        let scratch = tempfile::Builder::new()
            .prefix("pages-")
            .tempdir_in(scratch_parent)
            .map_err(|e| RasterError::io(scratch_parent, e))?;

        info!(total_pages, "rasterizing document");
        let pages = self.process_pages(input, total_pages, scratch.path()).await?;

        let dpi = self.config.dpi;
        let destination = output.to_path_buf();
        tokio::task::spawn_blocking(move || assemble_pdf(&pages, dpi, &destination))
            .await
            .map_err(|e| RasterError::Assemble(e.to_string()))??;

        info!(total_pages, output = %output.display(), "document reassembled");
        Ok(())
    }

    #[instrument(skip(self, input, output), fields(input = %input.display()))]
    async fn clean_image(&self, input: &Path, output: &Path) -> Result<(), RasterError> {
        let config = Arc::clone(&self.config);
        let input = input.to_path_buf();
        let output = output.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let page = ImageReader::open(&input)
                .map_err(|e| RasterError::io(&input, e))?
                .with_guessed_format()
                .map_err(|e| RasterError::io(&input, e))?
                .decode()
                .map_err(|e| RasterError::Image {
                    path: input.clone(),
                    source: e,
                })?;
            let processed = transform::apply(&page, &config);
            processed.save(&output).map_err(|e| RasterError::Image {
                path: output.clone(),
                source: e,
            })
        })
        .await
        .map_err(|e| RasterError::Assemble(e.to_string()))?
    }
}
