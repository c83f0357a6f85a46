//! External PDF renderer discovery and invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::RasterError;

/// Fixed install locations probed before `PATH`.
const CANDIDATE_PATHS: [&str; 5] = [
    "/usr/bin/gs",
    "/usr/local/bin/gs",
    "/opt/homebrew/bin/gs",
    "/opt/local/bin/gs",
    "/snap/bin/gs",
];

/// Executable names probed on `PATH`.
const PATH_NAMES: [&str; 3] = ["gs", "gswin64c", "gswin32c"];

/// Renders one PDF page to a PNG.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Renders 1-based `page` of `pdf` at `dpi` into `dest`.
    async fn rasterize(&self, pdf: &Path, page: usize, dpi: u32, dest: &Path)
    -> Result<(), RasterError>;
}

/// Ghostscript located on this machine.
#[derive(Debug, Clone)]
pub struct GhostscriptRasterizer {
    executable: PathBuf,
}

impl GhostscriptRasterizer {
    /// Probes `explicit` first, then the fixed candidate list, then `PATH`.
    ///
    /// # Errors
    ///
    /// [`RasterError::RenderingToolUnavailable`] listing everything probed.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, RasterError> {
        let mut searched = Vec::new();

        let fixed = explicit
            .map(Path::to_path_buf)
            .into_iter()
            .chain(CANDIDATE_PATHS.iter().map(PathBuf::from));
        for candidate in fixed {
            if candidate.is_file() {
                info!(path = %candidate.display(), "renderer found");
                return Ok(Self {
                    executable: candidate,
                });
            }
            searched.push(candidate.display().to_string());
        }

        for name in PATH_NAMES {
            if let Ok(found) = which::which(name) {
                info!(path = %found.display(), "renderer found on PATH");
                return Ok(Self { executable: found });
            }
            searched.push(format!("PATH:{name}"));
        }

        Err(RasterError::RenderingToolUnavailable { searched })
    }

    /// Uses `executable` without probing.
    #[must_use]
    pub fn at(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

#[async_trait]
impl PageRasterizer for GhostscriptRasterizer {
    #[instrument(skip(self, pdf, dest), fields(pdf = %pdf.display()))]
    async fn rasterize(
        &self,
        pdf: &Path,
        page: usize,
        dpi: u32,
        dest: &Path,
    ) -> Result<(), RasterError> {
        let output = Command::new(&self.executable)
            .args([
                "-q".to_string(),
                "-dNOPAUSE".to_string(),
                "-dBATCH".to_string(),
                "-dSAFER".to_string(),
                "-sDEVICE=png16m".to_string(),
                format!("-r{dpi}"),
                format!("-dFirstPage={page}"),
                format!("-dLastPage={page}"),
                format!("-sOutputFile={}", dest.display()),
            ])
            .arg(pdf)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RasterError::io(&self.executable, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RasterError::Renderer {
                status: output.status.code(),
                stderr: stderr.trim().chars().take(500).collect(),
            });
        }
        if !dest.is_file() {
            return Err(RasterError::Renderer {
                status: output.status.code(),
                stderr: format!("no output written to {}", dest.display()),
            });
        }

        debug!(page, "page rasterized");
        Ok(())
    }
}
