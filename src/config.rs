//! File configuration and resolved runtime settings.
//!
//! The optional config file lives at `$XDG_CONFIG_HOME/rehoster/config.toml`
//! (falling back to `$HOME/.config/rehoster/config.toml`) and holds flat
//! `key = value` lines. Values are double-quoted strings, integers, floats
//! or booleans; `#` starts a comment outside strings. Unknown keys and
//! out-of-range values are rejected with their line number.
//!
//! Precedence is CLI flag > file value > [`RuntimeSettings::default`].

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::auth::default_config_dir;
use crate::browser::PoolConfig;
use crate::raster::{CenterRegion, ColorMode, TransformConfig};
use crate::remote::{DEFAULT_API_BASE, DEFAULT_UPLOAD_BASE};

/// Default OAuth token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Default destination folder for artifacts without a collection.
pub const DEFAULT_FOLDER_NAME: &str = "Processed";

/// Default luma threshold when binarizing.
pub const DEFAULT_THRESHOLD: u8 = 128;

pub const DEFAULT_FOLDER_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_FOLDER_DEPTH: usize = 10;

const APP_DIR_NAME: &str = "rehoster";

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax on line {line}: expected key = value")]
    Syntax { line: usize },

    #[error("unknown configuration key '{key}' on line {line}")]
    UnknownKey { key: String, line: usize },

    #[error("invalid `{key}` value on line {line}: {reason}")]
    InvalidValue {
        key: String,
        line: usize,
        reason: String,
    },

    /// Settings that are individually valid but conflict.
    #[error("invalid configuration: {0}")]
    Conflict(String),
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerbositySetting {
    #[default]
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Verbose => "verbose",
            Self::Quiet => "quiet",
            Self::Debug => "debug",
        }
    }

    /// Tracing filter directive for this setting.
    #[must_use]
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose => "debug",
            Self::Quiet => "error",
            Self::Debug => "trace",
        }
    }
}

/// Values read from the config file; `None` means "not set".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub work_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub credentials_dir: Option<PathBuf>,
    pub root_folder_id: Option<String>,
    pub default_folder_name: Option<String>,
    pub api_base_url: Option<String>,
    pub upload_base_url: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub render_dpi: Option<u32>,
    pub brightness: Option<f32>,
    pub contrast: Option<f32>,
    pub gamma: Option<f32>,
    pub sharpen: Option<f32>,
    pub center_width: Option<f32>,
    pub center_height: Option<f32>,
    pub preserve_color: Option<bool>,
    pub threshold: Option<u8>,
    pub renderer_path: Option<PathBuf>,
    pub max_browser_sessions: Option<usize>,
    pub browser_idle_timeout_secs: Option<u64>,
    pub browser_sweep_interval_secs: Option<u64>,
    pub browser_profile_dir: Option<PathBuf>,
    pub chrome_path: Option<PathBuf>,
    pub stream_wait_secs: Option<u64>,
    pub folder_concurrency: Option<usize>,
    pub max_folder_depth: Option<usize>,
    pub video_max_attempts: Option<u32>,
    pub video_retry_step_secs: Option<u64>,
    pub verbosity: Option<VerbositySetting>,
}

/// Everything the pipeline and binary need, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub work_dir: PathBuf,
    pub database_path: PathBuf,
    pub credentials_dir: PathBuf,
    pub root_folder_id: String,
    pub default_folder_name: String,
    pub api_base_url: String,
    pub upload_base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub transform: TransformConfig,
    pub renderer_path: Option<PathBuf>,
    pub max_browser_sessions: usize,
    pub browser_idle_timeout: Duration,
    pub browser_sweep_interval: Duration,
    pub browser_profile_dir: PathBuf,
    pub chrome_path: Option<PathBuf>,
    pub stream_wait: Duration,
    pub folder_concurrency: usize,
    pub max_folder_depth: usize,
    pub video_max_attempts: u32,
    pub video_retry_step: Duration,
    pub verbosity: VerbositySetting,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let app_dir = default_config_dir().unwrap_or_else(|_| PathBuf::from(".rehoster"));
        let pool = PoolConfig::default();
        Self {
            work_dir: env::temp_dir().join(APP_DIR_NAME),
            database_path: app_dir.join("ledger.db"),
            credentials_dir: app_dir.clone(),
            root_folder_id: "root".to_string(),
            default_folder_name: DEFAULT_FOLDER_NAME.to_string(),
            api_base_url: DEFAULT_API_BASE.to_string(),
            upload_base_url: DEFAULT_UPLOAD_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            transform: TransformConfig::default(),
            renderer_path: None,
            max_browser_sessions: pool.max_sessions,
            browser_idle_timeout: pool.idle_timeout,
            browser_sweep_interval: pool.sweep_interval,
            browser_profile_dir: app_dir.join("browser-profile"),
            chrome_path: None,
            stream_wait: crate::video::DEFAULT_STREAM_WAIT,
            folder_concurrency: DEFAULT_FOLDER_CONCURRENCY,
            max_folder_depth: DEFAULT_MAX_FOLDER_DEPTH,
            video_max_attempts: crate::video::DEFAULT_MAX_ATTEMPTS,
            video_retry_step: crate::video::DEFAULT_RETRY_STEP,
            verbosity: VerbositySetting::Default,
        }
    }
}

impl RuntimeSettings {
    /// Overlays every value set in `file`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Conflict`] when the resulting transform is invalid or
    /// a threshold is given while colours are preserved.
    pub fn with_file(mut self, file: &FileConfig) -> Result<Self, ConfigError> {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = &file.$field {
                    self.$field = value.clone();
                })*
            };
        }
        overlay!(
            work_dir,
            database_path,
            credentials_dir,
            root_folder_id,
            default_folder_name,
            api_base_url,
            upload_base_url,
            token_url,
            client_id,
            client_secret,
            browser_profile_dir,
            folder_concurrency,
            max_folder_depth,
            video_max_attempts,
            max_browser_sessions,
            verbosity,
        );
        if file.renderer_path.is_some() {
            self.renderer_path.clone_from(&file.renderer_path);
        }
        if file.chrome_path.is_some() {
            self.chrome_path.clone_from(&file.chrome_path);
        }
        if let Some(secs) = file.browser_idle_timeout_secs {
            self.browser_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.browser_sweep_interval_secs {
            self.browser_sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stream_wait_secs {
            self.stream_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = file.video_retry_step_secs {
            self.video_retry_step = Duration::from_secs(secs);
        }

        self.transform = transform_from_file(self.transform, file)?;
        Ok(self)
    }

    /// Browser pool sizing and timers.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_sessions: self.max_browser_sessions,
            idle_timeout: self.browser_idle_timeout,
            sweep_interval: self.browser_sweep_interval,
        }
    }
}

fn transform_from_file(
    mut transform: TransformConfig,
    file: &FileConfig,
) -> Result<TransformConfig, ConfigError> {
    if let Some(dpi) = file.render_dpi {
        transform.dpi = dpi;
    }
    if let Some(v) = file.brightness {
        transform.brightness = v;
    }
    if let Some(v) = file.contrast {
        transform.contrast = v;
    }
    if let Some(v) = file.gamma {
        transform.gamma = v;
    }
    if let Some(v) = file.sharpen {
        transform.sharpen = v;
    }

    match (file.center_width, file.center_height) {
        (None, None) => {}
        (Some(w), Some(h)) => {
            transform.center_region = Some(CenterRegion {
                width_fraction: w,
                height_fraction: h,
            });
        }
        _ => {
            return Err(ConfigError::Conflict(
                "center_width and center_height must be set together".to_string(),
            ));
        }
    }

    match (file.preserve_color, file.threshold) {
        (Some(false), threshold) => {
            transform.mode = ColorMode::Binarize {
                threshold: threshold.unwrap_or(DEFAULT_THRESHOLD),
            };
        }
        (_, Some(_)) => {
            return Err(ConfigError::Conflict(
                "threshold requires preserve_color = false".to_string(),
            ));
        }
        (Some(true) | None, None) => transform.mode = ColorMode::PreserveColor,
    }

    transform.validate().map_err(ConfigError::Conflict)?;
    Ok(transform)
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: Option<PathBuf>,
    pub config: Option<FileConfig>,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/rehoster/config.toml`
/// 2. `$HOME/.config/rehoster/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join(APP_DIR_NAME).join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR_NAME)
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file from the default path if it exists.
///
/// # Errors
///
/// Read or parse failures of an existing file.
pub fn load_default_file_config() -> Result<LoadedConfig, ConfigError> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(p) if p.exists() => Some(load_file_config(p)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

/// Loads and parses the config file at `path`.
///
/// # Errors
///
/// [`ConfigError::Read`] or any parse error.
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&raw)
}

/// Parses config text.
///
/// # Errors
///
/// Syntax, unknown key, or invalid value errors carrying the line number.
pub fn parse_config_str(raw: &str) -> Result<FileConfig, ConfigError> {
    let mut cfg = FileConfig::default();

    for (index, raw_line) in raw.lines().enumerate() {
        let line_no = index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax { line: line_no });
        };
        let key = raw_key.trim();
        let value = Value {
            key,
            raw: raw_value.trim(),
            line: line_no,
        };

        match key {
            "work_dir" => cfg.work_dir = Some(value.path()?),
            "database_path" => cfg.database_path = Some(value.path()?),
            "credentials_dir" => cfg.credentials_dir = Some(value.path()?),
            "root_folder_id" => cfg.root_folder_id = Some(value.non_empty_string()?),
            "default_folder_name" => cfg.default_folder_name = Some(value.non_empty_string()?),
            "api_base_url" => cfg.api_base_url = Some(value.url()?),
            "upload_base_url" => cfg.upload_base_url = Some(value.url()?),
            "token_url" => cfg.token_url = Some(value.url()?),
            "client_id" => cfg.client_id = Some(value.string()?),
            "client_secret" => cfg.client_secret = Some(value.string()?),
            "render_dpi" => cfg.render_dpi = Some(value.integer_in(36, 1200)?),
            "brightness" => cfg.brightness = Some(value.float_in(-100.0, 100.0)?),
            "contrast" => cfg.contrast = Some(value.float_in(-100.0, 100.0)?),
            "gamma" => cfg.gamma = Some(value.float_in(0.01, 10.0)?),
            "sharpen" => cfg.sharpen = Some(value.float_in(0.0, 10.0)?),
            "center_width" => cfg.center_width = Some(value.float_in(0.01, 1.0)?),
            "center_height" => cfg.center_height = Some(value.float_in(0.01, 1.0)?),
            "preserve_color" => cfg.preserve_color = Some(value.boolean()?),
            "threshold" => cfg.threshold = Some(value.integer_in(0, 255)?),
            "renderer_path" => cfg.renderer_path = Some(value.path()?),
            "max_browser_sessions" => cfg.max_browser_sessions = Some(value.integer_in(1, 16)?),
            "browser_idle_timeout_secs" => {
                cfg.browser_idle_timeout_secs = Some(value.integer_in(1, 86_400)?);
            }
            "browser_sweep_interval_secs" => {
                cfg.browser_sweep_interval_secs = Some(value.integer_in(1, 86_400)?);
            }
            "browser_profile_dir" => cfg.browser_profile_dir = Some(value.path()?),
            "chrome_path" => cfg.chrome_path = Some(value.path()?),
            "stream_wait_secs" => cfg.stream_wait_secs = Some(value.integer_in(1, 600)?),
            "folder_concurrency" => cfg.folder_concurrency = Some(value.integer_in(1, 64)?),
            "max_folder_depth" => cfg.max_folder_depth = Some(value.integer_in(1, 100)?),
            "video_max_attempts" => cfg.video_max_attempts = Some(value.integer_in(1, 20)?),
            "video_retry_step_secs" => cfg.video_retry_step_secs = Some(value.integer_in(0, 600)?),
            "verbosity" => cfg.verbosity = Some(value.verbosity()?),
            unknown => {
                return Err(ConfigError::UnknownKey {
                    key: unknown.to_string(),
                    line: line_no,
                });
            }
        }
    }
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

/// One raw right-hand side, with enough context to report errors.
struct Value<'a> {
    key: &'a str,
    raw: &'a str,
    line: usize,
}

impl Value<'_> {
    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.key.to_string(),
            line: self.line,
            reason: reason.into(),
        }
    }

    fn string(&self) -> Result<String, ConfigError> {
        let raw = self.raw;
        if raw.len() < 2 || !raw.starts_with('"') || !raw.ends_with('"') {
            return Err(self.invalid("expected double-quoted string"));
        }
        Ok(raw[1..raw.len() - 1].to_string())
    }

    fn non_empty_string(&self) -> Result<String, ConfigError> {
        let value = self.string()?;
        if value.trim().is_empty() {
            return Err(self.invalid("must not be empty"));
        }
        Ok(value)
    }

    fn path(&self) -> Result<PathBuf, ConfigError> {
        self.non_empty_string().map(PathBuf::from)
    }

    fn url(&self) -> Result<String, ConfigError> {
        let value = self.non_empty_string()?;
        url::Url::parse(&value).map_err(|e| self.invalid(format!("not a URL: {e}")))?;
        Ok(value)
    }

    fn boolean(&self) -> Result<bool, ConfigError> {
        match self.raw {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(self.invalid("expected 'true' or 'false'")),
        }
    }

    fn integer_in<T>(&self, min: i64, max: i64) -> Result<T, ConfigError>
    where
        T: TryFrom<i64>,
    {
        let value: i64 = self
            .raw
            .parse()
            .map_err(|_| self.invalid("expected integer"))?;
        if !(min..=max).contains(&value) {
            return Err(self.invalid(format!("{value} outside {min}..={max}")));
        }
        T::try_from(value).map_err(|_| self.invalid("integer out of range"))
    }

    fn float_in(&self, min: f32, max: f32) -> Result<f32, ConfigError> {
        let value: f32 = self
            .raw
            .parse()
            .map_err(|_| self.invalid("expected number"))?;
        if !(min..=max).contains(&value) {
            return Err(self.invalid(format!("{value} outside {min}..={max}")));
        }
        Ok(value)
    }

    fn verbosity(&self) -> Result<VerbositySetting, ConfigError> {
        match self.string()?.as_str() {
            "default" => Ok(VerbositySetting::Default),
            "verbose" => Ok(VerbositySetting::Verbose),
            "quiet" => Ok(VerbositySetting::Quiet),
            "debug" => Ok(VerbositySetting::Debug),
            _ => Err(self.invalid("expected one of: default, verbose, quiet, debug")),
        }
    }
}
