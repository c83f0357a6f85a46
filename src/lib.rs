//! Rehoster Core Library
//!
//! Takes links to files and folders in a cloud drive, removes watermarks
//! from PDFs and images (or simply rehosts other media), and republishes
//! the result to the drive, returning a new link. Reprocessing is avoided
//! while the previous artifact is still live.
//!
//! # Architecture
//!
//! - [`locator`] - share link parsing into resource references
//! - [`auth`] - per-role OAuth credentials with refresh and encrypted storage
//! - [`remote`] - remote store capability surface and its Drive client
//! - [`ledger`] / [`db`] - durable idempotency records in SQLite
//! - [`guard`] - skip/reprocess decision against the ledger
//! - [`raster`] - page-parallel PDF/image de-watermark engine
//! - [`browser`] - bounded pool of headless browser sessions
//! - [`video`] - stream URL capture and quota-tolerant download
//! - [`publish`] - destination folders, duplicate purge and upload
//! - [`pipeline`] - single-resource and folder-tree orchestration
//! - [`retry`] - retry with a failure classifier and backoff schedule
//! - [`config`] - file configuration and runtime settings

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod browser;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod locator;
pub mod pipeline;
pub mod publish;
pub mod raster;
pub mod remote;
pub mod retry;
pub mod video;

// Re-export commonly used types
pub use config::{RuntimeSettings, VerbositySetting};
pub use db::Database;
pub use error::PipelineError;
pub use locator::{ResourceKind, ResourceRef, resolve, resolve_folder};
pub use pipeline::{
    Pipeline, ProcessOptions, ProcessOutcome, ProcessResponse, ProcessStatus, ProcessingReport,
};
