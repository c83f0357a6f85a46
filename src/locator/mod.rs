//! Resource reference resolution from heterogeneous share links.
//!
//! Turns whatever the user pasted (a direct file link, a redirect-wrapped
//! link, a singly or doubly percent-encoded `id=` link, a Workspace document
//! link, or a bare identifier) into a canonical [`ResourceRef`].
//!
//! # Pattern order
//!
//! Patterns are tried in a fixed order and the first match wins:
//!
//! 1. explicit path id: `/d/<id>` (or `/folders/<id>`)
//! 2. `id=<id>` query parameter
//! 3. encoded `id%3D<id>` / doubly encoded `id%253D<id>`
//! 4. bare 25-40 character identifier
//!
//! A redirect wrapper (`.../url?q=<encoded target>`) is unwrapped once before
//! any pattern is tried, and the unwrapped target is matched first: a wrapper
//! can carry its own unrelated `id=` parameter, and the target is what the
//! user meant. Each candidate is tried raw, then percent-decoded once, then
//! twice.
//!
//! # Example
//!
//! ```
//! use rehoster_core::locator::{resolve, ResourceKind};
//!
//! let r = resolve("https://drive.google.com/file/d/1AbCdEfGhIjKlMnOpQrStUvWxYz/view").unwrap();
//! assert_eq!(r.id(), "1AbCdEfGhIjKlMnOpQrStUvWxYz");
//! assert_eq!(r.kind(), ResourceKind::File);
//! ```

mod error;

pub use error::{LocatorError, MAX_INPUT_LENGTH};

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument, trace};
use url::Url;

/// Explicit `/d/<id>` or `/folders/<id>` path segment.
#[allow(clippy::expect_used)]
static PATH_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(d|folders)/([A-Za-z0-9_-]+)").expect("path id regex is valid") // Static pattern, safe to panic
});

/// `id=<id>` query parameter.
#[allow(clippy::expect_used)]
static QUERY_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[?&#])id=([A-Za-z0-9_-]+)").expect("query id regex is valid")
});

/// `id%3D<id>` or `id%253D<id>` left over from nested encoding.
#[allow(clippy::expect_used)]
static ENCODED_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|%3F|%26|%253F|%2526|[?&])id%(?:25)?3D([A-Za-z0-9_-]+)")
        .expect("encoded id regex is valid")
});

/// A bare identifier with nothing around it.
#[allow(clippy::expect_used)]
static BARE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{25,40}$").expect("bare id regex is valid"));

/// `resourcekey=<key>` in plain or encoded form.
#[allow(clippy::expect_used)]
static RESOURCE_KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resourcekey(?:=|%3D|%253D)([A-Za-z0-9_-]+)")
        .expect("resource key regex is valid")
});

/// Whether a reference points at a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A single file (document, image, video, or anything else).
    File,
    /// A folder whose children are walked.
    Folder,
}

/// Canonical reference to a remote resource.
///
/// Only this module constructs references; everything else receives them
/// from [`resolve`], [`resolve_folder`], or from listings mapped through
/// [`ResourceRef::from_listing`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceRef {
    id: String,
    resource_key: Option<String>,
    kind: ResourceKind,
}

impl ResourceRef {
    /// The opaque resource id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The access key for shared-with-link resources, if any.
    #[must_use]
    pub fn resource_key(&self) -> Option<&str> {
        self.resource_key.as_deref()
    }

    /// File or folder.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Builds a reference from a child entry returned by a folder listing
    /// or from a ledger row. The id is trusted as-is.
    #[must_use]
    pub fn from_listing(
        id: impl Into<String>,
        resource_key: Option<String>,
        kind: ResourceKind,
    ) -> Self {
        Self {
            id: id.into(),
            resource_key,
            kind,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Resolves arbitrary input text to a resource reference.
///
/// The kind is inferred: `/folders/<id>` and `folderview?id=` links resolve
/// to [`ResourceKind::Folder`], everything else to [`ResourceKind::File`].
///
/// # Errors
///
/// Returns [`LocatorError::UnresolvableReference`] when nothing matches after
/// one redirect unwrap and up to two levels of percent-decoding.
#[instrument(skip(input), fields(input_len = input.len()))]
pub fn resolve(input: &str) -> Result<ResourceRef, LocatorError> {
    resolve_with_kind(input, None)
}

/// Resolves input text and forces the reference kind to folder.
///
/// # Errors
///
/// Same as [`resolve`].
pub fn resolve_folder(input: &str) -> Result<ResourceRef, LocatorError> {
    resolve_with_kind(input, Some(ResourceKind::Folder))
}

fn resolve_with_kind(
    input: &str,
    forced_kind: Option<ResourceKind>,
) -> Result<ResourceRef, LocatorError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(LocatorError::empty());
    }
    if trimmed.len() > MAX_INPUT_LENGTH {
        return Err(LocatorError::too_long(trimmed));
    }

    let mut layers: Vec<String> = Vec::with_capacity(2);
    if let Some(target) = unwrap_redirect(trimmed) {
        debug!(target = %target, "unwrapped redirect link");
        layers.push(target);
    }
    layers.push(trimmed.to_string());

    for layer in &layers {
        for candidate in decode_levels(layer) {
            trace!(candidate = %candidate, "trying patterns");
            if let Some((id, inferred_kind)) = match_patterns(&candidate) {
                let resource_key = RESOURCE_KEY_PATTERN
                    .captures(&candidate)
                    .map(|c| c[1].to_string());
                let kind = forced_kind.unwrap_or(inferred_kind);
                debug!(id = %id, ?kind, has_key = resource_key.is_some(), "resolved reference");
                return Ok(ResourceRef {
                    id,
                    resource_key,
                    kind,
                });
            }
        }
    }

    Err(LocatorError::no_match(trimmed))
}

/// Returns the target of a `.../url?q=<target>` redirect wrapper.
fn unwrap_redirect(input: &str) -> Option<String> {
    let parsed = Url::parse(input).ok()?;
    if !parsed.path().ends_with("/url") {
        return None;
    }
    parsed
        .query_pairs()
        .find(|(key, _)| key == "q" || key == "url")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Raw input, then decoded once, then decoded twice (duplicates skipped).
fn decode_levels(input: &str) -> Vec<String> {
    let mut levels = vec![input.to_string()];
    for _ in 0..2 {
        let Some(last) = levels.last() else { break };
        let decoded = match urlencoding::decode(last) {
            Ok(Cow::Owned(decoded)) => decoded,
            Ok(Cow::Borrowed(_)) | Err(_) => break,
        };
        if &decoded == last {
            break;
        }
        levels.push(decoded);
    }
    levels
}

fn match_patterns(candidate: &str) -> Option<(String, ResourceKind)> {
    if let Some(caps) = PATH_ID_PATTERN.captures(candidate) {
        let kind = if &caps[1] == "folders" {
            ResourceKind::Folder
        } else {
            ResourceKind::File
        };
        return Some((caps[2].to_string(), kind));
    }

    let folder_hint = if candidate.contains("folderview") {
        ResourceKind::Folder
    } else {
        ResourceKind::File
    };

    if let Some(caps) = QUERY_ID_PATTERN.captures(candidate) {
        return Some((caps[1].to_string(), folder_hint));
    }

    if let Some(caps) = ENCODED_ID_PATTERN.captures(candidate) {
        return Some((caps[1].to_string(), folder_hint));
    }

    if BARE_ID_PATTERN.is_match(candidate) {
        return Some((candidate.to_string(), ResourceKind::File));
    }

    None
}
