//! Error types for resource reference resolution.

use thiserror::Error;

/// Maximum input length to accept before attempting any pattern match.
pub const MAX_INPUT_LENGTH: usize = 4000;

/// Errors that can occur while resolving a resource reference.
#[derive(Debug, Clone, Error)]
pub enum LocatorError {
    /// No known link pattern matched the input.
    #[error("unresolvable reference '{input_preview}': {reason}\n  Suggestion: {suggestion}")]
    UnresolvableReference {
        /// Truncated input for display
        input_preview: String,
        /// Why nothing matched
        reason: String,
        /// How to fix the issue
        suggestion: String,
    },
}

impl LocatorError {
    /// Creates an error for input that is empty after trimming.
    #[must_use]
    pub fn empty() -> Self {
        Self::UnresolvableReference {
            input_preview: String::new(),
            reason: "input is empty".to_string(),
            suggestion: "Pass a share link or a resource id".to_string(),
        }
    }

    /// Creates an error for input that matched none of the link patterns.
    #[must_use]
    pub fn no_match(input: &str) -> Self {
        Self::UnresolvableReference {
            input_preview: preview(input),
            reason: "no resource id pattern matched".to_string(),
            suggestion: "Use a link of the form .../d/<id>/..., ...?id=<id>, or a bare id"
                .to_string(),
        }
    }

    /// Creates an error for input longer than [`MAX_INPUT_LENGTH`].
    #[must_use]
    pub fn too_long(input: &str) -> Self {
        Self::UnresolvableReference {
            input_preview: preview(input),
            reason: format!("input is {} chars, max {MAX_INPUT_LENGTH}", input.len()),
            suggestion: "Check for extraneous content around the link".to_string(),
        }
    }
}

fn preview(input: &str) -> String {
    input.chars().take(80).collect()
}
