//! DNS-label-safe display names for allocations.
//!
//! A display name is a single DNS label: lowercase ASCII letters, digits and
//! single hyphens, no leading or trailing hyphen, at most 63 bytes. Names that
//! would exceed the limit are cut and suffixed with a short digest of the full
//! label so two long names sharing a prefix stay distinct.

use sha2::{Digest, Sha256};

/// Maximum length of a single DNS label in bytes.
pub const MAX_LABEL_LEN: usize = 63;

/// Hex characters of digest appended to truncated labels.
const DIGEST_SUFFIX_LEN: usize = 8;

/// Label used when nothing alphanumeric survives sanitization.
const EMPTY_LABEL: &str = "unnamed";

/// Lowercase `raw` and collapse every run of non-alphanumerics into one hyphen.
///
/// Leading and trailing separators are dropped. The result is not length-limited.
pub fn sanitize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_hyphen = false;

    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    out
}

/// Cut `label` to [`MAX_LABEL_LEN`] bytes, appending a digest of the full label if cut.
pub fn fit_label(label: &str) -> String {
    if label.is_empty() {
        return EMPTY_LABEL.to_string();
    }
    if label.len() <= MAX_LABEL_LEN {
        return label.to_string();
    }

    let digest = Sha256::digest(label.as_bytes());
    let suffix: String = digest
        .iter()
        .take(DIGEST_SUFFIX_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();

    // Sanitized labels are pure ASCII, so any byte index is a char boundary.
    let keep = MAX_LABEL_LEN - DIGEST_SUFFIX_LEN - 1;
    let prefix = label[..keep].trim_end_matches('-');
    format!("{prefix}-{suffix}")
}

/// Display name for a consumer: the branch label followed by the project label.
///
/// An empty project contributes nothing, which is how rows migrated from the
/// branch-only schema are named.
pub fn display_name(project: &str, branch: &str) -> String {
    let joined = if project.is_empty() {
        sanitize_label(branch)
    } else {
        sanitize_label(&format!("{branch}-{project}"))
    };
    fit_label(&joined)
}
