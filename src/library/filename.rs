use sha2::{Digest, Sha256};

/// Maximum length for the readable portion of a record stem
const MAX_READABLE_LENGTH: usize = 48;

/// Number of hex characters of the id digest appended to every stem
const DIGEST_CHARS: usize = 16;

/// Check if a character may appear in the readable part of a stem.
///
/// Dots are excluded so a stem can never be `..` or carry a fake extension.
fn is_valid_stem_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

/// Derive the on-disk stem shared by an episode's metadata and bytes records.
///
/// Format: "sanitized-id-0123456789abcdef", or only the digest when nothing of
/// the id survives sanitization. The digest keeps distinct ids apart even when
/// they sanitize to the same text.
pub fn record_stem(episode_id: &str) -> String {
    let readable = sanitize_id(episode_id);
    let digest = id_digest(episode_id);

    if readable.is_empty() {
        digest
    } else {
        format!("{}-{}", readable, digest)
    }
}

fn id_digest(episode_id: &str) -> String {
    let hash = Sha256::digest(episode_id.as_bytes());
    let mut hex = format!("{:x}", hash);
    hex.truncate(DIGEST_CHARS);
    hex
}

/// Whitelist sanitization with separator collapsing
fn sanitize_id(episode_id: &str) -> String {
    let mut result = String::with_capacity(episode_id.len());
    let mut last_was_separator = false;

    for c in episode_id.chars() {
        if is_valid_stem_char(c) && c != '-' {
            result.push(c);
            last_was_separator = false;
        } else if !last_was_separator {
            result.push('-');
            last_was_separator = true;
        }
    }

    let trimmed = result.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_READABLE_LENGTH).collect();
    truncated.trim_end_matches('-').to_string()
}
