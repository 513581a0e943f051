//! Run directory and artifact naming.
//!
//! A run writes into `<out_dir>/<YYYYMMDD-HHMMSS>_<theme-slug>/`; final
//! artifacts are named `<sample-id>_<effect-slug>.wav`.

use chrono::{DateTime, Utc};

/// Maximum length for slug components.
pub const MAX_SLUG_LENGTH: usize = 48;

/// Turn free text into a filesystem-safe, lowercase, hyphen-separated slug.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_sep = true;

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('-');
            last_was_sep = true;
        }
        if slug.len() >= MAX_SLUG_LENGTH {
            break;
        }
    }

    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Directory name for a run started at `when` with the given theme.
pub fn run_dir_name(when: DateTime<Utc>, theme: &str) -> String {
    format!("{}_{}", when.format("%Y%m%d-%H%M%S"), slugify(theme))
}

/// Final artifact filename for a sample.
///
/// The sample id keeps its dots (ids like "L1.1" are meaningful); the
/// effect name is slugified with underscores as in the recipes.
pub fn artifact_filename(sample_id: &str, effect_name: &str) -> String {
    let safe_id: String = sample_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}.wav", safe_id, slugify(effect_name).replace('-', "_"))
}
