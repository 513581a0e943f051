//! Classification of raw collaborator output.
//!
//! Collaborators speak a loose contract: stdout is either a payload or an
//! error message distinguishable by a prefix convention. This module is
//! the single place that convention is interpreted; everything downstream
//! works with the `Classified` sum type.

use std::io;

use crate::types::Recipe;

/// Minimum acceptable recipe description length, in characters.
const MIN_DESCRIPTION_CHARS: usize = 10;

/// Minimum acceptable recipe duration, in seconds.
const MIN_RECIPE_DURATION_S: f64 = 0.1;

/// Prefixes that mark a collaborator reply as an error message.
const ERROR_PREFIXES: &[&str] = &["ERROR:", "Error:", "error:"];

/// Outcome of classifying one collaborator reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// The reply parsed into the expected payload shape. Carries the
    /// normalized payload to hand to the next stage.
    Success(String),
    /// A transient fault worth another full pipeline cycle.
    Retryable(String),
}

/// How a relocation io error should be treated at the pipeline level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocateFault {
    /// The source artifact does not exist. Treated as a proxy for an
    /// upstream compilation fault, so the pipeline restarts and any
    /// exhaustion is attributed to Compile, not Relocate.
    MissingSource,
    /// Anything else (permissions, read-only destination, ...): the move
    /// is structurally impossible to retry.
    Fatal(String),
}

/// True if the reply is an error message by the prefix convention.
fn has_error_prefix(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    ERROR_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

fn first_line(raw: &str) -> &str {
    raw.lines().next().unwrap_or("").trim()
}

/// Classify the Analyze collaborator's reply.
///
/// Success requires a parseable `Recipe` with a plausible duration and a
/// non-trivial description. Everything else is transient.
pub fn classify_analyze(raw: &str) -> Classified {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Classified::Retryable("analyzer returned empty output".to_string());
    }
    if has_error_prefix(trimmed) {
        return Classified::Retryable(format!("analyzer error: {}", first_line(trimmed)));
    }

    let recipe: Recipe = match serde_json::from_str(trimmed) {
        Ok(recipe) => recipe,
        Err(e) => {
            return Classified::Retryable(format!("analyzer output is not a recipe: {e}"));
        }
    };

    if recipe.duration < MIN_RECIPE_DURATION_S {
        return Classified::Retryable(format!(
            "recipe duration {} below minimum {MIN_RECIPE_DURATION_S}",
            recipe.duration
        ));
    }
    if recipe.description.trim().chars().count() < MIN_DESCRIPTION_CHARS {
        return Classified::Retryable("recipe description too short".to_string());
    }

    Classified::Success(trimmed.to_string())
}

/// Classify the Generate collaborator's reply.
///
/// The generator is expected to answer with DSP source text, possibly
/// wrapped in a Markdown fenced code block. The fence is stripped; an
/// empty body after stripping is transient.
pub fn classify_generate(raw: &str) -> Classified {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Classified::Retryable("generator returned empty output".to_string());
    }
    if has_error_prefix(trimmed) {
        return Classified::Retryable(format!("generator error: {}", first_line(trimmed)));
    }

    let code = extract_fenced_block(trimmed).unwrap_or(trimmed);
    if code.trim().is_empty() {
        return Classified::Retryable("generator produced an empty code block".to_string());
    }

    Classified::Success(code.trim().to_string())
}

/// Classify the Execute collaborator's reply.
///
/// Success is a single path line; whether the file actually exists is
/// checked by the caller, which owns filesystem access.
pub fn classify_execute(raw: &str) -> Classified {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Classified::Retryable("executor returned empty output".to_string());
    }
    if has_error_prefix(trimmed) {
        return Classified::Retryable(format!("executor error: {}", first_line(trimmed)));
    }

    // The executor may log before printing the path; the last non-empty
    // line is the artifact path.
    let path_line = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");

    if path_line.is_empty() {
        return Classified::Retryable("executor printed no artifact path".to_string());
    }

    Classified::Success(path_line.to_string())
}

/// Classify a relocation io error.
///
/// Note the asymmetry: a missing source is a compile-stage proxy and
/// restarts the pipeline; everything else ends the task.
pub fn classify_relocate(err: &io::Error) -> RelocateFault {
    if err.kind() == io::ErrorKind::NotFound {
        RelocateFault::MissingSource
    } else {
        RelocateFault::Fatal(err.to_string())
    }
}

/// Extract the body of the first Markdown fenced code block, if any.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}
