//! Lenient parsing of model output into category scores.
//!
//! Vision models wrap JSON in code fences, prepend chatter, or drop keys.
//! Parsing strips fences, takes the first balanced object, maps scores onto
//! the closed category set and renormalizes.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{CategoryKey, ScoreVector};

/// Category scores recovered from model text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub category: CategoryKey,
    pub scores: ScoreVector,
    pub caption: Option<String>,
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    scores: HashMap<String, serde_json::Value>,
    #[serde(default)]
    caption: Option<String>,
}

pub(crate) fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```JSON"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// First balanced `{...}` in `s`, ignoring braces inside string literals.
pub(crate) fn extract_first_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse model text into a category and normalized scores.
///
/// The reported category is the arg-max of the scores. When the model gives
/// no usable scores, all mass goes to its stated category (unknown → `other`).
pub fn parse_output(content: &str) -> PipelineResult<ParsedOutput> {
    let body = strip_code_fences(content);
    let json = extract_first_json_object(body).ok_or_else(|| PipelineError::RemoteEngine {
        message: format!("no JSON object in model output: {}", truncate(content, 200)),
        status_code: None,
    })?;
    let raw: RawOutput = serde_json::from_str(json).map_err(|e| PipelineError::RemoteEngine {
        message: format!("invalid JSON from model: {e}"),
        status_code: None,
    })?;

    let numeric: HashMap<String, f32> = raw
        .scores
        .iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f as f32)))
        .collect();
    let stated = raw.category.as_deref().map(CategoryKey::parse_or_other);
    let mut scores = ScoreVector::from_map(&numeric);

    if scores.sum() <= 0.0 {
        let category = stated.ok_or_else(|| PipelineError::RemoteEngine {
            message: "model output has neither scores nor category".to_string(),
            status_code: None,
        })?;
        scores = ScoreVector::one_hot(category);
    }

    let (category, _) = scores.top();
    if let Some(stated) = stated {
        if stated != category {
            tracing::debug!(%stated, derived = %category, "Model category disagrees with its scores");
        }
    }

    Ok(ParsedOutput {
        category,
        scores,
        caption: raw.caption.filter(|c| !c.trim().is_empty()),
    })
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
