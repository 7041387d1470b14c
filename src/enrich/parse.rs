//! Response repair cascade.
//!
//! Model output is often JSON wrapped in prose or code fences. Strategies
//! run in a fixed order and the first success wins:
//!
//! 1. [`Strategy::Direct`]: the whole response is JSON.
//! 2. [`Strategy::BraceExtract`]: first `{` to last `}`, then the balanced
//!    object starting at the first `{`.
//! 3. [`Strategy::FencedBlock`]: contents of a ```` ``` ```` fence.
//! 4. [`Strategy::KeyValue`]: `key: value` lines rebuilt into an object
//!    (annotations only).
//!
//! When all fail the caller gets [`Error::MalformedResponse`] and applies
//! its own fallback.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{Annotation, AnnotationSource, Confidence, ConversationContext, UNTAGGED};

/// Which strategy recovered the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    BraceExtract,
    FencedBlock,
    KeyValue,
}

/// Recover a JSON object from `text` using strategies 1–3.
pub fn parse_json_object(text: &str) -> Result<(Map<String, Value>, Strategy)> {
    let text = text.trim();

    if let Some(obj) = as_object(text) {
        return Ok((obj, Strategy::Direct));
    }
    if let Some(obj) = brace_extract(text) {
        return Ok((obj, Strategy::BraceExtract));
    }
    if let Some(obj) = fenced_block(text) {
        return Ok((obj, Strategy::FencedBlock));
    }

    Err(Error::MalformedResponse(format!(
        "no JSON object in response: {}",
        preview(text)
    )))
}

/// Parse a per-unit annotation, trying every strategy including key/value.
pub fn parse_annotation(text: &str) -> Result<(Annotation, Strategy)> {
    let (obj, strategy) = match parse_json_object(text) {
        Ok(found) => found,
        Err(_) => match key_value(text) {
            Some(obj) => (obj, Strategy::KeyValue),
            None => {
                return Err(Error::MalformedResponse(format!(
                    "unrecoverable annotation: {}",
                    preview(text)
                )))
            }
        },
    };
    let annotation = annotation_from_object(&obj, AnnotationSource::Model)?;
    Ok((annotation, strategy))
}

/// Parse the conversation pre-pass answer `{domain, topic}`.
pub fn parse_context(text: &str) -> Result<ConversationContext> {
    let (obj, _) = parse_json_object(text)?;
    let domain = string_field(&obj, "domain")
        .ok_or_else(|| Error::MalformedResponse("context has no domain".into()))?;
    let topic = string_field(&obj, "topic").unwrap_or_default();
    Ok(ConversationContext {
        domain: domain.to_lowercase(),
        topic,
    })
}

/// Outcome of the validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub valid: bool,
    pub corrected: Option<Annotation>,
    pub reasoning: Option<String>,
}

/// Parse `{valid, corrected?, reasoning}`.
pub fn parse_verdict(text: &str) -> Result<Verdict> {
    let (obj, _) = parse_json_object(text)?;
    let valid = match obj.get("valid") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes"),
        _ => return Err(Error::MalformedResponse("verdict has no 'valid' flag".into())),
    };
    let corrected = match obj.get("corrected") {
        Some(Value::Object(c)) => annotation_from_object(c, AnnotationSource::Corrected).ok(),
        _ => None,
    };
    Ok(Verdict {
        valid,
        corrected,
        reasoning: string_field(&obj, "reasoning"),
    })
}

/// Build a normalised annotation from a parsed object.
pub fn annotation_from_object(
    obj: &Map<String, Value>,
    source: AnnotationSource,
) -> Result<Annotation> {
    let has_any = ["tags", "category", "domain"]
        .iter()
        .any(|k| obj.contains_key(*k));
    if !has_any {
        return Err(Error::MalformedResponse(
            "object carries no annotation fields".into(),
        ));
    }

    let raw_tags: Vec<String> = match obj.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => split_tag_list(s),
        _ => Vec::new(),
    };
    let mut tags = normalize_tags(&raw_tags);
    if tags.is_empty() {
        tags.push(UNTAGGED.to_string());
    }

    let confidence = match obj.get("confidence") {
        Some(Value::String(s)) => Confidence::parse_lenient(s),
        Some(Value::Number(n)) => Confidence::parse_lenient(&n.to_string()),
        _ => Confidence::Low,
    };

    Ok(Annotation {
        tags,
        category: string_field(obj, "category")
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "uncategorized".to_string()),
        confidence,
        domain: string_field(obj, "domain")
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string()),
        reasoning: string_field(obj, "reasoning"),
        source,
    })
}

/// Lower-case, `#`-prefix and de-duplicate tags, keeping first-seen order.
pub fn normalize_tags(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for tag in raw {
        let cleaned = tag
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim_start_matches('#')
            .trim()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-");
        if cleaned.is_empty() {
            continue;
        }
        let tag = format!("#{}", cleaned);
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

fn as_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

fn brace_extract(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        if let Some(obj) = as_object(&text[start..=end]) {
            return Some(obj);
        }
    }
    let end = balanced_end(&text[start..])?;
    as_object(&text[start..start + end])
}

/// Byte length of the balanced `{...}` at the start of `s`.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
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
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn fence_re() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[a-zA-Z0-9_-]*\s*\n?(.*?)```").expect("fence regex must compile")
    })
}

fn fenced_block(text: &str) -> Option<Map<String, Value>> {
    fence_re()
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .find_map(|body| as_object(body.as_str().trim()))
}

fn key_value_re() -> &'static Regex {
    static KV: OnceLock<Regex> = OnceLock::new();
    KV.get_or_init(|| {
        Regex::new(concat!(
            r#"(?im)^[\s\-\*]*"?(tags|category|confidence|domain|reasoning)"?"#,
            r"\s*[:=]\s*(.+?)\s*,?\s*$",
        ))
        .expect("key/value regex must compile")
    })
}

fn key_value(text: &str) -> Option<Map<String, Value>> {
    let mut obj = Map::new();
    for cap in key_value_re().captures_iter(text) {
        let key = cap[1].to_lowercase();
        let raw = cap[2].trim();
        if obj.contains_key(&key) {
            continue;
        }
        let value = if key == "tags" {
            Value::Array(split_tag_list(raw).into_iter().map(Value::String).collect())
        } else {
            Value::String(unquote(raw).to_string())
        };
        obj.insert(key, value);
    }
    if obj.contains_key("tags") || obj.contains_key("category") {
        Some(obj)
    } else {
        None
    }
}

fn split_tag_list(raw: &str) -> Vec<String> {
    raw.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(|t| unquote(t.trim()).to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}
