//! Content hashing.
//!
//! Every unit is identified by a SHA-256 digest of a canonical JSON
//! projection of its *input* fields. The projection is produced by
//! [`ContentAddressed::essential_fields`]; derived fields (tags, cluster ids,
//! embedding references) never take part, so re-running enrichment cannot
//! change a unit's identity.
//!
//! Canonical form: object keys sorted, no insignificant whitespace, strings
//! normalised (CRLF → LF, surrounding whitespace trimmed).

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::manifest::Manifest;
use crate::models::{Chunk, Message};

/// A unit whose identity is derived from its content.
pub trait ContentAddressed {
    /// The projection of input fields that defines identity.
    fn essential_fields(&self) -> Value;
}

/// Digest of a unit's essential fields.
pub fn compute_hash<T: ContentAddressed + ?Sized>(unit: &T) -> String {
    digest_value(&unit.essential_fields())
}

/// Digest of an arbitrary JSON value in canonical form.
pub fn digest_value(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    sha256_hex(out.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Chunk id: digest of the owning message id and the chunk text digest.
pub fn chunk_id(message_id: &str, text: &str) -> String {
    let text_digest = sha256_hex(normalize_text(text).as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(message_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(text_digest.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `digest` is already recorded in `manifest`.
pub fn is_processed(digest: &str, manifest: &Manifest) -> bool {
    manifest.contains(digest)
}

/// Record `digest` in `manifest`. Must be called only after the unit's
/// output has been written.
pub fn mark_processed(digest: &str, manifest: &mut Manifest) -> Result<()> {
    manifest.mark(digest).map(|_| ())
}

pub fn normalize_text(s: &str) -> String {
    s.replace("\r\n", "\n").trim().to_string()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            let normalized = normalize_text(s);
            out.push_str(&Value::String(normalized).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Projection of a message before its id is known.
pub fn message_projection(
    conversation_id: &str,
    role: &str,
    content: &str,
    parent_id: Option<&str>,
) -> Value {
    json!({
        "conversation_id": conversation_id,
        "role": role,
        "content": content,
        "parent_id": parent_id,
    })
}

impl ContentAddressed for Message {
    fn essential_fields(&self) -> Value {
        message_projection(
            &self.conversation_id,
            &self.role,
            &self.content,
            self.parent_id.as_deref(),
        )
    }
}

impl ContentAddressed for Chunk {
    fn essential_fields(&self) -> Value {
        json!({
            "source_message_id": self.source_message_id,
            "text": self.text,
        })
    }
}

/// Conversation identity covers its title, creation time and the ordered
/// role/content pairs of its messages. Message ids are excluded because
/// they depend on the conversation id.
pub struct ConversationDraft<'a> {
    pub title: &'a str,
    pub create_time: Option<i64>,
    pub turns: Vec<(&'a str, &'a str)>,
}

impl ContentAddressed for ConversationDraft<'_> {
    fn essential_fields(&self) -> Value {
        let turns: Vec<Value> = self
            .turns
            .iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect();
        json!({
            "title": self.title,
            "create_time": self.create_time,
            "messages": turns,
        })
    }
}
