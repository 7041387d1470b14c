//! Raw conversation export parsing.
//!
//! Two record shapes are accepted, either as a JSON array or as JSONL:
//!
//! | Shape | Recognised by | Turn order |
//! |-------|---------------|------------|
//! | ChatGPT export | `mapping` + `current_node` | `parent` links up to the root, reversed |
//! | Simple | `messages` array of `{role, content, timestamp?}` | array order |
//!
//! Turns with no textual content (tool stubs, hidden system prompts, image
//! parts) are dropped. Each turn's parent is the turn before it, so the
//! resulting messages form a single reply chain.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hasher::{compute_hash, digest_value, message_projection, ConversationDraft};
use crate::models::{Conversation, Message};

/// One conversation as found in the export, before hashing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawConversation {
    pub title: String,
    pub create_time: Option<i64>,
    pub turns: Vec<RawTurn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawTurn {
    pub role: String,
    pub content: String,
    pub timestamp: Option<i64>,
}

/// Result of reading an export: parsed records plus the number of records
/// that could not be understood and were skipped.
#[derive(Debug, Default)]
pub struct CorpusRead {
    pub conversations: Vec<RawConversation>,
    pub skipped: usize,
}

/// Read an export file. Failing to open or to parse a JSON array is fatal;
/// individual malformed records are skipped with a warning.
pub fn read_corpus(path: &Path) -> Result<CorpusRead> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Artifact {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("cannot read export: {}", e),
    })?;
    parse_corpus(&content).map_err(|reason| Error::Artifact {
        path: path.to_path_buf(),
        line: 0,
        reason,
    })
}

/// Parse export text (JSON array or JSONL).
pub fn parse_corpus(content: &str) -> std::result::Result<CorpusRead, String> {
    let mut read = CorpusRead::default();
    let trimmed = content.trim_start();

    if trimmed.starts_with('[') {
        let records: Vec<Value> =
            serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON array: {}", e))?;
        for (i, record) in records.iter().enumerate() {
            push_record(&mut read, record, i + 1);
        }
    } else {
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(record) => push_record(&mut read, &record, i + 1),
                Err(e) => {
                    warn!(line = i + 1, error = %e, "skipping unparseable export line");
                    read.skipped += 1;
                }
            }
        }
    }

    Ok(read)
}

fn push_record(read: &mut CorpusRead, record: &Value, position: usize) {
    match parse_record(record) {
        Some(conv) if !conv.turns.is_empty() => read.conversations.push(conv),
        Some(_) => {
            debug!(position, "skipping conversation with no text turns");
            read.skipped += 1;
        }
        None => {
            warn!(position, "skipping unrecognised export record");
            read.skipped += 1;
        }
    }
}

fn parse_record(record: &Value) -> Option<RawConversation> {
    let obj = record.as_object()?;
    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Untitled")
        .trim()
        .to_string();
    let create_time = obj.get("create_time").and_then(as_epoch_seconds);

    let turns = if let Some(mapping) = obj.get("mapping").and_then(Value::as_object) {
        let current = obj.get("current_node").and_then(Value::as_str);
        mapping_turns(mapping, current)?
    } else if let Some(messages) = obj.get("messages").and_then(Value::as_array) {
        messages.iter().filter_map(simple_turn).collect()
    } else {
        return None;
    };

    Some(RawConversation {
        title,
        create_time,
        turns,
    })
}

fn mapping_turns(
    mapping: &serde_json::Map<String, Value>,
    current_node: Option<&str>,
) -> Option<Vec<RawTurn>> {
    // Without current_node, take the deepest leaf reachable by first children.
    let start = match current_node {
        Some(id) => id.to_string(),
        None => leaf_from_root(mapping)?,
    };

    let mut chain = Vec::new();
    let mut cursor = Some(start);
    let mut guard = 0usize;
    while let Some(id) = cursor {
        guard += 1;
        if guard > mapping.len() + 1 {
            warn!("cycle in conversation mapping");
            break;
        }
        let node = mapping.get(&id)?;
        if let Some(turn) = node.get("message").and_then(mapping_turn) {
            chain.push(turn);
        }
        cursor = node
            .get("parent")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    chain.reverse();
    Some(chain)
}

fn leaf_from_root(mapping: &serde_json::Map<String, Value>) -> Option<String> {
    let (root, _) = mapping
        .iter()
        .find(|(_, node)| node.get("parent").map(Value::is_null).unwrap_or(true))?;
    let mut id = root.clone();
    loop {
        let next = mapping
            .get(&id)
            .and_then(|n| n.get("children"))
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(Value::as_str);
        match next {
            Some(child) if mapping.contains_key(child) => id = child.to_string(),
            _ => return Some(id),
        }
    }
}

fn mapping_turn(message: &Value) -> Option<RawTurn> {
    let role = message
        .get("author")
        .and_then(|a| a.get("role"))
        .and_then(Value::as_str)?;
    let content = message.get("content")?;
    let text = match content.get("parts").and_then(Value::as_array) {
        Some(parts) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        None => content
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };
    if text.trim().is_empty() {
        return None;
    }
    Some(RawTurn {
        role: role.to_string(),
        content: text,
        timestamp: message.get("create_time").and_then(as_epoch_seconds),
    })
}

fn simple_turn(message: &Value) -> Option<RawTurn> {
    let role = message.get("role").and_then(Value::as_str)?;
    let content = message.get("content").and_then(Value::as_str)?;
    if content.trim().is_empty() {
        return None;
    }
    Some(RawTurn {
        role: role.to_string(),
        content: content.to_string(),
        timestamp: message.get("timestamp").and_then(as_epoch_seconds),
    })
}

fn as_epoch_seconds(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        Value::String(s) => s
            .parse::<f64>()
            .ok()
            .map(|f| f.floor() as i64)
            .or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp())
            }),
        _ => None,
    }
}

/// Assign content-derived ids to a raw conversation and its messages.
pub fn materialize(raw: &RawConversation) -> (Conversation, Vec<Message>) {
    let draft = ConversationDraft {
        title: &raw.title,
        create_time: raw.create_time,
        turns: raw
            .turns
            .iter()
            .map(|t| (t.role.as_str(), t.content.as_str()))
            .collect(),
    };
    let conversation_id = compute_hash(&draft);

    let mut messages = Vec::with_capacity(raw.turns.len());
    let mut parent: Option<String> = None;
    for turn in &raw.turns {
        let id = digest_value(&message_projection(
            &conversation_id,
            &turn.role,
            &turn.content,
            parent.as_deref(),
        ));
        messages.push(Message {
            id: id.clone(),
            conversation_id: conversation_id.clone(),
            role: turn.role.clone(),
            content: turn.content.clone(),
            timestamp: turn.timestamp,
            parent_id: parent.take(),
        });
        parent = Some(id);
    }

    let conversation = Conversation {
        id: conversation_id,
        title: raw.title.clone(),
        create_time: raw.create_time,
        message_ids: messages.iter().map(|m| m.id.clone()).collect(),
    };
    (conversation, messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHATGPT: &str = r#"[{
        "title": "Borrow checker",
        "create_time": 1700000000.25,
        "current_node": "n3",
        "mapping": {
            "root": {"id": "root", "message": null, "parent": null, "children": ["n1"]},
            "n1": {"id": "n1", "parent": "root", "children": ["n2"],
                   "message": {"author": {"role": "user"}, "create_time": 1700000001,
                               "content": {"content_type": "text",
                                           "parts": ["Why does this not compile?"]}}},
            "n2": {"id": "n2", "parent": "n1", "children": ["n3", "alt"],
                   "message": {"author": {"role": "assistant"},
                               "content": {"content_type": "text",
                                           "parts": ["You move the value twice."]}}},
            "alt": {"id": "alt", "parent": "n2", "children": [],
                    "message": {"author": {"role": "user"},
                                "content": {"content_type": "text",
                                            "parts": ["abandoned branch"]}}},
            "n3": {"id": "n3", "parent": "n2", "children": [],
                   "message": {"author": {"role": "user"},
                               "content": {"content_type": "text",
                                           "parts": ["Thanks!"]}}}
        }
    }]"#;

    #[test]
    fn test_chatgpt_mapping_follows_current_node() {
        let read = parse_corpus(CHATGPT).unwrap();
        assert_eq!(read.conversations.len(), 1);
        let conv = &read.conversations[0];
        assert_eq!(conv.title, "Borrow checker");
        assert_eq!(conv.create_time, Some(1700000000));
        let contents: Vec<&str> = conv.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Why does this not compile?", "You move the value twice.", "Thanks!"]
        );
        assert_eq!(conv.turns[0].timestamp, Some(1700000001));
    }

    #[test]
    fn test_simple_jsonl_with_bad_line() {
        let input = concat!(
            r#"{"title": "A", "messages": [{"role": "user", "content": "hi"}]}"#,
            "\n",
            "{not json\n",
            r#"{"title": "B", "messages": []}"#,
            "\n"
        );
        let read = parse_corpus(input).unwrap();
        assert_eq!(read.conversations.len(), 1);
        assert_eq!(read.skipped, 2);
    }

    #[test]
    fn test_broken_array_is_error() {
        assert!(parse_corpus("[{\"title\": ").is_err());
    }

    #[test]
    fn test_materialize_links_reply_chain() {
        let read = parse_corpus(CHATGPT).unwrap();
        let (conv, messages) = materialize(&read.conversations[0]);
        assert_eq!(conv.message_ids.len(), 3);
        assert_eq!(messages[0].parent_id, None);
        assert_eq!(messages[1].parent_id.as_deref(), Some(messages[0].id.as_str()));
        assert_eq!(messages[2].parent_id.as_deref(), Some(messages[1].id.as_str()));
        assert!(messages.iter().all(|m| m.conversation_id == conv.id));
    }

    #[test]
    fn test_materialize_is_stable() {
        let read = parse_corpus(CHATGPT).unwrap();
        let (a, ma) = materialize(&read.conversations[0]);
        let (b, mb) = materialize(&read.conversations[0]);
        assert_eq!(a, b);
        assert_eq!(ma, mb);
        assert_eq!(compute_hash(&ma[1]), ma[1].id);
    }
}
