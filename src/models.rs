//! Core data models that flow through the pipeline.
//!
//! The raw layer ([`Conversation`], [`Message`]) is immutable once extracted.
//! [`Chunk`]s are created by the chunker and only ever gain fields as later
//! stages run. [`Cluster`]s are rebuilt wholesale on every clustering run.

use serde::{Deserialize, Serialize};

/// Cluster id assigned to chunks that belong to no dense region.
pub const NOISE_CLUSTER: i64 = -1;

/// Tag written when enrichment could not produce a usable annotation.
pub const UNTAGGED: &str = "#untagged";

/// Records in an artifact stream are keyed by a stable id.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// A conversation, identified by the hash of its essential content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub create_time: Option<i64>,
    pub message_ids: Vec<String>,
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// A semantically coherent span of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub conversation_id: String,
    pub source_message_id: String,
    pub index: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_ref: Option<String>,
}

impl Chunk {
    /// Tags from the chunk's annotation, empty before enrichment.
    pub fn tags(&self) -> &[String] {
        self.annotation
            .as_ref()
            .map(|a| a.tags.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }

    /// Lenient parse used on model output.
    pub fn parse_lenient(s: &str) -> Self {
        let s = s.trim().to_lowercase();
        if s.starts_with("high") {
            return Confidence::High;
        }
        if s.starts_with("med") {
            return Confidence::Medium;
        }
        if let Ok(v) = s.parse::<f64>() {
            return if v >= 0.75 {
                Confidence::High
            } else if v >= 0.4 {
                Confidence::Medium
            } else {
                Confidence::Low
            };
        }
        Confidence::Low
    }
}

/// Where an annotation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationSource {
    /// First-pass model output, not validated.
    Model,
    /// Confirmed by the validation pass.
    Validated,
    /// Replaced by the validation pass.
    Corrected,
    /// Safe default after failure.
    Fallback,
}

/// Enrichment result for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub tags: Vec<String>,
    pub category: String,
    pub confidence: Confidence,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub source: AnnotationSource,
}

impl Annotation {
    /// The fixed annotation used whenever enrichment fails.
    pub fn fallback() -> Self {
        Self {
            tags: vec![UNTAGGED.to_string()],
            category: "uncategorized".to_string(),
            confidence: Confidence::Low,
            domain: "unknown".to_string(),
            reasoning: None,
            source: AnnotationSource::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == AnnotationSource::Fallback
    }
}

/// Coarse domain/topic shared by all chunks of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub domain: String,
    pub topic: String,
}

/// Embedding vector for a chunk. Persisted only in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub model: String,
    pub dims: usize,
    pub vector: Vec<f32>,
}

/// Cluster membership of one chunk for one clustering run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub run: String,
    pub chunk_id: String,
    pub cluster_id: i64,
}

/// Aggregate view of one cluster for one clustering run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub run: String,
    pub id: i64,
    pub size: usize,
    pub top_terms: Vec<String>,
    pub sample_titles: Vec<String>,
    #[serde(default)]
    pub x: Option<f32>,
    #[serde(default)]
    pub y: Option<f32>,
    #[serde(default)]
    pub centroid: Vec<f32>,
}

impl Cluster {
    /// Key used in both stores; cluster ids are small integers.
    pub fn store_id(&self) -> String {
        self.id.to_string()
    }
}

/// Algorithm that produced a 2D layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMethod {
    Spectral,
    Pca,
    Random,
}

impl LayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutMethod::Spectral => "spectral",
            LayoutMethod::Pca => "pca",
            LayoutMethod::Random => "random",
        }
    }
}

/// Display coordinates of one chunk for one positioning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub run: String,
    pub chunk_id: String,
    pub x: f32,
    pub y: f32,
    pub method: LayoutMethod,
}

/// Written once a batch stage has appended every record of a run. Readers
/// take the stage's last header as the current run, so a run that produced
/// no records still replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRun {
    pub stage: String,
    pub run: String,
    pub records: usize,
    pub created_at: i64,
}

/// A tag and how many chunks carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub count: u64,
}

impl Keyed for Conversation {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Message {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Chunk {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for EmbeddingRecord {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for ClusterAssignment {
    fn key(&self) -> &str {
        &self.chunk_id
    }
}

impl Keyed for ChunkPosition {
    fn key(&self) -> &str {
        &self.chunk_id
    }
}

/// Batch artifacts carry the id of the run that produced them.
pub trait RunScoped {
    fn run(&self) -> &str;
}

impl RunScoped for ClusterAssignment {
    fn run(&self) -> &str {
        &self.run
    }
}

impl RunScoped for Cluster {
    fn run(&self) -> &str {
        &self.run
    }
}

impl RunScoped for ChunkPosition {
    fn run(&self) -> &str {
        &self.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_lenient() {
        assert_eq!(Confidence::parse_lenient("High"), Confidence::High);
        assert_eq!(Confidence::parse_lenient(" medium "), Confidence::Medium);
        assert_eq!(Confidence::parse_lenient("0.9"), Confidence::High);
        assert_eq!(Confidence::parse_lenient("0.5"), Confidence::Medium);
        assert_eq!(Confidence::parse_lenient("whatever"), Confidence::Low);
    }

    #[test]
    fn test_fallback_annotation_never_empty() {
        let a = Annotation::fallback();
        assert_eq!(a.tags, vec![UNTAGGED.to_string()]);
        assert_eq!(a.confidence, Confidence::Low);
        assert!(a.is_fallback());
    }

    #[test]
    fn test_chunk_serializes_without_unset_fields() {
        let chunk = Chunk {
            id: "c1".into(),
            conversation_id: "conv".into(),
            source_message_id: "m1".into(),
            index: 0,
            text: "hello".into(),
            cluster_id: None,
            annotation: None,
            embedding_ref: None,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(!json.contains("cluster_id"));
        assert!(!json.contains("annotation"));
        assert!(chunk.tags().is_empty());
    }
}
