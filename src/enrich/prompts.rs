//! Prompt construction for the three enrichment calls.

use crate::inference::ChatMessage;
use crate::models::{Annotation, ConversationContext};

/// Longest content excerpt sent in any prompt, in chars.
const MAX_EXCERPT_CHARS: usize = 4000;

const ANNOTATE_SYSTEM: &str = "You label excerpts from chat conversations. \
Reply with a single JSON object and nothing else: \
{\"tags\": [\"#tag\", ...], \"category\": \"...\", \
\"confidence\": \"high|medium|low\", \"domain\": \"...\"}. \
Use 1-5 short lowercase tags that describe what the excerpt is actually about.";

const CLASSIFY_SYSTEM: &str = "You classify whole conversations. \
Reply with a single JSON object and nothing else: {\"domain\": \"...\", \"topic\": \"...\"}.";

const VALIDATE_SYSTEM: &str = "You review labels proposed for a chat excerpt. \
Check whether the tags, category and domain describe the excerpt, watching for vocabulary \
borrowed from an unrelated field. Reply with a single JSON object and nothing else: \
{\"valid\": true|false, \"corrected\": {\"tags\": [...], \"category\": \"...\", \
\"confidence\": \"...\", \"domain\": \"...\"}, \"reasoning\": \"...\"}. \
Omit \"corrected\" when the labels are valid.";

pub fn classify(title: &str, samples: &[&str]) -> Vec<ChatMessage> {
    let mut body = format!("Conversation title: {}\n\nSample excerpts:\n", title);
    for (i, sample) in samples.iter().enumerate() {
        body.push_str(&format!("\n[{}] {}\n", i + 1, excerpt(sample, 600)));
    }
    vec![ChatMessage::system(CLASSIFY_SYSTEM), ChatMessage::user(body)]
}

pub fn annotate(content: &str, context: Option<&ConversationContext>) -> Vec<ChatMessage> {
    let mut body = String::new();
    if let Some(ctx) = context {
        body.push_str(&format!(
            "The surrounding conversation is about {} (domain: {}).\n\n",
            ctx.topic, ctx.domain
        ));
    }
    body.push_str("Excerpt:\n");
    body.push_str(&excerpt(content, MAX_EXCERPT_CHARS));
    vec![ChatMessage::system(ANNOTATE_SYSTEM), ChatMessage::user(body)]
}

pub fn validate(content: &str, proposal: &Annotation) -> Vec<ChatMessage> {
    let proposed = serde_json::json!({
        "tags": proposal.tags,
        "category": proposal.category,
        "confidence": proposal.confidence.as_str(),
        "domain": proposal.domain,
    });
    let body = format!(
        "Proposed labels:\n{}\n\nExcerpt:\n{}",
        proposed,
        excerpt(content, MAX_EXCERPT_CHARS)
    );
    vec![ChatMessage::system(VALIDATE_SYSTEM), ChatMessage::user(body)]
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if out.len() < text.len() {
        out.push_str(" …");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_includes_context() {
        let ctx = ConversationContext {
            domain: "cooking".into(),
            topic: "sourdough".into(),
        };
        let msgs = annotate("feed the starter", Some(&ctx));
        assert_eq!(msgs[0].role, "system");
        assert!(msgs[1].content.contains("sourdough"));
        assert!(msgs[1].content.contains("feed the starter"));
        assert!(!annotate("x", None)[1].content.contains("surrounding"));
    }

    #[test]
    fn test_long_content_truncated() {
        let long = "a".repeat(MAX_EXCERPT_CHARS + 10);
        let msgs = annotate(&long, None);
        assert!(msgs[1].content.ends_with('…'));
    }
}
