//! Enrichment client: tags, category, confidence and domain per chunk.
//!
//! Protocol for one conversation:
//!
//! 1. [`EnrichmentClient::classify_conversation`] samples a few sibling
//!    chunks and asks for a coarse `{domain, topic}`. Failure just means
//!    no context.
//! 2. [`EnrichmentClient::annotate`] asks for an annotation per chunk. Calls
//!    go through the shared [`RetryPolicy`] and [`Throttle`]; the reply goes
//!    through the [`parse`] cascade.
//! 3. If enabled, a second call reviews the proposal and may replace it.
//!
//! `annotate` never fails: any error ends in [`Annotation::fallback`].

pub mod parse;
pub mod prompts;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::EnrichmentConfig;
use crate::error::Result;
use crate::inference::{ChatMessage, InferenceRequest, InferenceService};
use crate::models::{Annotation, AnnotationSource, ConversationContext};
use crate::retry::{retry, RetryPolicy, Throttle};

pub use parse::Strategy;

pub struct EnrichmentClient {
    service: Arc<dyn InferenceService>,
    model: String,
    temperature: f32,
    policy: RetryPolicy,
    throttle: Throttle,
    validate: bool,
    sample_size: usize,
}

impl EnrichmentClient {
    pub fn new(service: Arc<dyn InferenceService>, config: &EnrichmentConfig) -> Self {
        Self {
            service,
            model: config.model_name().to_string(),
            temperature: config.temperature,
            policy: config.retry_policy(),
            throttle: Throttle::new(config.min_delay()),
            validate: config.validate,
            sample_size: config.context_sample_size,
        }
    }

    /// Replace the retry policy, e.g. to shorten delays.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, label: &str, messages: Vec<ChatMessage>) -> Result<String> {
        let request = InferenceRequest {
            model: self.model.clone(),
            prompt: None,
            messages,
            temperature: self.temperature,
        };
        let response = retry(&self.policy, label, || async {
            self.throttle.wait().await;
            self.service.generate(&request).await
        })
        .await?;
        Ok(response.text)
    }

    /// Coarse domain/topic for a conversation, from evenly spaced samples
    /// of its chunks.
    pub async fn classify_conversation(
        &self,
        title: &str,
        chunk_texts: &[&str],
    ) -> Option<ConversationContext> {
        if chunk_texts.is_empty() || self.sample_size == 0 {
            return None;
        }
        let samples: Vec<&str> = sample_evenly(chunk_texts, self.sample_size)
            .into_iter()
            .copied()
            .collect();
        let outcome = match self
            .call("enrich.classify", prompts::classify(title, &samples))
            .await
        {
            Ok(text) => parse::parse_context(&text),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(ctx) => {
                debug!(title, domain = %ctx.domain, topic = %ctx.topic, "conversation classified");
                Some(ctx)
            }
            Err(e) => {
                warn!(
                    title,
                    error = %e,
                    "conversation pre-pass failed, continuing without context"
                );
                None
            }
        }
    }

    /// First-pass annotation without fallback.
    pub async fn try_annotate(
        &self,
        content: &str,
        context: Option<&ConversationContext>,
    ) -> Result<(Annotation, Strategy)> {
        let text = self
            .call("enrich.annotate", prompts::annotate(content, context))
            .await?;
        let (annotation, strategy) = parse::parse_annotation(&text)?;
        if strategy != Strategy::Direct {
            debug!(?strategy, "annotation recovered by repair cascade");
        }
        Ok((annotation, strategy))
    }

    /// Annotate one chunk. Always returns an annotation.
    pub async fn annotate(
        &self,
        content: &str,
        context: Option<&ConversationContext>,
    ) -> Annotation {
        let proposal = match self.try_annotate(content, context).await {
            Ok((annotation, _)) => annotation,
            Err(e) => {
                warn!(error = %e, kind = ?e.kind(), "annotation failed, using fallback");
                return Annotation::fallback();
            }
        };
        if !self.validate {
            return proposal;
        }
        self.validate(content, proposal).await
    }

    /// Second-pass review. Errors keep the proposal unchanged.
    pub async fn validate(&self, content: &str, proposal: Annotation) -> Annotation {
        let verdict = match self
            .call("enrich.validate", prompts::validate(content, &proposal))
            .await
        {
            Ok(text) => parse::parse_verdict(&text),
            Err(e) => Err(e),
        };
        let verdict = match verdict {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "validation pass failed, keeping proposal");
                return proposal;
            }
        };

        match (verdict.valid, verdict.corrected) {
            (true, _) => Annotation {
                source: AnnotationSource::Validated,
                reasoning: verdict.reasoning,
                ..proposal
            },
            (false, Some(corrected)) => {
                debug!(from = ?proposal.tags, to = ?corrected.tags, "annotation corrected");
                Annotation {
                    reasoning: verdict.reasoning.or(corrected.reasoning.clone()),
                    ..corrected
                }
            }
            (false, None) => Annotation {
                reasoning: verdict.reasoning,
                ..proposal
            },
        }
    }
}

/// Up to `n` items spread evenly across `items`, first item included.
pub fn sample_evenly<T>(items: &[T], n: usize) -> Vec<&T> {
    if n == 0 || items.is_empty() {
        return Vec::new();
    }
    if items.len() <= n {
        return items.iter().collect();
    }
    (0..n).map(|i| &items[i * items.len() / n]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{ScriptStep, ScriptedService};
    use crate::models::{Confidence, UNTAGGED};
    use std::time::Duration;

    fn config(validate: bool) -> EnrichmentConfig {
        EnrichmentConfig {
            provider: "ollama".into(),
            model: Some("test-model".into()),
            validate,
            ..EnrichmentConfig::default()
        }
    }

    fn client(service: Arc<ScriptedService>, validate: bool) -> EnrichmentClient {
        EnrichmentClient::new(service, &config(validate)).with_policy(RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
            backoff: crate::retry::Backoff::Fixed,
            timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn test_three_transient_failures_fall_back() {
        let svc = Arc::new(ScriptedService::sequence(vec![ScriptStep::Transient]));
        let c = client(svc.clone(), false);
        let a = c.annotate("some text", None).await;
        assert_eq!(a.tags, vec![UNTAGGED]);
        assert!(a.is_fallback());
        assert_eq!(svc.calls(), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_one_transient() {
        let svc = Arc::new(ScriptedService::sequence(vec![
            ScriptStep::Transient,
            ScriptStep::Reply(r##"{"tags": ["#rust"], "confidence": "high"}"##.into()),
        ]));
        let a = client(svc.clone(), false).annotate("text", None).await;
        assert_eq!(a.tags, vec!["#rust"]);
        assert_eq!(a.confidence, Confidence::High);
        assert_eq!(svc.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let svc = Arc::new(ScriptedService::sequence(vec![ScriptStep::Reject]));
        let a = client(svc.clone(), false).annotate("text", None).await;
        assert!(a.is_fallback());
        assert_eq!(svc.calls(), 1);
    }

    #[tokio::test]
    async fn test_garbage_reply_falls_back() {
        let svc = Arc::new(ScriptedService::always("no idea, sorry"));
        let a = client(svc, false).annotate("text", None).await;
        assert!(a.is_fallback());
    }

    #[tokio::test]
    async fn test_validation_corrects_mislabel() {
        let svc = Arc::new(ScriptedService::sequence(vec![
            ScriptStep::Reply(r##"{"tags": ["#kubernetes"], "domain": "devops"}"##.into()),
            ScriptStep::Reply(
                r##"{"valid": false, "corrected": {"tags": ["#bread"], "domain": "cooking"},
                    "reasoning": "about baking"}"##
                    .into(),
            ),
        ]));
        let a = client(svc, true).annotate("proofing dough overnight", None).await;
        assert_eq!(a.tags, vec!["#bread"]);
        assert_eq!(a.source, AnnotationSource::Corrected);
        assert_eq!(a.reasoning.as_deref(), Some("about baking"));
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_proposal() {
        let svc = Arc::new(ScriptedService::sequence(vec![
            ScriptStep::Reply(r##"{"tags": ["#sql"]}"##.into()),
            ScriptStep::Reject,
        ]));
        let a = client(svc, true).annotate("select * from t", None).await;
        assert_eq!(a.tags, vec!["#sql"]);
        assert_eq!(a.source, AnnotationSource::Model);
    }

    #[tokio::test]
    async fn test_validation_confirms() {
        let svc = Arc::new(ScriptedService::sequence(vec![
            ScriptStep::Reply(r##"{"tags": ["#sql"]}"##.into()),
            ScriptStep::Reply(r#"{"valid": true, "reasoning": "fits"}"#.into()),
        ]));
        let a = client(svc, true).annotate("select * from t", None).await;
        assert_eq!(a.source, AnnotationSource::Validated);
    }

    #[tokio::test]
    async fn test_context_passed_to_annotation_prompt() {
        let svc = Arc::new(ScriptedService::from_fn(|req, _| {
            if req.full_text().contains("classify whole conversations") {
                ScriptStep::Reply(r#"{"domain": "cooking", "topic": "sourdough"}"#.into())
            } else {
                ScriptStep::Reply(r##"{"tags": ["#starter"]}"##.into())
            }
        }));
        let c = client(svc.clone(), false);
        let ctx = c
            .classify_conversation("Bread", &["a", "b", "c", "d", "e", "f", "g"])
            .await
            .unwrap();
        assert_eq!(ctx.domain, "cooking");
        c.annotate("feed it twice a day", Some(&ctx)).await;
        let last = svc.requests().pop().unwrap();
        assert!(last.full_text().contains("sourdough"));
    }

    #[tokio::test]
    async fn test_classify_failure_yields_none() {
        let svc = Arc::new(ScriptedService::always("?"));
        assert!(client(svc, false)
            .classify_conversation("t", &["x"])
            .await
            .is_none());
    }

    #[test]
    fn test_sample_evenly() {
        let items: Vec<u32> = (0..10).collect();
        let s: Vec<u32> = sample_evenly(&items, 5).into_iter().copied().collect();
        assert_eq!(s, vec![0, 2, 4, 6, 8]);
        assert_eq!(sample_evenly(&items[..3], 5).len(), 3);
        assert!(sample_evenly(&items, 0).is_empty());
    }
}
