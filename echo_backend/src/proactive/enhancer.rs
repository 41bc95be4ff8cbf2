use anyhow::Result;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::llm_client::TextGenerator;

pub const DEFAULT_ENHANCEMENT_TIMEOUT: Duration = Duration::from_secs(20);
const FAILURE_WARN_THRESHOLD: u32 = 3;

/// Optional style pass over raw candidate text. Never fails: any problem
/// returns the raw text unchanged.
pub struct MessageEnhancer {
    generator: Option<Arc<dyn TextGenerator>>,
    timeout: Duration,
    consecutive_failures: AtomicU32,
}

impl MessageEnhancer {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self {
            generator: Some(generator),
            timeout,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Pass-through enhancer used when enhancement is turned off.
    pub fn disabled() -> Self {
        Self {
            generator: None,
            timeout: DEFAULT_ENHANCEMENT_TIMEOUT,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.generator.is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub async fn enhance(&self, raw: &str) -> String {
        let Some(generator) = self.generator.as_ref() else {
            return raw.to_string();
        };

        let prompt = enhancement_prompt(raw);
        match tokio::time::timeout(self.timeout, collect_text(generator.as_ref(), &prompt)).await {
            Ok(Ok(text)) => {
                let cleaned = clean_enhanced(&text);
                if cleaned.is_empty() {
                    self.record_failure("empty response");
                    raw.to_string()
                } else {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    cleaned
                }
            }
            Ok(Err(error)) => {
                self.record_failure(&error.to_string());
                raw.to_string()
            }
            Err(_) => {
                self.record_failure(&format!("timed out after {:?}", self.timeout));
                raw.to_string()
            }
        }
    }

    fn record_failure(&self, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= FAILURE_WARN_THRESHOLD {
            tracing::warn!(
                "Message enhancement failed {} times in a row (latest: {}); using raw text",
                failures,
                reason
            );
        } else {
            tracing::debug!("Message enhancement failed ({}); using raw text", reason);
        }
    }
}

fn enhancement_prompt(raw: &str) -> String {
    format!(
        "Take this message and make it sound more natural and personal. \
         Keep the core message but make it warmer and more conversational:\n\n\
         \"{}\"\n\n\
         Make it feel like it comes from someone who genuinely cares about the relationship \
         and has been thinking about the conversation. Reply with the rewritten message only.",
        raw
    )
}

async fn collect_text(generator: &dyn TextGenerator, prompt: &str) -> Result<String> {
    let mut stream = generator.generate(prompt).await?;
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}

/// Trim whitespace and a single pair of wrapping quotes.
fn clean_enhanced(text: &str) -> String {
    let trimmed = text.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proactive::testing::{
        BrokenStreamGenerator, FailingGenerator, FixedGenerator, StallingGenerator,
    };

    #[tokio::test]
    async fn successful_stream_replaces_text() {
        let generator = Arc::new(FixedGenerator::new(&["\"Hey", " there!\""]));
        let enhancer = MessageEnhancer::new(generator.clone(), DEFAULT_ENHANCEMENT_TIMEOUT);
        assert_eq!(enhancer.enhance("hello").await, "Hey there!");
        assert_eq!(enhancer.consecutive_failures(), 0);
        assert!(generator.prompts()[0].contains("\"hello\""));
    }

    #[tokio::test]
    async fn generator_error_falls_back_to_raw() {
        let enhancer = MessageEnhancer::new(Arc::new(FailingGenerator), DEFAULT_ENHANCEMENT_TIMEOUT);
        assert_eq!(enhancer.enhance("raw text").await, "raw text");
        assert_eq!(enhancer.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn mid_stream_error_falls_back_to_raw() {
        let enhancer =
            MessageEnhancer::new(Arc::new(BrokenStreamGenerator), DEFAULT_ENHANCEMENT_TIMEOUT);
        assert_eq!(enhancer.enhance("raw text").await, "raw text");
    }

    #[tokio::test]
    async fn empty_output_falls_back_to_raw() {
        let enhancer = MessageEnhancer::new(
            Arc::new(FixedGenerator::new(&["  ", "\n"])),
            DEFAULT_ENHANCEMENT_TIMEOUT,
        );
        assert_eq!(enhancer.enhance("raw text").await, "raw text");
        assert_eq!(enhancer.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_generator_times_out() {
        let enhancer = MessageEnhancer::new(Arc::new(StallingGenerator), Duration::from_secs(5));
        assert_eq!(enhancer.enhance("raw text").await, "raw text");
        assert_eq!(enhancer.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let failing = MessageEnhancer::new(Arc::new(FailingGenerator), DEFAULT_ENHANCEMENT_TIMEOUT);
        for _ in 0..3 {
            failing.enhance("x").await;
        }
        assert_eq!(failing.consecutive_failures(), 3);

        let enhancer = MessageEnhancer {
            generator: Some(Arc::new(FixedGenerator::new(&["fine"]))),
            timeout: DEFAULT_ENHANCEMENT_TIMEOUT,
            consecutive_failures: AtomicU32::new(4),
        };
        assert_eq!(enhancer.enhance("x").await, "fine");
        assert_eq!(enhancer.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn disabled_enhancer_passes_through() {
        let enhancer = MessageEnhancer::disabled();
        assert!(!enhancer.is_enabled());
        assert_eq!(enhancer.enhance("as is").await, "as is");
    }
}
