//! LLM adapter: one HTTP call shape, three typed uses (signature extraction,
//! batch digest, trend summary).
//!
//! Every call is guarded by an hourly budget and an in-flight semaphore.
//! Failures never propagate past this module — callers see `None` and the
//! pipeline treats the message as having no signature.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crosswatch_core::clock::Clock;
use crosswatch_core::config::LlmConfig;
use crosswatch_core::text::clip;
use crosswatch_core::types::EventSignature;

use crate::error::{LlmError, Result};
use crate::parse::parse_json_lenient;
use crate::prompts;

/// Extraction input is clipped to bound prompt cost.
const EXTRACT_INPUT_MAX: usize = 1500;
/// Per-message clip inside a batch digest.
const BATCH_ITEM_MAX: usize = 500;
/// Max messages folded into one batch digest.
const BATCH_ITEMS_MAX: usize = 20;
/// Trend summary input clip.
const TREND_INPUT_MAX: usize = 800;

struct BudgetWindow {
    used: u32,
    window_start: DateTime<Utc>,
}

pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    budget_hourly: u32,
    budget: Mutex<BudgetWindow>,
    in_flight: Semaphore,
    clock: Arc<dyn Clock>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.base_url.clone(),
            api_key: config.api_key.clone(),
            budget_hourly: config.budget_hourly,
            budget: Mutex::new(BudgetWindow {
                used: 0,
                window_start: clock.now(),
            }),
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            clock,
        })
    }

    /// Charge one call against the hourly budget. The window resets when an
    /// hour has elapsed since its start.
    fn try_charge(&self) -> Result<()> {
        let now = self.clock.now();
        let mut budget = self.budget.lock().unwrap();
        if (now - budget.window_start).num_seconds() >= 3600 {
            budget.used = 0;
            budget.window_start = now;
        }
        if budget.used >= self.budget_hourly {
            return Err(LlmError::BudgetExhausted {
                used: budget.used,
                limit: self.budget_hourly,
            });
        }
        budget.used += 1;
        Ok(())
    }

    /// Calls charged in the current window. Exposed for the hourly stats log.
    pub fn calls_used(&self) -> u32 {
        self.budget.lock().unwrap().used
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.try_charge()?;
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| LlmError::Parse("semaphore closed".into()))?;

        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": 0.2, "maxOutputTokens": 512},
        });
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: clip(&message, 200).to_string(),
            });
        }
        let parsed: GenerateResponse = response.json().await?;
        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.trim().to_string())
            .ok_or_else(|| LlmError::Parse("empty candidates".into()))?;
        Ok(text)
    }

    /// Extract a structured signature from a raw message.
    ///
    /// Returns `None` on budget exhaustion, transport failure, parse failure,
    /// or an `irrelevant` classification — the caller cannot tell these apart
    /// and is not supposed to.
    pub async fn extract_signature(&self, text: &str) -> Option<EventSignature> {
        let prompt = prompts::extract_prompt(clip(text, EXTRACT_INPUT_MAX));
        let raw = match self.complete(&prompt).await {
            Ok(raw) => raw,
            Err(LlmError::BudgetExhausted { used, limit }) => {
                warn!(used, limit, "extraction skipped: LLM budget exhausted");
                return None;
            }
            Err(e) => {
                warn!("extraction call failed: {e}");
                return None;
            }
        };
        match signature_from_raw(&raw) {
            Some(sig) => Some(sig),
            None => {
                debug!(raw = %clip(&raw, 200), "no usable signature in LLM output");
                None
            }
        }
    }

    /// Hebrew digest of a batch of uncorrelated messages.
    pub async fn summarize_batch(
        &self,
        texts: &[String],
        authority_context: &str,
    ) -> Option<String> {
        let blob = texts
            .iter()
            .take(BATCH_ITEMS_MAX)
            .map(|t| clip(t, BATCH_ITEM_MAX))
            .collect::<Vec<_>>()
            .join("\n---\n");
        let prompt = prompts::summary_prompt(&blob, authority_context);
        match self.complete(&prompt).await {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!("batch summary failed: {e}");
                None
            }
        }
    }

    /// One-line Hebrew trend summary plus a quoted translation line.
    pub async fn summarize_trend(&self, text: &str, authority_context: &str) -> Option<String> {
        let prompt = prompts::trend_prompt(clip(text, TREND_INPUT_MAX), authority_context);
        match self.complete(&prompt).await {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!("trend summary failed: {e}");
                None
            }
        }
    }
}

/// Parse LLM output into a signature; `irrelevant` maps to `None`.
fn signature_from_raw(raw: &str) -> Option<EventSignature> {
    let mut value = parse_json_lenient(raw)?;
    // Models return explicit nulls for absent fields; drop them so the
    // defaults apply instead of failing deserialization.
    if let Some(obj) = value.as_object_mut() {
        obj.retain(|_, v| !v.is_null());
    }
    let sig: EventSignature = match serde_json::from_value(value) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("signature parse failed: {e} | raw: {}", clip(raw, 200));
            return None;
        }
    };
    sig.is_relevant().then_some(sig)
}
