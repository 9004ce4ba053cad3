/// advisor.rs — Non-binding entry advice from a text-generation model
///
/// The advisor only ever annotates an order report. It cannot veto or alter
/// the order sequence, and a slow or failing advisor just means no advice.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::AdvisorError;
use crate::market::{MacdPoint, MarketSnapshot};
use crate::models::VolatilityThreshold;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-3-flash-preview";

const PROMPT_PRICES: usize = 10;
const PROMPT_MACD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdviceSignal {
    Open,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    pub signal:     AdviceSignal,
    pub reason:     String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdviceRequest {
    pub prices:               Vec<f64>,
    pub macd_history:         Vec<MacdPoint>,
    pub volatility_threshold: VolatilityThreshold,
}

impl AdviceRequest {
    pub fn from_snapshot(snapshot: &MarketSnapshot, threshold: VolatilityThreshold) -> Self {
        Self {
            prices:               snapshot.prices.clone(),
            macd_history:         snapshot.macd.clone(),
            volatility_threshold: threshold,
        }
    }
}

#[async_trait]
pub trait SignalAdvisor: Send + Sync {
    async fn advise(&self, request: &AdviceRequest) -> Result<Advice, AdvisorError>;
}

pub struct GeminiAdvisor {
    client:   Client,
    base_url: String,
    api_key:  String,
    model:    String,
}

impl GeminiAdvisor {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self, AdvisorError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: GEMINI_BASE_URL.to_owned(),
            api_key:  api_key.to_owned(),
            model:    model.to_owned(),
        })
    }
}

#[async_trait]
impl SignalAdvisor for GeminiAdvisor {
    async fn advise(&self, request: &AdviceRequest) -> Result<Advice, AdvisorError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": build_prompt(request) }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "properties": {
                        "signal":     { "type": "STRING", "enum": ["OPEN", "WAIT"] },
                        "reason":     { "type": "STRING" },
                        "confidence": { "type": "NUMBER" }
                    },
                    "required": ["signal", "reason", "confidence"]
                }
            }
        });

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let text = resp.text().await?;
        debug!(model = %self.model, "Advisor answered");
        parse_generate_response(&text)
    }
}

pub fn build_prompt(request: &AdviceRequest) -> String {
    let prices: Vec<String> = tail(&request.prices, PROMPT_PRICES)
        .iter()
        .map(|p| format!("{p:.1}"))
        .collect();
    let macd: Vec<String> = tail(&request.macd_history, PROMPT_MACD)
        .iter()
        .map(|m| format!("{{macd:{:.2},signal:{:.2},hist:{:.2}}}", m.macd, m.signal, m.histogram))
        .collect();

    format!(
        "Analyse the following BTC data for a PERPETUAL FUTURES trade (LONG only).\n\
         Recent prices: [{}]\n\
         MACD history: [{}]\n\
         Selected volatility threshold: {}\n\n\
         Decide whether this is a good moment to open a LONG based on trend and MACD.\n\
         Answer ONLY with JSON: {{\"signal\": \"OPEN\" | \"WAIT\", \"reason\": string, \"confidence\": number}}",
        prices.join(", "),
        macd.join(", "),
        request.volatility_threshold
    )
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

pub fn parse_generate_response(body: &str) -> Result<Advice, AdvisorError> {
    let resp: GenerateResponse =
        serde_json::from_str(body).map_err(|e| AdvisorError::Answer(e.to_string()))?;
    let text = resp
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content.parts.into_iter().find_map(|p| p.text))
        .ok_or_else(|| AdvisorError::Answer("no candidate text".into()))?;

    let advice: Advice =
        serde_json::from_str(text.trim()).map_err(|e| AdvisorError::Answer(e.to_string()))?;
    if !advice.confidence.is_finite() {
        return Err(AdvisorError::Answer("non-finite confidence".into()));
    }
    Ok(advice)
}
