use std::time::Duration;

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::NarrativeConfig;
use crate::error::NarrativeError;
use crate::model::IndicatorRow;

pub const PROMPT_VERSION: &str = "v1.0";

const SYSTEM_PROMPT: &str = "You are a cautious financial analyst.";
const REQUEST_TIMEOUT_SECS: u64 = 60;

fn fmt_value(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.decimals$}"))
}

/// Plain-text snapshot of the latest technical state of one ticker.
pub fn summarize_technical_state(latest: &IndicatorRow) -> String {
    let daily_return = latest
        .daily_return
        .map_or_else(|| "n/a".to_string(), |r| format!("{:.2}%", r * 100.0));

    format!(
        "Ticker: {ticker}\n\
         Date: {date}\n\
         \n\
         Price:\n\
         - Close: {close}\n\
         \n\
         Trend:\n\
         - MA 5: {ma_5}\n\
         - MA 20: {ma_20}\n\
         - MA 50: {ma_50}\n\
         \n\
         Momentum:\n\
         - RSI: {rsi}\n\
         \n\
         Returns:\n\
         - Daily return: {daily_return}\n",
        ticker = latest.ticker,
        date = latest.date,
        close = fmt_value(latest.close, 2),
        ma_5 = fmt_value(latest.ma_5, 2),
        ma_20 = fmt_value(latest.ma_20, 2),
        ma_50 = fmt_value(latest.ma_50, 2),
        rsi = fmt_value(latest.rsi, 2),
    )
}

pub fn build_prompt(summary: &str) -> String {
    format!(
        "[PROMPT_VERSION: {PROMPT_VERSION}]\n\
         You are a cautious financial market analyst.\n\
         \n\
         Based ONLY on the technical indicators below, provide:\n\
         1. Trend assessment (bullish / bearish / sideways)\n\
         2. Momentum interpretation\n\
         3. Risk signals\n\
         4. A cautious technical outlook\n\
         \n\
         DO NOT give direct buy/sell advice.\n\
         DO NOT make predictions.\n\
         DO NOT guarantee outcomes.\n\
         \n\
         Technical data:\n\
         {summary}"
    )
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct NarrativeClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    api_key: String,
}

impl NarrativeClient {
    /// Build a client, or `None` when narratives are disabled or no API key
    /// is configured.
    pub fn from_config(config: &NarrativeConfig) -> Option<Self> {
        if !config.enabled {
            debug!("narrative disabled in config");
            return None;
        }

        let Some(api_key) = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
        else {
            warn!(env = %config.api_key_env, "API key not found in environment");
            return None;
        };

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "failed to initialize narrative client");
                return None;
            }
        };

        Some(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key,
        })
    }

    pub async fn analyze(&self, prompt: &str) -> Result<String, Report<NarrativeError>> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .change_context(NarrativeError::Request)?;

        if !response.status().is_success() {
            return Err(Report::new(NarrativeError::Request)
                .attach(format!("HTTP status: {}", response.status())));
        }

        let body: ChatResponse = response
            .json()
            .await
            .change_context(NarrativeError::ResponseParse)?;

        first_message(body)
    }
}

/// Narrative for the latest row of a ticker. Fails with
/// [`NarrativeError::Unavailable`] when no client is configured; callers
/// show an "unavailable" notice instead of the text.
pub async fn technical_outlook(
    client: Option<&NarrativeClient>,
    latest: &IndicatorRow,
) -> Result<String, Report<NarrativeError>> {
    let client = client.ok_or_else(|| Report::new(NarrativeError::Unavailable))?;
    let prompt = build_prompt(&summarize_technical_state(latest));
    client.analyze(&prompt).await
}

fn first_message(body: ChatResponse) -> Result<String, Report<NarrativeError>> {
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| Report::new(NarrativeError::ResponseParse).attach("response had no content"))
}

// ── API payload types ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn latest() -> IndicatorRow {
        IndicatorRow {
            ticker: "TLKM.JK".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            close: Some(3120.0),
            ma_5: Some(3101.456),
            ma_20: Some(3050.0),
            ma_50: None,
            rsi: Some(61.234),
            daily_return: Some(0.0125),
        }
    }

    #[test]
    fn summary_lists_every_indicator() {
        let summary = summarize_technical_state(&latest());
        assert!(summary.contains("Ticker: TLKM.JK"));
        assert!(summary.contains("Date: 2024-05-17"));
        assert!(summary.contains("- Close: 3120.00"));
        assert!(summary.contains("- MA 5: 3101.46"));
        assert!(summary.contains("- MA 50: n/a"));
        assert!(summary.contains("- RSI: 61.23"));
        assert!(summary.contains("- Daily return: 1.25%"));
    }

    #[test]
    fn prompt_is_versioned_and_embeds_summary() {
        let prompt = build_prompt("SUMMARY");
        assert!(prompt.starts_with("[PROMPT_VERSION: v1.0]"));
        assert!(prompt.contains("DO NOT give direct buy/sell advice."));
        assert!(prompt.ends_with("SUMMARY"));
    }

    #[test]
    fn disabled_config_builds_no_client() {
        let config = NarrativeConfig {
            enabled: false,
            ..NarrativeConfig::default()
        };
        assert!(NarrativeClient::from_config(&config).is_none());
    }

    #[test]
    fn missing_api_key_builds_no_client() {
        let config = NarrativeConfig {
            api_key_env: "EQUITY_PULSE_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..NarrativeConfig::default()
        };
        assert!(NarrativeClient::from_config(&config).is_none());
    }

    #[tokio::test]
    async fn outlook_without_client_is_unavailable() {
        let report = technical_outlook(None, &latest()).await.unwrap_err();
        assert!(matches!(
            report.current_context(),
            NarrativeError::Unavailable
        ));
    }

    #[test]
    fn first_message_extracts_content() {
        let body: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Sideways trend."}}]}"#,
        )
        .unwrap();
        assert_eq!(first_message(body).unwrap(), "Sideways trend.");
    }

    #[test]
    fn empty_choices_is_a_parse_error() {
        let body: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(first_message(body).is_err());
    }
}
