use std::time::Duration;

use analysis_core::Side;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use technical_analysis::{CombinedSignal, IndicatorSummary, PriceStructure, TrendClass, VolumeClass};

const ANALYST_SYSTEM: &str = r#"You are an expert quantitative day-trading analyst. You analyze candlestick patterns, technical indicators, price action, and market data to make trading decisions.

Your responses must be valid JSON with this exact structure:
{
    "decision": "enter_long" | "enter_short" | "skip",
    "confidence": 0.0-1.0,
    "reasoning": "Brief explanation of why",
    "stop_loss": null or suggested stop,
    "take_profit": null or suggested target,
    "key_factors": ["factor1", "factor2"]
}

Rules:
- Only recommend "enter_long" or "enter_short" if confidence >= 0.6
- Consider risk/reward ratio (minimum 2:1 preferred)
- Account for current trend direction and volume confirmation
- If data is insufficient or conflicting, recommend "skip"
- Be conservative: missing a trade is better than a bad trade"#;

/// Everything the advisor sees about one actionable signal.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryRequest {
    pub symbol: String,
    pub current_price: f64,
    pub signal: CombinedSignal,
    pub structure: PriceStructure,
    pub indicators: IndicatorSummary,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    EnterLong,
    EnterShort,
    Skip,
}

impl Decision {
    pub fn side(&self) -> Option<Side> {
        match self {
            Decision::EnterLong => Some(Side::Long),
            Decision::EnterShort => Some(Side::Short),
            Decision::Skip => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    pub decision: Decision,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub key_factors: Vec<String>,
}

impl Advice {
    pub fn skip(reasoning: impl Into<String>) -> Self {
        Self {
            decision: Decision::Skip,
            confidence: 0.0,
            stop_loss: None,
            take_profit: None,
            reasoning: reasoning.into(),
            key_factors: Vec::new(),
        }
    }
}

/// Second opinion on a signal before any order is placed.
///
/// Implementations never fail: errors become a `skip` with the cause in `reasoning`.
#[async_trait]
pub trait AdvisoryOracle: Send + Sync {
    async fn advise(&self, request: &AdvisoryRequest) -> Advice;
}

/// Pull the JSON object out of a model reply, tolerating markdown fences.
pub fn parse_advice(text: &str) -> Result<Advice> {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = body.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        body = body.rsplit_once("```").map(|(inner, _)| inner).unwrap_or(body);
    }
    let body = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => return Err(anyhow!("no JSON object in reply")),
    };

    let mut advice: Advice = serde_json::from_str(body).context("reply is not valid advice JSON")?;
    advice.confidence = advice.confidence.clamp(0.0, 1.0);
    advice.stop_loss = advice.stop_loss.filter(|p| p.is_finite() && *p > 0.0);
    advice.take_profit = advice.take_profit.filter(|p| p.is_finite() && *p > 0.0);
    Ok(advice)
}

fn trend_label(class: TrendClass) -> &'static str {
    match class {
        TrendClass::Uptrend => "uptrend",
        TrendClass::Downtrend => "downtrend",
        TrendClass::Sideways => "sideways",
    }
}

fn volume_label(class: VolumeClass) -> &'static str {
    match class {
        VolumeClass::VeryHigh => "very_high",
        VolumeClass::High => "high",
        VolumeClass::Normal => "normal",
        VolumeClass::Low => "low",
        VolumeClass::NoVolume => "no_volume",
    }
}

pub fn build_prompt(request: &AdvisoryRequest) -> String {
    let mut sections = vec![
        format!("## Analysis for {}", request.symbol),
        format!("Current Price: ${:.2}", request.current_price),
    ];

    let signal = serde_json::to_string_pretty(&request.signal).unwrap_or_default();
    sections.push(format!("\n### Signal Detected\n{}", signal));

    let levels = |levels: &[technical_analysis::PriceLevel]| {
        levels
            .iter()
            .map(|l| format!("{:.2}", l.display_price()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let structure = &request.structure;
    sections.push(format!(
        "\n### Price Action\nTrend: {} (strength: {:.2})\nVolume: {} (relative: {:.2}x)\nSupport levels: [{}]\nResistance levels: [{}]",
        trend_label(structure.trend.classification),
        structure.trend.strength,
        volume_label(structure.volume.class),
        structure.volume.relative,
        levels(&structure.support),
        levels(&structure.resistance),
    ));

    let indicators = serde_json::to_string_pretty(&request.indicators).unwrap_or_default();
    sections.push(format!("\n### Technical Indicators\n{}", indicators));

    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        sections.push(format!("\n### Additional Context\n{}", context));
    }

    sections.push(
        "\n### Decision Required\nBased on all the above data, should we enter a trade? Respond with valid JSON only."
            .to_string(),
    );
    sections.join("\n")
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Advisor backed by an Anthropic-compatible messages endpoint.
pub struct LlmOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl LlmOracle {
    pub fn new(base_url: String, api_key: Option<String>, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    async fn complete(&self, api_key: &str, prompt: &str) -> Result<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: 1024,
            system: ANALYST_SYSTEM,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("advisor returned {}: {}", status, error_text));
        }

        let reply = response.json::<MessagesResponse>().await?;
        reply
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text)
            .ok_or_else(|| anyhow!("advisor reply had no text"))
    }
}

#[async_trait]
impl AdvisoryOracle for LlmOracle {
    async fn advise(&self, request: &AdvisoryRequest) -> Advice {
        let Some(api_key) = self.api_key.as_deref() else {
            return Advice::skip("No AI API key configured");
        };

        let prompt = build_prompt(request);
        let reply = match self.complete(api_key, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("AI evaluation failed for {}: {:#}", request.symbol, e);
                return Advice::skip(format!("AI error: {}", e));
            }
        };

        match parse_advice(&reply) {
            Ok(advice) => {
                tracing::info!(
                    "AI decision for {}: {:?} (confidence: {:.2})",
                    request.symbol,
                    advice.decision,
                    advice.confidence
                );
                advice
            }
            Err(e) => {
                tracing::error!("AI response not valid JSON for {}: {:#}", request.symbol, e);
                Advice::skip(format!("AI response parsing failed: {}", e))
            }
        }
    }
}
