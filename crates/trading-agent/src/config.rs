use analysis_core::Timeframe;
use anyhow::{bail, Context, Result};
use risk_manager::RiskParameters;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Alpaca
    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,
    pub alpaca_base_url: String,
    pub alpaca_data_url: String,
    pub alpaca_stream_url: String,

    // Advisory model (no key = every signal is skipped)
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub ai_model: String,
    pub ai_timeout_secs: u64,
    pub min_ai_confidence: f64,

    // Trading
    pub watchlist: Vec<String>,
    pub timeframe: Timeframe,
    pub risk: RiskParameters,
    pub position_check_interval_secs: u64,

    // Bar history
    pub backfill_bars: usize,       // 200
    pub history_bars: usize,        // 100 kept per symbol for analysis
    pub min_history_bars: usize,    // 20 before any signal is scored

    // Database
    pub database_url: String,

    pub live_trading_approved: bool,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source. Unset variables take their defaults;
    /// set-but-unparseable ones are errors naming the variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            alpaca_api_key: var("ALPACA_API_KEY")
                .or_else(|| var("APCA_API_KEY_ID"))
                .context("ALPACA_API_KEY not set")?,
            alpaca_secret_key: var("ALPACA_SECRET_KEY")
                .or_else(|| var("APCA_API_SECRET_KEY"))
                .context("ALPACA_SECRET_KEY not set")?,
            alpaca_base_url: var("ALPACA_BASE_URL")
                .unwrap_or_else(|| "https://paper-api.alpaca.markets".to_string()),
            alpaca_data_url: var("ALPACA_DATA_URL")
                .unwrap_or_else(|| "https://data.alpaca.markets".to_string()),
            alpaca_stream_url: var("ALPACA_STREAM_URL")
                .unwrap_or_else(|| alpaca_broker::websocket::ALPACA_IEX_STREAM.to_string()),

            anthropic_api_key: var("ANTHROPIC_API_KEY"),
            anthropic_base_url: var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            ai_model: var("AI_MODEL").unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            ai_timeout_secs: parse_var(&var, "AI_TIMEOUT_SECS", 30)?,
            min_ai_confidence: parse_var(&var, "MIN_AI_CONFIDENCE", 0.6)?,

            watchlist: var("WATCHLIST")
                .unwrap_or_else(|| "AAPL,MSFT,NVDA,TSLA,SPY".to_string())
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            timeframe: parse_var(&var, "TIMEFRAME", Timeframe::Minute5)?,
            risk: RiskParameters {
                max_position_fraction: parse_var(&var, "MAX_POSITION_PCT", 0.05)?,
                max_positions: parse_var(&var, "MAX_POSITIONS", 3)?,
                stop_loss_fraction: parse_var(&var, "STOP_LOSS_PCT", 0.02)?,
                take_profit_fraction: parse_var(&var, "TAKE_PROFIT_PCT", 0.04)?,
                daily_loss_limit_fraction: parse_var(&var, "DAILY_LOSS_LIMIT_PCT", 0.03)?,
            },
            position_check_interval_secs: parse_var(&var, "POSITION_CHECK_INTERVAL", 30)?,

            backfill_bars: parse_var(&var, "BACKFILL_BARS", 200)?,
            history_bars: parse_var(&var, "HISTORY_BARS", 100)?,
            min_history_bars: parse_var(&var, "MIN_HISTORY_BARS", 20)?,

            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:candle_trader.db?mode=rwc".to_string()),

            live_trading_approved: var("LIVE_TRADING_APPROVED")
                .map(|v| v.eq_ignore_ascii_case("yes"))
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.watchlist.is_empty() {
            bail!("WATCHLIST is empty");
        }
        let fractions = [
            ("MAX_POSITION_PCT", self.risk.max_position_fraction),
            ("STOP_LOSS_PCT", self.risk.stop_loss_fraction),
            ("TAKE_PROFIT_PCT", self.risk.take_profit_fraction),
            ("DAILY_LOSS_LIMIT_PCT", self.risk.daily_loss_limit_fraction),
            ("MIN_AI_CONFIDENCE", self.min_ai_confidence),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                bail!("{} must be a fraction in (0, 1], got {}", name, value);
            }
        }
        if self.risk.max_positions == 0 {
            bail!("MAX_POSITIONS must be at least 1");
        }
        if self.position_check_interval_secs == 0 {
            bail!("POSITION_CHECK_INTERVAL must be at least 1 second");
        }
        if self.min_history_bars > self.history_bars {
            bail!(
                "MIN_HISTORY_BARS ({}) exceeds HISTORY_BARS ({})",
                self.min_history_bars,
                self.history_bars
            );
        }
        Ok(())
    }

    pub fn is_paper(&self) -> bool {
        self.alpaca_base_url.contains("paper-api")
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}='{}' is invalid: {}", name, raw, e)),
        None => Ok(default),
    }
}
