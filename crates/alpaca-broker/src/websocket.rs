use crate::models::StreamMessage;
use analysis_core::Bar;
use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub const ALPACA_IEX_STREAM: &str = "wss://stream.data.alpaca.markets/v2/iex";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Live minute bars for a fixed watchlist, fanned out over a broadcast channel.
pub struct AlpacaBarStream {
    url: String,
    api_key: String,
    api_secret: String,
    symbols: Vec<String>,
    tx: broadcast::Sender<(String, Bar)>,
    shutdown: Arc<Notify>,
}

impl AlpacaBarStream {
    pub fn new(
        url: String,
        api_key: String,
        api_secret: String,
        symbols: &[String],
    ) -> (Self, broadcast::Receiver<(String, Bar)>) {
        let (tx, rx) = broadcast::channel(1024);
        let stream = Self {
            url,
            api_key,
            api_secret,
            symbols: symbols.iter().map(|s| s.trim().to_uppercase()).collect(),
            tx,
            shutdown: Arc::new(Notify::new()),
        };
        (stream, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, Bar)> {
        self.tx.subscribe()
    }

    /// Handle that stops `run` from another task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Stream until shutdown, reconnecting after failures.
    pub async fn run(&self) {
        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    tracing::info!("Alpaca bar stream stopped");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Alpaca bar stream error: {:#}, reconnecting in 5s", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                        _ = self.shutdown.notified() => {
                            tracing::info!("Alpaca bar stream shutdown requested");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connecting to {}", self.url))?;
        let (mut write, mut read) = ws_stream.split();
        tracing::info!("Connected to Alpaca market data stream");

        let auth_msg = serde_json::json!({
            "action": "auth",
            "key": self.api_key,
            "secret": self.api_secret,
        });
        write.send(Message::Text(auth_msg.to_string())).await?;

        // The server greets with "connected" before answering the auth request
        loop {
            let text = match read.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(anyhow!("stream closed during authentication")),
            };
            if authenticated(&parse_frame(&text)?)? {
                break;
            }
        }

        let sub_msg = serde_json::json!({
            "action": "subscribe",
            "bars": self.symbols,
        });
        write.send(Message::Text(sub_msg.to_string())).await?;
        tracing::info!("Streaming bars for: {}", self.symbols.join(", "));

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(anyhow!("connection closed by server"));
                        }
                        Some(Err(e)) => {
                            return Err(e.into());
                        }
                        _ => {}
                    }
                }
                _ = self.shutdown.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let messages = match parse_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("Unparseable stream frame: {:#}", e);
                return;
            }
        };

        for message in messages {
            match message {
                StreamMessage::Error { code, msg } => {
                    tracing::error!("Alpaca stream error {}: {}", code, msg);
                }
                other => {
                    if let Some((symbol, bar)) = other.into_bar() {
                        tracing::debug!(
                            "Bar: {} O={:.2} H={:.2} L={:.2} C={:.2} V={}",
                            symbol,
                            bar.open,
                            bar.high,
                            bar.low,
                            bar.close,
                            bar.volume
                        );
                        // No receivers is fine; bars are dropped until someone listens
                        let _ = self.tx.send((symbol, bar));
                    }
                }
            }
        }
    }
}

pub fn parse_frame(text: &str) -> Result<Vec<StreamMessage>> {
    serde_json::from_str(text).context("invalid stream frame")
}

/// True once the frame confirms authentication; an error frame fails the connection.
fn authenticated(messages: &[StreamMessage]) -> Result<bool> {
    for message in messages {
        match message {
            StreamMessage::Success { msg } if msg == "authenticated" => return Ok(true),
            StreamMessage::Error { code, msg } => {
                return Err(anyhow!("authentication failed ({}): {}", code, msg));
            }
            _ => {}
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (AlpacaBarStream, broadcast::Receiver<(String, Bar)>) {
        AlpacaBarStream::new(
            ALPACA_IEX_STREAM.to_string(),
            "key".to_string(),
            "secret".to_string(),
            &[" aapl".to_string(), "msft ".to_string()],
        )
    }

    #[test]
    fn test_symbols_normalized() {
        let (s, _rx) = stream();
        assert_eq!(s.symbols, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn test_authentication_handshake() {
        let connected = parse_frame(r#"[{"T":"success","msg":"connected"}]"#).unwrap();
        assert!(!authenticated(&connected).unwrap());

        let ok = parse_frame(r#"[{"T":"success","msg":"authenticated"}]"#).unwrap();
        assert!(authenticated(&ok).unwrap());

        let failed = parse_frame(r#"[{"T":"error","code":402,"msg":"auth failed"}]"#).unwrap();
        let err = authenticated(&failed).unwrap_err();
        assert!(err.to_string().contains("402"));
    }

    #[test]
    fn test_bars_are_broadcast() {
        let (s, mut rx) = stream();
        s.handle_message(
            r#"[{"T":"b","S":"AAPL","o":10,"h":11,"l":9.5,"c":10.5,"v":500,"t":"2024-03-01T15:05:00Z"},
                {"T":"t","S":"AAPL","p":10.4}]"#,
        );

        let (symbol, bar) = rx.try_recv().unwrap();
        assert_eq!(symbol, "AAPL");
        assert_eq!(bar.volume, 500);
        assert!(bar.vwap.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_garbage_frame_is_ignored() {
        let (s, mut rx) = stream();
        s.handle_message("not json");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_retry() {
        let (s, _rx) = AlpacaBarStream::new(
            "ws://127.0.0.1:1".to_string(),
            "key".to_string(),
            "secret".to_string(),
            &["AAPL".to_string()],
        );
        s.shutdown_handle().notify_one();
        tokio::time::timeout(Duration::from_secs(10), s.run())
            .await
            .unwrap();
    }
}
