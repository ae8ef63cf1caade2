pub mod client;
pub mod models;
pub mod websocket;

pub use broker_trait::BrokerClient;
pub use client::AlpacaClient;
pub use models::*;
pub use websocket::AlpacaBarStream;
