use std::time::Duration;

use async_trait::async_trait;
use wsqueue::WsSubscription;

use super::{Connection, Connector};
use crate::config::BridgeConfig;
use crate::error::BridgeResult;

/// Opens websocket subscriptions against the configured socket endpoint.
///
/// The handshake shares the publisher's request timeout, so a dead server can never
/// stall a connect attempt indefinitely.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    handshake_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            url: config.socket_url().to_string(),
            handshake_timeout: config.request_timeout(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Connection = WsSubscription;

    async fn connect(&self) -> BridgeResult<WsSubscription> {
        Ok(WsSubscription::open(&self.url, self.handshake_timeout).await?)
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connection for WsSubscription {
    async fn receive(&mut self) -> BridgeResult<Option<String>> {
        Ok(WsSubscription::receive(self).await?)
    }

    async fn close(&mut self) -> BridgeResult<()> {
        Ok(WsSubscription::close(self).await?)
    }
}
