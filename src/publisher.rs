use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{Instrument, debug, error, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};

mod finite;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Body of a publish request: the event name plus the payload serialized to text.
#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    event: &'a str,
    data: String,
}

/// Sends outbound events to the queue server's publish endpoint.
///
/// Every call is one HTTP round trip bounded by the configured request timeout; there
/// is no retry and no shared mutable state, so a `Publisher` can be cloned freely and
/// used from many tasks at once.
#[derive(Debug, Clone)]
pub struct Publisher {
    client: Client,
    publish_url: Url,
    request_timeout: Duration,
}

impl Publisher {
    /// Creates a publisher for the configured publish endpoint.
    ///
    /// # Errors
    /// Returns `BridgeError::Config` if the HTTP client cannot be built
    pub fn new(config: &BridgeConfig) -> BridgeResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| BridgeError::Config(format!("failed to build HTTP client: {}", err)))?;

        Ok(Self {
            client,
            publish_url: config.publish_url().clone(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn publish_url(&self) -> &Url {
        &self.publish_url
    }

    /// Publishes one event and reports whether the queue server accepted it.
    ///
    /// Rejections, timeouts and transport failures are logged and come back as
    /// `Ok(false)`; callers that need at-least-once delivery retry on `false`.
    ///
    /// # Errors
    /// Returns `BridgeError::Serialization` if `payload` cannot be encoded
    pub async fn publish<T>(&self, event: &str, payload: &T) -> BridgeResult<bool>
    where
        T: Serialize + ?Sized,
    {
        match self.try_publish(event, payload).await {
            Ok(()) => Ok(true),
            Err(BridgeError::Serialization(err)) => {
                error!("Refusing to publish '{}': {}", event, err);
                Err(BridgeError::Serialization(err))
            }
            Err(err) => {
                warn!("{}", err);
                Ok(false)
            }
        }
    }

    /// Publishes one event, returning the reason when it was not accepted.
    ///
    /// # Errors
    /// Returns `BridgeError::Serialization` if `payload` cannot be encoded and
    /// `BridgeError::Publish` for non-2xx answers, timeouts and transport failures
    pub async fn try_publish<T>(&self, event: &str, payload: &T) -> BridgeResult<()>
    where
        T: Serialize + ?Sized,
    {
        let body = PublishRequest {
            event,
            data: encode_payload(payload)?,
        };
        let request_id = Uuid::new_v4();
        let span = info_span!("publish", event, %request_id);

        self.send(&body, request_id).instrument(span).await
    }

    async fn send(&self, body: &PublishRequest<'_>, request_id: Uuid) -> BridgeResult<()> {
        let response = self
            .client
            .post(self.publish_url.clone())
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .json(body)
            .send()
            .await
            .map_err(|err| BridgeError::Publish {
                event: body.event.to_owned(),
                reason: self.describe_transport_error(&err),
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "event accepted");
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        Err(BridgeError::Publish {
            event: body.event.to_owned(),
            reason: format!("queue server answered {}: {}", status, detail.trim()),
        })
    }

    fn describe_transport_error(&self, err: &reqwest::Error) -> String {
        if err.is_timeout() {
            format!("request timed out after {:?}", self.request_timeout)
        } else if err.is_connect() {
            format!("could not reach {}: {}", self.publish_url, err)
        } else {
            err.to_string()
        }
    }
}

/// Serializes a payload to the text carried in the `data` field.
///
/// The payload goes through `serde_json::Value`, whose objects keep their keys sorted,
/// so equal payloads always encode to identical text whatever map type they came from.
///
/// # Errors
/// Returns `BridgeError::Serialization` when the payload has no JSON representation,
/// e.g. a map whose keys are not strings, a NaN or infinite float, or a `Serialize`
/// impl that fails
pub fn encode_payload<T>(payload: &T) -> BridgeResult<String>
where
    T: Serialize + ?Sized,
{
    finite::check(payload)?;
    let value = serde_json::to_value(payload)?;
    Ok(serde_json::to_string(&value)?)
}
