//! Broker signaling client.
//!
//! Registers this proxy with the rendezvous broker, receives client offers,
//! and returns the negotiated answers. The same HTTP client also talks to
//! the NAT probe endpoint.

use crate::config::ProxyConfig;
use async_trait::async_trait;
use flurry_core::messages::{
    coarse_client_count, AnswerRequest, ProbeRequest, ProbeResponse, ProxyPollRequest,
    ProxyPollResponse, STATUS_CLIENT_MATCH, STATUS_NO_MATCH,
};
use flurry_core::{FlurryError, FlurryResult, NatType, SessionDescription, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Broker requests are long-polled; give them room before giving up.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A client offer handed out by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOffer {
    /// JSON-encoded session description, validated by the session.
    pub offer: String,
    /// Relay the client asked for instead of the configured default.
    pub relay_url: Option<String>,
    /// The client's own NAT classification as reported by the broker.
    pub client_nat: NatType,
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Match(ClientOffer),
    /// No client waiting; treated as a timeout by the control loop.
    NoMatch,
}

/// Signaling operations the orchestrator and NAT probe depend on.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Register and ask for a client offer.
    async fn get_offer(
        &self,
        sid: &str,
        active_clients: usize,
        nat: NatType,
    ) -> FlurryResult<PollOutcome>;

    /// Hand the local answer back. Failures are logged, not returned.
    async fn send_answer(&self, sid: &str, answer: &SessionDescription);

    /// Exchange a self-test offer with the NAT probe endpoint.
    async fn probe(&self, offer: &SessionDescription) -> FlurryResult<SessionDescription>;
}

/// HTTP implementation of [`Signaling`].
pub struct BrokerClient {
    http: reqwest::Client,
    /// Normalised broker base URL with trailing slash.
    url: String,
    probe_url: String,
    proxy_type: String,
    relay_pattern: String,
}

impl BrokerClient {
    pub fn new(config: &ProxyConfig) -> FlurryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FlurryError::Broker(format!("cannot build HTTP client: {e}")))?;

        info!(broker = %config.broker_url, "using broker");

        Ok(Self {
            http,
            url: config.broker_url.clone(),
            probe_url: config.probe_url.clone(),
            proxy_type: config.proxy_type.clone(),
            relay_pattern: config.allowed_relay_pattern.clone(),
        })
    }

    /// Base URL the client was configured with.
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> FlurryResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| FlurryError::Broker(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FlurryError::Broker(format!(
                "{url} returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| FlurryError::Broker(format!("bad response body from {url}: {e}")))
    }
}

#[async_trait]
impl Signaling for BrokerClient {
    async fn get_offer(
        &self,
        sid: &str,
        active_clients: usize,
        nat: NatType,
    ) -> FlurryResult<PollOutcome> {
        let request = ProxyPollRequest {
            version: PROTOCOL_VERSION.to_string(),
            sid: sid.to_string(),
            proxy_type: self.proxy_type.clone(),
            nat,
            clients: coarse_client_count(active_clients),
            accepted_relay_pattern: self.relay_pattern.clone(),
        };
        let url = format!("{}proxy", self.url);
        debug!(sid, url = %url, "polling broker");

        let response: ProxyPollResponse = self.post_json(&url, &request).await?;
        match response.status.as_str() {
            STATUS_CLIENT_MATCH => {
                let offer = response.offer.filter(|o| !o.is_empty()).ok_or_else(|| {
                    FlurryError::UnexpectedStatus("client match without an offer".into())
                })?;
                Ok(PollOutcome::Match(ClientOffer {
                    offer,
                    relay_url: response.relay_url.filter(|u| !u.is_empty()),
                    client_nat: response
                        .nat
                        .as_deref()
                        .map(NatType::parse)
                        .unwrap_or_default(),
                }))
            }
            STATUS_NO_MATCH => Ok(PollOutcome::NoMatch),
            other => Err(FlurryError::UnexpectedStatus(other.to_string())),
        }
    }

    async fn send_answer(&self, sid: &str, answer: &SessionDescription) {
        let answer = match answer.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(sid, error = %e, "cannot encode answer");
                return;
            }
        };
        let request = AnswerRequest {
            version: PROTOCOL_VERSION.to_string(),
            sid: sid.to_string(),
            answer,
        };
        let url = format!("{}answer", self.url);

        match self.post_json::<_, serde_json::Value>(&url, &request).await {
            Ok(_) => debug!(sid, "answer delivered to broker"),
            Err(e) => warn!(sid, error = %e, "failed to deliver answer"),
        }
    }

    async fn probe(&self, offer: &SessionDescription) -> FlurryResult<SessionDescription> {
        let request = ProbeRequest {
            status: STATUS_CLIENT_MATCH.to_string(),
            offer: offer.to_json()?,
        };
        let response: ProbeResponse = self.post_json(&self.probe_url, &request).await?;
        SessionDescription::parse_answer(&response.answer)
    }
}
