//! HTTP offer/answer exchange with the voice backend.
//!
//! One POST carries the local `{sdp, type}` offer to the configured
//! endpoint and expects an `{sdp, type}` answer back. There is no retry:
//! a failed exchange resets voice state and the user triggers it again.

use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use crate::voice::port::SessionDescription;
use crate::voice::VoiceError;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Default timeouts for the signaling exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignalingDefaults;

impl SignalingDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Client for the offer/answer signaling endpoint.
#[derive(Clone)]
pub struct SignalingClient {
    http: Client,
    offer_url: String,
    api_key: Option<SecretString>,
    exchange_timeout: Duration,
}

impl SignalingClient {
    pub fn new(
        offer_url: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, VoiceError> {
        let http = Client::builder()
            .connect_timeout(SignalingDefaults::CONNECT_TIMEOUT)
            .build()
            .map_err(VoiceError::Signaling)?;

        Ok(Self {
            http,
            offer_url: offer_url.into(),
            api_key,
            exchange_timeout: SignalingDefaults::EXCHANGE_TIMEOUT,
        })
    }

    /// Posts the local offer and returns the remote answer.
    pub async fn exchange(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, VoiceError> {
        let mut request = self
            .http
            .post(&self.offer_url)
            .timeout(self.exchange_timeout)
            .json(offer);

        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", api_key.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(ERROR_BODY_SNIPPET_LEN).collect();
            return Err(VoiceError::SignalingStatus {
                status,
                body: snippet,
            });
        }

        let answer: SessionDescription = response.json().await?;
        Ok(answer)
    }
}
