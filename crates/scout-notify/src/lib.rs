//! Outbound delivery: formats notification messages and sends them through an
//! SMS gateway. Each attempt reports success or failure; the sweep decides
//! what happens next.

use std::time::Duration;

use async_trait::async_trait;
use scout_core::SearchResult;
use thiserror::Error;

pub const CRATE_NAME: &str = "scout-notify";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway rejected message with status {status}")]
    Gateway { status: u16 },
}

/// Capability interface for the notification channel. One call is one
/// delivery attempt; any error means "not delivered" and nothing more.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, destination: &str, message: &str) -> Result<(), DeliveryError>;
}

/// The message a user receives for one discovered result.
pub fn format_notification(query: &str, result: &SearchResult) -> String {
    format!(
        "New item found matching your search: {query}\n\n\
         Title: {title}\n\
         Description: {description}\n\
         URL: {url}",
        title = result.title,
        description = result.description,
        url = result.external_id,
    )
}

#[derive(Debug, Clone)]
pub struct SmsGatewayConfig {
    pub api_base: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub timeout: Duration,
}

impl SmsGatewayConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("SCOUT_SMS_API_BASE")
                .unwrap_or_else(|_| "https://api.twilio.com".to_string()),
            account_sid: std::env::var("SCOUT_SMS_ACCOUNT_SID").unwrap_or_default(),
            auth_token: std::env::var("SCOUT_SMS_AUTH_TOKEN").unwrap_or_default(),
            from_number: std::env::var("SCOUT_SMS_FROM_NUMBER").unwrap_or_default(),
            timeout: Duration::from_secs(
                std::env::var("SCOUT_SMS_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15),
            ),
        }
    }
}

/// Twilio-style REST gateway. No internal retries: an undelivered result
/// stays in the pending set and the next sweep tries again.
#[derive(Debug)]
pub struct SmsGateway {
    client: reqwest::Client,
    config: SmsGatewayConfig,
}

impl SmsGateway {
    pub fn new(config: SmsGatewayConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DeliveryChannel for SmsGateway {
    async fn deliver(&self, destination: &str, message: &str) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid,
        );
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", destination),
                ("From", self.config.from_number.as_str()),
                ("Body", message),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Gateway {
                status: status.as_u16(),
            })
        }
    }
}
