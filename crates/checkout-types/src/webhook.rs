//! Webhook endpoint subscriptions and their delivery policy knobs.
//!
//! An endpoint is merchant-owned configuration: where to POST, which event
//! types to receive, the HMAC secret, and the retry policy. Health is
//! tracked per endpoint; after [`AUTO_FAIL_THRESHOLD`] consecutive terminal
//! failures the endpoint flips to `failed` and stops receiving deliveries
//! until a merchant re-enables it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use url::Url;

use crate::event::{AggregateType, DomainEvent, EventType};
use crate::id::{EndpointId, MerchantId};

/// Consecutive terminal failures before an endpoint auto-transitions to
/// `failed`.
pub const AUTO_FAIL_THRESHOLD: u32 = 10;

/// Minimum HMAC secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

pub const MAX_RETRIES_BOUND: u32 = 10;
pub const MIN_TIMEOUT_SECONDS: u64 = 5;
pub const MAX_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Active,
    Disabled,
    Failed,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointStatus::Active => "active",
            EndpointStatus::Disabled => "disabled",
            EndpointStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Retry delay growth curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    Linear,
    Exponential,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WebhookEndpointError {
    #[error("Endpoint URL must use https, got {0}")]
    NotHttps(String),
    #[error("Subscription set must not be empty")]
    EmptySubscriptions,
    #[error("Secret must be at least {MIN_SECRET_LEN} bytes, got {0}")]
    SecretTooShort(usize),
    #[error("max_retries {0} outside [0, {MAX_RETRIES_BOUND}]")]
    MaxRetriesOutOfBounds(u32),
    #[error("timeout_seconds {0} outside [{MIN_TIMEOUT_SECONDS}, {MAX_TIMEOUT_SECONDS}]")]
    TimeoutOutOfBounds(u64),
    #[error("Endpoint is {0}; operation requires a different status")]
    WrongStatus(EndpointStatus),
}

/// A merchant's webhook subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: EndpointId,
    pub merchant_id: MerchantId,
    pub url: Url,
    pub events: BTreeSet<EventType>,
    /// HMAC-SHA256 key for payload signatures.
    pub secret: String,
    pub status: EndpointStatus,
    pub max_retries: u32,
    pub retry_backoff: RetryBackoff,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,
    /// Extra static headers applied to every delivery request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Consecutive terminal-failure count feeding the auto-fail rule.
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable endpoint settings accepted on create and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: Url,
    pub events: BTreeSet<EventType>,
    pub secret: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff")]
    pub retry_backoff: RetryBackoff,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff() -> RetryBackoff {
    RetryBackoff::Exponential
}

fn default_timeout_seconds() -> u64 {
    30
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), WebhookEndpointError> {
        if self.url.scheme() != "https" {
            return Err(WebhookEndpointError::NotHttps(self.url.to_string()));
        }
        if self.events.is_empty() {
            return Err(WebhookEndpointError::EmptySubscriptions);
        }
        if self.secret.len() < MIN_SECRET_LEN {
            return Err(WebhookEndpointError::SecretTooShort(self.secret.len()));
        }
        if self.max_retries > MAX_RETRIES_BOUND {
            return Err(WebhookEndpointError::MaxRetriesOutOfBounds(
                self.max_retries,
            ));
        }
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&self.timeout_seconds) {
            return Err(WebhookEndpointError::TimeoutOutOfBounds(
                self.timeout_seconds,
            ));
        }
        Ok(())
    }
}

impl WebhookEndpoint {
    pub fn new(
        merchant_id: MerchantId,
        config: EndpointConfig,
    ) -> Result<WebhookEndpoint, WebhookEndpointError> {
        config.validate()?;
        let now = Utc::now();
        Ok(WebhookEndpoint {
            id: EndpointId::generate(),
            merchant_id,
            url: config.url,
            events: config.events,
            secret: config.secret,
            status: EndpointStatus::Active,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            timeout_seconds: config.timeout_seconds,
            allowed_ips: config.allowed_ips,
            headers: config.headers,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == EndpointStatus::Active
    }

    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.events.contains(&event_type)
    }

    /// Replaces the endpoint configuration; health state is preserved.
    pub fn reconfigure(&mut self, config: EndpointConfig) -> Result<(), WebhookEndpointError> {
        config.validate()?;
        self.url = config.url;
        self.events = config.events;
        self.secret = config.secret;
        self.max_retries = config.max_retries;
        self.retry_backoff = config.retry_backoff;
        self.timeout_seconds = config.timeout_seconds;
        self.allowed_ips = config.allowed_ips;
        self.headers = config.headers;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Records a successful delivery; resets the failure streak.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.updated_at = Utc::now();
    }

    /// Records a terminally failed delivery. Returns `true` when the streak
    /// crosses [`AUTO_FAIL_THRESHOLD`] and the endpoint flips to `failed`.
    pub fn record_terminal_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.updated_at = Utc::now();
        if self.status == EndpointStatus::Active
            && self.consecutive_failures >= AUTO_FAIL_THRESHOLD
        {
            self.status = EndpointStatus::Failed;
            true
        } else {
            false
        }
    }

    /// Merchant action: re-enable a disabled or failed endpoint.
    pub fn enable(&mut self) -> Result<(), WebhookEndpointError> {
        match self.status {
            EndpointStatus::Disabled | EndpointStatus::Failed => {
                self.status = EndpointStatus::Active;
                self.consecutive_failures = 0;
                self.updated_at = Utc::now();
                Ok(())
            }
            EndpointStatus::Active => Err(WebhookEndpointError::WrongStatus(self.status)),
        }
    }

    /// Merchant action: pause deliveries without losing configuration.
    pub fn disable(&mut self) -> Result<(), WebhookEndpointError> {
        match self.status {
            EndpointStatus::Active => {
                self.status = EndpointStatus::Disabled;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(WebhookEndpointError::WrongStatus(self.status)),
        }
    }
}

/// Events published for endpoint lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookEndpointEvent {
    Created {
        endpoint_id: EndpointId,
        merchant_id: MerchantId,
        url: Url,
        events: BTreeSet<EventType>,
        at: DateTime<Utc>,
    },
    Updated {
        endpoint_id: EndpointId,
        merchant_id: MerchantId,
        at: DateTime<Utc>,
    },
    Enabled {
        endpoint_id: EndpointId,
        merchant_id: MerchantId,
        at: DateTime<Utc>,
    },
    Disabled {
        endpoint_id: EndpointId,
        merchant_id: MerchantId,
        at: DateTime<Utc>,
    },
    Deleted {
        endpoint_id: EndpointId,
        merchant_id: MerchantId,
        at: DateTime<Utc>,
    },
}

impl DomainEvent for WebhookEndpointEvent {
    fn event_type(&self) -> EventType {
        match self {
            WebhookEndpointEvent::Created { .. } => EventType::WebhookEndpointCreated,
            WebhookEndpointEvent::Updated { .. } => EventType::WebhookEndpointUpdated,
            WebhookEndpointEvent::Enabled { .. } => EventType::WebhookEndpointEnabled,
            WebhookEndpointEvent::Disabled { .. } => EventType::WebhookEndpointDisabled,
            WebhookEndpointEvent::Deleted { .. } => EventType::WebhookEndpointDeleted,
        }
    }

    fn aggregate_type() -> AggregateType {
        AggregateType::WebhookEndpoint
    }
}

/// How one delivery attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryAttemptOutcome {
    Delivered,
    Retrying,
    FailedTerminal,
}

/// Audit record of one webhook delivery attempt, appended to the delivery's
/// own stream (one stream per `(event, endpoint)` pair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDeliveryAttempted {
    pub delivery_id: crate::id::DeliveryId,
    pub endpoint_id: EndpointId,
    pub event_id: crate::id::EventId,
    pub event_type: EventType,
    pub attempt: u32,
    pub outcome: DeliveryAttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl DomainEvent for WebhookDeliveryAttempted {
    fn event_type(&self) -> EventType {
        EventType::WebhookDeliveryAttempted
    }

    fn aggregate_type() -> AggregateType {
        AggregateType::WebhookDelivery
    }
}
