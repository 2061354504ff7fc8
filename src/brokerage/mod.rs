//! Brokerage integrations.
//!
//! Defines the `BrokerageGateway` trait the decision loop trades through,
//! the `SessionValidator` used by the control surface to check credentials,
//! and the gateway error taxonomy. Implementations:
//! - Alpaca (REST, paper or live endpoint)
//! - Paper (in-memory fills for dry runs)

pub mod alpaca;
pub mod paper;

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret, SecretString};
use std::fmt;

use crate::types::{AccountSnapshot, OpenOrder, OrderReceipt, OrderRequest, Position};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure talking to the brokerage.
///
/// The split matters for submissions: a `Timeout` or `Unavailable` after the
/// request left means the order may or may not exist at the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Brokerage call timed out")]
    Timeout,

    /// Connection never established; nothing was sent.
    #[error("Brokerage unreachable: {0}")]
    Unreachable(String),

    #[error("Brokerage unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Brokerage credentials rejected")]
    Unauthorized,

    #[error("Unexpected brokerage response: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// Errors after which no further trading should be attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Unauthorized)
    }

    /// The request may have reached the broker; its effect is unknown.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Unavailable { .. })
    }

    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_connect() {
            GatewayError::Unreachable(e.to_string())
        } else if e.is_decode() {
            GatewayError::Malformed(e.to_string())
        } else {
            // Request may have been written before the failure.
            GatewayError::Unavailable {
                status: 0,
                body: e.to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// API key pair. The secret never appears in `Debug` output or logs.
pub struct Credentials {
    pub api_key: String,
    api_secret: SecretString,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: Secret::new(api_secret.into()),
        }
    }

    /// Read both halves from environment variables, if present and non-empty.
    pub fn from_env(key_var: &str, secret_var: &str) -> Option<Self> {
        let key = std::env::var(key_var).ok().filter(|v| !v.trim().is_empty())?;
        let secret = std::env::var(secret_var).ok().filter(|v| !v.trim().is_empty())?;
        Some(Self::new(key.trim(), secret.trim()))
    }

    pub fn api_secret(&self) -> &str {
        self.api_secret.expose_secret()
    }

    pub fn is_blank(&self) -> bool {
        self.api_key.trim().is_empty() || self.api_secret().trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Abstraction over the brokerage the loop trades through.
///
/// Implementors report account state and accept order submissions. Each call
/// is independent; callers apply their own time bounds.
#[async_trait]
pub trait BrokerageGateway: Send + Sync {
    async fn account(&self) -> Result<AccountSnapshot, GatewayError>;

    async fn positions(&self) -> Result<Vec<Position>, GatewayError>;

    /// Orders that are accepted but not yet filled or cancelled.
    async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderReceipt, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    /// Install credentials for subsequent calls.
    async fn set_credentials(&self, _credentials: std::sync::Arc<Credentials>) {}

    /// Gateway name for logging and identification.
    fn name(&self) -> &str;
}

/// Checks whether a credential pair opens a brokerage session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// `Ok(false)` when the broker rejects the credentials.
    async fn validate(&self, credentials: &Credentials) -> Result<bool, GatewayError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
