//! Alpaca trading API integration.
//!
//! REST v2 against either the paper or live endpoint.
//!
//! API docs: https://docs.alpaca.markets/reference
//! Auth: `APCA-API-KEY-ID` / `APCA-API-SECRET-KEY` headers on every call.
//! Numeric fields arrive as JSON strings ("100000.00").

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{BrokerageGateway, Credentials, GatewayError, SessionValidator};
use crate::types::{
    AccountSnapshot, OpenOrder, OrderReceipt, OrderRequest, OrderSide, OrderType, Position,
    TimeInForce,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const PAPER_BASE_URL: &str = "https://paper-api.alpaca.markets";
const GATEWAY_NAME: &str = "alpaca";

// ---------------------------------------------------------------------------
// API response types (Alpaca JSON → Rust)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AlpacaAccount {
    equity: String,
    cash: String,
    buying_power: String,
    #[serde(default)]
    portfolio_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    #[serde(default)]
    current_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrder {
    id: String,
    #[serde(default)]
    client_order_id: String,
    symbol: String,
    side: String,
    #[serde(default)]
    qty: Option<String>,
    #[serde(rename = "type", alias = "order_type")]
    order_type: String,
    #[serde(default)]
    limit_price: Option<String>,
    #[serde(default)]
    stop_price: Option<String>,
    status: String,
    #[serde(default)]
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct AlpacaOrderBody<'a> {
    symbol: &'a str,
    qty: String,
    side: &'static str,
    #[serde(rename = "type")]
    order_type: &'static str,
    time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trail_percent: Option<String>,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct AlpacaErrorBody {
    #[serde(default)]
    message: String,
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, GatewayError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| GatewayError::Malformed(format!("{field}={raw:?}: {e}")))
}

fn parse_opt_decimal(field: &str, raw: Option<&str>) -> Result<Option<Decimal>, GatewayError> {
    raw.map(|r| parse_decimal(field, r)).transpose()
}

impl AlpacaAccount {
    fn into_snapshot(self) -> Result<AccountSnapshot, GatewayError> {
        let equity = parse_decimal("equity", &self.equity)?;
        Ok(AccountSnapshot {
            equity,
            cash: parse_decimal("cash", &self.cash)?,
            buying_power: parse_decimal("buying_power", &self.buying_power)?,
            portfolio_value: parse_opt_decimal("portfolio_value", self.portfolio_value.as_deref())?
                .unwrap_or(equity),
        })
    }
}

impl AlpacaPosition {
    fn into_position(self) -> Result<Position, GatewayError> {
        let avg_price = parse_decimal("avg_entry_price", &self.avg_entry_price)?;
        Ok(Position {
            quantity: parse_decimal("qty", &self.qty)?,
            current_price: parse_opt_decimal("current_price", self.current_price.as_deref())?
                .unwrap_or(avg_price),
            avg_price,
            symbol: self.symbol,
        })
    }
}

impl AlpacaOrder {
    fn into_open_order(self) -> Result<OpenOrder, GatewayError> {
        Ok(OpenOrder {
            side: parse_side(&self.side)?,
            quantity: parse_opt_decimal("qty", self.qty.as_deref())?.unwrap_or(Decimal::ZERO),
            order_type: parse_order_type(&self.order_type)?,
            limit_price: parse_opt_decimal("limit_price", self.limit_price.as_deref())?,
            stop_price: parse_opt_decimal("stop_price", self.stop_price.as_deref())?,
            id: self.id,
            symbol: self.symbol,
            status: self.status,
        })
    }

    fn into_receipt(self) -> OrderReceipt {
        OrderReceipt {
            order_id: self.id,
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            status: self.status,
            submitted_at: self.submitted_at.unwrap_or_else(Utc::now),
        }
    }
}

fn parse_side(raw: &str) -> Result<OrderSide, GatewayError> {
    match raw {
        "buy" => Ok(OrderSide::Buy),
        "sell" => Ok(OrderSide::Sell),
        other => Err(GatewayError::Malformed(format!("side={other:?}"))),
    }
}

fn parse_order_type(raw: &str) -> Result<OrderType, GatewayError> {
    match raw {
        "market" => Ok(OrderType::Market),
        "limit" => Ok(OrderType::Limit),
        "stop" => Ok(OrderType::Stop),
        "stop_limit" => Ok(OrderType::StopLimit),
        "trailing_stop" => Ok(OrderType::TrailingStop),
        other => Err(GatewayError::Malformed(format!("type={other:?}"))),
    }
}

fn order_body(order: &OrderRequest) -> AlpacaOrderBody<'_> {
    AlpacaOrderBody {
        symbol: &order.symbol,
        qty: order.quantity.to_string(),
        side: match order.side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        },
        order_type: match order.order_type {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TrailingStop => "trailing_stop",
        },
        time_in_force: match order.time_in_force {
            TimeInForce::Day => "day",
            TimeInForce::Gtc => "gtc",
        },
        limit_price: order.limit_price.map(|p| p.to_string()),
        stop_price: order.stop_price.map(|p| p.to_string()),
        trail_percent: order.trail_percent.map(|p| p.to_string()),
        client_order_id: &order.client_order_id,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Alpaca REST client. Credentials are installed after construction, either
/// from the environment at startup or through the control surface.
pub struct AlpacaClient {
    http: Client,
    base_url: String,
    credentials: RwLock<Option<Arc<Credentials>>>,
}

impl AlpacaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("CAIMEO/0.1.0 (equity-entry-loop)")
            .build()
            .context("Failed to build HTTP client for Alpaca")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // -- Internal helpers ------------------------------------------------

    fn authed(builder: RequestBuilder, creds: &Credentials) -> RequestBuilder {
        builder
            .header("APCA-API-KEY-ID", &creds.api_key)
            .header("APCA-API-SECRET-KEY", creds.api_secret())
    }

    async fn current_credentials(&self) -> Result<Arc<Credentials>, GatewayError> {
        self.credentials
            .read()
            .await
            .clone()
            .ok_or(GatewayError::Unauthorized)
    }

    /// Send a request and map transport and status failures.
    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, GatewayError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(&e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let creds = self.current_credentials().await?;
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "Alpaca GET");
        let resp = self.send(Self::authed(self.http.get(&url), &creds)).await?;
        resp.json::<T>()
            .await
            .map_err(|e| GatewayError::Malformed(format!("{path}: {e}")))
    }
}

fn classify_status(status: StatusCode, body: String) -> GatewayError {
    let message = serde_json::from_str::<AlpacaErrorBody>(&body)
        .map(|b| b.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or(body);

    match status {
        StatusCode::UNAUTHORIZED => GatewayError::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => GatewayError::Timeout,
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            GatewayError::Unavailable {
                status: s.as_u16(),
                body: message,
            }
        }
        _ => GatewayError::Rejected(message),
    }
}

// ---------------------------------------------------------------------------
// BrokerageGateway trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl BrokerageGateway for AlpacaClient {
    async fn account(&self) -> Result<AccountSnapshot, GatewayError> {
        let raw: AlpacaAccount = self.get_json("/v2/account").await?;
        raw.into_snapshot()
    }

    async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        let raw: Vec<AlpacaPosition> = self.get_json("/v2/positions").await?;
        raw.into_iter().map(AlpacaPosition::into_position).collect()
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let raw: Vec<AlpacaOrder> = self.get_json("/v2/orders?status=open&limit=500").await?;
        raw.into_iter().map(AlpacaOrder::into_open_order).collect()
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderReceipt, GatewayError> {
        let creds = self.current_credentials().await?;
        let url = format!("{}/v2/orders", self.base_url);
        let body = order_body(order);

        info!(order = %order, client_order_id = %order.client_order_id, "Submitting order to Alpaca");

        let resp = self
            .send(Self::authed(self.http.post(&url), &creds).json(&body))
            .await?;
        let raw: AlpacaOrder = resp.json().await.map_err(|e| {
            // Accepted but unreadable: the order exists, we just can't see it.
            warn!(error = %e, "Alpaca order response unreadable");
            GatewayError::Unavailable {
                status: 200,
                body: e.to_string(),
            }
        })?;
        Ok(raw.into_receipt())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let creds = self.current_credentials().await?;
        let url = format!("{}/v2/orders/{}", self.base_url, urlencoding::encode(order_id));
        self.send(Self::authed(self.http.delete(&url), &creds)).await?;
        info!(order_id = %order_id, "Order cancelled");
        Ok(())
    }

    async fn set_credentials(&self, credentials: Arc<Credentials>) {
        *self.credentials.write().await = Some(credentials);
    }

    fn name(&self) -> &str {
        GATEWAY_NAME
    }
}

#[async_trait]
impl SessionValidator for AlpacaClient {
    /// `GET /v2/account` with the candidate credentials.
    async fn validate(&self, credentials: &Credentials) -> Result<bool, GatewayError> {
        let url = format!("{}/v2/account", self.base_url);
        match self.send(Self::authed(self.http.get(&url), credentials)).await {
            Ok(_) => Ok(true),
            Err(GatewayError::Unauthorized) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
