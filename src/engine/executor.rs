//! Order executor.
//!
//! Submits orders through the brokerage gateway under a time bound and
//! classifies the result. A submission whose fate is unknown (timeout, or a
//! failure after the request may have left) marks its symbol unresolved;
//! the symbol is not traded again until a later snapshot shows the order or
//! the position, or the exchange-local day the order was sent on is over.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::brokerage::{BrokerageGateway, GatewayError};
use crate::types::{BrokerSnapshot, OrderReceipt, OrderRequest, OrderSide};

// ---------------------------------------------------------------------------
// Submission result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Placed(OrderReceipt),
    /// The broker refused the order, or it never left. Nothing exists.
    Rejected(GatewayError),
    /// The order may or may not exist at the broker.
    Ambiguous(GatewayError),
    /// Credentials no longer accepted.
    Fatal(GatewayError),
}

#[derive(Debug, Clone)]
struct Unresolved {
    client_order_id: String,
    sent_on: NaiveDate,
    sent_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct OrderExecutor {
    gateway: Arc<dyn BrokerageGateway>,
    timeout: Duration,
    unresolved_entries: HashMap<String, Unresolved>,
    unresolved_exits: HashMap<String, Unresolved>,
}

impl OrderExecutor {
    pub fn new(gateway: Arc<dyn BrokerageGateway>, timeout: Duration) -> Self {
        Self {
            gateway,
            timeout,
            unresolved_entries: HashMap::new(),
            unresolved_exits: HashMap::new(),
        }
    }

    /// Submit one order. Never retries.
    pub async fn submit(
        &mut self,
        order: &OrderRequest,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> SubmitOutcome {
        let submission = self.gateway.submit_order(order);
        let result = match tokio::time::timeout(self.timeout, submission).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };

        match result {
            Ok(receipt) => {
                info!(
                    order = %order,
                    order_id = %receipt.order_id,
                    status = %receipt.status,
                    "Order placed"
                );
                SubmitOutcome::Placed(receipt)
            }
            Err(e) if e.is_fatal() => SubmitOutcome::Fatal(e),
            // A response we couldn't read still means the broker answered.
            Err(e) if e.is_ambiguous() || matches!(e, GatewayError::Malformed(_)) => {
                warn!(order = %order, error = %e, "Order outcome unknown, symbol held until reconciled");
                let marker = Unresolved {
                    client_order_id: order.client_order_id.clone(),
                    sent_on: today,
                    sent_at: now,
                };
                match order.side {
                    OrderSide::Buy => self.unresolved_entries.insert(order.symbol.clone(), marker),
                    OrderSide::Sell => self.unresolved_exits.insert(order.symbol.clone(), marker),
                };
                SubmitOutcome::Ambiguous(e)
            }
            Err(e) => {
                warn!(order = %order, error = %e, "Order rejected");
                SubmitOutcome::Rejected(e)
            }
        }
    }

    /// Clear unresolved markers the fresh snapshot accounts for.
    pub fn reconcile(&mut self, snapshot: &BrokerSnapshot, today: NaiveDate) {
        self.unresolved_entries.retain(|symbol, u| {
            if snapshot.is_active(symbol) {
                info!(symbol = %symbol, client_order_id = %u.client_order_id, "Unresolved entry confirmed by broker");
                false
            } else if u.sent_on < today {
                // Day orders don't outlive their session.
                info!(symbol = %symbol, sent_at = %u.sent_at, "Unresolved entry expired with its session");
                false
            } else {
                true
            }
        });

        self.unresolved_exits.retain(|symbol, u| {
            let held = snapshot.positions.iter().any(|p| &p.symbol == symbol);
            if snapshot.has_exit_order(symbol) || !held {
                info!(symbol = %symbol, client_order_id = %u.client_order_id, "Unresolved exit resolved");
                false
            } else {
                true
            }
        });
    }

    pub fn is_unresolved(&self, symbol: &str) -> bool {
        self.unresolved_entries.contains_key(symbol)
    }

    pub fn exit_unresolved(&self, symbol: &str) -> bool {
        self.unresolved_exits.contains_key(symbol)
    }

    pub fn unresolved_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.unresolved_entries.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
