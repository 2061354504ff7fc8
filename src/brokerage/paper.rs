//! In-memory paper brokerage.
//!
//! Used when `agent.dry_run` is set. Limit buys fill immediately at their
//! limit price; protective sells rest as open orders. Nothing leaves the
//! process.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Mutex;
use tracing::info;

use super::{BrokerageGateway, Credentials, GatewayError, SessionValidator};
use crate::types::{
    AccountSnapshot, OpenOrder, OrderReceipt, OrderRequest, OrderSide, Position,
};

const GATEWAY_NAME: &str = "paper";

#[derive(Debug)]
struct PaperBook {
    cash: Decimal,
    positions: Vec<Position>,
    open_orders: Vec<OpenOrder>,
    next_id: u64,
}

/// Simulated account seeded with a starting cash balance.
#[derive(Debug)]
pub struct PaperBroker {
    book: Mutex<PaperBook>,
}

impl PaperBroker {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                cash: starting_cash,
                positions: Vec::new(),
                open_orders: Vec::new(),
                next_id: 1,
            }),
        }
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut PaperBook) -> T) -> Result<T, GatewayError> {
        let mut book = self
            .book
            .lock()
            .map_err(|_| GatewayError::Unreachable("paper book poisoned".into()))?;
        Ok(f(&mut book))
    }
}

impl PaperBook {
    fn market_value(&self) -> Decimal {
        self.positions
            .iter()
            .map(|p| p.quantity * p.current_price)
            .sum()
    }
}

#[async_trait]
impl BrokerageGateway for PaperBroker {
    async fn account(&self) -> Result<AccountSnapshot, GatewayError> {
        self.with_book(|book| {
            let equity = book.cash + book.market_value();
            AccountSnapshot {
                equity,
                cash: book.cash,
                buying_power: book.cash.max(Decimal::ZERO),
                portfolio_value: equity,
            }
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.with_book(|book| book.positions.clone())
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        self.with_book(|book| book.open_orders.clone())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderReceipt, GatewayError> {
        if order.quantity == 0 {
            return Err(GatewayError::Rejected("qty must be > 0".into()));
        }

        let receipt = self.with_book(|book| {
            let id = format!("paper-{}", book.next_id);
            book.next_id += 1;
            let qty = Decimal::from(order.quantity);

            match order.side {
                OrderSide::Buy => {
                    let price = order.limit_price.unwrap_or(Decimal::ZERO);
                    let cost = price * qty;
                    if cost > book.cash {
                        return Err(GatewayError::Rejected("insufficient buying power".into()));
                    }
                    book.cash -= cost;
                    match book.positions.iter_mut().find(|p| p.symbol == order.symbol) {
                        Some(pos) => {
                            let total = pos.quantity + qty;
                            pos.avg_price = (pos.avg_price * pos.quantity + cost) / total;
                            pos.quantity = total;
                        }
                        None => book.positions.push(Position {
                            symbol: order.symbol.clone(),
                            quantity: qty,
                            avg_price: price,
                            current_price: price,
                        }),
                    }
                    Ok(OrderReceipt {
                        order_id: id,
                        client_order_id: order.client_order_id.clone(),
                        symbol: order.symbol.clone(),
                        status: "filled".into(),
                        submitted_at: Utc::now(),
                    })
                }
                OrderSide::Sell => {
                    book.open_orders.push(OpenOrder {
                        id: id.clone(),
                        symbol: order.symbol.clone(),
                        side: OrderSide::Sell,
                        quantity: qty,
                        order_type: order.order_type,
                        limit_price: order.limit_price,
                        stop_price: order.stop_price,
                        status: "new".into(),
                    });
                    Ok(OrderReceipt {
                        order_id: id,
                        client_order_id: order.client_order_id.clone(),
                        symbol: order.symbol.clone(),
                        status: "new".into(),
                        submitted_at: Utc::now(),
                    })
                }
            }
        })??;

        info!(order = %order, order_id = %receipt.order_id, "[DRY RUN] Paper order accepted");
        Ok(receipt)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.with_book(|book| {
            let before = book.open_orders.len();
            book.open_orders.retain(|o| o.id != order_id);
            if book.open_orders.len() == before {
                Err(GatewayError::Rejected(format!("order {order_id} not found")))
            } else {
                Ok(())
            }
        })?
    }

    fn name(&self) -> &str {
        GATEWAY_NAME
    }
}

#[async_trait]
impl SessionValidator for PaperBroker {
    /// Any non-blank pair opens a paper session.
    async fn validate(&self, credentials: &Credentials) -> Result<bool, GatewayError> {
        Ok(!credentials.is_blank())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_limit_buy_fills_and_debits_cash() {
        let broker = PaperBroker::new(dec!(10000));
        let order = OrderRequest::limit_entry("AAPL", 10, dec!(190.50));
        let receipt = broker.submit_order(&order).await.unwrap();
        assert_eq!(receipt.status, "filled");

        let account = broker.account().await.unwrap();
        assert_eq!(account.cash, dec!(8095.00));
        assert_eq!(account.equity, dec!(10000.00));

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(10));
    }

    #[tokio::test]
    async fn test_buy_over_cash_rejected() {
        let broker = PaperBroker::new(dec!(100));
        let order = OrderRequest::limit_entry("AAPL", 1, dec!(190));
        let err = broker.submit_order(&order).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        assert_eq!(broker.account().await.unwrap().cash, dec!(100));
    }

    #[tokio::test]
    async fn test_trailing_exit_rests_and_cancels() {
        let broker = PaperBroker::new(dec!(10000));
        let exit = OrderRequest::trailing_exit("AAPL", 10, dec!(6));
        let receipt = broker.submit_order(&exit).await.unwrap();

        let orders = broker.open_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_type, OrderType::TrailingStop);
        assert!(!orders[0].is_entry());

        broker.cancel_order(&receipt.order_id).await.unwrap();
        assert!(broker.open_orders().await.unwrap().is_empty());
        assert!(broker.cancel_order(&receipt.order_id).await.is_err());
    }

    #[tokio::test]
    async fn test_paper_session_validation() {
        let broker = PaperBroker::new(dec!(1));
        assert!(broker.validate(&Credentials::new("k", "s")).await.unwrap());
        assert!(!broker.validate(&Credentials::new("", "")).await.unwrap());
    }
}
