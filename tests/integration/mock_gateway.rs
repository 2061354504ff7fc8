//! Mock brokerage for integration testing.
//!
//! Provides a deterministic `BrokerageGateway` whose account, positions and
//! open orders are set from test code. Buys rest as open entry orders so the
//! position cap sees them. Faults can be injected per call type, and every
//! submission attempt is recorded, including ones that fail.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};

use caimeo::brokerage::{BrokerageGateway, GatewayError};
use caimeo::types::*;

#[derive(Default)]
struct Book {
    account: Option<AccountSnapshot>,
    positions: Vec<Position>,
    open_orders: Vec<OpenOrder>,
    next_id: u64,
}

/// A mock brokerage for deterministic testing.
pub struct MockGateway {
    book: Arc<Mutex<Book>>,
    submissions: Arc<Mutex<Vec<OrderRequest>>>,
    /// If set, every submission fails with this error.
    submit_error: Arc<Mutex<Option<GatewayError>>>,
    /// If set, snapshot reads fail with this error.
    snapshot_error: Arc<Mutex<Option<GatewayError>>>,
    /// When a submission fails, still book the order (the request got through).
    book_on_failure: Arc<Mutex<bool>>,
}

impl MockGateway {
    pub fn new(cash: Decimal) -> Self {
        let book = Book {
            account: Some(AccountSnapshot {
                equity: cash,
                cash,
                buying_power: cash,
                portfolio_value: cash,
            }),
            next_id: 1,
            ..Book::default()
        };
        Self {
            book: Arc::new(Mutex::new(book)),
            submissions: Arc::new(Mutex::new(Vec::new())),
            submit_error: Arc::new(Mutex::new(None)),
            snapshot_error: Arc::new(Mutex::new(None)),
            book_on_failure: Arc::new(Mutex::new(false)),
        }
    }

    pub fn set_submit_error(&self, err: GatewayError) {
        *self.submit_error.lock().unwrap() = Some(err);
    }

    pub fn set_snapshot_error(&self, err: GatewayError) {
        *self.snapshot_error.lock().unwrap() = Some(err);
    }

    pub fn clear_errors(&self) {
        *self.submit_error.lock().unwrap() = None;
        *self.snapshot_error.lock().unwrap() = None;
    }

    pub fn set_book_on_failure(&self, on: bool) {
        *self.book_on_failure.lock().unwrap() = on;
    }

    pub fn add_position(&self, symbol: &str, quantity: Decimal, price: Decimal) {
        self.book.lock().unwrap().positions.push(Position {
            symbol: symbol.to_string(),
            quantity,
            avg_price: price,
            current_price: price,
        });
    }

    /// Every submission attempt so far, in order.
    pub fn submissions(&self) -> Vec<OrderRequest> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn entry_submissions(&self) -> Vec<OrderRequest> {
        self.submissions()
            .into_iter()
            .filter(|o| o.side == OrderSide::Buy)
            .collect()
    }

    pub fn open_entry_count(&self) -> usize {
        self.book
            .lock()
            .unwrap()
            .open_orders
            .iter()
            .filter(|o| o.is_entry())
            .count()
    }

    pub fn position_count(&self) -> usize {
        self.book.lock().unwrap().positions.len()
    }

    fn book_order(&self, order: &OrderRequest) -> String {
        let mut book = self.book.lock().unwrap();
        let id = format!("mock-{}", book.next_id);
        book.next_id += 1;
        book.open_orders.push(OpenOrder {
            id: id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: Decimal::from(order.quantity),
            order_type: order.order_type,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            status: "new".into(),
        });
        id
    }

    fn snapshot_fault(&self) -> Result<(), GatewayError> {
        match self.snapshot_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerageGateway for MockGateway {
    async fn account(&self) -> Result<AccountSnapshot, GatewayError> {
        self.snapshot_fault()?;
        self.book
            .lock()
            .unwrap()
            .account
            .clone()
            .ok_or_else(|| GatewayError::Malformed("no account".into()))
    }

    async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.snapshot_fault()?;
        Ok(self.book.lock().unwrap().positions.clone())
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        self.snapshot_fault()?;
        Ok(self.book.lock().unwrap().open_orders.clone())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderReceipt, GatewayError> {
        self.submissions.lock().unwrap().push(order.clone());

        let fault = self.submit_error.lock().unwrap().clone();
        if let Some(e) = fault {
            if *self.book_on_failure.lock().unwrap() {
                self.book_order(order);
            }
            return Err(e);
        }

        let id = self.book_order(order);
        Ok(OrderReceipt {
            order_id: id,
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            status: "new".into(),
            submitted_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut book = self.book.lock().unwrap();
        let before = book.open_orders.len();
        book.open_orders.retain(|o| o.id != order_id);
        if book.open_orders.len() == before {
            return Err(GatewayError::Rejected(format!("order {order_id} not found")));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
