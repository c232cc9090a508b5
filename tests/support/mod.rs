//! Scripted gateway and recording history shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use posguard::domain::{LifecycleUpdate, OrderAck, OrderSide, Position};
use posguard::error::{PosguardError, Result};
use posguard::exchange::{ExchangeKind, Gateway, LifecycleStream};
use posguard::persistence::{AuditRecord, OrderHistory};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Everything the gateway was asked to do, in call order
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    MarketOrder(OrderSide, Decimal),
    ClosePosition(OrderSide, Decimal),
    CancelAll,
    FetchPosition,
    FetchOpenPositions,
    FetchOpenOrders,
    Subscribe,
}

/// Gateway with scripted responses.
///
/// Position fetches pop from a queue and repeat the last value once it is
/// drained. Cancel results pop the same way and default to `Ok(())`.
pub struct ScriptedGateway {
    kind: ExchangeKind,
    instrument: String,
    positions: Mutex<VecDeque<Position>>,
    last_position: Mutex<Position>,
    cancel_results: Mutex<VecDeque<Result<()>>>,
    order_error: Mutex<Option<PosguardError>>,
    fetch_error: Mutex<Option<PosguardError>>,
    open_orders: Mutex<Vec<String>>,
    open_positions: Mutex<Option<Vec<Position>>>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<Result<LifecycleUpdate>>>>,
    calls: Mutex<Vec<(Call, tokio::time::Instant)>>,
    order_seq: AtomicU64,
    fetches: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(initial: Position) -> Self {
        Self {
            kind: ExchangeKind::Bitflyer,
            instrument: "FX_BTC_JPY".to_string(),
            positions: Mutex::new(VecDeque::new()),
            last_position: Mutex::new(initial),
            cancel_results: Mutex::new(VecDeque::new()),
            order_error: Mutex::new(None),
            fetch_error: Mutex::new(None),
            open_orders: Mutex::new(Vec::new()),
            open_positions: Mutex::new(None),
            stream: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            order_seq: AtomicU64::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Positions returned by subsequent `fetch_position` calls
    pub fn then_positions(self, positions: impl IntoIterator<Item = Position>) -> Self {
        self.positions.lock().unwrap().extend(positions);
        self
    }

    pub fn with_cancel_results(self, results: impl IntoIterator<Item = Result<()>>) -> Self {
        self.cancel_results.lock().unwrap().extend(results);
        self
    }

    pub fn with_order_error(self, error: PosguardError) -> Self {
        *self.order_error.lock().unwrap() = Some(error);
        self
    }

    /// Fail every fetch after the first (the startup snapshot)
    pub fn with_fetch_error(self, error: PosguardError) -> Self {
        *self.fetch_error.lock().unwrap() = Some(error);
        self
    }

    pub fn with_open_orders(self, ids: &[&str]) -> Self {
        *self.open_orders.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Report these per-side exposures at shutdown, like a two-way venue
    pub fn with_open_positions(self, positions: Vec<Position>) -> Self {
        *self.open_positions.lock().unwrap() = Some(positions);
        self
    }

    /// Attach a lifecycle stream; the returned sender feeds it
    pub fn with_stream(self) -> (Self, mpsc::UnboundedSender<Result<LifecycleUpdate>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.stream.lock().unwrap() = Some(rx);
        (self, tx)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Call, tokio::time::Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| call(c)).count()
    }

    pub fn cancel_count(&self) -> usize {
        self.count(|c| matches!(c, Call::CancelAll))
    }

    pub fn flatten_orders(&self) -> Vec<(OrderSide, Decimal)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ClosePosition(side, size) | Call::MarketOrder(side, size) => {
                    Some((side, size))
                }
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .unwrap()
            .push((call, tokio::time::Instant::now()));
    }

    fn next_ack(&self) -> OrderAck {
        let n = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        OrderAck::new(format!("JRF-{}", n))
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    fn kind(&self) -> ExchangeKind {
        self.kind
    }

    fn instrument(&self) -> String {
        self.instrument.clone()
    }

    async fn market_order(&self, side: OrderSide, size: Decimal) -> Result<OrderAck> {
        self.record(Call::MarketOrder(side, size));
        if let Some(e) = self.order_error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.next_ack())
    }

    async fn close_position_market(&self, side: OrderSide, size: Decimal) -> Result<OrderAck> {
        self.record(Call::ClosePosition(side, size));
        if let Some(e) = self.order_error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.next_ack())
    }

    async fn cancel_all_orders(&self) -> Result<()> {
        self.record(Call::CancelAll);
        self.cancel_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn fetch_position(&self) -> Result<Position> {
        self.record(Call::FetchPosition);
        if self.fetches.fetch_add(1, Ordering::SeqCst) > 0 {
            if let Some(e) = self.fetch_error.lock().unwrap().take() {
                return Err(e);
            }
        }
        let mut last = self.last_position.lock().unwrap();
        if let Some(next) = self.positions.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(*last)
    }

    async fn fetch_open_positions(&self) -> Result<Vec<Position>> {
        let scripted = self.open_positions.lock().unwrap().clone();
        match scripted {
            Some(positions) => {
                self.record(Call::FetchOpenPositions);
                Ok(positions)
            }
            None => {
                let position = self.fetch_position().await?;
                Ok(if position.is_flat() {
                    Vec::new()
                } else {
                    vec![position]
                })
            }
        }
    }

    async fn fetch_open_order_ids(&self) -> Result<Vec<String>> {
        self.record(Call::FetchOpenOrders);
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn subscribe_lifecycle_events(&self) -> Result<LifecycleStream> {
        self.record(Call::Subscribe);
        match self.stream.lock().unwrap().take() {
            Some(mut rx) => Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()),
            None => Err(PosguardError::Validation(
                "scripted gateway has no stream".to_string(),
            )),
        }
    }
}

/// Order history that keeps records in memory and counts `close` calls
#[derive(Default)]
pub struct RecordingHistory {
    records: Mutex<Vec<AuditRecord>>,
    closes: AtomicUsize,
}

impl RecordingHistory {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl OrderHistory for RecordingHistory {
    fn append(&self, mut record: AuditRecord) -> Result<AuditRecord> {
        let mut records = self.records.lock().unwrap();
        record.sequence = records.len() as u64 + 1;
        records.push(record.clone());
        Ok(record)
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
