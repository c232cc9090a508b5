//! Shutdown liquidation
//!
//! Cancels working orders twice with a propagation wait after each pass,
//! re-reads the open positions over REST and settles every side that is at
//! least the minimum order quantity with a market order. Net-position venues
//! have at most one side; two-way venues may have both.
//!
//! Phases: Running -> Stopping -> CancelPass1 -> Wait1 -> CancelPass2 ->
//! Wait2 -> Flatten -> Closed. Any gateway error other than "no open orders"
//! aborts the sequence before Closed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::adapters::notify::{notify_best_effort, Notifier};
use crate::config::LiquidationConfig;
use crate::domain::{LiquidationPlan, OrderAck, Position};
use crate::error::{PosguardError, Result};
use crate::exchange::Gateway;
use crate::ledger::LedgerHandle;
use crate::persistence::{AuditRecord, OrderHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidationPhase {
    Running,
    Stopping,
    CancelPass1,
    Wait1,
    CancelPass2,
    Wait2,
    Flatten,
    Closed,
}

impl std::fmt::Display for LiquidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiquidationPhase::Running => write!(f, "running"),
            LiquidationPhase::Stopping => write!(f, "stopping"),
            LiquidationPhase::CancelPass1 => write!(f, "cancel_pass_1"),
            LiquidationPhase::Wait1 => write!(f, "wait_1"),
            LiquidationPhase::CancelPass2 => write!(f, "cancel_pass_2"),
            LiquidationPhase::Wait2 => write!(f, "wait_2"),
            LiquidationPhase::Flatten => write!(f, "flatten"),
            LiquidationPhase::Closed => write!(f, "closed"),
        }
    }
}

/// What a completed liquidation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidationReport {
    pub cancel_calls: u32,
    /// Order ids still open after the second wait (best effort)
    pub residual_open_orders: Vec<String>,
    /// Net of `open_positions`, written to the ledger
    pub fetched_position: Position,
    /// Per-side exposures read before flattening
    pub open_positions: Vec<Position>,
    /// One settle order per side at or above the minimum quantity
    pub flattened: Vec<(OrderAck, LiquidationPlan)>,
    pub audit: Vec<AuditRecord>,
}

pub struct LiquidationOrchestrator {
    gateway: Arc<dyn Gateway>,
    ledger: LedgerHandle,
    history: Option<Arc<dyn OrderHistory>>,
    notifier: Option<Arc<dyn Notifier>>,
    config: LiquidationConfig,
    stop_flag: Arc<AtomicBool>,
    started: AtomicBool,
    cancel_calls: AtomicU32,
    phase_tx: watch::Sender<LiquidationPhase>,
}

impl LiquidationOrchestrator {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        ledger: LedgerHandle,
        config: LiquidationConfig,
        stop_flag: Arc<AtomicBool>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(LiquidationPhase::Running);
        Self {
            gateway,
            ledger,
            history: None,
            notifier: None,
            config,
            stop_flag,
            started: AtomicBool::new(false),
            cancel_calls: AtomicU32::new(0),
            phase_tx,
        }
    }

    pub fn with_history(mut self, history: Option<Arc<dyn OrderHistory>>) -> Self {
        self.history = history;
        self
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn Notifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn phase(&self) -> LiquidationPhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<LiquidationPhase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: LiquidationPhase) {
        self.phase_tx.send_replace(phase);
        info!("Liquidation phase: {}", phase);
    }

    /// Run the shutdown sequence once.
    pub async fn run(&self) -> Result<LiquidationReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PosguardError::InvalidState(
                "liquidation already started".to_string(),
            ));
        }

        let instrument = self.gateway.instrument();
        match self.execute().await {
            Ok(report) => {
                notify_best_effort(self.notifier.as_ref(), &summary(&instrument, &report)).await;
                Ok(report)
            }
            Err(e) => {
                error!(phase = %self.phase(), "Liquidation aborted: {}", e);
                notify_best_effort(
                    self.notifier.as_ref(),
                    &format!(
                        "[{}] {} shutdown liquidation aborted during {}: {}",
                        self.gateway.kind(),
                        instrument,
                        self.phase(),
                        e
                    ),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn execute(&self) -> Result<LiquidationReport> {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.set_phase(LiquidationPhase::Stopping);

        self.set_phase(LiquidationPhase::CancelPass1);
        self.cancel_all().await?;

        self.set_phase(LiquidationPhase::Wait1);
        tokio::time::sleep(self.config.first_wait()).await;

        self.set_phase(LiquidationPhase::CancelPass2);
        self.cancel_all().await?;

        self.set_phase(LiquidationPhase::Wait2);
        tokio::time::sleep(self.config.second_wait()).await;

        let residual_open_orders = self.residual_open_orders().await;
        if !residual_open_orders.is_empty() {
            warn!(
                count = residual_open_orders.len(),
                "Orders still open after cancel passes: {:?}", residual_open_orders
            );
        }

        let open_positions = self.gateway.fetch_open_positions().await?;
        let fetched_position =
            Position::from_signed(open_positions.iter().map(Position::signed).sum());
        match self.ledger.reconcile(fetched_position).await {
            Ok(streamed) if streamed != fetched_position => {
                warn!("Streamed position {} replaced by REST {}", streamed, fetched_position);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not reconcile ledger before flattening: {}", e),
        }

        self.set_phase(LiquidationPhase::Flatten);
        let mut flattened = Vec::new();
        let mut audit = Vec::new();
        if open_positions.is_empty() {
            info!("No open position; nothing to flatten");
        }
        for exposure in &open_positions {
            let Some(plan) =
                LiquidationPlan::for_position(exposure, self.config.minimum_order_quantity)
            else {
                info!(
                    "Residual {} below minimum order quantity {}; left as is",
                    exposure, self.config.minimum_order_quantity
                );
                continue;
            };

            info!("Liquidating open position {}", exposure);
            let ack = self
                .gateway
                .close_position_market(plan.side, plan.size)
                .await?;
            audit.extend(self.record(&ack, &plan));
            flattened.push((ack, plan));
        }

        if let Some(history) = &self.history {
            if let Err(e) = history.close() {
                error!("Failed to close order history: {}", e);
            }
        }

        self.set_phase(LiquidationPhase::Closed);

        Ok(LiquidationReport {
            cancel_calls: self.cancel_calls.load(Ordering::SeqCst),
            residual_open_orders,
            fetched_position,
            open_positions,
            flattened,
            audit,
        })
    }

    async fn cancel_all(&self) -> Result<()> {
        let pass = self.cancel_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.gateway.cancel_all_orders().await {
            Ok(()) => {
                debug!(pass, "Cancel-all accepted");
                Ok(())
            }
            Err(e) if e.is_no_open_orders() => {
                debug!(pass, "Cancel-all: no open orders");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Bounded lookup; timeouts and errors count as "none".
    async fn residual_open_orders(&self) -> Vec<String> {
        match tokio::time::timeout(
            self.config.lookup_timeout(),
            self.gateway.fetch_open_order_ids(),
        )
        .await
        {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                debug!("Open order lookup failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!(
                    "Open order lookup timed out after {:?}",
                    self.config.lookup_timeout()
                );
                Vec::new()
            }
        }
    }

    fn record(&self, ack: &OrderAck, plan: &LiquidationPlan) -> Option<AuditRecord> {
        let history = self.history.as_ref()?;
        match history.append(AuditRecord::liquidation(
            ack.order_id.clone(),
            plan.side,
            plan.size,
        )) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(order = %ack.order_id, "Failed to write liquidation audit record: {}", e);
                None
            }
        }
    }
}

fn summary(instrument: &str, report: &LiquidationReport) -> String {
    if report.flattened.is_empty() {
        return format!(
            "{} bot stopped: position {} left as is",
            instrument, report.fetched_position
        );
    }
    let orders: Vec<String> = report
        .flattened
        .iter()
        .map(|(ack, plan)| format!("{} {} (order {})", plan.side, plan.size, ack.order_id))
        .collect();
    format!(
        "{} bot stopped: liquidated {} with {}",
        instrument,
        report.fetched_position,
        orders.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderSide;
    use crate::exchange::{ExchangeKind, MockGateway};
    use crate::ledger::PositionLedger;
    use crate::persistence::MemoryOrderHistory;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use rust_decimal_macros::dec;

    fn base_mock() -> MockGateway {
        let mut mock = MockGateway::new();
        mock.expect_instrument()
            .returning(|| "FX_BTC_JPY".to_string());
        mock.expect_kind().returning(|| ExchangeKind::Bitflyer);
        mock
    }

    fn orchestrator(
        mock: MockGateway,
        ledger: LedgerHandle,
        history: Arc<MemoryOrderHistory>,
    ) -> LiquidationOrchestrator {
        LiquidationOrchestrator::new(
            Arc::new(mock),
            ledger,
            LiquidationConfig::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .with_history(Some(history))
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_run_in_order() {
        let mut mock = base_mock();
        let mut seq = Sequence::new();
        mock.expect_cancel_all_orders()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_cancel_all_orders()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(PosguardError::NoOpenOrders));
        mock.expect_fetch_open_order_ids()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Vec::new()));
        mock.expect_fetch_open_positions()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![Position::long(dec!(0.5))?]));
        mock.expect_close_position_market()
            .with(eq(OrderSide::Sell), eq(dec!(0.5)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(OrderAck::new("JRF-1")));

        let (ledger, _task) = PositionLedger::spawn(Position::long(dec!(0.7)).unwrap());
        let history = Arc::new(MemoryOrderHistory::new());
        let orchestrator = orchestrator(mock, ledger.clone(), history.clone());

        let report = orchestrator.run().await.unwrap();

        assert_eq!(orchestrator.phase(), LiquidationPhase::Closed);
        assert_eq!(report.cancel_calls, 2);
        assert_eq!(report.fetched_position, Position::long(dec!(0.5)).unwrap());
        assert_eq!(ledger.position(), Position::long(dec!(0.5)).unwrap());

        let records = history.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "Liquidation");
        assert_eq!(records[0].side, OrderSide::Sell);
        assert_eq!(records[0].size, dec!(0.5));
        assert!(history.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedged_book_settles_each_side() {
        let mut mock = base_mock();
        mock.expect_cancel_all_orders().times(2).returning(|| Ok(()));
        mock.expect_fetch_open_order_ids().returning(|| Ok(Vec::new()));
        mock.expect_fetch_open_positions()
            .returning(|| Ok(vec![Position::long(dec!(1.5))?, Position::short(dec!(0.4))?]));
        mock.expect_close_position_market()
            .with(eq(OrderSide::Sell), eq(dec!(1.5)))
            .times(1)
            .returning(|_, _| Ok(OrderAck::new("G-1")));
        mock.expect_close_position_market()
            .with(eq(OrderSide::Buy), eq(dec!(0.4)))
            .times(1)
            .returning(|_, _| Ok(OrderAck::new("G-2")));

        let (ledger, _task) = PositionLedger::spawn(Position::flat());
        let history = Arc::new(MemoryOrderHistory::new());
        let report = orchestrator(mock, ledger.clone(), history.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.fetched_position, Position::long(dec!(1.1)).unwrap());
        assert_eq!(ledger.position(), Position::long(dec!(1.1)).unwrap());
        assert_eq!(report.flattened.len(), 2);

        let records = history.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].order_id, "G-1");
        assert_eq!(records[1].side, OrderSide::Buy);
        assert_eq!(records[1].size, dec!(0.4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_minimum_is_left_alone() {
        let mut mock = base_mock();
        mock.expect_cancel_all_orders().times(2).returning(|| Ok(()));
        mock.expect_fetch_open_order_ids()
            .returning(|| Ok(vec!["still-open".to_string()]));
        mock.expect_fetch_open_positions()
            .returning(|| Ok(vec![Position::short(dec!(0.005))?]));
        mock.expect_close_position_market().never();

        let (ledger, _task) = PositionLedger::spawn(Position::flat());
        let history = Arc::new(MemoryOrderHistory::new());
        let report = orchestrator(mock, ledger, history.clone())
            .run()
            .await
            .unwrap();

        assert!(report.flattened.is_empty());
        assert_eq!(report.residual_open_orders, vec!["still-open".to_string()]);
        assert!(history.records().is_empty());
        assert!(history.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_failure_aborts() {
        let mut mock = base_mock();
        mock.expect_cancel_all_orders()
            .times(1)
            .returning(|| Err(PosguardError::rejection(500, "Internal Server Error")));
        mock.expect_fetch_open_positions().never();
        mock.expect_close_position_market().never();

        let (ledger, _task) = PositionLedger::spawn(Position::long(dec!(1)).unwrap());
        let history = Arc::new(MemoryOrderHistory::new());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let orchestrator = LiquidationOrchestrator::new(
            Arc::new(mock),
            ledger,
            LiquidationConfig::default(),
            stop_flag.clone(),
        )
        .with_history(Some(history.clone()));

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, PosguardError::VenueRejection { status: 500, .. }));
        assert!(stop_flag.load(Ordering::SeqCst));
        assert_eq!(orchestrator.phase(), LiquidationPhase::CancelPass1);
        assert!(history.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_counts_as_empty() {
        let mut mock = base_mock();
        mock.expect_cancel_all_orders().times(2).returning(|| Ok(()));
        mock.expect_fetch_open_order_ids()
            .returning(|| Err(PosguardError::Timeout("lookup".to_string())));
        mock.expect_fetch_open_positions().returning(|| Ok(Vec::new()));

        let (ledger, _task) = PositionLedger::spawn(Position::flat());
        let report = orchestrator(mock, ledger, Arc::new(MemoryOrderHistory::new()))
            .run()
            .await
            .unwrap();
        assert!(report.residual_open_orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_rejected() {
        let mut mock = base_mock();
        mock.expect_cancel_all_orders().times(2).returning(|| Ok(()));
        mock.expect_fetch_open_order_ids().returning(|| Ok(Vec::new()));
        mock.expect_fetch_open_positions().returning(|| Ok(Vec::new()));

        let (ledger, _task) = PositionLedger::spawn(Position::flat());
        let orchestrator = orchestrator(mock, ledger, Arc::new(MemoryOrderHistory::new()));

        orchestrator.run().await.unwrap();
        assert!(matches!(
            orchestrator.run().await,
            Err(PosguardError::InvalidState(_))
        ));
    }
}
