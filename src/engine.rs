//! Position engine
//!
//! Facade for the bot framework: seeds the ledger from REST, keeps it fed
//! from the lifecycle stream, and runs the shutdown liquidation on `stop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::notify::{notifier_from_config, Notifier};
use crate::config::{AppConfig, LiquidationConfig};
use crate::coordination::{LiquidationOrchestrator, LiquidationPhase, LiquidationReport};
use crate::domain::Position;
use crate::error::{PosguardError, Result};
use crate::exchange::{build_gateway, Gateway};
use crate::ledger::{LedgerHandle, PositionLedger};
use crate::persistence::{CsvOrderHistory, OrderHistory};
use crate::services::{EventIngestor, IngestStats};

pub struct PositionEngine {
    gateway: Arc<dyn Gateway>,
    ledger: LedgerHandle,
    orchestrator: Arc<LiquidationOrchestrator>,
    notifier: Option<Arc<dyn Notifier>>,
    stop_flag: Arc<AtomicBool>,
    started: AtomicBool,
    ingest_task: Mutex<Option<JoinHandle<IngestStats>>>,
}

impl PositionEngine {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        config: LiquidationConfig,
        history: Option<Arc<dyn OrderHistory>>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        let (ledger, _ledger_task) = PositionLedger::spawn(Position::flat());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let orchestrator = LiquidationOrchestrator::new(
            gateway.clone(),
            ledger.clone(),
            config,
            stop_flag.clone(),
        )
        .with_history(history)
        .with_notifier(notifier.clone());

        Self {
            gateway,
            ledger,
            orchestrator: Arc::new(orchestrator),
            notifier,
            stop_flag,
            started: AtomicBool::new(false),
            ingest_task: Mutex::new(None),
        }
    }

    /// Wire gateway, order history and notifier from configuration.
    pub fn from_config(app_config: &AppConfig) -> Result<Self> {
        let notifier = notifier_from_config(&app_config.notify);
        let gateway = build_gateway(app_config, notifier.clone())?;

        let history: Option<Arc<dyn OrderHistory>> = if app_config.order_history.enabled {
            Some(Arc::new(CsvOrderHistory::open(
                &app_config.order_history.dir,
                &app_config.file_stem(),
            )?))
        } else {
            None
        };

        Ok(Self::new(
            gateway,
            app_config.liquidation.clone(),
            history,
            notifier,
        ))
    }

    /// Seed the ledger from REST and start consuming lifecycle events.
    ///
    /// Venues without a stream run on the REST snapshot alone.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PosguardError::InvalidState(
                "position engine already started".to_string(),
            ));
        }

        let snapshot = self.gateway.fetch_position().await?;
        self.ledger.initialize(snapshot).await?;
        info!(
            "Position engine started for {} at {}",
            self.gateway.instrument(),
            snapshot
        );

        match self.gateway.subscribe_lifecycle_events().await {
            Ok(stream) => {
                let ingestor = EventIngestor::new(self.gateway.clone(), self.ledger.clone())
                    .with_notifier(self.notifier.clone());
                let task = tokio::spawn(ingestor.run(stream));
                *self.ingest_task.lock().await = Some(task);
            }
            Err(PosguardError::Validation(reason)) => {
                warn!("No lifecycle stream: {}", reason);
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Run the shutdown liquidation to completion.
    ///
    /// The sequence runs on its own task, so dropping this future does not
    /// abandon it halfway.
    pub async fn stop(&self) -> Result<LiquidationReport> {
        let orchestrator = self.orchestrator.clone();
        let result = tokio::spawn(async move { orchestrator.run().await })
            .await
            .map_err(|e| PosguardError::Internal(format!("liquidation task failed: {}", e)))?;

        if let Some(task) = self.ingest_task.lock().await.take() {
            task.abort();
        }

        result
    }

    /// Immutable snapshot, safe from any task
    pub fn current_position(&self) -> Position {
        self.ledger.position()
    }

    /// False once the lifecycle stream has ended (or never existed); the
    /// ledger then only moves on REST reconciles.
    pub async fn is_streaming(&self) -> bool {
        self.ingest_task
            .lock()
            .await
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Strategy code polls this to stop placing orders
    pub fn is_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    pub fn ledger(&self) -> LedgerHandle {
        self.ledger.clone()
    }

    pub fn phase(&self) -> watch::Receiver<LiquidationPhase> {
        self.orchestrator.subscribe_phase()
    }

    pub fn gateway(&self) -> Arc<dyn Gateway> {
        self.gateway.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LifecycleEvent, LifecycleUpdate, OrderAck, OrderSide};
    use crate::exchange::{ExchangeKind, MockGateway};
    use crate::persistence::MemoryOrderHistory;
    use futures::StreamExt;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn test_start_stream_and_stop() {
        let mut mock = MockGateway::new();
        mock.expect_instrument()
            .returning(|| "FX_BTC_JPY".to_string());
        mock.expect_kind().returning(|| ExchangeKind::Bitflyer);
        mock.expect_fetch_position()
            .times(1)
            .returning(|| Ok(Position::flat()));
        mock.expect_fetch_open_positions()
            .times(1)
            .returning(|| Ok(vec![Position::long(dec!(0.3))?]));
        mock.expect_subscribe_lifecycle_events().returning(|| {
            let items = vec![Ok(LifecycleUpdate::Event(LifecycleEvent::execution(
                "A",
                OrderSide::Buy,
                dec!(0.3),
            )))];
            Ok(futures::stream::iter(items)
                .chain(futures::stream::pending())
                .boxed())
        });
        mock.expect_cancel_all_orders().times(2).returning(|| Ok(()));
        mock.expect_fetch_open_order_ids().returning(|| Ok(Vec::new()));
        mock.expect_close_position_market()
            .times(1)
            .returning(|_, _| Ok(OrderAck::new("JRF-9")));

        let history = Arc::new(MemoryOrderHistory::new());
        let engine = PositionEngine::new(
            Arc::new(mock),
            LiquidationConfig::default(),
            Some(history.clone()),
            None,
        );

        engine.start().await.unwrap();
        let mut rx = engine.ledger().subscribe();
        while engine.current_position().is_flat() {
            rx.changed().await.unwrap();
        }
        assert_eq!(engine.current_position(), Position::long(dec!(0.3)).unwrap());
        assert!(!engine.is_stopping());
        assert!(engine.is_streaming().await);

        let report = engine.stop().await.unwrap();
        assert!(engine.is_stopping());
        assert_eq!(*engine.phase().borrow(), LiquidationPhase::Closed);
        assert_eq!(report.flattened.len(), 1);
        assert_eq!(report.flattened[0].0.order_id, "JRF-9");
        assert_eq!(history.records().len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut mock = MockGateway::new();
        mock.expect_instrument()
            .returning(|| "BTC_JPY".to_string());
        mock.expect_kind().returning(|| ExchangeKind::Gmo);
        mock.expect_fetch_position()
            .returning(|| Position::short(dec!(1)));
        mock.expect_subscribe_lifecycle_events().returning(|| {
            Err(PosguardError::Validation("no stream".to_string()))
        });

        let engine = PositionEngine::new(Arc::new(mock), LiquidationConfig::default(), None, None);
        engine.start().await.unwrap();
        assert_eq!(engine.current_position(), Position::short(dec!(1)).unwrap());
        assert!(!engine.is_streaming().await);
        assert!(matches!(
            engine.start().await,
            Err(PosguardError::InvalidState(_))
        ));
    }
}
