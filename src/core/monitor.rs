//! The periodic driver: one guarded pass per market per cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{MonitorConfig, NotificationConfig};
use crate::core::{AlertRecord, LookbackWindow, Market, RiskLevel};
use crate::db::SharedDatabase;
use crate::error::{ChainSubmitError, PassError};
use crate::notifications::Notifier;
use crate::rpc::EventSource;
use crate::signals::SignalEngine;
use crate::sink::RiskSink;
use crate::tags::AddressBook;

/// Where a pass is. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassState {
    Fetching,
    Aggregating,
    Scoring,
    Persisting,
    AlertCheck,
    Idle,
}

/// What one successful pass wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub timestamp: DateTime<Utc>,
    pub total_score: f64,
    pub risk_level: RiskLevel,
    pub previous_level: Option<RiskLevel>,
    /// Row id of the alert written this pass.
    pub alert_id: Option<i64>,
    pub new_swaps: usize,
}

#[derive(Debug)]
pub struct MarketOutcome {
    pub market_id: String,
    pub label: String,
    pub result: Result<PassSummary, PassError>,
}

/// Per-market results of one cycle, in configuration order.
#[derive(Debug)]
pub struct CycleReport {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub outcomes: Vec<MarketOutcome>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn outcome(&self, market_id: &str) -> Option<&MarketOutcome> {
        self.outcomes.iter().find(|o| o.market_id == market_id)
    }
}

pub struct Monitor {
    markets: Vec<Market>,
    source: Arc<dyn EventSource>,
    db: SharedDatabase,
    engine: SignalEngine,
    book: AddressBook,
    sink: Option<Arc<dyn RiskSink>>,
    submit_timeout: Duration,
    notifier: Notifier,
    /// At most one pass per market at a time.
    guards: HashMap<String, Arc<Mutex<()>>>,
    permits: Semaphore,
    lookback_blocks: u64,
    persist_swaps: bool,
    interval: Duration,
    stop_timeout: Duration,
}

impl Monitor {
    /// Only `dex_pool` markets get passes; the rest feed the address book.
    pub fn new(
        markets: Vec<Market>,
        source: Arc<dyn EventSource>,
        db: SharedDatabase,
        engine: SignalEngine,
        book: AddressBook,
        config: &MonitorConfig,
        lookback_blocks: u64,
    ) -> Self {
        let markets: Vec<Market> = markets.into_iter().filter(Market::is_monitored).collect();
        let guards = markets
            .iter()
            .map(|m| (m.id.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            markets,
            source,
            db,
            engine,
            book,
            sink: None,
            submit_timeout: Duration::ZERO,
            notifier: Notifier::new(&NotificationConfig::default()),
            guards,
            permits: Semaphore::new(config.max_concurrency.max(1)),
            lookback_blocks,
            persist_swaps: config.persist_swaps,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }

    /// A submission that outlives `submit_timeout` is dropped so the pass,
    /// and with it the cycle, can finish.
    pub fn with_sink(mut self, sink: Arc<dyn RiskSink>, submit_timeout: Duration) -> Self {
        self.sink = Some(sink);
        self.submit_timeout = submit_timeout;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run cycles every `interval` until `shutdown` flips to true or its
    /// sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Monitor started: {} markets, every {}s",
            self.markets.len(),
            self.interval.as_secs()
        );

        let mut cycles: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let report = self.run_cycle(shutdown.clone()).await;
            cycles += 1;
            info!(
                "Cycle {cycles} done in {}ms: {} ok, {} failed",
                (report.finished - report.started).num_milliseconds(),
                report.succeeded(),
                report.failed()
            );
        }

        info!("Monitor stopped after {cycles} cycles");
    }

    /// A single cycle with no way to stop it early.
    pub async fn run_once(self: &Arc<Self>) -> CycleReport {
        let (_keep_open, stop) = watch::channel(false);
        self.run_cycle(stop).await
    }

    /// Spawn every pass, then wait for all of them. Once `stop` fires the
    /// remaining passes get `stop_timeout` to finish before they are aborted.
    pub async fn run_cycle(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> CycleReport {
        let started = Utc::now();
        let mut tasks = JoinSet::new();
        for market in &self.markets {
            let monitor = Arc::clone(self);
            let market = market.clone();
            tasks.spawn(async move {
                let result = monitor.process_market(&market).await;
                (market.id, result)
            });
        }

        let mut results: HashMap<String, Result<PassSummary, PassError>> = HashMap::new();
        let mut stopping = *stop.borrow();
        while !stopping {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((id, result))) => {
                        results.insert(id, result);
                    }
                    Some(Err(e)) => error!("Market pass panicked: {e}"),
                    None => break,
                },
                changed = stop.changed() => {
                    stopping = changed.is_err() || *stop.borrow();
                }
            }
        }

        if !tasks.is_empty() {
            info!(
                "Stop requested, waiting up to {}s for {} passes",
                self.stop_timeout.as_secs(),
                tasks.len()
            );
            let drain = async {
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((id, result)) => {
                            results.insert(id, result);
                        }
                        Err(e) => error!("Market pass panicked: {e}"),
                    }
                }
            };
            if tokio::time::timeout(self.stop_timeout, drain).await.is_err() {
                warn!("Abandoning {} passes still in flight", tasks.len());
            }
            tasks.shutdown().await;
        }

        let outcomes = self
            .markets
            .iter()
            .map(|m| MarketOutcome {
                market_id: m.id.clone(),
                label: m.label.clone(),
                result: results.remove(&m.id).unwrap_or(Err(PassError::Abandoned)),
            })
            .collect();

        CycleReport {
            started,
            finished: Utc::now(),
            outcomes,
        }
    }

    /// One guarded pass. Failures are logged here and never escape to other
    /// markets.
    pub async fn process_market(&self, market: &Market) -> Result<PassSummary, PassError> {
        let result = self.guarded_pass(market).await;
        match &result {
            Ok(summary) => debug!(
                market = %market.label,
                score = summary.total_score,
                level = summary.risk_level.as_u8(),
                "Pass complete"
            ),
            Err(PassError::Fetch(e)) if e.is_transient() => {
                warn!(market = %market.label, "Pass skipped, will retry next cycle: {e}")
            }
            Err(e) => error!(market = %market.label, "Pass failed: {e}"),
        }
        result
    }

    async fn guarded_pass(&self, market: &Market) -> Result<PassSummary, PassError> {
        let guard = self
            .guards
            .get(&market.id)
            .ok_or_else(|| PassError::UnknownMarket(market.id.clone()))?;
        let _permit = self.permits.acquire().await.map_err(|_| PassError::Abandoned)?;
        let _held = guard.lock().await;

        let market_id = market.id.clone();
        let previous = self.db.blocking(move |db| db.latest(&market_id)).await?;
        let timestamp = next_timestamp(previous.as_ref().map(|s| s.timestamp));

        transition(market, PassState::Fetching);
        let head = self.source.head_block().await?;
        let window = LookbackWindow::ending_at(head, self.lookback_blocks);
        let events = self
            .source
            .fetch_events(market, window.from_block, window.to_block)
            .await?;

        transition(market, PassState::Aggregating);
        let (signals, factors) = self.engine.aggregate(market, &events, &window, &self.book)?;

        transition(market, PassState::Scoring);
        let snapshot = self.engine.snapshot(&market.id, signals, factors, timestamp);

        transition(market, PassState::Persisting);
        let previous_level = previous.map(|s| s.risk_level);
        let alert = AlertRecord::for_transition(previous_level, &snapshot);
        let alert_id = {
            let (snapshot, alert) = (snapshot.clone(), alert.clone());
            self.db
                .blocking(move |db| db.append_cycle(&snapshot, alert.as_ref()))
                .await?
        };
        let new_swaps = if self.persist_swaps && !events.swaps.is_empty() {
            let swaps = events.swaps;
            match self.db.blocking(move |db| db.append_swaps(&swaps)).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(market = %market.label, "Failed to store swap events: {e}");
                    0
                }
            }
        } else {
            0
        };

        transition(market, PassState::AlertCheck);
        if let Some(alert) = &alert {
            info!(
                market = %market.label,
                "{} {} → {} (score {:.1})",
                alert.new_level.emoji(),
                alert.previous_level.as_str(),
                alert.new_level.as_str(),
                snapshot.total_score
            );
            self.notifier.notify(market, alert);
        }
        if alert.is_some() || previous_level.is_none() {
            self.push_level(market, snapshot.risk_level).await;
        }
        transition(market, PassState::Idle);

        Ok(PassSummary {
            timestamp,
            total_score: snapshot.total_score,
            risk_level: snapshot.risk_level,
            previous_level,
            alert_id,
            new_swaps,
        })
    }

    async fn push_level(&self, market: &Market, level: RiskLevel) {
        let Some(sink) = &self.sink else {
            return;
        };
        let result = tokio::time::timeout(self.submit_timeout, sink.update_risk(market, level))
            .await
            .unwrap_or_else(|_| Err(ChainSubmitError::Timeout(self.submit_timeout.as_secs())));
        if let Err(e) = result {
            warn!(market = %market.label, "On-chain update failed: {e}");
        }
    }
}

fn transition(market: &Market, state: PassState) {
    debug!(market = %market.label, state = ?state, "Pass state");
}

/// Now, or 1ms past the previous snapshot if the clock hasn't moved on.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now.timestamp_millis() <= prev.timestamp_millis() => {
            prev + chrono::Duration::milliseconds(1)
        }
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalConfig;
    use crate::core::{MarketEvents, MarketType, SwapEvent};
    use crate::error::FetchError;
    use crate::signals::aggregators::SignalParams;
    use crate::signals::score::ScoreWeights;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn open_test_db() -> SharedDatabase {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "chainmonitor_monitor_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    fn pool(id: &str) -> Market {
        Market {
            id: id.into(),
            label: format!("UNISWAP_{id}_WETH"),
            market_type: MarketType::DexPool,
            address: "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc".into(),
            description: None,
            base_token: None,
            base_token_index: 0,
            baseline_volume: None,
        }
    }

    /// 5e22 base sold by one whale: DEX 75, whale 85 → 59.75, level 2.
    fn whale_dump(market_id: &str) -> Vec<SwapEvent> {
        vec![SwapEvent {
            market_id: market_id.into(),
            block_number: 990,
            log_index: 0,
            tx_hash: "0xdump".into(),
            timestamp: Utc::now(),
            sender: "0x1111111111111111111111111111111111111111".into(),
            recipient: "0x1111111111111111111111111111111111111111".into(),
            amount_in: 5 * 10u128.pow(22),
            amount_out: 1,
            token_in_is_base: true,
        }]
    }

    #[derive(Default)]
    struct FakeSource {
        swaps: std::sync::Mutex<HashMap<String, Vec<SwapEvent>>>,
        failing: HashSet<String>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeSource {
        fn set_swaps(&self, market_id: &str, swaps: Vec<SwapEvent>) {
            self.swaps.lock().unwrap().insert(market_id.into(), swaps);
        }
    }

    #[async_trait]
    impl EventSource for FakeSource {
        async fn head_block(&self) -> Result<u64, FetchError> {
            Ok(1000)
        }

        async fn fetch_events(
            &self,
            market: &Market,
            _from_block: u64,
            _to_block: u64,
        ) -> Result<MarketEvents, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&market.id) {
                return Err(FetchError::Permanent(format!("{} is gone", market.id)));
            }
            let swaps = self
                .swaps
                .lock()
                .unwrap()
                .get(&market.id)
                .cloned()
                .unwrap_or_default();
            Ok(MarketEvents {
                swaps,
                ..MarketEvents::default()
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: std::sync::Mutex<Vec<(String, RiskLevel)>>,
        fail: bool,
    }

    #[async_trait]
    impl RiskSink for RecordingSink {
        async fn update_risk(&self, market: &Market, level: RiskLevel) -> Result<String, ChainSubmitError> {
            self.calls.lock().unwrap().push((market.label.clone(), level));
            if self.fail {
                return Err(ChainSubmitError::Contract("reverted".into()));
            }
            Ok("0xabc".into())
        }
    }

    struct HangingSink;

    #[async_trait]
    impl RiskSink for HangingSink {
        async fn update_risk(&self, _market: &Market, _level: RiskLevel) -> Result<String, ChainSubmitError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("0xnever".into())
        }
    }

    const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

    fn monitor(markets: Vec<Market>, source: Arc<FakeSource>, db: SharedDatabase, config: MonitorConfig) -> Monitor {
        let signals = SignalConfig::default();
        let engine = SignalEngine::new(
            ScoreWeights::new(0.40, 0.35, 0.30, 0.05).unwrap(),
            SignalParams::from(&signals),
        );
        let book = AddressBook::from_markets(&markets);
        Monitor::new(markets, source, db, engine, book, &config, 100)
    }

    #[tokio::test]
    async fn failing_market_does_not_block_others() {
        let source = Arc::new(FakeSource {
            failing: HashSet::from(["a".to_string()]),
            ..FakeSource::default()
        });
        let db = open_test_db();
        let monitor = Arc::new(monitor(
            vec![pool("a"), pool("b")],
            source,
            db.clone(),
            MonitorConfig::default(),
        ));

        let report = monitor.run_once().await;
        assert_eq!(report.succeeded(), 1);
        assert!(matches!(
            report.outcome("a").unwrap().result,
            Err(PassError::Fetch(FetchError::Permanent(_)))
        ));
        assert!(db.latest("a").unwrap().is_none());
        assert!(db.latest("b").unwrap().is_some());
    }

    #[tokio::test]
    async fn non_pool_markets_are_not_passed() {
        let mut whale = pool("w");
        whale.market_type = MarketType::Whale;
        let monitor = Arc::new(monitor(
            vec![pool("a"), whale],
            Arc::new(FakeSource::default()),
            open_test_db(),
            MonitorConfig::default(),
        ));
        let report = monitor.run_once().await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].market_id, "a");
    }

    #[tokio::test]
    async fn overlapping_passes_serialize() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_millis(30),
            ..FakeSource::default()
        });
        let db = open_test_db();
        let config = MonitorConfig {
            max_concurrency: 4,
            ..MonitorConfig::default()
        };
        let monitor = Arc::new(monitor(vec![pool("a")], source.clone(), db.clone(), config));

        let (first, second) = tokio::join!(monitor.run_once(), monitor.run_once());
        assert_eq!(first.succeeded() + second.succeeded(), 2);
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);

        let history = db.history("a", None).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp < history[1].timestamp);
    }

    #[tokio::test]
    async fn level_change_writes_one_alert() {
        let source = Arc::new(FakeSource::default());
        let db = open_test_db();
        let sink = Arc::new(RecordingSink::default());
        let monitor = Arc::new(
            monitor(vec![pool("a")], source.clone(), db.clone(), MonitorConfig::default())
                .with_sink(sink.clone(), SUBMIT_TIMEOUT),
        );

        // first observation: no alert, sink initialised
        let report = monitor.run_once().await;
        let summary = report.outcome("a").unwrap().result.as_ref().unwrap();
        assert_eq!(summary.risk_level, RiskLevel::Low);
        assert_eq!(summary.previous_level, None);
        assert!(summary.alert_id.is_none());
        assert_eq!(sink.calls.lock().unwrap().len(), 1);

        source.set_swaps("a", whale_dump("a"));
        let report = monitor.run_once().await;
        let summary = report.outcome("a").unwrap().result.as_ref().unwrap();
        assert_eq!(summary.risk_level, RiskLevel::High);
        assert!(summary.alert_id.is_some());
        assert_eq!(summary.new_swaps, 1);

        let alerts = db.alerts(None, 10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].previous_level, RiskLevel::Low);
        assert_eq!(alerts[0].new_level, RiskLevel::High);
        assert_eq!(
            sink.calls.lock().unwrap().last().cloned(),
            Some(("UNISWAP_a_WETH".to_string(), RiskLevel::High))
        );
    }

    #[tokio::test]
    async fn unchanged_level_writes_no_alert() {
        let source = Arc::new(FakeSource::default());
        let db = open_test_db();
        let sink = Arc::new(RecordingSink::default());
        let monitor = Arc::new(
            monitor(vec![pool("a")], source, db.clone(), MonitorConfig::default())
                .with_sink(sink.clone(), SUBMIT_TIMEOUT),
        );

        monitor.run_once().await;
        monitor.run_once().await;
        monitor.run_once().await;

        assert_eq!(db.history("a", None).unwrap().len(), 3);
        assert!(db.alerts(None, 10).unwrap().is_empty());
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_is_not_fatal() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let db = open_test_db();
        let monitor = Arc::new(
            monitor(vec![pool("a")], Arc::new(FakeSource::default()), db.clone(), MonitorConfig::default())
                .with_sink(sink, SUBMIT_TIMEOUT),
        );
        let report = monitor.run_once().await;
        assert_eq!(report.succeeded(), 1);
        assert!(db.latest("a").unwrap().is_some());
    }

    #[tokio::test]
    async fn hung_submission_does_not_stall_the_cycle() {
        let db = open_test_db();
        let monitor = Arc::new(
            monitor(
                vec![pool("a"), pool("b")],
                Arc::new(FakeSource::default()),
                db.clone(),
                MonitorConfig::default(),
            )
            .with_sink(Arc::new(HangingSink), Duration::from_millis(50)),
        );

        let report = tokio::time::timeout(Duration::from_secs(3), monitor.run_once())
            .await
            .expect("cycle should finish despite the hung sink");
        assert_eq!(report.succeeded(), 2);
        assert!(db.latest("a").unwrap().is_some());
        assert!(db.latest("b").unwrap().is_some());

        // the guard was released, so the next cycle runs too
        let report = tokio::time::timeout(Duration::from_secs(3), monitor.run_once())
            .await
            .expect("second cycle should finish");
        assert_eq!(report.succeeded(), 2);
    }

    #[tokio::test]
    async fn stop_abandons_slow_passes() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_secs(30),
            ..FakeSource::default()
        });
        let db = open_test_db();
        let config = MonitorConfig {
            stop_timeout_secs: 0,
            ..MonitorConfig::default()
        };
        let monitor = Arc::new(monitor(vec![pool("a"), pool("b")], source, db.clone(), config));

        let (stop_tx, stop_rx) = watch::channel(false);
        let cycle = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.run_cycle(stop_rx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), cycle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.failed(), 2);
        assert!(report
            .outcomes
            .iter()
            .all(|o| matches!(o.result, Err(PassError::Abandoned))));
        assert!(db.latest_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_loop_exits_on_shutdown() {
        let db = open_test_db();
        let monitor = Arc::new(monitor(
            vec![pool("a")],
            Arc::new(FakeSource::default()),
            db.clone(),
            MonitorConfig::default(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&monitor).run(stop_rx));

        // first tick fires immediately
        for _ in 0..100 {
            if db.latest("a").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(db.latest("a").unwrap().is_some());

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn timestamps_never_repeat() {
        let future = Utc::now() + chrono::Duration::seconds(60);
        let next = next_timestamp(Some(future));
        assert_eq!(next.timestamp_millis(), future.timestamp_millis() + 1);
        let prev = Utc::now() - chrono::Duration::seconds(60);
        assert!(next_timestamp(Some(prev)) > prev);
    }
}
