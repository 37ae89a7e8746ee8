//! Trading orchestrator
//!
//! One `Trader` runs one configured instance for one trading day:
//!
//! ```text
//! Stopped -> Validating -> RunningLive | RunningBacktest -> CompletedForDay
//!               |
//!               +-> Stopped (validation failed)
//! ```
//!
//! Each scheduled cycle resolves pending orders first, otherwise fetches the
//! latest closed candles for every due instrument, runs the strategy and
//! hands signals to the execution engine. Live ticks take the same
//! execution path. Both paths serialise per instrument.

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDateTime, Weekday};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::strategy::{build_strategy, Strategy};
use crate::broker::{CandleRequest, CandleSource, OrderGateway};
use crate::config::{InstanceConfig, ValidationError};
use crate::execution::{
    ExecutionContext, ExecutionEngine, ExecutionEvent, ExecutionMode, ExecutionOutcome,
    FillJournal, SessionWindow,
};
use crate::persistence::StateStore;
use crate::scheduler::{ActionScheduler, SchedulerParams, ShutdownSignal};
use crate::streams::{ConsumerRef, TickConsumer, TickHandler};
use crate::types::{Candle, Instrument, Signal, Tick};

/// Concurrent candle fetches per cycle
pub const MAX_CONCURRENT_FETCHES: usize = 10;

/// Ticks buffered between the feed and the trader
const TICK_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderState {
    Stopped,
    Validating,
    RunningLive,
    RunningBacktest,
    CompletedForDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// Market has closed; nothing more to do today
    DayComplete,
}

/// Collaborators shared by every instance in the process
#[derive(Clone)]
pub struct TraderServices {
    pub candles: Arc<dyn CandleSource>,
    pub orders: Arc<dyn OrderGateway>,
    pub store: Arc<StateStore>,
    /// Live tick feed; `None` disables the tick path
    pub ticks: Option<Arc<TickHandler>>,
    /// CSV fill journal, opened once and shared
    pub journal: Option<Arc<FillJournal>>,
}

/// Everything that only exists once validation passed
struct Runtime {
    session: SessionWindow,
    strategy: Mutex<Box<dyn Strategy>>,
    instruments: Mutex<Vec<Instrument>>,
    engine: ExecutionEngine,
}

impl Runtime {
    fn strategy(&self) -> MutexGuard<'_, Box<dyn Strategy>> {
        self.strategy.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn instruments(&self) -> MutexGuard<'_, Vec<Instrument>> {
        self.instruments.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hands ticks from the feed's reader task to the trader's tick task
struct TickForwarder {
    instance: String,
    tx: mpsc::Sender<Tick>,
}

impl TickConsumer for TickForwarder {
    fn on_tick(&self, tick: &Tick) {
        if let Err(e) = self.tx.try_send(tick.clone()) {
            match e {
                mpsc::error::TrySendError::Full(tick) => warn!(
                    instance = %self.instance,
                    instrument = %tick.instrument,
                    "Tick queue full, dropping tick"
                ),
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(instance = %self.instance, "Tick task gone")
                }
            }
        }
    }

    fn on_subscription_success(&self, instrument: &str) {
        info!(instance = %self.instance, instrument, "Live ticks subscribed");
    }

    fn on_subscription_failure(&self, instrument: &str, reason: &str) {
        warn!(instance = %self.instance, instrument, reason, "Live tick subscription failed");
    }
}

pub struct Trader {
    config: InstanceConfig,
    ctx: ExecutionContext,
    services: TraderServices,
    state: watch::Sender<TraderState>,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    runtime: OnceLock<Runtime>,
    tick_subscription: Mutex<Option<(ConsumerRef, Vec<String>)>>,
    scheduler_shutdown: Mutex<Option<ShutdownSignal>>,
}

impl Trader {
    pub fn new(config: InstanceConfig, ctx: ExecutionContext, services: TraderServices) -> Arc<Self> {
        let locks = config
            .instruments
            .iter()
            .map(|i| (i.symbol.clone(), Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        let (state, _) = watch::channel(TraderState::Stopped);

        Arc::new(Self {
            config,
            ctx,
            services,
            state,
            locks,
            runtime: OnceLock::new(),
            tick_subscription: Mutex::new(None),
            scheduler_shutdown: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> TraderState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TraderState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: TraderState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(instance = %self.config.name, "State {:?} -> {:?}", previous, state);
        }
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .get()
            .with_context(|| format!("Trader '{}' has not been started", self.config.name))
    }

    /// Execution events of this instance
    pub fn subscribe_events(&self) -> Result<tokio::sync::broadcast::Receiver<ExecutionEvent>> {
        Ok(self.runtime()?.engine.subscribe())
    }

    pub fn position(&self, instrument: &str) -> Option<i64> {
        self.runtime.get().map(|rt| rt.engine.position(instrument))
    }

    /// Validate, restore state and subscribe live ticks, then trade until
    /// the day is complete.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.prepare()?;
        match self.ctx.mode {
            ExecutionMode::Live => self.run_live().await,
            ExecutionMode::Backtest { days } => self.run_backtest(days).await,
        }
    }

    /// Ask a running live schedule to stop after the current firing
    pub fn stop(&self) {
        if let Some(signal) = self
            .scheduler_shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            signal.trigger();
        }
    }

    fn validate(&self) -> Result<Runtime, ValidationError> {
        self.config.validate_basics()?;
        let session = SessionWindow::from_instance(&self.config)?;

        let mut strategy = build_strategy(&self.config.strategy, &self.config.strategy_params)?;
        let mut instruments: Vec<Instrument> = self
            .config
            .instruments
            .iter()
            .map(|i| {
                let mut instrument = Instrument::new(&i.symbol, i.interval);
                instrument.live_ticks = i.live_ticks;
                instrument
            })
            .collect();
        strategy.init(&instruments)?;

        let lookback = strategy.required_candles();
        for instrument in &mut instruments {
            instrument.lookback = lookback;
        }

        // Replays keep their positions out of the live state file
        let store = match self.ctx.mode {
            ExecutionMode::Live => self.services.store.clone(),
            ExecutionMode::Backtest { .. } => self.services.store.backtest_copy(),
        };
        let mut engine = ExecutionEngine::new(
            &self.config.name,
            session,
            self.config.orders.clone(),
            self.ctx.tz,
            self.services.orders.clone(),
            store,
        );
        if let Some(journal) = &self.services.journal {
            engine = engine.with_journal(journal.clone());
        }

        Ok(Runtime {
            session,
            strategy: Mutex::new(strategy),
            instruments: Mutex::new(instruments),
            engine,
        })
    }

    /// Validate the instance, restore saved positions and wire live ticks.
    /// Leaves the trader ready for `run_cycle`.
    pub fn prepare(self: &Arc<Self>) -> Result<()> {
        self.set_state(TraderState::Validating);
        info!(
            instance = %self.config.name,
            strategy = %self.config.strategy,
            mode = %self.ctx.mode,
            "Starting trader"
        );

        let runtime = match self.validate() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.set_state(TraderState::Stopped);
                error!(instance = %self.config.name, "Validation failed: {}", e);
                return Err(e.into());
            }
        };

        let symbols: Vec<String> = self.config.instruments.iter().map(|i| i.symbol.clone()).collect();
        match self.ctx.mode {
            ExecutionMode::Live => runtime.engine.restore(&symbols),
            ExecutionMode::Backtest { .. } => runtime.engine.reset(&symbols),
        }

        let live = {
            let instruments = runtime.instruments();
            runtime.strategy().live_instruments(&instruments)
        };

        if self.runtime.set(runtime).is_err() {
            bail!("Trader '{}' was already started", self.config.name);
        }

        if matches!(self.ctx.mode, ExecutionMode::Live) && !live.is_empty() {
            self.subscribe_ticks(live);
        }
        Ok(())
    }

    fn subscribe_ticks(self: &Arc<Self>, instruments: Vec<String>) {
        let Some(handler) = self.services.ticks.clone() else {
            warn!(
                instance = %self.config.name,
                "Strategy wants live ticks but no feed is configured"
            );
            return;
        };

        let (tx, mut rx) = mpsc::channel(TICK_QUEUE_CAPACITY);
        let forwarder: ConsumerRef = Arc::new(TickForwarder {
            instance: self.config.name.clone(),
            tx,
        });

        let mut subscribed = Vec::new();
        for instrument in instruments {
            match handler.subscribe(&instrument, forwarder.clone()) {
                Ok(()) => subscribed.push(instrument),
                Err(e) => warn!(instrument = %instrument, "Live tick subscription failed: {}", e),
            }
        }

        *self
            .tick_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((forwarder, subscribed));

        let trader = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                let Some(trader) = trader.upgrade() else {
                    break;
                };
                let now = trader.ctx.now();
                if let Err(e) = trader.on_tick(&tick, now).await {
                    warn!("Tick handling failed: {:#}", e);
                }
            }
        });
    }

    fn unsubscribe_ticks(&self) {
        let subscription = self
            .tick_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let (Some((forwarder, instruments)), Some(handler)) = (subscription, &self.services.ticks) {
            for instrument in &instruments {
                handler.unsubscribe(instrument, &forwarder);
            }
        }
    }

    fn lock_for(&self, instrument: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.locks.get(instrument).cloned()
    }

    /// One scheduled step. `now` is venue-local time.
    pub async fn run_cycle(&self, now: NaiveDateTime) -> Result<CycleOutcome> {
        let rt = self.runtime()?;

        if rt.engine.has_pending() {
            for order in rt.engine.pending_orders() {
                let Some(lock) = self.lock_for(&order.instrument) else {
                    warn!(instrument = %order.instrument, "Pending order for unconfigured instrument");
                    continue;
                };
                let _guard = lock.lock().await;
                let outcome = rt.engine.resubmit_pending(&order.instrument, now).await;
                self.notify_outcome(rt, &order.instrument, &outcome);
            }
            return Ok(self.check_day_end(rt, now));
        }

        for (symbol, candles) in self.fetch_windows(rt, now).await {
            let signal = rt.strategy().process_ohlc(&symbol, &candles);
            if signal == Signal::None {
                continue;
            }
            info!(instance = %self.config.name, instrument = %symbol, %signal, "Strategy signal");

            let Some(lock) = self.lock_for(&symbol) else {
                continue;
            };
            let _guard = lock.lock().await;
            self.execute(rt, &symbol, signal, now).await;
        }

        Ok(self.check_day_end(rt, now))
    }

    /// Live tick path. A pending order for the instrument goes out first;
    /// while one is still waiting the tick is not evaluated. Otherwise the
    /// strategy runs and its signal takes the same sizing and gating as a
    /// scheduled cycle.
    pub async fn on_tick(&self, tick: &Tick, now: NaiveDateTime) -> Result<()> {
        let rt = self.runtime()?;
        let Some(lock) = self.lock_for(&tick.instrument) else {
            debug!(instrument = %tick.instrument, "Tick for unconfigured instrument");
            return Ok(());
        };
        let _guard = lock.lock().await;

        if rt.engine.is_pending(&tick.instrument) {
            let outcome = rt.engine.resubmit_pending(&tick.instrument, now).await;
            self.notify_outcome(rt, &tick.instrument, &outcome);
            if rt.engine.is_pending(&tick.instrument) {
                return Ok(());
            }
        }

        let signal = rt.strategy().process_tick(tick, now);
        if signal == Signal::None {
            return Ok(());
        }
        info!(
            instance = %self.config.name,
            instrument = %tick.instrument,
            ltp = tick.ltp,
            %signal,
            "Tick signal"
        );

        self.execute(rt, &tick.instrument, signal, now).await;
        Ok(())
    }

    async fn execute(&self, rt: &Runtime, instrument: &str, signal: Signal, now: NaiveDateTime) {
        let outcome = rt
            .engine
            .handle_signal(instrument, signal, self.config.lot_size, now)
            .await;
        self.notify_outcome(rt, instrument, &outcome);
    }

    /// Tell the strategy how its signal ended. A deferred order, or a failed
    /// one still waiting to be resubmitted, may fill later and is not
    /// reported yet.
    fn notify_outcome(&self, rt: &Runtime, instrument: &str, outcome: &ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Filled { quantity, price, .. } => {
                rt.strategy().on_trade(instrument, *quantity, *price)
            }
            ExecutionOutcome::Deferred { .. } => {}
            ExecutionOutcome::Failed { .. } if rt.engine.is_pending(instrument) => {}
            ExecutionOutcome::NoAction
            | ExecutionOutcome::Dropped { .. }
            | ExecutionOutcome::Failed { .. } => rt.strategy().on_order_abandoned(instrument),
        }
    }

    /// Instruments whose candle closes on this boundary
    fn due_instruments(&self, rt: &Runtime, now: NaiveDateTime) -> Vec<Instrument> {
        let minutes = (now.time() - rt.session.market_open).num_minutes();
        rt.instruments()
            .iter()
            .filter(|i| minutes < 0 || minutes % i64::from(i.interval_minutes.max(1)) == 0)
            .cloned()
            .collect()
    }

    /// Fetch closed candles for every due instrument, at most
    /// `MAX_CONCURRENT_FETCHES` at a time. Failed or empty fetches are
    /// skipped.
    async fn fetch_windows(&self, rt: &Runtime, now: NaiveDateTime) -> Vec<(String, Vec<Candle>)> {
        let now_utc = self.ctx.to_utc(now);
        let session_minutes = rt.session.market_minutes();
        let instruments = self.due_instruments(rt, now);

        let mut results: Vec<(usize, Instrument, _)> = futures::stream::iter(
            instruments.into_iter().enumerate().map(|(index, instrument)| {
                let source = self.services.candles.clone();
                async move {
                    let request = CandleRequest::recent(
                        &instrument.symbol,
                        instrument.interval_minutes,
                        instrument.lookback,
                        session_minutes,
                        now_utc,
                    );
                    let result = source.fetch_candles(&request).await;
                    (index, instrument, result)
                }
            }),
        )
        .buffer_unordered(MAX_CONCURRENT_FETCHES)
        .collect()
        .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut windows = Vec::with_capacity(results.len());
        for (_, instrument, result) in results {
            let candles = match result {
                Ok(candles) => candles,
                Err(e) => {
                    warn!(instrument = %instrument.symbol, "Candle fetch failed: {}", e);
                    continue;
                }
            };

            let closed = closed_candles(candles, instrument.interval_minutes, now_utc);
            if closed.is_empty() {
                warn!(instrument = %instrument.symbol, "No closed candles returned, skipping");
                continue;
            }
            if closed.len() < instrument.lookback {
                debug!(
                    instrument = %instrument.symbol,
                    have = closed.len(),
                    need = instrument.lookback,
                    "Short candle window"
                );
            }

            if let Some(stored) = rt
                .instruments()
                .iter_mut()
                .find(|i| i.symbol == instrument.symbol)
            {
                stored.mark_fetched(now_utc);
            }
            windows.push((instrument.symbol, closed));
        }
        windows
    }

    fn check_day_end(&self, rt: &Runtime, now: NaiveDateTime) -> CycleOutcome {
        if rt.session.after_close(now.time()) {
            self.finish_day(rt);
            CycleOutcome::DayComplete
        } else {
            CycleOutcome::Continue
        }
    }

    fn finish_day(&self, rt: &Runtime) {
        if self.state() == TraderState::CompletedForDay {
            return;
        }
        if let Err(e) = rt.engine.persist() {
            error!(instance = %self.config.name, "Failed to persist end-of-day state: {:#}", e);
        }
        self.unsubscribe_ticks();
        self.set_state(TraderState::CompletedForDay);
        info!(
            instance = %self.config.name,
            positions = ?rt.engine.positions(),
            pending = rt.engine.pending_orders().len(),
            "Trading day complete"
        );
    }

    /// Shortest instrument interval drives the schedule
    fn schedule_interval(&self) -> u32 {
        self.config
            .instruments
            .iter()
            .map(|i| i.interval)
            .min()
            .unwrap_or(1)
            .max(1)
    }

    async fn run_live(self: &Arc<Self>) -> Result<()> {
        let rt = self.runtime()?;
        self.set_state(TraderState::RunningLive);

        let params = SchedulerParams {
            start_time: rt.session.market_open,
            end_time: rt.session.market_close,
            interval: self.schedule_interval(),
        };
        let scheduler = ActionScheduler::with_clock(params, self.ctx.clock.clone());
        let shutdown = scheduler.shutdown_signal();
        *self
            .scheduler_shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(shutdown.clone());

        // Every in-flight cycle holds a sender; recv() returns None once all
        // of them have finished.
        let (in_flight_tx, mut in_flight_rx) = mpsc::channel::<()>(1);

        let trader = self.clone();
        let action = move || {
            let trader = trader.clone();
            let shutdown = shutdown.clone();
            let in_flight = in_flight_tx.clone();
            async move {
                let now = trader.ctx.now();
                match trader.run_cycle(now).await {
                    Ok(CycleOutcome::DayComplete) => shutdown.trigger(),
                    Ok(CycleOutcome::Continue) => {}
                    Err(e) => error!(instance = %trader.config.name, "Cycle failed: {:#}", e),
                }
                drop(in_flight);
            }
        };

        scheduler.schedule(Some(action)).await?;
        let _ = in_flight_rx.recv().await;

        self.finish_day(rt);
        Ok(())
    }

    /// Replay the last `days` days on a simulated clock. Cycles run only
    /// inside the trading window; weekends are skipped.
    async fn run_backtest(self: &Arc<Self>, days: u32) -> Result<()> {
        let rt = self.runtime()?;
        self.set_state(TraderState::RunningBacktest);

        let horizon = self.ctx.now();
        let step = Duration::minutes(i64::from(self.schedule_interval()));
        let delay = std::time::Duration::from_millis(self.config.backtest_step_delay_ms);
        let mut now = (horizon.date() - Duration::days(i64::from(days))).and_time(rt.session.market_open);
        let mut cycles = 0usize;

        info!(
            instance = %self.config.name,
            from = %now,
            to = %horizon,
            "Backtest replay started"
        );

        while now <= horizon {
            if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) || rt.session.after_close(now.time()) {
                now = (now.date() + Duration::days(1)).and_time(rt.session.market_open);
                continue;
            }

            if rt.session.in_trading_window(now.time()) {
                debug!(at = %now, "Backtest step");
                if let Err(e) = self.run_cycle(now).await {
                    error!(instance = %self.config.name, "Backtest cycle failed: {:#}", e);
                }
                cycles += 1;
            }

            now += step;
            tokio::time::sleep(delay).await;
        }

        info!(instance = %self.config.name, cycles, "Backtest replay finished");
        self.finish_day(rt);
        Ok(())
    }
}

/// Drop the still-forming candle(s): a candle is closed once its interval
/// has fully elapsed by `now`.
pub fn closed_candles(
    mut candles: Vec<Candle>,
    interval_minutes: u32,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<Candle> {
    let interval = Duration::minutes(i64::from(interval_minutes));
    candles.retain(|c| c.timestamp + interval <= now);
    candles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, PaperBroker};
    use crate::config::{InstrumentConfig, OrderPolicy};
    use crate::execution::local_to_utc;
    use crate::streams::LoopbackAdapter;
    use chrono::{NaiveDate, Utc};
    use serde_json::json;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn instance(strategy: &str, params: serde_json::Value, symbols: &[&str]) -> InstanceConfig {
        InstanceConfig {
            name: "alpha".to_string(),
            enabled: true,
            strategy: strategy.to_string(),
            strategy_params: params,
            lot_size: 2,
            instruments: symbols
                .iter()
                .map(|s| InstrumentConfig {
                    symbol: s.to_string(),
                    interval: 15,
                    live_ticks: false,
                })
                .collect(),
            market_open: "09:15".to_string(),
            market_close: "15:30".to_string(),
            trading_start: "09:30".to_string(),
            trading_end: "15:15".to_string(),
            orders: OrderPolicy {
                retry_backoff_ms: 0,
                ..OrderPolicy::default()
            },
            backtest_step_delay_ms: 0,
        }
    }

    /// 15-minute candles ending (exclusive) at `end_local`, closes given
    fn candles_until(end_local: NaiveDateTime, closes: &[f64]) -> Vec<Candle> {
        let tz = chrono_tz::Asia::Kolkata;
        let n = closes.len() as i64;
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let local = end_local - Duration::minutes(15 * (n - i as i64));
                Candle {
                    timestamp: local_to_utc(tz, local),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 100.0,
                }
            })
            .collect()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        broker: Arc<PaperBroker>,
        store: Arc<StateStore>,
        services: TraderServices,
    }

    fn fixture(ticks: Option<Arc<TickHandler>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new());
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let services = TraderServices {
            candles: broker.clone(),
            orders: broker.clone(),
            store: store.clone(),
            ticks,
            journal: Some(Arc::new(FillJournal::open(dir.path().join("fills.csv")).unwrap())),
        };
        Fixture {
            _dir: dir,
            broker,
            store,
            services,
        }
    }

    fn live_ctx() -> ExecutionContext {
        ExecutionContext::live(chrono_tz::Asia::Kolkata)
    }

    // Flat then a sharp drop: SELL on the last candle with period 3, M = 1
    const DROP: [f64; 5] = [100.0, 100.0, 100.0, 100.0, 96.0];

    #[tokio::test]
    async fn test_validation_failure_stops_instance() {
        let f = fixture(None);
        let mut config = instance("trend_flip", json!({ "period": 0 }), &["A"]);
        let trader = Trader::new(config.clone(), live_ctx(), f.services.clone());
        assert!(trader.prepare().is_err());
        assert_eq!(trader.state(), TraderState::Stopped);
        assert!(trader.run_cycle(at(2, 10, 0)).await.is_err());

        config.strategy_params = json!({});
        config.market_open = "9am".to_string();
        let trader = Trader::new(config, live_ctx(), f.services.clone());
        let err = trader.prepare().unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }

    #[tokio::test]
    async fn test_cycle_sells_on_trend_flip() {
        let f = fixture(None);
        let now = at(2, 10, 30);
        // A forming candle that must be ignored
        let mut forming = candles_until(now + Duration::minutes(15), &[200.0]);
        let mut all = candles_until(now, &DROP);
        all.append(&mut forming);
        f.broker.insert_candles("A", all);

        let config = instance("trend_flip", json!({ "period": 3, "multiplier": 1.0 }), &["A"]);
        let trader = Trader::new(config, live_ctx(), f.services.clone());
        trader.prepare().unwrap();
        let mut events = trader.subscribe_events().unwrap();

        let outcome = trader.run_cycle(now).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Continue);
        assert_eq!(trader.position("A"), Some(-2));
        assert_eq!(f.broker.orders().len(), 1);
        assert!(matches!(events.try_recv().unwrap(), ExecutionEvent::OrderFilled { quantity: -2, .. }));
        assert_eq!(f.store.load("alpha").current_position["A"], -2);
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_only_that_instrument() {
        let f = fixture(None);
        let now = at(2, 10, 30);
        f.broker.insert_candles("B", candles_until(now, &DROP));
        f.broker.fail_fetches("A");

        let config = instance("trend_flip", json!({ "period": 3, "multiplier": 1.0 }), &["A", "B", "C"]);
        let trader = Trader::new(config, live_ctx(), f.services.clone());
        trader.prepare().unwrap();

        trader.run_cycle(now).await.unwrap();

        assert_eq!(trader.position("A"), Some(0));
        assert_eq!(trader.position("B"), Some(-2));
        assert_eq!(trader.position("C"), Some(0));
    }

    #[tokio::test]
    async fn test_pending_orders_resolve_before_fetching() {
        let f = fixture(None);
        let config = instance("trend_flip", json!({ "period": 3, "multiplier": 1.0 }), &["A"]);

        // Restart with a pending order saved from the previous evening
        f.store
            .save(
                "alpha",
                &[("A".to_string(), 4)].into(),
                &[crate::persistence::PendingOrder {
                    instrument: "A".to_string(),
                    order_qty: -6,
                    update_time: Utc::now(),
                }],
            )
            .unwrap();
        let now = at(3, 9, 30);
        f.broker.insert_candles("A", candles_until(now, &DROP));

        let trader = Trader::new(config, live_ctx(), f.services.clone());
        trader.prepare().unwrap();
        assert_eq!(trader.position("A"), Some(4));

        trader.run_cycle(now).await.unwrap();

        // Only the pending order went out; the SELL signal waits a cycle
        assert_eq!(f.broker.orders().len(), 1);
        assert_eq!(f.broker.orders()[0].signed_quantity(), -6);
        assert_eq!(trader.position("A"), Some(-2));
        assert!(f.store.load("alpha").pending_order_action.is_empty());
    }

    #[tokio::test]
    async fn test_failed_order_leaves_position_unchanged() {
        let f = fixture(None);
        let now = at(2, 10, 30);
        f.broker.insert_candles("A", candles_until(now, &DROP));
        f.broker.fail_next_order(BrokerError::Rejected("insufficient margin".into()));

        let config = instance("trend_flip", json!({ "period": 3, "multiplier": 1.0 }), &["A"]);
        let trader = Trader::new(config, live_ctx(), f.services.clone());
        trader.prepare().unwrap();
        trader.run_cycle(now).await.unwrap();

        assert_eq!(trader.position("A"), Some(0));
        assert!(f.broker.orders().is_empty());
    }

    #[tokio::test]
    async fn test_after_close_cycle_completes_day() {
        let f = fixture(None);
        let config = instance("trend_flip", json!({}), &["A"]);
        let trader = Trader::new(config, live_ctx(), f.services.clone());
        trader.prepare().unwrap();

        assert_eq!(trader.run_cycle(at(2, 15, 30)).await.unwrap(), CycleOutcome::Continue);
        assert_eq!(trader.run_cycle(at(2, 15, 45)).await.unwrap(), CycleOutcome::DayComplete);
        assert_eq!(trader.state(), TraderState::CompletedForDay);
        assert!(f.store.load("alpha").current_position.contains_key("A"));
    }

    #[tokio::test]
    async fn test_tick_breakout_buys_inside_entry_window() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let handler = TickHandler::new(adapter.clone());
        let f = fixture(Some(handler));
        let now = at(2, 15, 0);
        f.broker.insert_candles("A", candles_until(now, &[100.0, 104.0, 102.0]));

        let config = instance(
            "weekly_breakout",
            json!({ "breakout_period": 3, "max_stocks_to_execute": 1, "entry_start": "15:00", "entry_end": "15:15" }),
            &["A"],
        );
        let trader = Trader::new(config, live_ctx(), f.services.clone());
        trader.prepare().unwrap();
        assert!(adapter.is_subscribed("A"));

        // Candle cycle only refreshes the window high (105)
        trader.run_cycle(now).await.unwrap();
        assert!(f.broker.orders().is_empty());

        let tick = |ltp: f64| Tick {
            instrument: "A".to_string(),
            ltp,
            volume: None,
            timestamp: Utc::now(),
            raw: serde_json::Value::Null,
        };
        trader.on_tick(&tick(104.0), at(2, 15, 5)).await.unwrap();
        assert!(f.broker.orders().is_empty());

        trader.on_tick(&tick(106.0), at(2, 15, 5)).await.unwrap();
        assert_eq!(trader.position("A"), Some(2));

        // Already holding: no second entry
        trader.on_tick(&tick(107.0), at(2, 15, 6)).await.unwrap();
        assert_eq!(f.broker.orders().len(), 1);
    }

    #[test]
    fn test_closed_candles_drops_forming_bar() {
        let end = at(2, 10, 30);
        let mut candles = candles_until(end, &[1.0, 2.0]);
        candles.extend(candles_until(end + Duration::minutes(15), &[3.0]));

        let closed = closed_candles(candles, 15, local_to_utc(chrono_tz::Asia::Kolkata, end));
        assert_eq!(closed.iter().map(|c| c.close).collect::<Vec<_>>(), vec![1.0, 2.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backtest_replays_trading_window() {
        let f = fixture(None);
        let mut config = instance("trend_flip", json!({ "period": 3, "multiplier": 1.0 }), &["A"]);
        config.trading_start = "09:30".to_string();
        config.trading_end = "09:45".to_string();

        // Monday 2 June 2025, 12:00 local
        let clock_now = at(2, 12, 0);
        let ctx = ExecutionContext::backtest(chrono_tz::Asia::Kolkata, 0)
            .with_clock(Arc::new(move || clock_now));
        f.broker.insert_candles("A", candles_until(at(2, 9, 45), &DROP));

        let trader = Trader::new(config, ctx, f.services.clone());
        trader.start().await.unwrap();

        assert_eq!(trader.state(), TraderState::CompletedForDay);
        // SELL fires once the drop candle has closed (09:45 step)
        assert_eq!(trader.position("A"), Some(-2));
        assert_eq!(f.broker.orders().len(), 1);
    }

    fn breakout_tick(ltp: f64) -> Tick {
        Tick {
            instrument: "A".to_string(),
            ltp,
            volume: None,
            timestamp: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_rejected_entry_frees_breakout_slot() {
        let f = fixture(Some(TickHandler::new(Arc::new(LoopbackAdapter::new()))));
        let now = at(2, 15, 0);
        f.broker.insert_candles("A", candles_until(now, &[100.0, 104.0, 102.0]));

        let config = instance(
            "weekly_breakout",
            json!({ "breakout_period": 3, "max_stocks_to_execute": 1, "entry_start": "15:00", "entry_end": "15:15" }),
            &["A"],
        );
        let trader = Trader::new(config, live_ctx(), f.services.clone());
        trader.prepare().unwrap();
        trader.run_cycle(now).await.unwrap();

        f.broker.fail_next_order(BrokerError::Rejected("insufficient margin".into()));
        trader.on_tick(&breakout_tick(106.0), at(2, 15, 5)).await.unwrap();
        assert_eq!(trader.position("A"), Some(0));

        // The rejected entry no longer counts against max_stocks_to_execute
        trader.on_tick(&breakout_tick(107.0), at(2, 15, 6)).await.unwrap();
        assert_eq!(trader.position("A"), Some(2));
        assert_eq!(f.broker.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_sends_pending_order_before_evaluating() {
        let f = fixture(Some(TickHandler::new(Arc::new(LoopbackAdapter::new()))));
        let now = at(2, 15, 0);
        f.broker.insert_candles("A", candles_until(now, &[100.0, 104.0, 102.0]));

        // Entry window runs past the 15:30 close
        let config = instance(
            "weekly_breakout",
            json!({ "breakout_period": 3, "max_stocks_to_execute": 1, "entry_start": "15:00", "entry_end": "15:45" }),
            &["A"],
        );
        let trader = Trader::new(config, live_ctx(), f.services.clone());
        trader.prepare().unwrap();
        trader.run_cycle(now).await.unwrap();

        trader.on_tick(&breakout_tick(106.0), at(2, 15, 40)).await.unwrap();
        assert!(f.broker.orders().is_empty());
        assert_eq!(f.store.load("alpha").pending_order_action[0].order_qty, 2);

        // Next session: the first tick flushes the deferred entry
        trader.on_tick(&breakout_tick(107.0), at(3, 15, 5)).await.unwrap();
        assert_eq!(f.broker.orders().len(), 1);
        assert_eq!(f.broker.orders()[0].signed_quantity(), 2);
        assert_eq!(trader.position("A"), Some(2));
        assert!(f.store.load("alpha").pending_order_action.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backtest_leaves_live_state_alone() {
        let f = fixture(None);
        f.store.save("alpha", &[("A".to_string(), 7)].into(), &[]).unwrap();

        let mut config = instance("trend_flip", json!({ "period": 3, "multiplier": 1.0 }), &["A"]);
        config.trading_end = "09:45".to_string();
        let clock_now = at(2, 12, 0);
        let ctx = ExecutionContext::backtest(chrono_tz::Asia::Kolkata, 0)
            .with_clock(Arc::new(move || clock_now));
        f.broker.insert_candles("A", candles_until(at(2, 9, 45), &DROP));

        let trader = Trader::new(config, ctx, f.services.clone());
        trader.start().await.unwrap();

        // Replay starts flat, so the SELL is one lot rather than 2 + 7
        assert_eq!(trader.position("A"), Some(-2));
        assert_eq!(f.store.load("alpha").current_position["A"], 7);
        assert_eq!(f.store.backtest_copy().load("alpha").current_position["A"], -2);
    }
}
