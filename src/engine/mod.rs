//! Polling coordinator: fetch, analyze, schedule and persist, one cycle at a time.


use crate::cancel::{CancelScope, CancelSignal};
use crate::config::EngineConfig;
use crate::conflicts::{self, Conflict};
use crate::error::{EngineError, FetchError, PersistError};
use crate::fetcher::{HttpTrainDataSource, TrainDataSource};
use crate::network::Network;
use crate::persistence::{LocalScheduleStore, Persister, RemoteResultsSink, SavedSchedule, ScheduleSink};
use crate::scheduler::{HttpScheduleAdvisor, Schedule, ScheduleAdvisor, Scheduler};
use crate::trains::TrainBundle;
use chrono::{DateTime, SubsecRound, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Everything observers see. Replaced as a whole at the end of a cycle.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineState {
    pub trains: Vec<TrainBundle>,
    pub conflicts: Vec<Conflict>,
    pub schedule: Option<Schedule>,
    pub previous_schedule: Option<Schedule>,
    pub is_optimizing: bool,
    pub last_optimized: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub is_polling: bool,
    pub use_ai: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleTrigger {
    Timer,
    Manual,
}

impl fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleTrigger::Timer => f.write_str("timer"),
            CycleTrigger::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Stopped,
    TooSoon,
    InFlight,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Completed(Schedule),
    Skipped(SkipReason),
    Failed(String),
    Cancelled,
}

/// Collaborators behind the engine's seams.
pub struct EngineParts {
    pub source: Arc<dyn TrainDataSource>,
    pub advisor: Option<Arc<dyn ScheduleAdvisor>>,
    pub remote_sink: Arc<dyn ScheduleSink>,
    pub local_store: LocalScheduleStore,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct EngineInner {
    id: Uuid,
    config: EngineConfig,
    network: Arc<Network>,
    source: Arc<dyn TrainDataSource>,
    scheduler: Scheduler,
    persister: Persister,
    state_tx: watch::Sender<EngineState>,
    // 0 while idle, otherwise the id of the running cycle
    cycle_token: AtomicU64,
    next_cycle_id: AtomicU64,
    polling: AtomicBool,
    last_cycle_started: Mutex<Option<Instant>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    cancel_scope: Mutex<CancelScope>,
    runtime: Handle,
}

/// Releases the single-flight token when a cycle ends, however it ends.
struct CycleGuard<'a> {
    inner: &'a EngineInner,
    token: u64,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self
            .inner
            .cycle_token
            .compare_exchange(self.token, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.state_tx.send_if_modified(|state| {
                let was_optimizing = state.is_optimizing;
                state.is_optimizing = false;
                was_optimizing
            });
        }
    }
}

impl EngineInner {
    fn begin_cycle(&self) -> Result<(u64, CancelSignal), SkipReason> {
        if self.cycle_token.load(Ordering::Acquire) != 0 {
            return Err(SkipReason::InFlight);
        }

        let mut last_started = lock(&self.last_cycle_started);
        let now = Instant::now();

        if let Some(previous) = *last_started {
            if now.duration_since(previous) < self.config.min_cycle_spacing {
                return Err(SkipReason::TooSoon);
            }
        }

        // held until is_optimizing is published; stop() clears the token under the same lock
        let scope = lock(&self.cancel_scope);

        let token = self.next_cycle_id.fetch_add(1, Ordering::Relaxed) + 1;
        if self
            .cycle_token
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SkipReason::InFlight);
        }

        *last_started = Some(now);
        let signal = scope.signal();

        self.state_tx.send_modify(|state| {
            state.is_optimizing = true;
            state.error = None;
        });

        Ok((token, signal))
    }

    /// Applies `update` only if cycle `token` still owns the engine.
    fn publish_if_current(&self, token: u64, update: impl FnOnce(&mut EngineState)) -> bool {
        self.state_tx.send_if_modified(|state| {
            if self.cycle_token.load(Ordering::Acquire) != token {
                return false;
            }
            update(state);
            true
        })
    }

    async fn run_cycle(&self, trigger: CycleTrigger) -> CycleOutcome {
        if trigger == CycleTrigger::Timer && !self.polling.load(Ordering::Acquire) {
            return CycleOutcome::Skipped(SkipReason::Stopped);
        }

        let (token, cancel) = match self.begin_cycle() {
            Ok(acquired) => acquired,
            Err(reason) => {
                debug!("Skipping {} cycle on engine {}: {:?}", trigger, self.id, reason);
                return CycleOutcome::Skipped(reason);
            }
        };

        let _guard = CycleGuard { inner: self, token };

        let span = info_span!("cycle", engine = %self.id, trigger = %trigger, cycle = token);
        self.execute(token, &cancel).instrument(span).await
    }

    async fn execute(&self, token: u64, cancel: &CancelSignal) -> CycleOutcome {
        let started = Instant::now();
        info!("Starting optimization cycle");

        let fetch = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch());
        let fetched = match cancel.run(fetch).await {
            None => {
                info!("Cycle cancelled during fetch");
                return CycleOutcome::Cancelled;
            }
            Some(Err(_elapsed)) => Err(FetchError::Timeout),
            Some(Ok(result)) => result,
        };

        let trains = match fetched {
            Ok(trains) => trains,
            Err(e) => {
                error!("Failed to fetch train data: {}", e);
                let message = e.to_string();
                self.publish_if_current(token, |state| {
                    state.error = Some(message.clone());
                    state.is_optimizing = false;
                });
                return CycleOutcome::Failed(message);
            }
        };

        info!("Fetched {} trains", trains.len());

        let conflicts = conflicts::analyze(&trains, &self.network);
        info!("Detected {} conflicts", conflicts.len());

        // whole seconds, so hold times line up with entry_epoch_s
        let now = Utc::now().trunc_subsecs(0);
        let schedule = self
            .scheduler
            .schedule(&trains, &conflicts, &self.network, now, cancel)
            .await;

        if cancel.is_cancelled() {
            info!("Cycle cancelled after scheduling");
            return CycleOutcome::Cancelled;
        }

        let Some(report) = cancel.run(self.persister.persist(&schedule, now)).await else {
            info!("Cycle cancelled during persistence");
            return CycleOutcome::Cancelled;
        };

        let counts = schedule.action_counts();
        info!(
            "Schedule: {} proceed, {} hold, {} reroute (remote delivered: {}, local key: {:?})",
            counts.proceed, counts.hold, counts.reroute, report.remote_delivered, report.local_key
        );

        let published_schedule = schedule.clone();
        let published = self.publish_if_current(token, move |state| {
            if let Some(previous) = &state.schedule {
                let diff = schedule.diff(previous);
                if diff.is_empty() {
                    debug!("Schedule unchanged since previous cycle");
                } else {
                    info!(
                        "Schedule diff: added {:?}, removed {:?}, changed {:?}",
                        diff.added, diff.removed, diff.changed
                    );
                }
            }

            state.previous_schedule = state.schedule.take();
            state.trains = trains;
            state.conflicts = conflicts;
            state.schedule = Some(schedule);
            state.last_optimized = Some(now);
            state.error = None;
            state.is_optimizing = false;
        });

        if !published {
            info!("Engine stopped before publish, discarding schedule");
            return CycleOutcome::Cancelled;
        }

        info!("Optimization cycle finished in {:?}", started.elapsed());
        CycleOutcome::Completed(published_schedule)
    }

    /// Returns whether the engine was polling.
    fn stop(&self) -> bool {
        let was_polling = self.polling.swap(false, Ordering::AcqRel);

        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }

        {
            let mut scope = lock(&self.cancel_scope);
            scope.cancel();
            *scope = CancelScope::new();

            self.cycle_token.store(0, Ordering::Release);

            self.state_tx.send_modify(|state| {
                state.is_polling = false;
                state.is_optimizing = false;
            });
        }

        if was_polling {
            info!("Polling stopped on engine {}", self.id);
        }

        was_polling
    }
}

async fn poll(inner: Arc<EngineInner>) {
    let mut interval = tokio::time::interval(inner.config.polling_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        // first tick fires immediately
        interval.tick().await;

        if inner.cycle_token.load(Ordering::Acquire) != 0 {
            debug!("Optimization in progress, skipping tick");
            continue;
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            inner.run_cycle(CycleTrigger::Timer).await;
        });
    }
}

/// Owning handle. Dropping it stops polling and cancels any running cycle.
pub struct OptimizationEngine {
    inner: Arc<EngineInner>,
}

impl OptimizationEngine {
    /// Must be called from within a tokio runtime; the timer and cycles run on it.
    pub fn new(
        config: EngineConfig,
        network: Network,
        parts: EngineParts,
    ) -> Result<Self, EngineError> {
        let runtime = Handle::try_current()?;

        let scheduler = Scheduler::new(
            parts.advisor,
            config.ai_model.clone(),
            config.advisor_timeout,
        );

        let (state_tx, _) = watch::channel(EngineState {
            use_ai: scheduler.ai_enabled(),
            ..EngineState::default()
        });

        let inner = EngineInner {
            id: Uuid::new_v4(),
            network: Arc::new(network),
            source: parts.source,
            scheduler,
            persister: Persister::new(parts.remote_sink, parts.local_store),
            state_tx,
            cycle_token: AtomicU64::new(0),
            next_cycle_id: AtomicU64::new(0),
            polling: AtomicBool::new(false),
            last_cycle_started: Mutex::new(None),
            timer: Mutex::new(None),
            cancel_scope: Mutex::new(CancelScope::new()),
            runtime,
            config,
        };

        info!("Created optimization engine {}", inner.id);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// HTTP collaborators against `config.base_url`. The advisor exists only with a credential.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let client = reqwest::ClientBuilder::new()
            .use_rustls_tls()
            .user_agent("Railflow Juniper")
            .deflate(true)
            .gzip(true)
            .brotli(true)
            .build()?;

        let source = Arc::new(HttpTrainDataSource::new(
            client.clone(),
            &config.base_url,
            config.fetch_timeout,
        ));

        let advisor = config.ai_credential.clone().map(|credential| {
            Arc::new(HttpScheduleAdvisor::new(
                client.clone(),
                &config.base_url,
                credential,
                config.advisor_timeout,
            )) as Arc<dyn ScheduleAdvisor>
        });

        if advisor.is_none() {
            warn!("No AI credential configured, using deterministic scheduling only");
        }

        let remote_sink = Arc::new(RemoteResultsSink::new(
            client,
            &config.base_url,
            config.persist_timeout,
        ));
        let local_store = LocalScheduleStore::new(config.schedule_dir.clone());

        Self::new(
            config,
            Network::corridor(),
            EngineParts {
                source,
                advisor,
                remote_sink,
                local_store,
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &Network {
        &self.inner.network
    }

    /// Returns false (and does nothing) when already polling.
    pub fn start(&self) -> bool {
        if self
            .inner
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Polling already active on engine {}", self.inner.id);
            return false;
        }

        info!(
            "Starting polling every {:?} on engine {}",
            self.inner.config.polling_interval, self.inner.id
        );

        self.inner.state_tx.send_modify(|state| state.is_polling = true);

        let timer = self.inner.runtime.spawn(poll(self.inner.clone()));
        if let Some(old) = lock(&self.inner.timer).replace(timer) {
            old.abort();
        }

        true
    }

    /// Returns false if the engine was not polling. Any running cycle is cancelled either way.
    pub fn stop(&self) -> bool {
        self.inner.stop()
    }

    /// Runs one cycle now, subject to the single-flight and spacing guards. Does not reset the timer.
    pub async fn refresh(&self) -> CycleOutcome {
        let inner = self.inner.clone();
        let cycle = self
            .inner
            .runtime
            .spawn(async move { inner.run_cycle(CycleTrigger::Manual).await });

        match cycle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Cycle task failed: {}", e);
                CycleOutcome::Failed(e.to_string())
            }
        }
    }

    /// Starts polling if the configuration asks for it.
    pub fn auto_start(&self) -> bool {
        self.inner.config.auto_start && self.start()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.polling.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EngineState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    /// Returns the effective setting, which stays false without an advisor.
    pub fn set_ai_enabled(&self, enabled: bool) -> bool {
        let effective = self.inner.scheduler.set_ai_enabled(enabled);
        self.inner.state_tx.send_if_modified(|state| {
            let changed = state.use_ai != effective;
            state.use_ai = effective;
            changed
        });
        effective
    }

    pub fn saved_schedules(&self) -> Result<Vec<SavedSchedule>, PersistError> {
        self.inner.persister.local_store().list()
    }
}

impl Drop for OptimizationEngine {
    fn drop(&mut self) {
        self.inner.stop();
    }
}
