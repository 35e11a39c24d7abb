//! Engine facade
//!
//! Owns one of every subsystem and drives them from the host's cycle:
//!
//! ```text
//!   host cycle ──► Engine::end_cycle
//!                    ├─ Probe::record_measurement   (every active probe)
//!                    ├─ SessionCollector::update    (every running collection)
//!                    ├─ StatsAggregator::run_cycle  (inline on Cycles cadence,
//!                    │                               else AggregatorWorker)
//!                    └─ Lifecycle::tick ──Cleanup──► Engine::cleanup
//! ```
//!
//! Instrumentation sites are obtained through [`Engine::weaver`] and run on
//! any thread; everything else here is meant to be called from the thread
//! that owns the host cycle.

use crate::aggregator::{AggregatorWorker, ProfileLog, SortKey, StatsAggregator};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{Cadence, EngineConfig};
use crate::lifecycle::{Lifecycle, LifecycleState, Transition};
use crate::registry::{self, Registry, SlotId, TargetDescriptor};
use crate::session::{
    self, CollectionConfig, CollectionStatus, DeltaReport, Session, SessionCollector,
    SessionError, SessionHeader, SessionStore,
};
use crate::weaver::Weaver;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace};

/// Callbacks into the host application
pub trait HostHooks: Send + Sync {
    /// Whether an operator is currently interacting with the host
    fn is_interactive(&self) -> bool {
        false
    }

    /// Pause the host; called for surfaced errors when `pause_on_error` is set
    fn pause(&self) {}
}

/// Host that never pauses
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl HostHooks for NoHost {}

/// Shared handle to a running collection
#[derive(Clone)]
pub struct SessionHandle(Arc<Mutex<SessionCollector>>);

impl SessionHandle {
    pub fn slot(&self) -> SlotId {
        self.0.lock().slot()
    }

    pub fn status(&self) -> CollectionStatus {
        self.0.lock().status()
    }

    pub fn is_complete(&self) -> bool {
        self.0.lock().is_complete()
    }

    pub fn header(&self) -> SessionHeader {
        self.0.lock().header().clone()
    }

    /// Session with the rows collected so far
    pub fn snapshot(&self) -> session::Result<Session> {
        self.0.lock().snapshot()
    }

    fn update(&self) -> CollectionStatus {
        self.0.lock().update()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("slot", &self.slot())
            .field("status", &self.status())
            .finish()
    }
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<Registry>,
    weaver: Weaver,
    aggregator: Arc<StatsAggregator>,
    worker: Option<AggregatorWorker>,
    store: SessionStore,
    lifecycle: Mutex<Lifecycle>,
    collections: Mutex<Vec<SessionHandle>>,
    host: Arc<dyn HostHooks>,
    paused: AtomicBool,
    cycles: AtomicU64,
    last_aggregation: Mutex<Duration>,
}

impl Engine {
    /// Engine on the monotonic clock with no host hooks
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Engine on `clock`.
    ///
    /// An invalid configuration is logged and replaced by the defaults,
    /// keeping only its session directory.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                error!("Invalid engine configuration ({}); using defaults", e);
                EngineConfig {
                    session_dir: config.session_dir,
                    ..EngineConfig::default()
                }
            }
        };
        let registry = Arc::new(Registry::new(&config));
        let weaver = Weaver::new(Arc::clone(&registry), Arc::clone(&clock));
        let aggregator = Arc::new(StatsAggregator::new(Arc::clone(&registry), config.sort_key));
        let lifecycle = Lifecycle::new(config.cooldown(), Arc::clone(&clock));
        let last_aggregation = clock.now();

        Self {
            store: SessionStore::new(config.session_dir.clone()),
            config,
            clock,
            registry,
            weaver,
            aggregator,
            worker: None,
            lifecycle: Mutex::new(lifecycle),
            collections: Mutex::new(Vec::new()),
            host: Arc::new(NoHost),
            paused: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            last_aggregation: Mutex::new(last_aggregation),
        }
    }

    pub fn with_host(mut self, host: Arc<dyn HostHooks>) -> Self {
        self.host = host;
        self
    }

    /// Move aggregation onto a background thread.
    ///
    /// Interval cadences aggregate on the worker's own timer; cycle cadences
    /// signal the worker instead of aggregating inline.
    pub fn start_background(&mut self) {
        if self.worker.is_none() {
            let interval = self.config.cadence.interval();
            self.worker = Some(AggregatorWorker::spawn(Arc::clone(&self.aggregator), interval));
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn weaver(&self) -> &Weaver {
        &self.weaver
    }

    pub fn aggregator(&self) -> &Arc<StatsAggregator> {
        &self.aggregator
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Register `descriptor` and return the slot it refers to
    ///
    /// Failures are surfaced to the host and the target stays uninstrumented.
    pub fn register_target<A: ?Sized>(
        &self,
        descriptor: &TargetDescriptor<A>,
    ) -> registry::Result<SlotId> {
        match self.registry.register_target(descriptor) {
            Ok(patch) => Ok(patch.slot_for(&descriptor.target.signature())),
            Err(e) => {
                self.surface_error(&e);
                Err(e)
            }
        }
    }

    /// Toggle an entry; enabling one counts as a profiling request
    pub fn set_entry_active(&self, entry: &str, active: bool) -> registry::Result<()> {
        self.registry.set_entry_active(entry, active)?;
        if active {
            self.begin_profiling();
        } else if self.registry.entries().iter().all(|(_, on)| !on) {
            self.end_profiling();
        }
        Ok(())
    }

    /// A profiling request arrived; cancels a pending cleanup
    pub fn begin_profiling(&self) -> Transition {
        self.lifecycle.lock().begin_profiling()
    }

    pub fn end_profiling(&self) {
        self.lifecycle.lock().end_profiling();
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.lock().state()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Host cycles processed while not paused
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// Close the current measurement cycle
    pub fn end_cycle(&self) {
        if self.is_paused() {
            return;
        }
        let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;

        for (_, probe) in self.registry.active_probes() {
            probe.record_measurement();
        }
        self.update_collections();

        match self.config.cadence {
            Cadence::Cycles(every) if cycle % u64::from(every.max(1)) == 0 => self.aggregate(),
            Cadence::Cycles(_) => {}
            Cadence::IntervalMs(_) if self.worker.is_some() => {}
            Cadence::IntervalMs(ms) => {
                let now = self.clock.now();
                let mut last = self.last_aggregation.lock();
                if now.saturating_sub(*last) >= Duration::from_millis(ms) {
                    *last = now;
                    drop(last);
                    self.aggregator.run_cycle();
                }
            }
        }

        let transition = self.lifecycle.lock().tick();
        if transition == Transition::Cleanup {
            self.cleanup();
        }
        trace!("Cycle {} closed", cycle);
    }

    fn aggregate(&self) {
        match &self.worker {
            Some(worker) => worker.signal(),
            None => {
                self.aggregator.run_cycle();
            }
        }
    }

    fn update_collections(&self) {
        let mut collections = self.collections.lock();
        collections.retain(|handle| handle.update() != CollectionStatus::Completed);
    }

    /// Tear down all instrumentation; sites woven before this run untimed
    pub fn cleanup(&self) {
        self.collections.lock().clear();
        self.aggregator.clear();
        self.registry.flush();
        info!("Instrumentation torn down");
    }

    /// Start collecting samples from the probe of `slot`
    pub fn start_collection(
        &self,
        slot: SlotId,
        config: &CollectionConfig,
    ) -> session::Result<SessionHandle> {
        let probe = self
            .registry
            .probe(slot)
            .ok_or(SessionError::UnknownSlot(slot))?;
        self.track(SessionCollector::new(slot, probe, config))
    }

    /// Start collecting with settings copied from an earlier session header
    pub fn start_collection_like(
        &self,
        slot: SlotId,
        header: SessionHeader,
    ) -> session::Result<SessionHandle> {
        let probe = self
            .registry
            .probe(slot)
            .ok_or(SessionError::UnknownSlot(slot))?;
        self.track(SessionCollector::from_header(slot, probe, header))
    }

    fn track(&self, collector: SessionCollector) -> session::Result<SessionHandle> {
        let handle = SessionHandle(Arc::new(Mutex::new(collector)));
        self.collections.lock().push(handle.clone());
        Ok(handle)
    }

    /// Collections still receiving samples
    pub fn running_collections(&self) -> Vec<SessionHandle> {
        self.collections.lock().clone()
    }

    /// Default collection settings from the engine configuration
    pub fn collection_config(&self) -> CollectionConfig {
        CollectionConfig {
            target_entries: self.config.default_target_entries,
            ..CollectionConfig::default()
        }
    }

    /// Write what `handle` collected to the session directory
    pub fn save_session(&self, handle: &SessionHandle) -> session::Result<PathBuf> {
        let result = handle.snapshot().and_then(|session| self.store.save(&session));
        if let Err(e) = &result {
            self.surface_error(e);
        }
        result
    }

    pub fn load_session(&self, path: impl AsRef<Path>) -> session::Result<Session> {
        let result = self.store.load(path);
        if let Err(e) = &result {
            self.surface_error(e);
        }
        result
    }

    pub fn compare_sessions(&self, left: &Session, right: &Session) -> DeltaReport {
        DeltaReport::compare(left, right)
    }

    /// Latest aggregation ranked by `key`
    pub fn get_ranked_logs(&self, key: SortKey) -> Vec<ProfileLog> {
        self.aggregator.ranked_logs(key)
    }

    /// Log an error and pause the host when configured to
    pub fn surface_error(&self, err: &dyn std::error::Error) {
        error!("{}", err);
        if self.config.pause_on_error && self.host.is_interactive() {
            self.host.pause();
        }
    }
}
