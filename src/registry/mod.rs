//! Slot registry: stable identities for instrumented targets
//!
//! Every registered target (and every dynamically keyed sub-target) owns a
//! slot. A slot id indexes a set of parallel arrays:
//!
//! ```text
//!  slot id      0      1        2        3       ...
//!            ┌──────┬────────┬────────┬────────┬─────
//!  active    │  -   │ true   │ false  │ true   │
//!  targets   │  -   │ Foo.Bar│ Map.Sim│ Map.Ren│
//!  probes    │  -   │ Probe  │  None  │ Probe  │
//!            └──────┴────────┴────────┴────────┴─────
//! ```
//!
//! Slot 0 is reserved as "unassigned". Positions never move: the arrays only
//! grow (see [`table::SlotTable`]) and are reset as a whole by [`Registry::flush`].
//!
//! Allocation is serialized by one exclusive section; reading a slot's flag or
//! probe never takes a lock.
//!
//! Lock order, outermost first: key map, dynamic-key map, entries, allocator.

pub mod diff;
pub mod table;
pub mod target;


pub use diff::{edit_script, inserted_calls, EditOp};
pub use table::SlotTable;
pub use target::{
    diff_sub_key, CallInstruction, InsertedCall, KeyResolver, LabelResolver, PatchTarget,
    TargetBody, TargetDescriptor, TargetId,
};

use crate::config::EngineConfig;
use crate::probe::Probe;
use arc_swap::ArcSwapOption;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while registering or toggling targets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstrumentError {
    #[error("cannot instrument {target}: {reason}")]
    Uninstrumentable { target: String, reason: String },

    #[error("unknown entry: {0}")]
    UnknownEntry(String),

    #[error("multi-target {call_site} has no stages")]
    EmptyMultiTarget { call_site: String },
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, InstrumentError>;

/// Stable identity of an instrumented target (1-based, 0 = unassigned)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SlotId(u32);

impl SlotId {
    pub const UNASSIGNED: SlotId = SlotId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Metadata recorded for a slot when it is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    /// Registry key (signature, dynamic key or diff sub-key)
    pub key: String,
    pub target: TargetId,
    /// Entries the slot belongs to
    pub entries: Vec<String>,
    /// Slot of the registered target that created this one on demand
    pub owner: Option<SlotId>,
}

#[derive(Debug, Default)]
struct EntryState {
    active: bool,
    slots: BTreeSet<SlotId>,
}

/// Owned registry context, shared by `Arc`
pub struct Registry {
    buffer_capacity: usize,
    verbose_logging: bool,

    active: SlotTable<AtomicBool>,
    targets: SlotTable<OnceLock<TargetInfo>>,
    probes: SlotTable<ArcSwapOption<Probe>>,

    key_to_target: RwLock<FnvHashMap<String, Arc<PatchTarget>>>,
    dynamic_slots: RwLock<FnvHashMap<String, SlotId>>,
    entries: RwLock<FnvHashMap<String, EntryState>>,

    /// Last allocated id; the lock is the allocation exclusive section
    next_id: Mutex<u32>,
    /// Published copy of `next_id` for lock-free iteration
    allocated: AtomicU32,
    /// Bumped by every flush; sites built before a flush compare against it
    generation: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("slots", &self.slot_count())
            .field("capacity", &self.active.len())
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}

impl Registry {
    pub fn new(config: &EngineConfig) -> Self {
        let expand = config.array_expand_size;
        Self {
            buffer_capacity: config.buffer_capacity,
            verbose_logging: config.verbose_logging,
            active: SlotTable::new(expand),
            targets: SlotTable::new(expand),
            probes: SlotTable::new(expand),
            key_to_target: RwLock::new(FnvHashMap::default()),
            dynamic_slots: RwLock::new(FnvHashMap::default()),
            entries: RwLock::new(FnvHashMap::default()),
            next_id: Mutex::new(0),
            allocated: AtomicU32::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of cycles each probe created by this registry retains
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Number of flushes so far
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Highest slot id handed out so far
    pub fn slot_count(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Hand out the next slot id, growing the slot arrays when it reaches
    /// the last usable position.
    pub fn allocate_slot_id(&self) -> SlotId {
        let mut next = self.next_id.lock();
        *next += 1;
        let id = *next;

        if id as usize >= self.active.len().saturating_sub(1) {
            self.grow_arrays(id as usize + 2);
        }

        self.allocated.store(id, Ordering::Release);
        SlotId(id)
    }

    fn grow_arrays(&self, min_len: usize) {
        let grew = self.active.grow_to(min_len);
        self.targets.grow_to(min_len);
        self.probes.grow_to(min_len);
        if grew {
            debug!("Slot arrays grown to {} entries", self.active.len());
        }
    }

    /// Register a single call target.
    ///
    /// Idempotent: a target whose signature already has a slot returns the
    /// existing registration. Fast-path targets get their probe immediately.
    pub fn register_target<A: ?Sized>(
        &self,
        descriptor: &TargetDescriptor<A>,
    ) -> Result<Arc<PatchTarget>> {
        let key = descriptor.target.signature();

        if let Some(reason) = descriptor.body.uninstrumentable_reason() {
            warn!("Not instrumenting {}: {}", key, reason);
            return Err(InstrumentError::Uninstrumentable {
                target: key,
                reason: reason.to_string(),
            });
        }

        let mut key_map = self.key_to_target.write();
        if let Some(existing) = key_map.get(&key) {
            self.report_duplicate(&key);
            return Ok(Arc::clone(existing));
        }

        let slot = self.allocate_slot_id();
        self.install_slot(
            slot,
            TargetInfo {
                key: key.clone(),
                target: descriptor.target.clone(),
                entries: descriptor.entries.clone(),
                owner: None,
            },
        );
        if descriptor.is_fast_path() {
            self.ensure_probe(slot, || key.clone());
        }

        let patch = Arc::new(PatchTarget::Single {
            key: key.clone(),
            target: descriptor.target.clone(),
            slot,
        });
        key_map.insert(key.clone(), Arc::clone(&patch));
        debug!("Registered {} as slot {}", key, slot);
        Ok(patch)
    }

    /// Register several logically distinct stages sharing one call boundary.
    ///
    /// Each stage gets its own slot and probe and is addressable by its own
    /// signature.
    pub fn register_multi_target(
        &self,
        call_site: &TargetId,
        stages: &[TargetId],
        entries: &[String],
    ) -> Result<Arc<PatchTarget>> {
        let key = call_site.signature();
        if stages.is_empty() {
            return Err(InstrumentError::EmptyMultiTarget { call_site: key });
        }

        let mut key_map = self.key_to_target.write();
        if let Some(existing) = key_map.get(&key) {
            self.report_duplicate(&key);
            return Ok(Arc::clone(existing));
        }

        let mut slots = Vec::with_capacity(stages.len());
        for stage in stages {
            let slot = self.allocate_slot_id();
            let stage_key = stage.signature();
            self.install_slot(
                slot,
                TargetInfo {
                    key: stage_key.clone(),
                    target: stage.clone(),
                    entries: entries.to_vec(),
                    owner: None,
                },
            );
            self.ensure_probe(slot, || stage_key);
            slots.push((stage.clone(), slot));
        }

        let patch = Arc::new(PatchTarget::Multi {
            key: key.clone(),
            call_site: call_site.clone(),
            stages: slots,
        });
        for stage in stages {
            key_map
                .entry(stage.signature())
                .or_insert_with(|| Arc::clone(&patch));
        }
        key_map.insert(key.clone(), Arc::clone(&patch));
        debug!("Registered multi-target {} with {} stages", key, stages.len());
        Ok(patch)
    }

    /// Register the calls `current` adds to `body` relative to `baseline`.
    ///
    /// The body keeps a base slot; every inserted call that does not belong
    /// to the instrumentation itself receives its own slot, keyed
    /// `"<body> : <call>"`.
    pub fn register_diff_target(
        &self,
        body: &TargetId,
        baseline: &[CallInstruction],
        current: &[CallInstruction],
        entries: &[String],
    ) -> Result<Arc<PatchTarget>> {
        let key = body.signature();

        let mut key_map = self.key_to_target.write();
        if let Some(existing) = key_map.get(&key) {
            self.report_duplicate(&key);
            return Ok(Arc::clone(existing));
        }

        let base_slot = self.allocate_slot_id();
        self.install_slot(
            base_slot,
            TargetInfo {
                key: key.clone(),
                target: body.clone(),
                entries: entries.to_vec(),
                owner: None,
            },
        );

        let mut inserted = Vec::new();
        for position in inserted_calls(baseline, current) {
            let call = &current[position];
            let sub_key = diff_sub_key(&key, &call.target);
            let slot = self.allocate_slot_id();
            self.install_slot(
                slot,
                TargetInfo {
                    key: sub_key.clone(),
                    target: call.target.clone(),
                    entries: entries.to_vec(),
                    owner: Some(base_slot),
                },
            );
            self.ensure_probe(slot, || sub_key);
            inserted.push(InsertedCall {
                position,
                target: call.target.clone(),
                slot,
            });
        }

        let sub_keys: Vec<String> = inserted
            .iter()
            .map(|call| diff_sub_key(&key, &call.target))
            .collect();
        info!(
            "Diff-target {}: {} inserted call(s) instrumented",
            key,
            inserted.len()
        );
        let patch = Arc::new(PatchTarget::Diff {
            key: key.clone(),
            body: body.clone(),
            base_slot,
            inserted,
        });
        for sub_key in sub_keys {
            key_map
                .entry(sub_key)
                .or_insert_with(|| Arc::clone(&patch));
        }
        key_map.insert(key, Arc::clone(&patch));
        Ok(patch)
    }

    fn report_duplicate(&self, key: &str) {
        if self.verbose_logging {
            warn!("{} is already registered; keeping the existing slot", key);
        } else {
            debug!("{} is already registered; keeping the existing slot", key);
        }
    }

    /// Record metadata, entry membership and the initial active flag.
    ///
    /// A slot without entries starts active; otherwise it is active when any
    /// of its entries is. Entries are created active on first mention.
    fn install_slot(&self, slot: SlotId, info: TargetInfo) {
        let active = {
            let mut entries = self.entries.write();
            if info.entries.is_empty() {
                true
            } else {
                let mut any = false;
                for name in &info.entries {
                    let state = entries.entry(name.clone()).or_insert_with(|| EntryState {
                        active: true,
                        slots: BTreeSet::new(),
                    });
                    state.slots.insert(slot);
                    any |= state.active;
                }
                any
            }
        };

        self.targets.with(slot.index(), |cell| {
            let _ = cell.set(info);
        });
        self.active
            .with(slot.index(), |flag| flag.store(active, Ordering::Release));
    }

    /// Slot owning `key`: a registered signature, a stage or diff sub-key,
    /// or a dynamic key created at invocation time.
    pub fn lookup_by_key(&self, key: &str) -> Option<SlotId> {
        if let Some(slot) = self.dynamic_slots.read().get(key) {
            return Some(*slot);
        }
        self.key_to_target
            .read()
            .get(key)
            .and_then(|target| target.resolve_slot(key))
    }

    /// Registration previously returned for `key`
    pub fn patch_target(&self, key: &str) -> Option<Arc<PatchTarget>> {
        self.key_to_target.read().get(key).cloned()
    }

    pub fn slots_for_entry(&self, entry: &str) -> BTreeSet<SlotId> {
        self.entries
            .read()
            .get(entry)
            .map(|state| state.slots.clone())
            .unwrap_or_default()
    }

    /// Known entry names with their active state, sorted by name
    pub fn entries(&self) -> Vec<(String, bool)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(name, state)| (name.clone(), state.active))
            .collect();
        entries.sort();
        entries
    }

    /// Toggle an entry and recompute the active flag of every slot in it.
    ///
    /// The whole update happens under the entries write lock, so no other
    /// registry operation observes a half-toggled entry.
    pub fn set_entry_active(&self, entry: &str, active: bool) -> Result<()> {
        let mut entries = self.entries.write();
        let slots = match entries.get_mut(entry) {
            Some(state) => {
                state.active = active;
                state.slots.clone()
            }
            None => return Err(InstrumentError::UnknownEntry(entry.to_string())),
        };

        for slot in &slots {
            let any_active = self
                .target_info(*slot)
                .map(|info| {
                    info.entries
                        .iter()
                        .any(|name| entries.get(name).is_some_and(|s| s.active))
                })
                .unwrap_or(active);
            self.set_slot_active(*slot, any_active);
        }

        info!(
            "Entry '{}' {} ({} slot(s))",
            entry,
            if active { "enabled" } else { "disabled" },
            slots.len()
        );
        Ok(())
    }

    pub fn set_slot_active(&self, slot: SlotId, active: bool) {
        self.active
            .with(slot.index(), |flag| flag.store(active, Ordering::Release));
    }

    #[inline]
    pub fn is_active(&self, slot: SlotId) -> bool {
        self.active
            .with(slot.index(), |flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn target_info(&self, slot: SlotId) -> Option<TargetInfo> {
        self.targets
            .with(slot.index(), |cell| cell.get().cloned())
            .flatten()
    }

    #[inline]
    pub fn probe(&self, slot: SlotId) -> Option<Arc<Probe>> {
        self.probes
            .with(slot.index(), |cell| cell.load_full())
            .flatten()
    }

    /// Probe of `slot`, created with `label` if the slot has none yet.
    ///
    /// Concurrent creators race on a compare-and-swap; the loser adopts the
    /// winner's probe. Returns `None` for ids outside the arrays.
    pub fn ensure_probe(&self, slot: SlotId, label: impl FnOnce() -> String) -> Option<Arc<Probe>> {
        if !slot.is_assigned() {
            return None;
        }
        let capacity = self.buffer_capacity;
        self.probes
            .with(slot.index(), |cell| {
                if let Some(existing) = cell.load_full() {
                    return existing;
                }
                let fresh = Arc::new(Probe::new(label(), capacity));
                let previous = cell.compare_and_swap(&None::<Arc<Probe>>, Some(Arc::clone(&fresh)));
                match &*previous {
                    Some(winner) => Arc::clone(winner),
                    None => fresh,
                }
            })
    }

    /// Probe for a dynamically keyed invocation of the target owning `owner`.
    ///
    /// The first use of a key allocates a slot that inherits the owner's
    /// target, entries and active state; later uses hit the cached slot.
    pub fn probe_for_key(
        &self,
        owner: SlotId,
        key: &str,
        label: impl FnOnce() -> String,
    ) -> Option<Arc<Probe>> {
        let cached = self.dynamic_slots.read().get(key).copied();
        if let Some(slot) = cached {
            return self.ensure_probe(slot, label);
        }

        let mut dynamic = self.dynamic_slots.write();
        if let Some(slot) = dynamic.get(key).copied() {
            drop(dynamic);
            return self.ensure_probe(slot, label);
        }

        let owner_info = self.target_info(owner)?;
        let owner_active = self.is_active(owner);

        let slot = self.allocate_slot_id();
        self.install_slot(
            slot,
            TargetInfo {
                key: key.to_string(),
                target: owner_info.target,
                entries: owner_info.entries,
                owner: Some(owner),
            },
        );
        self.set_slot_active(slot, owner_active);
        dynamic.insert(key.to_string(), slot);
        drop(dynamic);

        debug!("Dynamic key '{}' of {} assigned slot {}", key, owner, slot);
        self.ensure_probe(slot, label)
    }

    /// Every slot whose active flag is set and that owns a probe
    pub fn active_probes(&self) -> Vec<(SlotId, Arc<Probe>)> {
        let active = self.active.snapshot();
        let probes = self.probes.snapshot();
        let limit = self.slot_count() as usize;

        active
            .iter()
            .zip(probes.iter())
            .enumerate()
            .skip(1)
            .take(limit)
            .filter(|(_, (flag, _))| flag.load(Ordering::Acquire))
            .filter_map(|(index, (_, cell))| {
                cell.load_full().map(|probe| (SlotId(index as u32), probe))
            })
            .collect()
    }

    /// Every probe that exists, active or not
    pub fn all_probes(&self) -> Vec<(SlotId, Arc<Probe>)> {
        let limit = self.slot_count() as usize;
        self.probes
            .snapshot()
            .iter()
            .enumerate()
            .skip(1)
            .take(limit)
            .filter_map(|(index, cell)| cell.load_full().map(|p| (SlotId(index as u32), p)))
            .collect()
    }

    /// Turn every slot and entry off without forgetting them
    pub fn disable_all(&self) {
        let mut entries = self.entries.write();
        for state in entries.values_mut() {
            state.active = false;
        }
        for flag in self.active.snapshot() {
            flag.store(false, Ordering::Release);
        }
        info!("All instrumentation disabled");
    }

    /// Drop every probe; slots and registrations survive and probes are
    /// recreated on the next active invocation.
    pub fn clear_probes(&self) {
        for cell in self.probes.snapshot() {
            cell.store(None);
        }
        debug!("All probes cleared");
    }

    /// Forget every registration and reset all slot arrays
    pub fn flush(&self) {
        let mut key_map = self.key_to_target.write();
        let mut dynamic = self.dynamic_slots.write();
        let mut entries = self.entries.write();
        let mut next = self.next_id.lock();

        key_map.clear();
        dynamic.clear();
        entries.clear();
        self.active.reset();
        self.targets.reset();
        self.probes.reset();
        *next = 0;
        self.allocated.store(0, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);

        info!("Registry flushed");
    }
}
