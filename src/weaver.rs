//! Invocation-time weaving
//!
//! The host wraps each interception point in a site obtained from the
//! [`Weaver`]. Invoking a site decides, per call, whether and how to time it:
//!
//! - **fast path**: slot inactive ⇒ one flag check and the original call;
//!   slot active ⇒ probe fetched by slot index.
//! - **dynamic path**: the key resolver turns the call's arguments into a
//!   probe key; `None` runs the call untimed.
//!
//! Timing is bracketed by a [`ProbeGuard`], whose `Drop` stops the probe, so
//! every exit of the body (return, `?`, panic unwinding) closes the interval.

use crate::clock::Clock;
use crate::probe::Probe;
use crate::registry::{
    self, CallInstruction, InsertedCall, KeyResolver, LabelResolver, PatchTarget, Registry,
    SlotId, TargetDescriptor, TargetId,
};
use std::sync::Arc;
use tracing::warn;

/// Starts a probe on creation and stops it on drop
pub struct ProbeGuard<'a> {
    probe: Arc<Probe>,
    clock: &'a dyn Clock,
}

impl<'a> ProbeGuard<'a> {
    #[inline]
    pub fn start(probe: Arc<Probe>, clock: &'a dyn Clock) -> Self {
        if let Err(e) = probe.start(clock.now()) {
            warn!("{}", e);
        }
        Self { probe, clock }
    }
}

impl Drop for ProbeGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        if let Err(e) = self.probe.stop(self.clock.now()) {
            warn!("{}", e);
        }
    }
}

/// Builds invocation sites against a shared registry
#[derive(Clone)]
pub struct Weaver {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
}

impl Weaver {
    pub fn new(registry: Arc<Registry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register `descriptor` and return a site for it
    pub fn weave<A: ?Sized>(&self, descriptor: TargetDescriptor<A>) -> registry::Result<WovenSite<A>> {
        let patch = self.registry.register_target(&descriptor)?;
        let key = descriptor.target.signature();
        Ok(WovenSite {
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            generation: self.registry.generation(),
            slot: patch.slot_for(&key),
            key,
            key_resolver: descriptor.key_resolver,
            label_resolver: descriptor.label_resolver,
        })
    }

    /// Register a multi-target and return its site
    pub fn weave_multi(
        &self,
        call_site: &TargetId,
        stages: &[TargetId],
        entries: &[String],
    ) -> registry::Result<MultiSite> {
        let patch = self
            .registry
            .register_multi_target(call_site, stages, entries)?;
        let slots = match patch.as_ref() {
            PatchTarget::Multi { stages, .. } => stages.iter().map(|(_, slot)| *slot).collect(),
            other => other.slots(),
        };
        Ok(MultiSite {
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            generation: self.registry.generation(),
            slots,
        })
    }

    /// Register a diff-target and return its site
    pub fn weave_diff(
        &self,
        body: &TargetId,
        baseline: &[CallInstruction],
        current: &[CallInstruction],
        entries: &[String],
    ) -> registry::Result<DiffSite> {
        let patch = self
            .registry
            .register_diff_target(body, baseline, current, entries)?;
        let (base_slot, inserted) = match patch.as_ref() {
            PatchTarget::Diff {
                base_slot,
                inserted,
                ..
            } => (*base_slot, inserted.clone()),
            other => (other.primary_slot(), Vec::new()),
        };
        Ok(DiffSite {
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            generation: self.registry.generation(),
            base_slot,
            inserted,
        })
    }
}

/// A single interception point
pub struct WovenSite<A: ?Sized = ()> {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    generation: u64,
    slot: SlotId,
    key: String,
    key_resolver: Option<KeyResolver<A>>,
    label_resolver: Option<LabelResolver<A>>,
}

impl<A: ?Sized> WovenSite<A> {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// False once the registry was flushed; stale sites run untimed
    #[inline]
    pub fn is_current(&self) -> bool {
        self.registry.generation() == self.generation
    }

    /// Run `body`, timing it when the site is active.
    ///
    /// The return value of `body` is passed through untouched.
    #[inline]
    pub fn invoke<R>(&self, args: &A, body: impl FnOnce() -> R) -> R {
        if !self.registry.is_active(self.slot) || !self.is_current() {
            return body();
        }
        match self.resolve(args) {
            Some(probe) => {
                let _guard = ProbeGuard::start(probe, self.clock.as_ref());
                body()
            }
            None => body(),
        }
    }

    fn resolve(&self, args: &A) -> Option<Arc<Probe>> {
        match (&self.key_resolver, &self.label_resolver) {
            (None, None) => self
                .registry
                .probe(self.slot)
                .or_else(|| self.registry.ensure_probe(self.slot, || self.key.clone())),
            (None, Some(label)) => self.registry.ensure_probe(self.slot, || label(args)),
            (Some(resolve_key), label) => {
                let key = resolve_key(args)?;
                self.registry.probe_for_key(self.slot, &key, || match label {
                    Some(label) => label(args),
                    None => key.clone(),
                })
            }
        }
    }
}

impl WovenSite<()> {
    /// [`WovenSite::invoke`] for sites without arguments
    #[inline]
    pub fn call<R>(&self, body: impl FnOnce() -> R) -> R {
        self.invoke(&(), body)
    }
}

/// Several stages sharing one physical call boundary
pub struct MultiSite {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    generation: u64,
    slots: Vec<SlotId>,
}

impl MultiSite {
    pub fn slots(&self) -> &[SlotId] {
        &self.slots
    }

    /// Run `body` with a [`StageRunner`] for its stages.
    ///
    /// The active check happens once here: when no stage is active, every
    /// stage of this invocation runs untimed.
    pub fn invoke<R>(&self, body: impl FnOnce(&StageRunner<'_>) -> R) -> R {
        let active = self.registry.generation() == self.generation
            && self.slots.iter().any(|slot| self.registry.is_active(*slot));
        let runner = StageRunner { site: self, active };
        body(&runner)
    }
}

/// Times the stages of one [`MultiSite`] invocation
pub struct StageRunner<'a> {
    site: &'a MultiSite,
    active: bool,
}

impl StageRunner<'_> {
    /// Run stage `index`, timed by that stage's own probe
    pub fn run<R>(&self, index: usize, stage: impl FnOnce() -> R) -> R {
        if !self.active {
            return stage();
        }
        let probe = self.site.slots.get(index).and_then(|slot| {
            if self.site.registry.is_active(*slot) {
                self.site.registry.probe(*slot)
            } else {
                None
            }
        });
        match probe {
            Some(probe) => {
                let _guard = ProbeGuard::start(probe, self.site.clock.as_ref());
                stage()
            }
            None => stage(),
        }
    }
}

/// A body whose inserted calls are timed individually
pub struct DiffSite {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    generation: u64,
    base_slot: SlotId,
    inserted: Vec<InsertedCall>,
}

impl DiffSite {
    pub fn base_slot(&self) -> SlotId {
        self.base_slot
    }

    pub fn inserted(&self) -> &[InsertedCall] {
        &self.inserted
    }

    /// Run the call found at `position` of the current call sequence.
    ///
    /// Only calls that were inserted relative to the baseline are timed.
    pub fn invoke_call<R>(&self, position: usize, call: impl FnOnce() -> R) -> R {
        if !self.registry.is_active(self.base_slot) || self.registry.generation() != self.generation {
            return call();
        }
        let probe = self
            .inserted
            .iter()
            .find(|c| c.position == position)
            .filter(|c| self.registry.is_active(c.slot))
            .and_then(|c| self.registry.probe(c.slot));
        match probe {
            Some(probe) => {
                let _guard = ProbeGuard::start(probe, self.clock.as_ref());
                call()
            }
            None => call(),
        }
    }
}
