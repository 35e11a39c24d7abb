//! Idle-cooldown state machine
//!
//! ```text
//!            begin_profiling            end_profiling
//!   Idle ───────────────────► Profiling ─────────────► CoolingDown(deadline)
//!    ▲                            ▲                        │        │
//!    │                            └──── begin_profiling ───┘        │ tick(now ≥ deadline)
//!    │                                                              ▼
//!    └──────────────────────── begin_profiling ─────────────── Cleaned
//! ```
//!
//! The machine only decides; the engine performs the teardown when
//! [`Lifecycle::tick`] reports [`Transition::Cleanup`]. Time is read from the
//! injected clock, so cancellation and expiry are deterministic under test.

use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Profiling,
    CoolingDown { deadline: Duration },
    Cleaned,
}

/// What a state change asks the owner to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Pending teardown was cancelled by renewed profiling
    Cancelled,
    /// Quiescent period elapsed: tear everything down now
    Cleanup,
}

pub struct Lifecycle {
    state: LifecycleState,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl Lifecycle {
    pub fn new(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: LifecycleState::Idle,
            cooldown,
            clock,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_profiling(&self) -> bool {
        self.state == LifecycleState::Profiling
    }

    /// A profiling request arrived
    pub fn begin_profiling(&mut self) -> Transition {
        let transition = match self.state {
            LifecycleState::CoolingDown { .. } => {
                info!("Profiling resumed; cleanup cancelled");
                Transition::Cancelled
            }
            _ => Transition::None,
        };
        self.state = LifecycleState::Profiling;
        transition
    }

    /// The last profiling request ended; start the quiescent countdown
    pub fn end_profiling(&mut self) {
        if self.state == LifecycleState::Profiling {
            let deadline = self.clock.now() + self.cooldown;
            debug!("Cooldown started, cleanup in {:?}", self.cooldown);
            self.state = LifecycleState::CoolingDown { deadline };
        }
    }

    /// Advance the machine against the clock
    pub fn tick(&mut self) -> Transition {
        match self.state {
            LifecycleState::CoolingDown { deadline } if self.clock.now() >= deadline => {
                info!("Cooldown elapsed; cleaning up instrumentation");
                self.state = LifecycleState::Cleaned;
                Transition::Cleanup
            }
            _ => Transition::None,
        }
    }
}
