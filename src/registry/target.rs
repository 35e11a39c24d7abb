//! Target descriptors and the patch-target sum type

use super::SlotId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Computes a probe key from the call's arguments. `None` opts the call out.
pub type KeyResolver<A> = Arc<dyn Fn(&A) -> Option<String> + Send + Sync>;

/// Computes the human-readable label shown for a dynamically keyed probe
pub type LabelResolver<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// Identity of one instrumentable call target: declaring type + simple name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub declaring_type: String,
    pub name: String,
}

impl TargetId {
    pub fn new(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
        }
    }

    /// Parse `"Type.Method"`; the last `.` separates the type from the name.
    /// A string without a `.` is a free function with an empty declaring type.
    pub fn parse(signature: &str) -> Self {
        match signature.rsplit_once('.') {
            Some((ty, name)) => Self::new(ty, name),
            None => Self::new("", signature),
        }
    }

    /// Stable registry key, e.g. `Foo.Bar`
    pub fn signature(&self) -> String {
        if self.declaring_type.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.declaring_type, self.name)
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// What the site-interception layer found when it examined a target's body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetBody {
    /// Has a concrete body that can be bracketed
    #[default]
    Concrete,
    /// Declared without a body
    Abstract,
    /// Implemented outside the host (FFI, runtime intrinsic)
    External,
    /// Only reachable through virtual dispatch, no concrete implementation
    VirtualOnly,
}

impl TargetBody {
    /// Why this body cannot be instrumented, or `None` when it can
    pub fn uninstrumentable_reason(&self) -> Option<&'static str> {
        match self {
            TargetBody::Concrete => None,
            TargetBody::Abstract => Some("target is abstract and has no body"),
            TargetBody::External => Some("target is marked external and cannot be examined"),
            TargetBody::VirtualOnly => {
                Some("target is virtually dispatched with no concrete implementation")
            }
        }
    }
}

/// Describes one interception point the caller wants timed.
///
/// Without resolvers the target takes the fast path: one slot, one probe,
/// created at registration. With a key resolver every distinct key gets its
/// own slot and probe on first use. A label resolver alone keeps the
/// signature as key but labels the probe lazily.
pub struct TargetDescriptor<A: ?Sized = ()> {
    pub target: TargetId,
    pub body: TargetBody,
    pub entries: Vec<String>,
    pub(crate) key_resolver: Option<KeyResolver<A>>,
    pub(crate) label_resolver: Option<LabelResolver<A>>,
}

impl<A: ?Sized> TargetDescriptor<A> {
    pub fn new(target: TargetId) -> Self {
        Self {
            target,
            body: TargetBody::Concrete,
            entries: Vec::new(),
            key_resolver: None,
            label_resolver: None,
        }
    }

    /// Shorthand for `TargetDescriptor::new(TargetId::parse(signature))`
    pub fn parse(signature: &str) -> Self {
        Self::new(TargetId::parse(signature))
    }

    /// Add the target to a named entry (category)
    pub fn in_entry(mut self, entry: impl Into<String>) -> Self {
        self.entries.push(entry.into());
        self
    }

    pub fn with_body(mut self, body: TargetBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_key<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&A) -> Option<String> + Send + Sync + 'static,
    {
        self.key_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_label<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.label_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn is_fast_path(&self) -> bool {
        self.key_resolver.is_none() && self.label_resolver.is_none()
    }
}

impl<A: ?Sized> Clone for TargetDescriptor<A> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            body: self.body,
            entries: self.entries.clone(),
            key_resolver: self.key_resolver.clone(),
            label_resolver: self.label_resolver.clone(),
        }
    }
}

impl<A: ?Sized> fmt::Debug for TargetDescriptor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDescriptor")
            .field("target", &self.target)
            .field("body", &self.body)
            .field("entries", &self.entries)
            .field("key_resolver", &self.key_resolver.is_some())
            .field("label_resolver", &self.label_resolver.is_some())
            .finish()
    }
}

/// One call instruction inside a body's call sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInstruction {
    pub target: TargetId,
    /// Argument list as rendered by the interception layer; ignored by the diff
    #[serde(default)]
    pub arguments: Vec<String>,
    /// The call was emitted by this instrumentation system itself
    #[serde(default)]
    pub instrumentation: bool,
}

impl CallInstruction {
    pub fn new(target: TargetId) -> Self {
        Self {
            target,
            arguments: Vec::new(),
            instrumentation: false,
        }
    }

    pub fn parse(signature: &str) -> Self {
        Self::new(TargetId::parse(signature))
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn instrumentation(mut self) -> Self {
        self.instrumentation = true;
        self
    }

    /// Identity used by the diff: name + declaring type, never the arguments,
    /// so overloads of one name compare equal.
    pub fn same_target(&self, other: &CallInstruction) -> bool {
        self.target == other.target
    }
}

/// A call that exists only in the current sequence and received its own slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedCall {
    /// Index in the current call sequence
    pub position: usize,
    pub target: TargetId,
    pub slot: SlotId,
}

/// A registered target and the slots it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchTarget {
    /// One call site, one slot
    Single {
        key: String,
        target: TargetId,
        slot: SlotId,
    },
    /// Several stages sharing one physical call boundary
    Multi {
        key: String,
        call_site: TargetId,
        stages: Vec<(TargetId, SlotId)>,
    },
    /// Calls injected into a body relative to its baseline
    Diff {
        key: String,
        body: TargetId,
        base_slot: SlotId,
        inserted: Vec<InsertedCall>,
    },
}

impl PatchTarget {
    pub fn key(&self) -> &str {
        match self {
            PatchTarget::Single { key, .. }
            | PatchTarget::Multi { key, .. }
            | PatchTarget::Diff { key, .. } => key,
        }
    }

    /// Slot identifying the target as a whole
    pub fn primary_slot(&self) -> SlotId {
        match self {
            PatchTarget::Single { slot, .. } => *slot,
            PatchTarget::Multi { stages, .. } => {
                stages.first().map(|(_, s)| *s).unwrap_or(SlotId::UNASSIGNED)
            }
            PatchTarget::Diff { base_slot, .. } => *base_slot,
        }
    }

    pub fn slots(&self) -> Vec<SlotId> {
        match self {
            PatchTarget::Single { slot, .. } => vec![*slot],
            PatchTarget::Multi { stages, .. } => stages.iter().map(|(_, s)| *s).collect(),
            PatchTarget::Diff {
                base_slot,
                inserted,
                ..
            } => std::iter::once(*base_slot)
                .chain(inserted.iter().map(|c| c.slot))
                .collect(),
        }
    }

    /// Slot a registration under `key` refers to.
    ///
    /// A multi-target stage or diff insert registered by its own signature
    /// resolves to its own slot, anything else to the primary slot.
    pub fn slot_for(&self, key: &str) -> SlotId {
        self.resolve_slot(key).unwrap_or_else(|| self.primary_slot())
    }

    /// Resolve a registry key (own key or one of the sub-keys) to its slot
    pub fn resolve_slot(&self, key: &str) -> Option<SlotId> {
        match self {
            PatchTarget::Single { key: own, slot, .. } => (own == key).then_some(*slot),
            PatchTarget::Multi {
                key: own, stages, ..
            } => stages
                .iter()
                .find(|(target, _)| target.signature() == key)
                .map(|(_, slot)| *slot)
                .or_else(|| (own == key).then(|| self.primary_slot())),
            PatchTarget::Diff {
                key: own,
                base_slot,
                inserted,
                ..
            } => {
                if own == key {
                    return Some(*base_slot);
                }
                inserted
                    .iter()
                    .find(|call| diff_sub_key(own, &call.target) == key)
                    .map(|call| call.slot)
            }
        }
    }
}

/// Registry key of a call injected into `body_key`
pub fn diff_sub_key(body_key: &str, call: &TargetId) -> String {
    format!("{} : {}", body_key, call.signature())
}
