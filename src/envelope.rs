//! Uniform single-or-batch carrier type passed between stages.
use std::sync::Arc;

/// Identity of an [`Envelope`], used by [`crate::ParallelStage`] to key its
/// completion ledger.
///
/// Rather than requiring `T: Hash + Eq` (and risking two structurally-equal
/// but logically distinct items conflating their join counters, see
/// `SPEC_FULL.md` §9), every envelope boxes its payload in an [`Arc`] at
/// construction and identity is the `Arc`'s pointer address. Two envelopes
/// constructed from separate calls to [`Envelope::single`]/[`Envelope::batch`]
/// always get distinct identities, even if their contents compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnvelopeId(usize);

/// An immutable tagged value carrying either exactly one `T`, a finite batch
/// of `T`, or nothing.
///
/// The runtime never mutates a payload once constructed; it is shared
/// read-only across workers (and, for [`crate::ParallelStage`], across every
/// child).
pub enum Envelope<T> {
    /// Exactly one item.
    Single(Arc<T>),
    /// A finite, ordered batch of items.
    Batch(Arc<Vec<T>>),
    /// No payload. Valid to send through a stage but `value()`/`array()`
    /// both return `None`.
    Empty,
}

// Cloning only ever touches the `Arc` pointers, so this must not derive a
// `T: Clone` bound the way `#[derive(Clone)]` would.
impl<T> Clone for Envelope<T> {
    fn clone(&self) -> Self {
        match self {
            Envelope::Single(v) => Envelope::Single(v.clone()),
            Envelope::Batch(v) => Envelope::Batch(v.clone()),
            Envelope::Empty => Envelope::Empty,
        }
    }
}

impl<T> Envelope<T> {
    /// Wraps a single item.
    pub fn single(value: T) -> Self {
        Envelope::Single(Arc::new(value))
    }

    /// Wraps a batch of items.
    pub fn batch(values: Vec<T>) -> Self {
        Envelope::Batch(Arc::new(values))
    }

    /// The empty envelope.
    pub fn empty() -> Self {
        Envelope::Empty
    }

    /// Returns the single value, if this envelope holds case (a).
    pub fn value(&self) -> Option<&T> {
        match self {
            Envelope::Single(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the batch of values, if this envelope holds case (b).
    pub fn array(&self) -> Option<&[T]> {
        match self {
            Envelope::Batch(v) => Some(v),
            _ => None,
        }
    }

    /// Returns `true` if this envelope carries no payload.
    pub fn is_empty(&self) -> bool {
        matches!(self, Envelope::Empty)
    }

    /// Identity used for join tracking. Two envelopes built from distinct
    /// `single`/`batch` calls never collide, regardless of `T`'s contents.
    /// [`Envelope::Empty`] has no stable identity: callers must not send
    /// empty envelopes through a [`crate::ParallelStage`].
    pub fn identity(&self) -> Option<EnvelopeId> {
        match self {
            Envelope::Single(v) => Some(EnvelopeId(Arc::as_ptr(v) as usize)),
            Envelope::Batch(v) => Some(EnvelopeId(Arc::as_ptr(v) as usize)),
            Envelope::Empty => None,
        }
    }
}
