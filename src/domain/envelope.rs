// src/domain/envelope.rs

//! The call envelope: the unit placed on a service queue.

use bytes::Bytes;
use std::sync::Arc;

/// One queued call.
///
/// A `CallEnvelope` is what producers append to a service queue and what the
/// dispatch loop reads back. Its shape on the broker is
/// `{ data: <payload bytes>, timeAt?: <decimal unix nanoseconds> }`; the
/// service name is the queue itself and the entry id is assigned by the
/// broker on append.
///
/// Three kinds of envelope share this type:
///
/// | `fire_at` | `payload`  | meaning                               |
/// |-----------|------------|---------------------------------------|
/// | `None`    | non-empty  | immediate call                        |
/// | `Some(t)` | non-empty  | deferred call, run at `t`             |
/// | `Some(t)` | empty      | cancellation tombstone for `t`        |
///
/// An envelope with neither payload nor fire time is the placeholder entry
/// written while provisioning a queue; it carries no call.
///
/// # Example
///
/// ```
/// # use stream_rpc::CallEnvelope;
/// # use bytes::Bytes;
/// let env = CallEnvelope::deferred("reminders", 1_700_000_000_000_000_000, Bytes::from_static(b"{}"));
/// assert!(env.is_deferred());
/// assert!(!env.is_tombstone());
///
/// let cancel = CallEnvelope::tombstone("reminders", 1_700_000_000_000_000_000);
/// assert!(cancel.is_tombstone());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallEnvelope {
    // ---
    /// Service (API) name; also the queue the envelope lives on.
    pub service: Arc<str>,

    /// Codec-encoded call input.
    pub payload: Bytes,

    /// Unix nanosecond fire time; present only for deferred calls and tombstones.
    pub fire_at: Option<i64>,

    /// Broker-assigned entry id, set on envelopes read back from a queue.
    pub entry_id: Option<Arc<str>>,
}

impl CallEnvelope {
    // ---
    /// Create an immediate call envelope.
    pub fn immediate(service: impl Into<Arc<str>>, payload: Bytes) -> Self {
        Self {
            service: service.into(),
            payload,
            fire_at: None,
            entry_id: None,
        }
    }

    /// Create a deferred call envelope that should run at `fire_at` (unix nanos).
    pub fn deferred(service: impl Into<Arc<str>>, fire_at: i64, payload: Bytes) -> Self {
        Self {
            service: service.into(),
            payload,
            fire_at: Some(fire_at),
            entry_id: None,
        }
    }

    /// Create a cancellation tombstone for the deferred call at `fire_at`.
    pub fn tombstone(service: impl Into<Arc<str>>, fire_at: i64) -> Self {
        Self {
            service: service.into(),
            payload: Bytes::new(),
            fire_at: Some(fire_at),
            entry_id: None,
        }
    }

    /// Attach the broker-assigned entry id.
    pub fn with_entry_id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.entry_id = Some(id.into());
        self
    }

    /// True for deferred calls and tombstones.
    pub fn is_deferred(&self) -> bool {
        self.fire_at.is_some()
    }

    /// True if this envelope cancels a pending deferred call.
    pub fn is_tombstone(&self) -> bool {
        self.fire_at.is_some() && self.payload.is_empty()
    }

    /// True for the provisioning placeholder, which carries no call at all.
    pub fn is_placeholder(&self) -> bool {
        self.fire_at.is_none() && self.payload.is_empty()
    }
}
