//! Event types for the NSI event system
//!
//! Provides shared event definitions and the EventBus used by the pipeline, the gateway
//! and the SSE endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// NSI event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NsiEvent {
    /// A normalization job began (or resumed) processing
    JobStarted {
        job_id: Uuid,
        total_count: u64,
        /// Records already counted by an earlier run
        resumed_from: u64,
        timestamp: DateTime<Utc>,
    },

    /// Periodic progress while a batch is being processed
    JobProgress {
        job_id: Uuid,
        processed_count: u64,
        total_count: u64,
        progress_percent: f64,
        timestamp: DateTime<Utc>,
    },

    /// A batch boundary was persisted
    BatchCheckpointed {
        job_id: Uuid,
        batch_id: u64,
        processed_count: u64,
        total_count: u64,
        timestamp: DateTime<Utc>,
    },

    JobCompleted {
        job_id: Uuid,
        processed_count: u64,
        failed_count: u64,
        manual_review_count: u64,
        duration_seconds: u64,
        timestamp: DateTime<Utc>,
    },

    JobCancelled {
        job_id: Uuid,
        processed_count: u64,
        timestamp: DateTime<Utc>,
    },

    JobFailed {
        job_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Circuit breaker of one provider changed state
    CircuitStateChanged {
        provider: String,
        old_state: String,
        new_state: String,
        failure_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// Provider priority order was recomputed
    ProvidersRanked {
        ranking: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A record could not be resolved with enough confidence
    RecordFlaggedForReview {
        job_id: Uuid,
        record_id: i64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl NsiEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            NsiEvent::JobStarted { .. } => "JobStarted",
            NsiEvent::JobProgress { .. } => "JobProgress",
            NsiEvent::BatchCheckpointed { .. } => "BatchCheckpointed",
            NsiEvent::JobCompleted { .. } => "JobCompleted",
            NsiEvent::JobCancelled { .. } => "JobCancelled",
            NsiEvent::JobFailed { .. } => "JobFailed",
            NsiEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
            NsiEvent::ProvidersRanked { .. } => "ProvidersRanked",
            NsiEvent::RecordFlaggedForReview { .. } => "RecordFlaggedForReview",
        }
    }

    /// Job the event belongs to, if any
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            NsiEvent::JobStarted { job_id, .. }
            | NsiEvent::JobProgress { job_id, .. }
            | NsiEvent::BatchCheckpointed { job_id, .. }
            | NsiEvent::JobCompleted { job_id, .. }
            | NsiEvent::JobCancelled { job_id, .. }
            | NsiEvent::JobFailed { job_id, .. }
            | NsiEvent::RecordFlaggedForReview { job_id, .. } => Some(*job_id),
            NsiEvent::CircuitStateChanged { .. } | NsiEvent::ProvidersRanked { .. } => None,
        }
    }
}

/// Broadcast bus for NsiEvent
///
/// Cloning is cheap; all clones share one channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<NsiEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before slow receivers start lagging
    ///
    /// # Examples
    ///
    /// ```
    /// use nsi_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<NsiEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: NsiEvent) -> Result<usize, broadcast::error::SendError<NsiEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: NsiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
