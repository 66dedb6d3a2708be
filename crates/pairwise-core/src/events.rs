//! Domain events, the broadcast event bus, and the transactional outbox.
//!
//! Components never emit from inside a store operation. They buffer events
//! in an [`Outbox`] while doing the unit of work and the component that
//! commits flushes them to the [`EventBus`] once the write succeeded. A
//! failed unit of work drops its outbox and nothing is published.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::context::RequestContext;

// ============================================================================
// Domain events
// ============================================================================

/// Something that happened to a job, record, rule or batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    JobEnqueued {
        job_id: Uuid,
        task_type: String,
    },
    JobPromoted {
        job_id: Uuid,
        dedupe_key: String,
    },
    JobCompleted {
        job_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        terminal: bool,
        error: String,
    },
    JobCancelled {
        job_id: Uuid,
    },
    JobsReclaimed {
        count: u64,
    },
    SimilarityRecordCreated {
        record_id: Uuid,
        pair_key: String,
    },
    SimilarityRecordReviewed {
        record_id: Uuid,
        status: String,
    },
    WorkflowTriggered {
        record_id: Uuid,
        workflow_map_id: String,
        process_id: String,
    },
    RuleChanged {
        rule_id: Uuid,
    },
    BatchStarted {
        batch_id: Uuid,
        jobs_spawned: usize,
    },
    BatchRefreshed {
        batch_id: Uuid,
        status: String,
    },
}

impl DomainEvent {
    /// Dot-namespaced event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::JobEnqueued { .. } => "job.enqueued",
            DomainEvent::JobPromoted { .. } => "job.promoted",
            DomainEvent::JobCompleted { .. } => "job.completed",
            DomainEvent::JobFailed { .. } => "job.failed",
            DomainEvent::JobCancelled { .. } => "job.cancelled",
            DomainEvent::JobsReclaimed { .. } => "job.reclaimed",
            DomainEvent::SimilarityRecordCreated { .. } => "similarity.created",
            DomainEvent::SimilarityRecordReviewed { .. } => "similarity.reviewed",
            DomainEvent::WorkflowTriggered { .. } => "workflow.triggered",
            DomainEvent::RuleChanged { .. } => "rule.changed",
            DomainEvent::BatchStarted { .. } => "batch.started",
            DomainEvent::BatchRefreshed { .. } => "batch.refreshed",
        }
    }
}

/// Event plus the context it was produced under.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// UUIDv7 for temporal ordering.
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub actor: String,
    pub payload: DomainEvent,
}

impl EventEnvelope {
    pub fn new(event: DomainEvent, ctx: &RequestContext) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            occurred_at: Utc::now(),
            request_id: ctx.request_id,
            tenant_id: ctx.tenant_id.clone(),
            actor: ctx.actor().to_string(),
            payload: event,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast bus for domain events.
///
/// Slow receivers that fall behind get `Lagged` and miss events. Emitting
/// with no subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: DomainEvent, ctx: &RequestContext) {
        let envelope = EventEnvelope::new(event, ctx);
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            request_id = %envelope.request_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ============================================================================
// Outbox
// ============================================================================

/// Events buffered inside a unit of work.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<DomainEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: DomainEvent) {
        self.pending.push(event);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Publish every buffered event in order and empty the outbox.
    pub fn flush(&mut self, bus: &EventBus, ctx: &RequestContext) -> usize {
        let count = self.pending.len();
        for event in self.pending.drain(..) {
            bus.emit(event, ctx);
        }
        count
    }
}
