//! Synchronous event emission with a crash-proof sink boundary.
//!
//! The sink is operator-supplied code running on the request path, so the
//! emitter treats it as untrusted: a panicking sink is caught and logged,
//! never propagated into the admission pipeline.

use crate::models::event::LimitEvent;
use log::{error, trace};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Operator-supplied event sink. Invoked synchronously, once per record.
pub type EventSink = Arc<dyn Fn(&LimitEvent) + Send + Sync>;

/// Wraps the optional sink. Cheap to clone; all clones share the sink.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sink: Option<EventSink>,
}

impl EventEmitter {
    pub fn new(sink: Option<EventSink>) -> Self {
        Self { sink }
    }

    /// Delivers one record to the sink, swallowing any panic it raises.
    pub fn emit(&self, event: LimitEvent) {
        let Some(ref sink) = self.sink else {
            trace!("no event sink configured, dropping {:?}", event.event_type);
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| sink(&event)));
        if outcome.is_err() {
            error!(
                "event sink panicked on {:?} for user={} endpoint={}",
                event.event_type, event.user, event.endpoint
            );
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::EventType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn events_reach_the_sink() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_sink = seen.clone();
        let emitter = EventEmitter::new(Some(Arc::new(move |_event| {
            seen_in_sink.fetch_add(1, Ordering::SeqCst);
        })));
        emitter.emit(LimitEvent::new(EventType::Allowed, "u", "free", "GET|/x"));
        emitter.emit(LimitEvent::new(EventType::Blocked, "u", "free", "GET|/x"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_sink_is_contained() {
        let emitter = EventEmitter::new(Some(Arc::new(|_event| {
            panic!("sink exploded");
        })));
        // Must not propagate.
        emitter.emit(LimitEvent::new(EventType::Allowed, "u", "free", "GET|/x"));
    }

    #[test]
    fn missing_sink_is_a_no_op() {
        EventEmitter::new(None).emit(LimitEvent::new(EventType::Allowed, "u", "free", "GET|/x"));
    }
}
