//! Observability event bus shared by every resilience primitive.
//!
//! Breakers, limiters, and the credential provider all emit state-change
//! notifications through the same `EventListeners<E>` collection so that a
//! single subscriber (metrics exporter, log sink, test harness) can observe
//! all of them without each primitive inventing its own notification path.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "tracing")]
use std::any::Any;

/// An event emitted by a resilience primitive.
pub trait FisoEvent: Send + Sync + fmt::Debug {
    /// e.g. "state_transition", "call_rejected".
    fn event_type(&self) -> &'static str;
    fn timestamp(&self) -> Instant;
    /// Name of the target this event concerns.
    fn target_name(&self) -> &str;
}

/// Subscriber for [`FisoEvent`]s of one concrete type.
pub trait EventListener<E: FisoEvent>: Send + Sync {
    fn on_event(&self, event: &E);
}

pub type BoxedEventListener<E> = Arc<dyn EventListener<E>>;

/// A collection of listeners for one event type.
#[derive(Clone)]
pub struct EventListeners<E: FisoEvent> {
    listeners: Vec<BoxedEventListener<E>>,
}

impl<E: FisoEvent> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits to every listener. A panicking listener is caught so the
    /// remaining listeners still run.
    pub fn emit(&self, event: &E) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));

            if let Err(_panic_payload) = result {
                #[cfg(feature = "tracing")]
                log_listener_panic(index, event, _panic_payload.as_ref());

                #[cfg(feature = "metrics")]
                record_listener_panic_metric(event);

                #[cfg(not(feature = "tracing"))]
                let _ = index;

                #[cfg(not(any(feature = "tracing", feature = "metrics")))]
                let _ = _panic_payload;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: FisoEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts a plain closure into an [`EventListener`].
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _phantom: std::marker::PhantomData<E>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: FisoEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}

#[cfg(feature = "tracing")]
fn log_listener_panic<E: FisoEvent>(index: usize, event: &E, panic_payload: &(dyn Any + Send)) {
    let panic_message = panic_payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic_payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());

    tracing::warn!(
        listener_index = index,
        target = event.target_name(),
        event_type = event.event_type(),
        panic_message = %panic_message,
        "fiso event listener panicked"
    );
}

#[cfg(feature = "metrics")]
fn record_listener_panic_metric<E: FisoEvent>(event: &E) {
    metrics::counter!(
        "fiso_event_listener_panics_total",
        "target" => event.target_name().to_string(),
        "event_type" => event.event_type().to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestEvent {
        target: String,
        timestamp: Instant,
    }

    impl FisoEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            "test"
        }
        fn timestamp(&self) -> Instant {
            self.timestamp
        }
        fn target_name(&self) -> &str {
            &self.target
        }
    }

    #[test]
    fn listeners_are_all_invoked() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(move |_: &TestEvent| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let event = TestEvent {
            target: "svc".into(),
            timestamp: Instant::now(),
        };

        listeners.emit(&event);
        listeners.emit(&event);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let survived = Arc::new(AtomicUsize::new(0));
        let survived_clone = Arc::clone(&survived);

        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(|_: &TestEvent| panic!("boom")));
        listeners.add(FnListener::new(move |_: &TestEvent| {
            survived_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let event = TestEvent {
            target: "svc".into(),
            timestamp: Instant::now(),
        };

        listeners.emit(&event);
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }
}
