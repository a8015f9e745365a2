use crate::log_info;

/// Structured payload attached to every lifecycle notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyPayload {
    pub project: String,
    pub iteration: u32,
    pub story_id: Option<String>,
    pub model: String,
    /// Residual counts at the time of the event.
    pub pending: usize,
    pub blocked: usize,
    pub message: String,
}

/// Abstract outbound channel for lifecycle events. Implementations must
/// absorb transport failures silently; a broken sink never affects the run.
pub trait Notifier: Send + Sync {
    fn iteration_complete(&self, topic: &str, payload: &NotifyPayload);
    fn prd_complete(&self, topic: &str, payload: &NotifyPayload);
    fn error(&self, topic: &str, payload: &NotifyPayload);
    fn retry(&self, topic: &str, payload: &NotifyPayload);
    fn blocked(&self, topic: &str, payload: &NotifyPayload);
    fn max_iterations(&self, topic: &str, payload: &NotifyPayload);
}

/// Discards every event. Used when no topic is configured.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn iteration_complete(&self, _topic: &str, _payload: &NotifyPayload) {}
    fn prd_complete(&self, _topic: &str, _payload: &NotifyPayload) {}
    fn error(&self, _topic: &str, _payload: &NotifyPayload) {}
    fn retry(&self, _topic: &str, _payload: &NotifyPayload) {}
    fn blocked(&self, _topic: &str, _payload: &NotifyPayload) {}
    fn max_iterations(&self, _topic: &str, _payload: &NotifyPayload) {}
}

/// Logs events to stderr through the crate's leveled macros.
pub struct StderrNotifier;

impl StderrNotifier {
    fn emit(&self, event: &str, topic: &str, payload: &NotifyPayload) {
        log_info!(
            "[notify:{}] {} iteration={} story={} model={} pending={} blocked={} {}",
            topic,
            event,
            payload.iteration,
            payload.story_id.as_deref().unwrap_or("-"),
            payload.model,
            payload.pending,
            payload.blocked,
            payload.message,
        );
    }
}

impl Notifier for StderrNotifier {
    fn iteration_complete(&self, topic: &str, payload: &NotifyPayload) {
        self.emit("iteration-complete", topic, payload);
    }
    fn prd_complete(&self, topic: &str, payload: &NotifyPayload) {
        self.emit("prd-complete", topic, payload);
    }
    fn error(&self, topic: &str, payload: &NotifyPayload) {
        self.emit("error", topic, payload);
    }
    fn retry(&self, topic: &str, payload: &NotifyPayload) {
        self.emit("retry", topic, payload);
    }
    fn blocked(&self, topic: &str, payload: &NotifyPayload) {
        self.emit("blocked", topic, payload);
    }
    fn max_iterations(&self, topic: &str, payload: &NotifyPayload) {
        self.emit("max-iterations", topic, payload);
    }
}

/// Test double, kept public so driver and run-loop tests can assert on
/// emitted events (mirrors the mock agent runner).
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records `(event, topic, payload)` triples for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<(String, String, NotifyPayload)>>,
    }

    impl RecordingNotifier {
        fn record(&self, event: &str, topic: &str, payload: &NotifyPayload) {
            self.events.lock().unwrap().push((
                event.to_string(),
                topic.to_string(),
                payload.clone(),
            ));
        }

        pub fn event_names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(e, _, _)| e.clone())
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn iteration_complete(&self, topic: &str, payload: &NotifyPayload) {
            self.record("iteration-complete", topic, payload);
        }
        fn prd_complete(&self, topic: &str, payload: &NotifyPayload) {
            self.record("prd-complete", topic, payload);
        }
        fn error(&self, topic: &str, payload: &NotifyPayload) {
            self.record("error", topic, payload);
        }
        fn retry(&self, topic: &str, payload: &NotifyPayload) {
            self.record("retry", topic, payload);
        }
        fn blocked(&self, topic: &str, payload: &NotifyPayload) {
            self.record("blocked", topic, payload);
        }
        fn max_iterations(&self, topic: &str, payload: &NotifyPayload) {
            self.record("max-iterations", topic, payload);
        }
    }
}
