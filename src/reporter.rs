/// Sink for the user-facing messages of a dispatcher.
pub trait Reporter: Send + Sync {
    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn verbose(&self, _message: &str) {}
}

/// Warnings go to `tracing::warn!`, verbose messages are dropped. Nothing is
/// printed unless the application installs a subscriber.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {}
