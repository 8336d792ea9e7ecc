use tracing::error;

/// Sink for uncaught errors. Fire-and-forget observability only; never on
/// the control-flow critical path.
pub trait ErrorReporter: Send + Sync {
  fn capture(&self, context: &str, error: &dyn std::fmt::Display);
}

/// Default reporter that forwards to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
  fn capture(&self, context: &str, error: &dyn std::fmt::Display) {
    error!("{context}: {error}");
  }
}
