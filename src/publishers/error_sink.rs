use crate::publishers::PublishError;

/// Where failed publishes end up.
///
/// `publish` never returns an error to its caller: connection, declaration and publishing
/// failures are handed over to the publisher's `ErrorSink` instead, exactly once per failed call.
///
/// Any `Fn(PublishError) + Send + Sync + 'static` closure is an `ErrorSink`.
/// Implementations must not panic.
pub trait ErrorSink: Send + Sync + 'static {
    fn handle(&self, error: PublishError);
}

/// The default [`ErrorSink`]: it logs the error and moves on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn handle(&self, error: PublishError) {
        tracing::error!(error = ?error, "Failed to publish message to RabbitMq");
    }
}

impl<F> ErrorSink for F
where
    F: Fn(PublishError) + Send + Sync + 'static,
{
    fn handle(&self, error: PublishError) {
        self(error)
    }
}
