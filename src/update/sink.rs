//! Notification boundary towards UPnP subscribers.

use {
    async_channel::{Receiver, Sender, bounded},
    tracing::info,
};

use crate::error::domain::UpdateError;

/// Receives coalesced `id,generation,...` update strings.
pub trait UpdateSink: Send + Sync {
    /// Forwards one non-empty update string.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::SinkError` if the subscriber side is gone. The
    /// coalescer treats this as fatal.
    fn send_update(&self, update: &str) -> Result<(), UpdateError>;
}

/// Forwards updates over a bounded channel to the transport layer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<String>,
}

impl ChannelSink {
    /// Creates a sink and the receiver the transport layer reads from.
    pub fn new(capacity: usize) -> (Self, Receiver<String>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl UpdateSink for ChannelSink {
    fn send_update(&self, update: &str) -> Result<(), UpdateError> {
        self.sender
            .send_blocking(update.to_string())
            .map_err(|e| UpdateError::SinkError {
                reason: e.to_string(),
            })
    }
}

/// Logs updates; used when no transport is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl UpdateSink for LogSink {
    fn send_update(&self, update: &str) -> Result<(), UpdateError> {
        info!("ContentDirectory SystemUpdate: {}", update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::domain::UpdateError,
        update::sink::{ChannelSink, LogSink, UpdateSink},
    };

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, receiver) = ChannelSink::new(4);
        sink.send_update("5,1").unwrap();
        assert_eq!(receiver.try_recv().unwrap(), "5,1");
    }

    #[test]
    fn test_channel_sink_fails_when_closed() {
        let (sink, receiver) = ChannelSink::new(1);
        drop(receiver);
        let result = sink.send_update("5,1");
        assert!(matches!(result, Err(UpdateError::SinkError { .. })));
    }

    #[test]
    fn test_log_sink_accepts_everything() {
        assert!(LogSink.send_update("1,2").is_ok());
    }
}
