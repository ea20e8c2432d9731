use std::collections::VecDeque;
use std::time::Duration;

use anisync::protocol::{Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;

/// [`Transport`] that replays queued replies and records every datagram
/// sent. An empty queue behaves like a silent provider.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<Vec<u8>, ScriptedFailure>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

#[derive(Clone, Copy, Debug)]
enum ScriptedFailure {
    Timeout,
    Closed,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, text: &str) -> &Self {
        self.reply_bytes(text.as_bytes().to_vec())
    }

    pub fn reply_bytes(&self, bytes: Vec<u8>) -> &Self {
        self.replies.lock().push_back(Ok(bytes));
        self
    }

    /// Queues one lost reply.
    pub fn drop_reply(&self) -> &Self {
        self.replies.lock().push_back(Err(ScriptedFailure::Timeout));
        self
    }

    pub fn close(&self) -> &Self {
        self.replies.lock().push_back(Err(ScriptedFailure::Closed));
        self
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }

    /// Sent datagrams as text, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    /// First word of every sent datagram.
    pub fn sent_commands(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|text| text.split_whitespace().next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn assert_sent_count_eq(&self, expected: usize) {
        let actual = self.sent.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} datagrams, got {}: {:?}",
            expected,
            actual,
            self.sent()
        );
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sent.lock().push(bytes.to_vec());
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.replies.lock().pop_front() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(ScriptedFailure::Closed)) => Err(TransportError::Closed),
            Some(Err(ScriptedFailure::Timeout)) | None => Err(TransportError::Timeout(timeout)),
        }
    }
}
