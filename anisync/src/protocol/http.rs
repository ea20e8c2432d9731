use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use super::{CommandLimiter, TransportError, command_limiter, wait_for_turn};
use crate::error::ProtocolError;
use crate::penalty::{PenaltyTracker, SubProtocol};
use crate::telemetry::protocol_span;

/// Status and body of an HTTP reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// HTTP client used for the provider's XML side channel.
#[async_trait]
pub trait HttpChannel: Send + Sync + fmt::Debug {
    async fn get(&self, url: &str) -> Result<HttpReply, TransportError>;
}

const BAN_MARKER: &str = "<error>banned</error>";
const MESSAGE_LIMIT: usize = 200;

/// Ban bookkeeping around an [`HttpChannel`].
pub struct HttpGuard {
    channel: Arc<dyn HttpChannel>,
    penalties: Arc<PenaltyTracker>,
    limiter: Option<CommandLimiter>,
}

impl fmt::Debug for HttpGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGuard")
            .field("channel", &self.channel)
            .field("rate_limited", &self.limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpGuard {
    pub fn new(
        channel: Arc<dyn HttpChannel>,
        penalties: Arc<PenaltyTracker>,
        request_interval: Duration,
    ) -> Self {
        Self {
            channel,
            penalties,
            limiter: command_limiter(request_interval),
        }
    }

    /// Fetches `url` and returns the body of a successful reply.
    ///
    /// Refuses to send while the HTTP sub-protocol is penalised. A 503 or a
    /// body carrying the ban marker records a ban; any other reply lifts it.
    pub async fn fetch(&self, url: &str) -> Result<String, ProtocolError> {
        let retry_in = self.penalties.retry_after(SubProtocol::Http);
        if !retry_in.is_zero() {
            return Err(ProtocolError::Banned {
                sub_protocol: SubProtocol::Http,
                retry_in,
            });
        }

        wait_for_turn(self.limiter.as_ref()).await;
        let reply = self
            .channel
            .get(url)
            .instrument(protocol_span("GET", SubProtocol::Http.as_str()))
            .await?;

        if reply.status == 503 || is_ban_body(&reply.body) {
            let reason = format!("HTTP {}", reply.status);
            self.penalties
                .mark_banned_because(SubProtocol::Http, None, Some(reason));
            return Err(ProtocolError::Banned {
                sub_protocol: SubProtocol::Http,
                retry_in: self.penalties.retry_after(SubProtocol::Http),
            });
        }

        self.penalties.mark_clear(SubProtocol::Http);
        match reply.status {
            200..=299 => Ok(reply.body),
            code @ 500..=599 => Err(ProtocolError::ServerError {
                code,
                message: truncate(&reply.body),
            }),
            code => Err(ProtocolError::Rejected {
                code,
                message: truncate(&reply.body),
            }),
        }
    }
}

fn is_ban_body(body: &str) -> bool {
    body.to_ascii_lowercase().contains(BAN_MARKER)
}

fn truncate(body: &str) -> String {
    body.chars().take(MESSAGE_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use crate::clock::ManualClock;
    use crate::penalty::PenaltyConfig;

    #[derive(Debug, Default)]
    struct FakeChannel {
        replies: Mutex<VecDeque<HttpReply>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl HttpChannel for FakeChannel {
        async fn get(&self, _url: &str) -> Result<HttpReply, TransportError> {
            *self.calls.lock() += 1;
            self.replies.lock().pop_front().ok_or(TransportError::Closed)
        }
    }

    fn guard(replies: Vec<HttpReply>) -> (HttpGuard, Arc<FakeChannel>, Arc<PenaltyTracker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let penalties = Arc::new(PenaltyTracker::new(PenaltyConfig::default(), clock.clone()));
        let channel = Arc::new(FakeChannel {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(0),
        });
        let guard = HttpGuard::new(channel.clone(), penalties.clone(), Duration::ZERO);
        (guard, channel, penalties, clock)
    }

    #[tokio::test]
    async fn ban_marker_in_body_bans_and_blocks() {
        let (guard, channel, penalties, _clock) =
            guard(vec![HttpReply::new(200, "<error>Banned</error>")]);

        let err = guard.fetch("http://api/anime?aid=1").await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Banned {
                sub_protocol: SubProtocol::Http,
                ..
            }
        ));
        assert!(penalties.is_banned(SubProtocol::Http));
        assert!(!penalties.is_banned(SubProtocol::Udp));

        assert!(guard.fetch("http://api/anime?aid=1").await.is_err());
        assert_eq!(*channel.calls.lock(), 1);
    }

    #[tokio::test]
    async fn request_after_expiry_clears_the_ban() {
        let (guard, _channel, penalties, clock) = guard(vec![
            HttpReply::new(503, "Service Unavailable"),
            HttpReply::new(200, "<anime id=\"1\"/>"),
        ]);

        assert!(guard.fetch("u").await.is_err());
        assert!(penalties.state(SubProtocol::Http).banned);

        clock.advance(PenaltyConfig::default().ban_window(SubProtocol::Http));
        assert_eq!(guard.fetch("u").await.unwrap(), "<anime id=\"1\"/>");
        assert!(!penalties.state(SubProtocol::Http).banned);
    }

    #[tokio::test]
    async fn error_statuses_map_to_errors() {
        let (guard, _channel, _penalties, _clock) = guard(vec![
            HttpReply::new(500, "oops"),
            HttpReply::new(404, "missing"),
        ]);

        assert!(matches!(
            guard.fetch("u").await,
            Err(ProtocolError::ServerError { code: 500, .. })
        ));
        assert!(matches!(
            guard.fetch("u").await,
            Err(ProtocolError::Rejected { code: 404, .. })
        ));
    }
}
