//! Session-based upstream protocol.
//!
//! [`UdpClient`] owns the single session with the provider: it logs in on
//! demand, attaches the session token, spaces commands with a rate limiter
//! and turns ban, busy and session-invalid replies into [`PenaltyTracker`]
//! updates before typed [`Request`]s parse what is left. [`HttpGuard`] does
//! the ban bookkeeping for the HTTP side channel.
//!
//! [`PenaltyTracker`]: crate::penalty::PenaltyTracker

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

mod client;
mod codec;
mod http;
mod request;
mod return_code;
mod session;
mod transport;

pub use client::{ClientConfig, Credentials, KeepAliveAction, UdpClient};
pub use codec::{
    build_command, decode_reply, escape_value, mask_command, split_tag, RawReply, TextEncoding,
};
pub use http::{HttpChannel, HttpGuard, HttpReply};
pub use request::{
    AnimeInfo, FileInfo, GetAnime, GetFile, Login, LoginAccepted, Logout, Ping, Request, Response,
};
pub use return_code::ReturnCode;
pub use session::Session;
pub use transport::{Transport, TransportError, UdpTransport};

pub(crate) type CommandLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One command per `interval`, no bursts. `None` for a zero interval.
pub(crate) fn command_limiter(interval: Duration) -> Option<CommandLimiter> {
    Quota::with_period(interval)
        .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)))
}

pub(crate) async fn wait_for_turn(limiter: Option<&CommandLimiter>) {
    if let Some(limiter) = limiter {
        limiter.until_ready().await;
    }
}
