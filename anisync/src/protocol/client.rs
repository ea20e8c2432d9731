use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use super::{
    CommandLimiter, Login, Logout, Ping, RawReply, Request, Response, ReturnCode, Session,
    TextEncoding, Transport, TransportError, build_command, command_limiter, decode_reply,
    mask_command, split_tag, wait_for_turn,
};
use crate::clock::{Clock, remaining};
use crate::config::{AniDbSettings, PenaltySettings};
use crate::error::ProtocolError;
use crate::penalty::{PenaltyTracker, SubProtocol};
use crate::runtime::CancellationToken;
use crate::telemetry::protocol_span;

/// Account used to log in.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Client behaviour derived from [`AniDbSettings`] and [`PenaltySettings`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub credentials: Credentials,
    pub client_name: String,
    pub client_version: u32,
    pub protocol_version: u32,
    pub reply_timeout: Duration,
    pub max_timeout_retries: u32,
    pub command_interval: Duration,
    pub ping_interval: Duration,
    pub logout_after_idle: Duration,
    pub preferred_encoding: TextEncoding,
    pub busy_backoff: Duration,
}

impl ClientConfig {
    pub fn from_settings(anidb: &AniDbSettings, penalty: &PenaltySettings) -> Self {
        Self {
            credentials: Credentials::new(anidb.username.clone(), anidb.password.clone()),
            client_name: anidb.client_name.clone(),
            client_version: anidb.client_version,
            protocol_version: anidb.protocol_version,
            reply_timeout: Duration::from_secs(anidb.reply_timeout_secs),
            max_timeout_retries: anidb.max_timeout_retries,
            command_interval: Duration::from_millis(anidb.command_interval_ms),
            ping_interval: Duration::from_secs(anidb.ping_interval_secs),
            logout_after_idle: Duration::from_secs(anidb.logout_after_idle_secs),
            preferred_encoding: if anidb.prefer_unicode {
                TextEncoding::Utf16Be
            } else {
                TextEncoding::Ascii
            },
            busy_backoff: Duration::from_secs(penalty.busy_backoff_secs),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_settings(&AniDbSettings::default(), &PenaltySettings::default())
    }
}

/// What a keep-alive tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    Pinged,
    LoggedOut,
}

#[derive(Default)]
struct ClientState {
    credentials: Credentials,
    session: Option<Session>,
    credentials_rejected: bool,
    last_activity: Option<DateTime<Utc>>,
    last_ping: Option<DateTime<Utc>>,
}

enum LoginAttempt {
    Accepted(Session),
    EncodingRefused,
}

/// Client for the provider's UDP API.
///
/// Calls are single-flight: one command is on the wire at a time, which is
/// what the provider's flood protection expects. Sharing one client behind an
/// `Arc` is the intended use.
pub struct UdpClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    penalties: Arc<PenaltyTracker>,
    clock: Arc<dyn Clock>,
    limiter: Option<CommandLimiter>,
    calls: tokio::sync::Mutex<()>,
    state: Mutex<ClientState>,
    next_tag: AtomicU64,
}

impl fmt::Debug for UdpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("UdpClient");
        debug.field("transport", &self.transport);
        match self.state.try_lock() {
            Some(state) => {
                debug.field("logged_in", &state.session.is_some());
                debug.field("credentials_rejected", &state.credentials_rejected);
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl UdpClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        penalties: Arc<PenaltyTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = ClientState {
            credentials: config.credentials.clone(),
            ..ClientState::default()
        };
        Self {
            limiter: command_limiter(config.command_interval),
            config,
            transport,
            penalties,
            clock,
            calls: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
            next_tag: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn penalties(&self) -> &Arc<PenaltyTracker> {
        &self.penalties
    }

    pub fn session(&self) -> Option<Session> {
        self.state.lock().session.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Replaces the credentials and forgets any earlier rejection. The
    /// current session is dropped so the next call logs in again.
    pub fn set_credentials(&self, credentials: Credentials) {
        let mut state = self.state.lock();
        state.credentials = credentials;
        state.credentials_rejected = false;
        state.session = None;
    }

    /// Sends `request`, logging in first when there is no session.
    pub async fn send<R: Request>(&self, request: &R) -> Result<Response<R::Payload>, ProtocolError> {
        let _call = self.calls.lock().await;
        self.send_locked(request).await
    }

    /// Like [`send`](Self::send), but logs in again and resends once when the
    /// provider reports the session as invalid.
    pub async fn send_with_relogin<R: Request>(
        &self,
        request: &R,
    ) -> Result<Response<R::Payload>, ProtocolError> {
        let _call = self.calls.lock().await;
        match self.send_locked(request).await {
            Err(ProtocolError::SessionExpired) => {
                tracing::debug!(command = request.command(), "session expired, resending after login");
                self.send_locked(request).await
            }
            other => other,
        }
    }

    pub async fn login(&self) -> Result<Session, ProtocolError> {
        let _call = self.calls.lock().await;
        self.ensure_available()?;
        self.login_locked().await
    }

    /// Ends the session. Returns `false` if there was none.
    pub async fn logout(&self) -> Result<bool, ProtocolError> {
        let _call = self.calls.lock().await;
        self.logout_locked().await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        let _call = self.calls.lock().await;
        self.ensure_available()?;
        self.dispatch(&Ping).await.map(|_| ())
    }

    /// Pings when idle past the ping interval and logs out when idle past
    /// the logout period. Does nothing while logged out or penalised.
    pub async fn keepalive_tick(&self) -> Result<KeepAliveAction, ProtocolError> {
        let _call = self.calls.lock().await;
        let now = self.clock.now();

        let (last_activity, last_contact) = {
            let state = self.state.lock();
            if state.session.is_none() {
                return Ok(KeepAliveAction::Idle);
            }
            let last_activity = state.last_activity.unwrap_or(now);
            let last_contact = state.last_ping.map_or(last_activity, |ping| ping.max(last_activity));
            (last_activity, last_contact)
        };
        if !self.penalties.retry_after(SubProtocol::Udp).is_zero() {
            return Ok(KeepAliveAction::Idle);
        }

        if remaining(last_activity, now) >= self.config.logout_after_idle {
            tracing::debug!("idle past the logout period");
            self.logout_locked().await?;
            return Ok(KeepAliveAction::LoggedOut);
        }
        if remaining(last_contact, now) >= self.config.ping_interval {
            self.dispatch(&Ping).await?;
            self.state.lock().last_ping = Some(now);
            return Ok(KeepAliveAction::Pinged);
        }
        Ok(KeepAliveAction::Idle)
    }

    /// Runs [`keepalive_tick`](Self::keepalive_tick) periodically until
    /// `cancel` fires.
    pub fn spawn_keepalive(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let period = client
            .config
            .ping_interval
            .min(client.config.logout_after_idle)
            .max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match client.keepalive_tick().await {
                    Ok(KeepAliveAction::Idle) => {}
                    Ok(action) => tracing::debug!(?action, "keep-alive"),
                    Err(err) => tracing::warn!(error = %err, "keep-alive failed"),
                }
            }
            tracing::debug!("keep-alive stopped");
        })
    }

    async fn send_locked<R: Request>(
        &self,
        request: &R,
    ) -> Result<Response<R::Payload>, ProtocolError> {
        self.ensure_available()?;
        if request.requires_session() && !self.is_logged_in() {
            self.login_locked().await?;
        }
        self.dispatch(request).await
    }

    async fn logout_locked(&self) -> Result<bool, ProtocolError> {
        if !self.is_logged_in() {
            return Ok(false);
        }
        let result = self.dispatch(&Logout).await;
        self.clear_session();
        result.map(|_| true)
    }

    /// Fails fast while the UDP sub-protocol is penalised.
    fn ensure_available(&self) -> Result<(), ProtocolError> {
        let retry_in = self.penalties.retry_after(SubProtocol::Udp);
        if retry_in.is_zero() {
            return Ok(());
        }
        if self.penalties.state(SubProtocol::Udp).banned {
            Err(ProtocolError::Banned {
                sub_protocol: SubProtocol::Udp,
                retry_in,
            })
        } else {
            Err(ProtocolError::ServerBusy {
                sub_protocol: SubProtocol::Udp,
                retry_in,
            })
        }
    }

    async fn dispatch<R: Request>(&self, request: &R) -> Result<Response<R::Payload>, ProtocolError> {
        let (token, encoding) = {
            let state = self.state.lock();
            match (&state.session, request.requires_session()) {
                (Some(session), true) => (Some(session.token().to_string()), session.encoding()),
                (None, true) => return Err(ProtocolError::SessionExpired),
                (session, false) => (
                    None,
                    session
                        .as_ref()
                        .map_or(self.config.preferred_encoding, Session::encoding),
                ),
            }
        };

        let tag = self.tag();
        let command = build_command(
            request.command(),
            &request.fields(),
            Some(&tag),
            token.as_deref(),
        );
        let reply = self.exchange(request.command(), &command, &tag, encoding).await?;
        let code = self.classify(&reply)?;
        let payload = request.parse(&reply)?;

        if request.counts_as_activity() {
            self.state.lock().last_activity = Some(self.clock.now());
        }
        Ok(Response { code, payload })
    }

    async fn login_locked(&self) -> Result<Session, ProtocolError> {
        let credentials = {
            let state = self.state.lock();
            if state.credentials_rejected {
                return Err(ProtocolError::LoginFailed {
                    reason: "credentials were rejected; set new ones to retry".to_string(),
                });
            }
            if !state.credentials.is_complete() {
                return Err(ProtocolError::LoginFailed {
                    reason: "no credentials configured".to_string(),
                });
            }
            state.credentials.clone()
        };

        let preferred = self.config.preferred_encoding;
        let first = self.try_login(&credentials, preferred).await;
        let result = match first {
            Ok(LoginAttempt::EncodingRefused)
            | Err(ProtocolError::Encoding { .. } | ProtocolError::ProtocolViolation { .. })
                if preferred != TextEncoding::Ascii =>
            {
                tracing::info!(refused = %preferred, "retrying login with ASCII");
                self.try_login(&credentials, TextEncoding::Ascii).await
            }
            other => other,
        };

        match result? {
            LoginAttempt::Accepted(session) => Ok(session),
            LoginAttempt::EncodingRefused => Err(ProtocolError::LoginFailed {
                reason: "no supported text encoding".to_string(),
            }),
        }
    }

    async fn try_login(
        &self,
        credentials: &Credentials,
        encoding: TextEncoding,
    ) -> Result<LoginAttempt, ProtocolError> {
        let request = Login {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            protocol_version: self.config.protocol_version,
            client_name: self.config.client_name.clone(),
            client_version: self.config.client_version,
            encoding,
        };
        let tag = self.tag();
        let command = build_command(request.command(), &request.fields(), Some(&tag), None);
        let reply = self.exchange(request.command(), &command, &tag, encoding).await?;
        let code = self.classify(&reply)?;

        match request.parse(&reply)? {
            Some(accepted) => {
                let now = self.clock.now();
                let session = Session::new(accepted.token, encoding, accepted.image_server, now);
                if code == ReturnCode::LoginAcceptedNewVersion {
                    tracing::warn!("provider reports a newer client version");
                }
                {
                    let mut state = self.state.lock();
                    state.session = Some(session.clone());
                    state.last_activity = Some(now);
                    state.last_ping = None;
                }
                tracing::info!(encoding = %encoding, "logged in");
                Ok(LoginAttempt::Accepted(session))
            }
            None if code == ReturnCode::EncodingNotSupported => Ok(LoginAttempt::EncodingRefused),
            None => {
                {
                    let mut state = self.state.lock();
                    state.credentials_rejected = true;
                    state.session = None;
                }
                tracing::error!(username = %credentials.username, "login rejected");
                Err(ProtocolError::LoginFailed {
                    reason: reply.status.clone(),
                })
            }
        }
    }

    fn tag(&self) -> String {
        format!("a{}", self.next_tag.fetch_add(1, Ordering::Relaxed))
    }

    /// Sends `command` and waits for its reply, resending the same bytes
    /// after timeouts and "resubmit" replies.
    async fn exchange(
        &self,
        name: &str,
        command: &str,
        tag: &str,
        encoding: TextEncoding,
    ) -> Result<RawReply, ProtocolError> {
        self.exchange_tagged(command, tag, encoding)
            .instrument(protocol_span(name, SubProtocol::Udp.as_str()))
            .await
    }

    async fn exchange_tagged(
        &self,
        command: &str,
        tag: &str,
        encoding: TextEncoding,
    ) -> Result<RawReply, ProtocolError> {
        let bytes = encoding.encode(command)?;
        let attempts = self.config.max_timeout_retries.saturating_add(1);

        let stale = self.transport.discard_pending();
        if stale > 0 {
            tracing::debug!(stale, "dropped unread replies");
        }

        for attempt in 1..=attempts {
            wait_for_turn(self.limiter.as_ref()).await;
            tracing::trace!(attempt, %encoding, command = %mask_command(command), "sending");
            self.transport.send(&bytes).await?;

            match self.await_reply(tag).await? {
                Some(reply) if reply.return_code() == ReturnCode::TimeoutDelayAndResubmit => {
                    tracing::warn!(attempt, "provider asked to resubmit");
                }
                Some(reply) => return Ok(reply),
                None => {
                    tracing::warn!(attempt, after = ?self.config.reply_timeout, "reply timed out");
                }
            }
        }
        Err(ProtocolError::TransportTimeout { attempts })
    }

    /// Waits up to the reply timeout for the reply tagged `tag`. Replies
    /// echoing another tag answer an earlier command that was resent after
    /// its reply ran late; they are dropped. `None` means the timeout passed.
    async fn await_reply(&self, tag: &str) -> Result<Option<RawReply>, ProtocolError> {
        let deadline = Instant::now() + self.config.reply_timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let datagram = match self.transport.receive(wait).await {
                Ok(datagram) => datagram,
                Err(TransportError::Timeout(_)) => return Ok(None),
                Err(err) => return Err(ProtocolError::from(err)),
            };

            // Indistinguishable from a dropped connection, so assume a ban.
            if datagram.iter().all(|byte| *byte == 0) {
                return Err(self.banned("empty reply"));
            }

            let text = decode_reply(&datagram)?;
            tracing::trace!(reply = %mask_command(&text), "received");
            match split_tag(&text) {
                (Some(echoed), _) if echoed != tag => {
                    tracing::debug!(expected = tag, echoed, "dropping late reply");
                }
                (_, body) => return RawReply::parse(body).map(Some),
            }
        }
    }

    /// Generic return-code handling shared by every request.
    fn classify(&self, reply: &RawReply) -> Result<ReturnCode, ProtocolError> {
        let code = reply.return_code();
        if code.is_ban() {
            let reason = reply.lines.first().unwrap_or(&reply.status).clone();
            return Err(self.banned(reason));
        }
        if code.is_busy() {
            self.penalties
                .mark_backoff(SubProtocol::Udp, self.config.busy_backoff, reply.status.clone());
            return Err(ProtocolError::ServerBusy {
                sub_protocol: SubProtocol::Udp,
                retry_in: self.penalties.retry_after(SubProtocol::Udp),
            });
        }

        self.penalties.mark_clear(SubProtocol::Udp);

        if code.is_session_invalid() {
            tracing::info!(%code, "session no longer valid");
            self.clear_session();
            return Err(ProtocolError::SessionExpired);
        }
        if code == ReturnCode::InternalServerError {
            return Err(ProtocolError::ServerError {
                code: reply.code,
                message: reply.status.clone(),
            });
        }
        if code.is_rejection() {
            return Err(ProtocolError::Rejected {
                code: reply.code,
                message: reply.status.clone(),
            });
        }
        Ok(code)
    }

    fn banned(&self, reason: impl Into<String>) -> ProtocolError {
        self.clear_session();
        self.penalties
            .mark_banned_because(SubProtocol::Udp, None, Some(reason));
        ProtocolError::Banned {
            sub_protocol: SubProtocol::Udp,
            retry_in: self.penalties.retry_after(SubProtocol::Udp),
        }
    }

    fn clear_session(&self) {
        let mut state = self.state.lock();
        state.session = None;
        state.last_ping = None;
    }
}
