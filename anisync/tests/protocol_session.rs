//! Provider session handling against a scripted transport: re-login after
//! an invalid session, busy and ban replies, lost datagrams, and the way
//! protocol failures turn into job outcomes. One test runs against a local
//! UDP responder that answers late.

use std::sync::Arc;
use std::time::Duration;

use anisync::protocol::{
    ClientConfig, Credentials, GetAnime, Ping, ReturnCode, TextEncoding, UdpClient, UdpTransport,
};
use anisync::{
    AniDbSettings, CancellationToken, JobDescriptor, JobExecutor, JobInput, JobOutcome, JobRegistry, JobState,
    Clock, ManualClock, PenaltyConfig, PenaltyTracker, Priority, ProtocolError, SchedulerConfig,
    SubProtocol, SubProtocolAvailable,
};
use anisync_testkit::{aid, run_once, SchedulerFixture, ScriptedTransport};
use async_trait::async_trait;
use tokio::net::UdpSocket;

fn client_config() -> ClientConfig {
    ClientConfig {
        credentials: Credentials::new("user", "secret"),
        command_interval: Duration::ZERO,
        reply_timeout: Duration::from_millis(5),
        max_timeout_retries: 2,
        preferred_encoding: TextEncoding::Ascii,
        ..ClientConfig::default()
    }
}

fn client(transport: Arc<ScriptedTransport>, penalties: Arc<PenaltyTracker>) -> UdpClient {
    UdpClient::new(
        client_config(),
        transport,
        penalties,
        Arc::new(ManualClock::starting_now()),
    )
}

fn standalone() -> (UdpClient, Arc<ScriptedTransport>, Arc<PenaltyTracker>) {
    let transport = Arc::new(ScriptedTransport::new());
    let penalties = Arc::new(PenaltyTracker::new(
        PenaltyConfig::default(),
        Arc::new(ManualClock::starting_now()),
    ));
    (client(transport.clone(), penalties.clone()), transport, penalties)
}

#[tokio::test]
async fn invalid_session_logs_in_again_and_resends_once() {
    let (client, transport, _) = standalone();
    transport
        .reply("200 tok1 LOGIN ACCEPTED")
        .reply("506 INVALID SESSION")
        .reply("200 tok2 LOGIN ACCEPTED")
        .reply("230 ANIME\n1|2013|TV Series|Shingeki no Kyojin");

    let response = client.send_with_relogin(&GetAnime::new(1)).await.unwrap();
    assert_eq!(response.code, ReturnCode::Anime);
    assert_eq!(response.payload.unwrap().romaji_name, "Shingeki no Kyojin");

    assert_eq!(transport.sent_commands(), vec!["AUTH", "ANIME", "AUTH", "ANIME"]);
    let sent = transport.sent();
    assert!(sent[1].ends_with("&s=tok1"));
    assert!(sent[3].ends_with("&s=tok2"));
    assert_eq!(client.session().unwrap().token(), "tok2");
}

#[tokio::test]
async fn second_invalid_session_is_not_retried_again() {
    let (client, transport, _) = standalone();
    transport
        .reply("200 tok1 LOGIN ACCEPTED")
        .reply("506 INVALID SESSION")
        .reply("200 tok2 LOGIN ACCEPTED")
        .reply("506 INVALID SESSION");

    let err = client.send_with_relogin(&GetAnime::new(1)).await.unwrap_err();
    assert!(matches!(err, ProtocolError::SessionExpired));
    assert!(matches!(err.outcome(), JobOutcome::Retry { .. }));
    transport.assert_sent_count_eq(4);
    assert!(!client.is_logged_in());
}

#[tokio::test]
async fn busy_reply_backs_off_without_sending_more() {
    let (client, transport, penalties) = standalone();
    transport
        .reply("200 tok LOGIN ACCEPTED")
        .reply("602 SERVER BUSY");

    let err = client.send(&GetAnime::new(1)).await.unwrap_err();
    assert!(matches!(err, ProtocolError::ServerBusy { .. }));
    assert!(matches!(err.outcome(), JobOutcome::Deferred { .. }));
    assert!(!penalties.is_banned(SubProtocol::Udp));
    assert!(!penalties.retry_after(SubProtocol::Udp).is_zero());

    let again = client.send(&Ping).await.unwrap_err();
    assert!(matches!(again, ProtocolError::ServerBusy { .. }));
    transport.assert_sent_count_eq(2);
}

#[tokio::test]
async fn lost_replies_are_resent_until_the_retry_limit() {
    let (client, transport, _) = standalone();

    let err = client.login().await.unwrap_err();
    assert!(matches!(err, ProtocolError::TransportTimeout { attempts: 3 }));
    assert_eq!(transport.sent_commands(), vec!["AUTH", "AUTH", "AUTH"]);

    let sent = transport.sent();
    assert!(sent.iter().all(|command| command == &sent[0]));
}

#[tokio::test]
async fn resubmit_reply_repeats_the_same_datagram() {
    let (client, transport, _) = standalone();
    transport
        .reply("604 TIMEOUT - DELAY AND RESUBMIT")
        .reply("300 PONG");

    client.ping().await.unwrap();
    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
}

/// Looks up an anime through the shared client.
struct AnimeLookup {
    client: Arc<UdpClient>,
}

#[async_trait]
impl JobExecutor for AnimeLookup {
    async fn execute(&self, input: &JobInput, cancel: CancellationToken) -> JobOutcome {
        let Some(anime_id) = input.get_u64("aid") else {
            return JobOutcome::fail("missing aid");
        };
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }
        match self.client.send_with_relogin(&GetAnime::new(anime_id)).await {
            Ok(response) if response.payload.is_some() => JobOutcome::Success,
            Ok(_) => JobOutcome::fail(format!("anime {anime_id} does not exist")),
            Err(err) => err.outcome(),
        }
    }
}

#[tokio::test]
async fn ban_reply_defers_the_job_and_gates_the_kind() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .reply("200 tok LOGIN ACCEPTED")
        .reply("555 BANNED\nflooding");

    let scripted = transport.clone();
    let f = SchedulerFixture::build(SchedulerConfig::default(), move |penalties| {
        let client = Arc::new(client(scripted, penalties.clone()));
        JobRegistry::builder().register(
            JobDescriptor::new("anidb.get_anime")
                .key_field("aid")
                .requires(SubProtocolAvailable::new(penalties, SubProtocol::Udp)),
            AnimeLookup { client },
        )
    })
    .unwrap();

    let created = f
        .scheduler
        .submit("anidb.get_anime", aid(1), Priority::NORMAL)
        .await
        .unwrap();
    assert_eq!(
        run_once(&f.scheduler, "w1").await.unwrap(),
        Some((created.job_id(), JobState::Pending))
    );
    assert!(f.penalties.is_banned(SubProtocol::Udp));

    let status = f.scheduler.status(created.job_id()).await.unwrap().unwrap();
    assert_eq!(status.attempts, 0);
    assert!(status.eligible_at.unwrap() > f.clock.now());

    f.clock.advance(Duration::from_secs(10 * 60));
    assert!(run_once(&f.scheduler, "w1").await.unwrap().is_none());
    transport.assert_sent_count_eq(2);
}

/// Local stand-in for the provider. Echoes the request tag like the real
/// service and holds back the reply to the first PING for `first_ping_delay`.
async fn slow_responder(first_ping_delay: Duration) -> std::net::SocketAddr {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        let mut pings = 0;
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let command = String::from_utf8_lossy(&buf[..len]).to_string();
            let tag = command
                .split([' ', '&'])
                .find_map(|param| param.strip_prefix("tag="))
                .unwrap_or_default()
                .to_string();

            let (body, delay) = match command.split(' ').next() {
                Some("PING") => {
                    pings += 1;
                    let delay = (pings == 1).then_some(first_ping_delay);
                    ("300 PONG", delay)
                }
                Some("AUTH") => ("200 tok LOGIN ACCEPTED", None),
                Some("LOGOUT") => ("203 LOGGED OUT", None),
                _ => ("598 UNKNOWN COMMAND", None),
            };
            let reply = format!("{tag} {body}");
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = socket.send_to(reply.as_bytes(), peer).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn late_udp_reply_does_not_answer_the_next_command() {
    let server = slow_responder(Duration::from_millis(80)).await;
    let settings = AniDbSettings {
        server_host: server.ip().to_string(),
        server_port: server.port(),
        client_port: 0,
        ..AniDbSettings::default()
    };
    let transport = Arc::new(UdpTransport::connect(&settings).await.unwrap());
    let penalties = Arc::new(PenaltyTracker::new(
        PenaltyConfig::default(),
        Arc::new(ManualClock::starting_now()),
    ));
    let config = ClientConfig {
        reply_timeout: Duration::from_millis(50),
        ..client_config()
    };
    let client = UdpClient::new(
        config,
        transport,
        penalties.clone(),
        Arc::new(ManualClock::starting_now()),
    );

    client.ping().await.unwrap();
    let session = client.login().await.unwrap();
    assert_eq!(session.token(), "tok");

    tokio::time::sleep(Duration::from_millis(60)).await;
    client.ping().await.unwrap();
    assert!(client.logout().await.unwrap());
    assert!(!penalties.is_banned(SubProtocol::Udp));
}
