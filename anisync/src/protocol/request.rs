use serde::{Deserialize, Serialize};

use super::{RawReply, ReturnCode, TextEncoding};
use crate::error::ProtocolError;

/// A typed command.
///
/// `parse` sees only replies that passed the client's generic code handling
/// (bans, expired sessions, busy and rejection codes never reach it). It
/// returns `Ok(None)` for codes that are part of the contract but carry no
/// payload, such as "no such file".
pub trait Request: Send + Sync {
    type Payload: Send;

    fn command(&self) -> &'static str;

    /// Parameters in wire order. Values are escaped by the client.
    fn fields(&self) -> Vec<(&'static str, String)>;

    fn requires_session(&self) -> bool {
        true
    }

    /// Whether sending this postpones the idle logout.
    fn counts_as_activity(&self) -> bool {
        true
    }

    fn parse(&self, reply: &RawReply) -> Result<Option<Self::Payload>, ProtocolError>;
}

/// Outcome of a request that passed generic handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response<T> {
    pub code: ReturnCode,
    pub payload: Option<T>,
}

/// `AUTH`. Built by the client from its credentials.
#[derive(Clone)]
pub struct Login {
    pub username: String,
    pub password: String,
    pub protocol_version: u32,
    pub client_name: String,
    pub client_version: u32,
    pub encoding: TextEncoding,
}

impl std::fmt::Debug for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Login")
            .field("username", &self.username)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginAccepted {
    pub token: String,
    pub image_server: Option<String>,
}

impl Request for Login {
    type Payload = LoginAccepted;

    fn command(&self) -> &'static str {
        "AUTH"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("user", self.username.clone()),
            ("pass", self.password.clone()),
            ("protover", self.protocol_version.to_string()),
            ("client", self.client_name.clone()),
            ("clientver", self.client_version.to_string()),
            ("enc", self.encoding.param().to_string()),
            ("imgserver", "1".to_string()),
        ]
    }

    fn requires_session(&self) -> bool {
        false
    }

    // Status text is `{token} [{image server}] LOGIN ACCEPTED`.
    fn parse(&self, reply: &RawReply) -> Result<Option<LoginAccepted>, ProtocolError> {
        match reply.return_code() {
            ReturnCode::LoginAccepted | ReturnCode::LoginAcceptedNewVersion => {
                let mut words = reply.status.split_whitespace();
                let token = words.next().ok_or_else(|| reply.violation())?;
                let image_server = words
                    .next()
                    .filter(|word| !word.eq_ignore_ascii_case("LOGIN"))
                    .map(str::to_string);
                Ok(Some(LoginAccepted {
                    token: token.to_string(),
                    image_server,
                }))
            }
            ReturnCode::LoginFailed | ReturnCode::EncodingNotSupported => Ok(None),
            _ => Err(reply.violation()),
        }
    }
}

/// `LOGOUT`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Logout;

impl Request for Logout {
    type Payload = ();

    fn command(&self) -> &'static str {
        "LOGOUT"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn counts_as_activity(&self) -> bool {
        false
    }

    fn parse(&self, reply: &RawReply) -> Result<Option<()>, ProtocolError> {
        match reply.return_code() {
            ReturnCode::LoggedOut => Ok(Some(())),
            _ => Err(reply.violation()),
        }
    }
}

/// `PING`. Works without a session.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ping;

impl Request for Ping {
    type Payload = ();

    fn command(&self) -> &'static str {
        "PING"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn requires_session(&self) -> bool {
        false
    }

    fn counts_as_activity(&self) -> bool {
        false
    }

    fn parse(&self, reply: &RawReply) -> Result<Option<()>, ProtocolError> {
        match reply.return_code() {
            ReturnCode::Pong => Ok(Some(())),
            _ => Err(reply.violation()),
        }
    }
}

/// Identifiers of a file the provider knows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: u64,
    pub anime_id: u64,
    pub episode_id: u64,
    pub group_id: u64,
}

/// `FILE` lookup by size and ED2K hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetFile {
    pub size: u64,
    pub ed2k: String,
}

impl GetFile {
    pub fn new(size: u64, ed2k: impl Into<String>) -> Self {
        Self {
            size,
            ed2k: ed2k.into(),
        }
    }
}

// Selects aid, eid and gid; the provider always prepends fid.
const FILE_FMASK: &str = "70000000";
const FILE_AMASK: &str = "00000000";

impl Request for GetFile {
    type Payload = FileInfo;

    fn command(&self) -> &'static str {
        "FILE"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("size", self.size.to_string()),
            ("ed2k", self.ed2k.to_ascii_lowercase()),
            ("fmask", FILE_FMASK.to_string()),
            ("amask", FILE_AMASK.to_string()),
        ]
    }

    fn parse(&self, reply: &RawReply) -> Result<Option<FileInfo>, ProtocolError> {
        match reply.return_code() {
            ReturnCode::File => {
                let fields = reply.fields(4)?;
                Ok(Some(FileInfo {
                    file_id: parse_id(reply, fields[0])?,
                    anime_id: parse_id(reply, fields[1])?,
                    episode_id: parse_id(reply, fields[2])?,
                    group_id: parse_id(reply, fields[3])?,
                }))
            }
            ReturnCode::NoSuchFile => Ok(None),
            _ => Err(reply.violation()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimeInfo {
    pub anime_id: u64,
    pub year: String,
    pub kind: String,
    pub romaji_name: String,
}

/// `ANIME` lookup by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetAnime {
    pub anime_id: u64,
}

impl GetAnime {
    pub fn new(anime_id: u64) -> Self {
        Self { anime_id }
    }
}

// aid, year, type, romaji name
const ANIME_AMASK: &str = "B0800000";

impl Request for GetAnime {
    type Payload = AnimeInfo;

    fn command(&self) -> &'static str {
        "ANIME"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("aid", self.anime_id.to_string()),
            ("amask", ANIME_AMASK.to_string()),
        ]
    }

    fn parse(&self, reply: &RawReply) -> Result<Option<AnimeInfo>, ProtocolError> {
        match reply.return_code() {
            ReturnCode::Anime => {
                let fields = reply.fields(4)?;
                let anime_id = parse_id(reply, fields[0])?;
                if anime_id != self.anime_id {
                    return Err(reply.violation());
                }
                Ok(Some(AnimeInfo {
                    anime_id,
                    year: fields[1].to_string(),
                    kind: fields[2].to_string(),
                    romaji_name: fields[3].to_string(),
                }))
            }
            ReturnCode::NoSuchAnime => Ok(None),
            _ => Err(reply.violation()),
        }
    }
}

fn parse_id(reply: &RawReply, raw: &str) -> Result<u64, ProtocolError> {
    raw.trim().parse().map_err(|_| reply.violation())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> RawReply {
        RawReply::parse(text).unwrap()
    }

    fn login() -> Login {
        Login {
            username: "user".into(),
            password: "pw".into(),
            protocol_version: 3,
            client_name: "anisync".into(),
            client_version: 1,
            encoding: TextEncoding::Utf16Be,
        }
    }

    #[test]
    fn login_extracts_token_and_image_server() {
        let accepted = login()
            .parse(&reply("200 abcde img7.example.net LOGIN ACCEPTED"))
            .unwrap()
            .unwrap();
        assert_eq!(accepted.token, "abcde");
        assert_eq!(accepted.image_server.as_deref(), Some("img7.example.net"));

        let accepted = login()
            .parse(&reply("201 xyz LOGIN ACCEPTED - NEW VERSION AVAILABLE"))
            .unwrap()
            .unwrap();
        assert_eq!(accepted.token, "xyz");
        assert_eq!(accepted.image_server, None);
    }

    #[test]
    fn login_refusals_have_no_payload() {
        assert!(login().parse(&reply("500 LOGIN FAILED")).unwrap().is_none());
        assert!(login()
            .parse(&reply("519 ENCODING NOT SUPPORTED"))
            .unwrap()
            .is_none());
        assert!(login().parse(&reply("200")).is_err());
    }

    #[test]
    fn login_debug_omits_password() {
        assert!(!format!("{:?}", login()).contains("pw"));
    }

    #[test]
    fn file_lookup_contract() {
        let request = GetFile::new(1024, "ABCDEF");
        assert_eq!(request.fields()[1], ("ed2k", "abcdef".to_string()));

        let info = request.parse(&reply("220 FILE\n10|20|30|40")).unwrap().unwrap();
        assert_eq!(
            info,
            FileInfo {
                file_id: 10,
                anime_id: 20,
                episode_id: 30,
                group_id: 40,
            }
        );
        assert!(request.parse(&reply("320 NO SUCH FILE")).unwrap().is_none());
        assert!(request.parse(&reply("220 FILE\n10|x|30|40")).is_err());
        assert!(request.parse(&reply("230 ANIME\n1|2|3|4")).is_err());
    }

    #[test]
    fn anime_lookup_checks_the_id() {
        let request = GetAnime::new(42);
        let info = request
            .parse(&reply("230 ANIME\n42|2013-2013|TV Series|Shingeki no Kyojin"))
            .unwrap()
            .unwrap();
        assert_eq!(info.romaji_name, "Shingeki no Kyojin");
        assert!(request.parse(&reply("230 ANIME\n7|2013|TV|x")).is_err());
        assert!(request.parse(&reply("330 NO SUCH ANIME")).unwrap().is_none());
    }

    #[test]
    fn session_exemptions() {
        assert!(!login().requires_session());
        assert!(!Ping.requires_session());
        assert!(!Ping.counts_as_activity());
        assert!(Logout.requires_session());
        assert!(GetAnime::new(1).requires_session());
    }
}
