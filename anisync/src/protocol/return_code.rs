use std::fmt;

/// Status code at the start of every reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    LoginAccepted,
    LoginAcceptedNewVersion,
    LoggedOut,
    File,
    Anime,
    Pong,
    NoSuchFile,
    NoSuchAnime,
    NotLoggedIn,
    LoginFailed,
    LoginFirst,
    AccessDenied,
    ClientVersionOutdated,
    ClientBanned,
    IllegalInput,
    InvalidSession,
    EncodingNotSupported,
    Banned,
    UnknownCommand,
    InternalServerError,
    OutOfService,
    ServerBusy,
    TimeoutDelayAndResubmit,
    ApiViolation,
    Other(u16),
}

impl ReturnCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            200 => ReturnCode::LoginAccepted,
            201 => ReturnCode::LoginAcceptedNewVersion,
            203 => ReturnCode::LoggedOut,
            220 => ReturnCode::File,
            230 => ReturnCode::Anime,
            300 => ReturnCode::Pong,
            320 => ReturnCode::NoSuchFile,
            330 => ReturnCode::NoSuchAnime,
            403 => ReturnCode::NotLoggedIn,
            500 => ReturnCode::LoginFailed,
            501 => ReturnCode::LoginFirst,
            502 => ReturnCode::AccessDenied,
            503 => ReturnCode::ClientVersionOutdated,
            504 => ReturnCode::ClientBanned,
            505 => ReturnCode::IllegalInput,
            506 => ReturnCode::InvalidSession,
            519 => ReturnCode::EncodingNotSupported,
            555 => ReturnCode::Banned,
            598 => ReturnCode::UnknownCommand,
            600 => ReturnCode::InternalServerError,
            601 => ReturnCode::OutOfService,
            602 => ReturnCode::ServerBusy,
            604 => ReturnCode::TimeoutDelayAndResubmit,
            666 => ReturnCode::ApiViolation,
            other => ReturnCode::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ReturnCode::LoginAccepted => 200,
            ReturnCode::LoginAcceptedNewVersion => 201,
            ReturnCode::LoggedOut => 203,
            ReturnCode::File => 220,
            ReturnCode::Anime => 230,
            ReturnCode::Pong => 300,
            ReturnCode::NoSuchFile => 320,
            ReturnCode::NoSuchAnime => 330,
            ReturnCode::NotLoggedIn => 403,
            ReturnCode::LoginFailed => 500,
            ReturnCode::LoginFirst => 501,
            ReturnCode::AccessDenied => 502,
            ReturnCode::ClientVersionOutdated => 503,
            ReturnCode::ClientBanned => 504,
            ReturnCode::IllegalInput => 505,
            ReturnCode::InvalidSession => 506,
            ReturnCode::EncodingNotSupported => 519,
            ReturnCode::Banned => 555,
            ReturnCode::UnknownCommand => 598,
            ReturnCode::InternalServerError => 600,
            ReturnCode::OutOfService => 601,
            ReturnCode::ServerBusy => 602,
            ReturnCode::TimeoutDelayAndResubmit => 604,
            ReturnCode::ApiViolation => 666,
            ReturnCode::Other(code) => *code,
        }
    }

    pub fn is_ban(&self) -> bool {
        matches!(self, ReturnCode::Banned | ReturnCode::ClientBanned)
    }

    /// The provider forgot or never had our session.
    pub fn is_session_invalid(&self) -> bool {
        matches!(
            self,
            ReturnCode::InvalidSession | ReturnCode::LoginFirst | ReturnCode::NotLoggedIn
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ReturnCode::ServerBusy | ReturnCode::OutOfService)
    }

    /// Codes that blame the request itself.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ReturnCode::UnknownCommand
                | ReturnCode::IllegalInput
                | ReturnCode::AccessDenied
                | ReturnCode::ApiViolation
                | ReturnCode::ClientVersionOutdated
        )
    }
}

impl From<u16> for ReturnCode {
    fn from(code: u16) -> Self {
        Self::from_u16(code)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnCode::Other(code) => write!(f, "{code}"),
            named => write!(f, "{} ({named:?})", named.as_u16()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_codes_map_both_ways() {
        for raw in [200, 201, 203, 220, 230, 300, 320, 330, 403, 500, 501, 502, 503, 504, 505, 506, 519, 555, 598, 600, 601, 602, 604, 666] {
            let code = ReturnCode::from_u16(raw);
            assert!(!matches!(code, ReturnCode::Other(_)), "{raw} should be named");
            assert_eq!(code.as_u16(), raw);
        }
    }

    #[test]
    fn unknown_codes_are_preserved() {
        assert_eq!(ReturnCode::from_u16(299), ReturnCode::Other(299));
        assert_eq!(ReturnCode::Other(299).as_u16(), 299);
        assert_eq!(ReturnCode::Other(299).to_string(), "299");
    }

    #[test]
    fn classification() {
        assert!(ReturnCode::Banned.is_ban());
        assert!(ReturnCode::ClientBanned.is_ban());
        assert!(ReturnCode::NotLoggedIn.is_session_invalid());
        assert!(ReturnCode::OutOfService.is_busy());
        assert!(ReturnCode::ApiViolation.is_rejection());
        assert!(!ReturnCode::File.is_rejection());
    }
}
