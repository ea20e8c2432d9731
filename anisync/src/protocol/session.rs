use std::fmt;

use chrono::{DateTime, Utc};

use super::TextEncoding;

/// Logged-in state handed out by the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    encoding: TextEncoding,
    image_server: Option<String>,
    established_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        token: impl Into<String>,
        encoding: TextEncoding,
        image_server: Option<String>,
        established_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token: token.into(),
            encoding,
            image_server,
            established_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Secondary host for artwork, when the provider announced one.
    pub fn image_server(&self) -> Option<&str> {
        self.image_server.as_deref()
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"****")
            .field("encoding", &self.encoding)
            .field("image_server", &self.image_server)
            .field("established_at", &self.established_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_token() {
        let session = Session::new("secret", TextEncoding::Ascii, None, Utc::now());
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret"));
        assert_eq!(session.token(), "secret");
    }
}
