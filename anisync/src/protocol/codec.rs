//! Wire framing: command building, text encodings and reply parsing.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ReturnCode;
use crate::error::ProtocolError;

/// Text encoding negotiated at login.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    /// Big-endian UTF-16 without BOM.
    Utf16Be,
    Ascii,
}

impl TextEncoding {
    /// Value of the `enc` login parameter.
    pub fn param(&self) -> &'static str {
        match self {
            TextEncoding::Utf16Be => "UTF-16BE",
            TextEncoding::Ascii => "ASCII",
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>, ProtocolError> {
        match self {
            TextEncoding::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
            TextEncoding::Ascii => {
                if let Some(bad) = text.chars().find(|c| !c.is_ascii()) {
                    return Err(ProtocolError::Encoding {
                        encoding: *self,
                        detail: format!("character {bad:?} is not ASCII"),
                    });
                }
                Ok(text.as_bytes().to_vec())
            }
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.param())
    }
}

/// Decodes a reply datagram.
///
/// UTF-16 is recognised by its BOM or by a leading zero byte on an
/// even-length buffer; anything else must be valid UTF-8. A leading BOM is
/// dropped in both cases.
pub fn decode_reply(bytes: &[u8]) -> Result<String, ProtocolError> {
    let looks_wide = bytes.starts_with(&[0xFE, 0xFF]) || (bytes.len() % 2 == 0 && bytes.first() == Some(&0));

    let text = if looks_wide {
        if bytes.len() % 2 != 0 {
            return Err(ProtocolError::Encoding {
                encoding: TextEncoding::Utf16Be,
                detail: format!("odd reply length {}", bytes.len()),
            });
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|e| ProtocolError::Encoding {
            encoding: TextEncoding::Utf16Be,
            detail: e.to_string(),
        })?
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::Encoding {
            encoding: TextEncoding::Ascii,
            detail: e.to_string(),
        })?
    };

    Ok(match text.strip_prefix('\u{FEFF}') {
        Some(rest) => rest.to_string(),
        None => text,
    })
}

/// Escapes a parameter value: `&` becomes `&amp;`, newlines become `<br />`.
pub fn escape_value(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace("\r\n", "<br />")
        .replace('\n', "<br />")
}

/// Renders `COMMAND k=v&k=v`, appending `tag=<tag>` and then `s=<token>`
/// when given.
pub fn build_command(
    command: &str,
    fields: &[(&str, String)],
    tag: Option<&str>,
    token: Option<&str>,
) -> String {
    let mut params: Vec<String> = fields
        .iter()
        .map(|(name, value)| format!("{name}={}", escape_value(value)))
        .collect();
    if let Some(tag) = tag {
        params.push(format!("tag={tag}"));
    }
    if let Some(token) = token {
        params.push(format!("s={token}"));
    }

    if params.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", params.join("&"))
    }
}

fn is_code(word: &str) -> bool {
    word.len() == 3 && word.bytes().all(|b| b.is_ascii_digit())
}

/// Separates the echoed `tag` from a reply. Replies the provider sends
/// without a tag come back unchanged with `None`.
pub fn split_tag(text: &str) -> (Option<&str>, &str) {
    let first = text.lines().next().unwrap_or_default();
    let Some((head, _)) = first.split_once(' ') else {
        return (None, text);
    };
    if is_code(head) {
        return (None, text);
    }

    let rest = &text[head.len() + 1..];
    let code_follows = rest.get(..3).is_some_and(is_code)
        && matches!(rest.as_bytes().get(3), None | Some(b' ' | b'\r' | b'\n'));
    if code_follows {
        (Some(head), rest)
    } else {
        (None, text)
    }
}

const MASKED_PARAMS: [&str; 2] = ["pass", "s"];

/// Replaces password and session values so a command can be logged.
pub fn mask_command(command: &str) -> String {
    let Some((name, params)) = command.split_once(' ') else {
        return command.to_string();
    };

    let masked: Vec<String> = params
        .split('&')
        .map(|param| match param.split_once('=') {
            Some((key, _)) if MASKED_PARAMS.contains(&key) => format!("{key}=****"),
            _ => param.to_string(),
        })
        .collect();
    format!("{name} {}", masked.join("&"))
}

/// A reply split into code, status text and payload lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawReply {
    pub code: u16,
    pub status: String,
    pub lines: Vec<String>,
}

impl RawReply {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut lines = text.lines();
        let first = lines
            .next()
            .ok_or_else(|| ProtocolError::violation(None, text))?;

        let digits = first.get(..3).filter(|d| d.bytes().all(|b| b.is_ascii_digit()));
        let Some(digits) = digits else {
            return Err(ProtocolError::violation(None, text));
        };
        let code: u16 = digits
            .parse()
            .map_err(|_| ProtocolError::violation(None, text))?;

        let rest = &first[3..];
        if !rest.is_empty() && !rest.starts_with(' ') {
            return Err(ProtocolError::violation(None, text));
        }

        let mut payload: Vec<String> = lines.map(str::to_string).collect();
        while payload.last().is_some_and(|line| line.is_empty()) {
            payload.pop();
        }

        Ok(Self {
            code,
            status: rest.trim().to_string(),
            lines: payload,
        })
    }

    pub fn return_code(&self) -> ReturnCode {
        ReturnCode::from_u16(self.code)
    }

    /// Fails with a violation carrying this reply.
    pub fn violation(&self) -> ProtocolError {
        ProtocolError::violation(Some(self.code), self.to_string())
    }

    /// Splits the first payload line on `|`, requiring at least `expected`
    /// fields.
    pub fn fields(&self, expected: usize) -> Result<Vec<&str>, ProtocolError> {
        let line = self.lines.first().ok_or_else(|| self.violation())?;
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < expected {
            return Err(self.violation());
        }
        Ok(fields)
    }
}

impl fmt::Display for RawReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.status)?;
        for line in &self.lines {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_escapes_values_and_appends_session() {
        let fields = vec![("aid", "1".to_string()), ("note", "a&b\nc".to_string())];
        assert_eq!(
            build_command("ANIME", &fields, None, Some("tok")),
            "ANIME aid=1&note=a&amp;b<br />c&s=tok"
        );
        assert_eq!(build_command("PING", &[], None, None), "PING");
        assert_eq!(
            build_command("ANIME", &fields[..1], Some("a7"), Some("tok")),
            "ANIME aid=1&tag=a7&s=tok"
        );
        assert_eq!(build_command("PING", &[], Some("a8"), None), "PING tag=a8");
    }

    #[test]
    fn tags_are_split_from_replies() {
        assert_eq!(split_tag("a7 300 PONG"), (Some("a7"), "300 PONG"));
        assert_eq!(
            split_tag("a9 230 ANIME\n1|2013"),
            (Some("a9"), "230 ANIME\n1|2013")
        );
        assert_eq!(split_tag("a7 300"), (Some("a7"), "300"));
        assert_eq!(split_tag("300 PONG"), (None, "300 PONG"));
        assert_eq!(split_tag("200 a7 LOGIN ACCEPTED"), (None, "200 a7 LOGIN ACCEPTED"));
        assert_eq!(split_tag("PONG"), (None, "PONG"));
        assert_eq!(split_tag("junk reply"), (None, "junk reply"));
    }

    #[test]
    fn masking_hides_password_and_session() {
        let masked = mask_command("AUTH user=me&pass=hunter2&enc=ASCII&s=abc");
        assert_eq!(masked, "AUTH user=me&pass=****&enc=ASCII&s=****");
        assert_eq!(mask_command("PING"), "PING");
    }

    #[test]
    fn utf16_round_trips_and_bom_is_stripped() {
        let encoded = TextEncoding::Utf16Be.encode("200 abc LOGIN ACCEPTED").unwrap();
        assert_eq!(decode_reply(&encoded).unwrap(), "200 abc LOGIN ACCEPTED");

        let mut with_bom = vec![0xFE, 0xFF];
        with_bom.extend(TextEncoding::Utf16Be.encode("300 PONG").unwrap());
        assert_eq!(decode_reply(&with_bom).unwrap(), "300 PONG");
    }

    #[test]
    fn ascii_refuses_wide_characters() {
        let err = TextEncoding::Ascii.encode("ANIME name=進撃").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Encoding {
                encoding: TextEncoding::Ascii,
                ..
            }
        ));
    }

    #[test]
    fn reply_parsing_splits_code_status_and_lines() {
        let reply = RawReply::parse("220 FILE\n1|2|3|4\n").unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.status, "FILE");
        assert_eq!(reply.lines, vec!["1|2|3|4"]);
        assert_eq!(reply.return_code(), ReturnCode::File);
        assert_eq!(reply.fields(4).unwrap(), vec!["1", "2", "3", "4"]);
        assert!(reply.fields(5).is_err());
    }

    #[test]
    fn malformed_replies_are_violations() {
        for text in ["", "OK", "20", "2000 nope", "abc DEF"] {
            assert!(
                matches!(
                    RawReply::parse(text),
                    Err(ProtocolError::ProtocolViolation { code: None, .. })
                ),
                "{text:?} should be rejected"
            );
        }
        assert_eq!(RawReply::parse("300").unwrap().status, "");
    }
}
