//! crates/protocol/src/body/command.rs
//!
//! `<command>` request body parsing.
//!
//! Required shape:
//!
//! ```text
//! <command>
//!   <commandString>modulemng list</commandString>
//!   <binaryData>bW9kdWxl...</binaryData>   (optional)
//! </command>
//! ```
//!
//! Exactly one `commandString` element is required. A repeated
//! `binaryData` element is treated as absent rather than rejected,
//! matching the observed host behavior.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::escape::partial_escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use thiserror::Error;

/// Ways a COMMAND body can be unusable. Every variant is answered
/// with the canned error response over the normal two-step reply.
#[derive(Debug, Error)]
pub enum CommandBodyError {
    /// The body is not parseable XML.
    #[error("malformed command xml: {0}")]
    Xml(#[from] quick_xml::Error),
    /// The root element is not `<command>`.
    #[error("unexpected root element {0:?}, expected \"command\"")]
    WrongRoot(String),
    /// `commandString` was missing or repeated.
    #[error("expected exactly one commandString element, found {0}")]
    CommandStringCount(usize),
    /// `binaryData` did not decode as Base64.
    #[error("invalid base64 binary data: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A decoded command request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// The textual command line, entities unescaped.
    pub command: String,
    /// Decoded `binaryData` payload, when present.
    pub binary_data: Option<Vec<u8>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Command,
    Binary,
}

/// Parses a (possibly reassembled) COMMAND message body.
pub fn parse_command_body(body: &[u8]) -> Result<CommandRequest, CommandBodyError> {
    // Some host stacks prepend a stray '?' to the document.
    let body = body.strip_prefix(b"?").unwrap_or(body);

    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut root_seen = false;
    let mut current: Option<Field> = None;
    let mut command_strings: Vec<String> = Vec::new();
    let mut binary_blobs: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(start) => {
                depth += 1;
                match depth {
                    1 => {
                        check_root(start.local_name().as_ref())?;
                        root_seen = true;
                    }
                    2 => {
                        current = open_field(
                            start.local_name().as_ref(),
                            &mut command_strings,
                            &mut binary_blobs,
                        );
                    }
                    _ => current = None,
                }
            }
            Event::Empty(empty) => match depth {
                0 => {
                    check_root(empty.local_name().as_ref())?;
                    root_seen = true;
                }
                1 => {
                    // An empty child element still counts as present.
                    let _ = open_field(
                        empty.local_name().as_ref(),
                        &mut command_strings,
                        &mut binary_blobs,
                    );
                }
                _ => {}
            },
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                current = None;
            }
            Event::Text(text) => {
                if let Some(field) = current {
                    let decoded = text.unescape()?;
                    append_field(field, &decoded, &mut command_strings, &mut binary_blobs);
                }
            }
            Event::CData(data) => {
                if let Some(field) = current {
                    let raw = String::from_utf8_lossy(&data).into_owned();
                    append_field(field, &raw, &mut command_strings, &mut binary_blobs);
                }
            }
            _ => {}
        }
        buf.clear();
    }

    if !root_seen {
        return Err(CommandBodyError::WrongRoot(String::new()));
    }
    if command_strings.len() != 1 {
        return Err(CommandBodyError::CommandStringCount(command_strings.len()));
    }

    // A repeated binaryData element is ignored wholesale.
    let binary_data = if binary_blobs.len() == 1 {
        let compact: String = binary_blobs[0]
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        Some(BASE64.decode(compact.as_bytes())?)
    } else {
        None
    };

    Ok(CommandRequest {
        command: command_strings.remove(0),
        binary_data,
    })
}

fn check_root(name: &[u8]) -> Result<(), CommandBodyError> {
    if name == b"command" {
        Ok(())
    } else {
        Err(CommandBodyError::WrongRoot(
            String::from_utf8_lossy(name).into_owned(),
        ))
    }
}

fn open_field(
    name: &[u8],
    command_strings: &mut Vec<String>,
    binary_blobs: &mut Vec<String>,
) -> Option<Field> {
    match name {
        b"commandString" => {
            command_strings.push(String::new());
            Some(Field::Command)
        }
        b"binaryData" => {
            binary_blobs.push(String::new());
            Some(Field::Binary)
        }
        _ => None,
    }
}

fn append_field(
    field: Field,
    text: &str,
    command_strings: &mut [String],
    binary_blobs: &mut [String],
) {
    let slot = match field {
        Field::Command => command_strings.last_mut(),
        Field::Binary => binary_blobs.last_mut(),
    };
    if let Some(slot) = slot {
        slot.push_str(text);
    }
}

/// Builds a `<command>` body for the host side of the protocol (used
/// by the debug simulator and tests).
#[must_use]
pub fn build_command_body(command: &str, binary_data: Option<&[u8]>) -> Vec<u8> {
    let escaped = partial_escape(command);
    match binary_data {
        None => format!("<command><commandString>{escaped}</commandString></command>").into_bytes(),
        Some(data) => {
            let encoded = BASE64.encode(data);
            format!(
                "<command><commandString>{escaped}</commandString>\
                 <binaryData>{encoded}</binaryData></command>"
            )
            .into_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_parses() {
        let request =
            parse_command_body(b"<command><commandString>modulemng list</commandString></command>")
                .expect("valid body");
        assert_eq!(request.command, "modulemng list");
        assert_eq!(request.binary_data, None);
    }

    #[test]
    fn leading_question_mark_is_tolerated() {
        let request =
            parse_command_body(b"?<command><commandString>osinfo</commandString></command>")
                .expect("valid body");
        assert_eq!(request.command, "osinfo");
    }

    #[test]
    fn binary_data_is_base64_decoded() {
        let body = build_command_body("upload target.bin", Some(b"\x00\x01binary\xff"));
        let request = parse_command_body(&body).expect("valid body");
        assert_eq!(request.command, "upload target.bin");
        assert_eq!(request.binary_data.as_deref(), Some(&b"\x00\x01binary\xff"[..]));
    }

    #[test]
    fn escaped_entities_are_decoded_once() {
        let request = parse_command_body(
            b"<command><commandString>exec echo &lt;a&gt; &amp; done</commandString></command>",
        )
        .expect("valid body");
        assert_eq!(request.command, "exec echo <a> & done");
    }

    #[test]
    fn rejects_non_xml() {
        assert!(matches!(
            parse_command_body(b"restart"),
            Err(CommandBodyError::CommandStringCount(0) | CommandBodyError::WrongRoot(_))
        ));
    }

    #[test]
    fn rejects_wrong_root() {
        assert!(matches!(
            parse_command_body(b"<cmd><commandString>x</commandString></cmd>"),
            Err(CommandBodyError::WrongRoot(root)) if root == "cmd"
        ));
    }

    #[test]
    fn rejects_missing_command_string() {
        assert!(matches!(
            parse_command_body(b"<command></command>"),
            Err(CommandBodyError::CommandStringCount(0))
        ));
    }

    #[test]
    fn rejects_repeated_command_string() {
        assert!(matches!(
            parse_command_body(
                b"<command><commandString>a</commandString>\
                  <commandString>b</commandString></command>"
            ),
            Err(CommandBodyError::CommandStringCount(2))
        ));
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(matches!(
            parse_command_body(
                b"<command><commandString>upload</commandString>\
                  <binaryData>!!not-base64!!</binaryData></command>"
            ),
            Err(CommandBodyError::Base64(_))
        ));
    }

    #[test]
    fn repeated_binary_data_is_ignored() {
        let request = parse_command_body(
            b"<command><commandString>upload</commandString>\
              <binaryData>QQ==</binaryData><binaryData>Qg==</binaryData></command>",
        )
        .expect("valid body");
        assert_eq!(request.binary_data, None);
    }

    #[test]
    fn whitespace_inside_base64_is_tolerated() {
        let request = parse_command_body(
            b"<command><commandString>upload</commandString>\
              <binaryData>aGVs\n  bG8=</binaryData></command>",
        )
        .expect("valid body");
        assert_eq!(request.binary_data.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn command_body_builder_escapes_once() {
        let body = build_command_body("exec echo <hi>", None);
        assert_eq!(
            body,
            b"<command><commandString>exec echo &lt;hi&gt;</commandString></command>".to_vec()
        );
    }
}
