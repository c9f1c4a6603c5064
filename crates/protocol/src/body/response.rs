//! crates/protocol/src/body/response.rs
//!
//! `<response>` reply body construction.
//!
//! The host's parser expects a fixed element order and exactly one
//! level of escaping; the child's output must never be wrapped twice.

use quick_xml::escape::partial_escape;

use crate::wire::{CorrelationId, MAX_FRAGMENT_BODY, Packet, PacketKind};

/// Overall outcome reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Child exited with status zero.
    Success,
    /// Request was malformed, the command was unknown, or the child
    /// failed.
    Error,
    /// Child was terminated at the execution deadline.
    TimeOut,
}

impl ResponseKind {
    /// The wire label inside `<responseType>`.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Error => "Error",
            Self::TimeOut => "TimeOut",
        }
    }
}

/// The reply produced for one accepted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Outcome class.
    pub kind: ResponseKind,
    /// Child exit status (zero for success and timeouts).
    pub return_code: i32,
    /// Merged child output on failure, empty otherwise.
    pub result_message: String,
    /// Echo of the command line as the host sent it.
    pub command_name: String,
    /// Child stdout on success, empty otherwise.
    pub output: String,
}

impl CommandResponse {
    /// A successful execution carrying the captured output.
    #[must_use]
    pub fn success(command_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Success,
            return_code: 0,
            result_message: String::new(),
            command_name: command_name.into(),
            output: output.into(),
        }
    }

    /// A failed execution; the merged output travels in
    /// `resultMessage`.
    #[must_use]
    pub fn error(
        command_name: impl Into<String>,
        result_message: impl Into<String>,
        return_code: i32,
    ) -> Self {
        Self {
            kind: ResponseKind::Error,
            return_code,
            result_message: result_message.into(),
            command_name: command_name.into(),
            output: String::new(),
        }
    }

    /// A command terminated at its deadline. Both message fields stay
    /// empty and the code reports zero.
    #[must_use]
    pub fn timeout(command_name: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::TimeOut,
            return_code: 0,
            result_message: String::new(),
            command_name: command_name.into(),
            output: String::new(),
        }
    }

    /// The canned all-empty error used for malformed requests and
    /// responses claimed under an unknown correlation id.
    #[must_use]
    pub fn canned_error() -> Self {
        Self::error("", "", 0)
    }

    /// Renders the body with one level of escaping.
    #[must_use]
    pub fn to_body(&self) -> String {
        format!(
            "<response>\
             <responseType>{}</responseType>\
             <resultCode>{}</resultCode>\
             <resultMessage>{}</resultMessage>\
             <commandName>{}</commandName>\
             <outputString>{}</outputString>\
             </response>",
            self.kind.label(),
            self.return_code,
            partial_escape(&self.result_message),
            partial_escape(&self.command_name),
            partial_escape(&self.output),
        )
    }

    /// Serializes into one or more RESPONSE packets, fragmenting
    /// bodies larger than [`MAX_FRAGMENT_BODY`] symmetrically to
    /// inbound reassembly.
    #[must_use]
    pub fn into_packets(self, correlation_id: CorrelationId) -> Vec<Packet> {
        Packet::single(PacketKind::Response, correlation_id, self.to_body().into_bytes())
            .into_fragments(MAX_FRAGMENT_BODY)
    }
}
