#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! The guest-side agent: one dispatcher thread owning the serial
//! link, short-lived supervisor threads owning child processes.
//!
//! The hypervisor host cannot reach the guest over the network, so a
//! framed protocol over a virtual serial port is the sole control
//! channel. Commands name plug-in executables under the install root;
//! the agent resolves them through the [`modules`] registry, runs them
//! under a per-command timeout, and answers every accepted request
//! with the `RECEIVED → AUTHRESPONSE → RESPONSE` handshake — including
//! commands whose whole point is to restart or replace the agent
//! itself (see [`restart`]).
//!
//! Shared mutable state is deliberately small: supervisors talk to the
//! dispatcher only through the in-flight response table and the
//! outbound packet mailbox ([`supervisor::SharedState`]).

pub mod command;
pub mod config;
pub mod dispatcher;
mod error;
pub mod link;
pub mod restart;
mod run;
pub mod supervisor;

pub use error::{AgentError, AgentResult};
pub use run::run;
