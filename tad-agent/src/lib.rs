//! A test agent exposing a [`tad::Tad`] instance over TCP.
//!
//! The agent speaks a line protocol. Every request is one line `<prefix> <keyword> [args...]`,
//! and may end with `attach <len>` in which case exactly `len` bytes of attachment follow the
//! line. Answers use the same framing, `<prefix> <rc> [values...]`, with received packets
//! attached to their answer.
//!
//! All connections share the same CSAPs, ids stay valid when the creating connection closes.
pub mod config;
pub mod server;

pub use config::Config;
pub use server::Server;
