//! A protocol-agnostic engine to generate, send, receive and match network traffic.
//!
//! ## Table of contents
//!
//! 1. [Overview](#overview)
//! 2. [Data model](#data-model)
//! 3. [Operations](#operations)
//! 4. [The layers](layer/index.html)
//! 5. [Media](media/index.html)
//! 6. [Commands](ch/index.html)
//!
//! ## Overview
//!
//! Traffic is described abstractly, per protocol layer, and handed to a *CSAP* (communication
//! service access point): one instantiated stack of layers such as `arp.eth`. Each layer is a
//! plugin registered in the protocol support table ([`spt`]) under its tag. The plugins know how
//! to fill in defaults for a header description, how to turn it into bytes and how to check
//! received bytes against it. The engine itself knows nothing about any protocol.
//!
//! ## Data model
//!
//! The atom of all descriptions is the [`DataUnit`]: a plain value, an expression over the
//! iteration arguments, or a pattern such as a mask or a set of intervals. A *template* lists one
//! header description per layer plus a payload and optional argument iteration; a *pattern* lists
//! alternatives (units) of such descriptions, each with a payload condition and actions. Both
//! arrive as textual attachments, see [`nds`].
//!
//! ## Operations
//!
//! A CSAP runs at most one operation at a time, each on its own worker thread:
//!
//! * send: generate and write the frames of a template, once per argument tuple,
//! * receive: read frames and match them against a pattern, reporting or counting the hits,
//! * send-recv: write one frame and wait for the answer.
//!
//! Operations run in the foreground, where the final answer is delivered when they end, or in the
//! background, where the start is acknowledged at once and a later stop, wait or get command
//! collects the result. The [`Tad`] handler dispatches those commands.
//!
//! [`spt`]: spt/index.html
//! [`nds`]: nds/index.html
//! [`DataUnit`]: du/enum.DataUnit.html
//! [`Tad`]: ch/struct.Tad.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

#[macro_use] mod macros;
pub mod args;
pub mod bps;
pub mod ch;
pub mod csap;
pub mod du;
mod engine;
pub mod error;
pub mod expr;
pub mod layer;
pub mod media;
pub mod nds;
pub mod spt;
pub mod wire;

pub use self::ch::{Answer, ChannelReply, Config, Reply, Request, Responder, Tad};
pub use self::du::DataUnit;
pub use self::engine::RecvTimeout;
pub use self::error::{Error, ErrorKind, Result};
