//! The MongoDB wire-protocol command execution layer.
//!
//! This crate turns a logical database command (a BSON document plus session, transaction and
//! read preference context) into an `OP_MSG` or `OP_QUERY` message on an already-open
//! connection, and turns the server's reply back into either a typed value or a classified
//! [`Error`](error::Error).
//!
//! The entry point is [`CommandWireProtocol`], which picks the framing supported by the
//! connection on every call:
//!
//! ```no_run
//! # use mongodb_wire::{
//! #     bson::{rawdoc, Document},
//! #     conn::SyncConnection,
//! #     session::NoSession,
//! #     Command,
//! #     CommandWireProtocol,
//! #     EncoderSettings,
//! # };
//! # use tokio_util::sync::CancellationToken;
//! # fn run(connection: &mut impl SyncConnection) -> mongodb_wire::error::Result<()> {
//! let command = Command::builder()
//!     .body(rawdoc! { "ping": 1 })
//!     .database("admin")
//!     .build();
//! let mut session = NoSession;
//! let reply: Document =
//!     CommandWireProtocol::new(&command, &mut session, EncoderSettings::default())
//!         .execute(connection, &CancellationToken::new())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(clippy::unreadable_literal, clippy::cognitive_complexity)
)]

pub use ::bson;

mod bson_util;
pub mod command;
pub mod concern;
pub mod conn;
pub mod error;
pub mod protocol;
pub mod selection_criteria;
pub mod session;
mod trace;

use std::{future::Future, pin::Pin};

pub use crate::{
    command::{Command, EncoderSettings, ResponseHandling},
    protocol::CommandWireProtocol,
    session::{ClientSession, ClusterTime, CoreSession, NoSession},
};

/// A boxed future, as returned by [`AsyncConnection`](conn::AsyncConnection) methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
