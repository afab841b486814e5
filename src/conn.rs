//! The connection interfaces consumed by the command protocols.

mod stream;
mod stream_description;
pub mod wire;

use std::fmt;

use tokio_util::sync::CancellationToken;

pub use self::{
    stream::StreamConnection,
    stream_description::{ConnectionDescription, ServerType},
    wire::{RequestMessage, ResponseMessage},
};
use crate::{error::Result, BoxFuture};

/// Identifies a connection for logging and error reporting.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct ConnectionId {
    /// The driver-generated id of the connection.
    pub id: u32,

    /// The server-generated id of the connection, if the handshake reported one.
    pub server_id: Option<i64>,

    /// The address of the server the connection is open to.
    pub address: String,
}

impl ConnectionId {
    /// Creates a new `ConnectionId`.
    pub fn new(id: u32, address: impl Into<String>) -> Self {
        Self {
            id,
            server_id: None,
            address: address.into(),
        }
    }

    /// Sets the server-generated id of the connection.
    pub fn with_server_id(mut self, server_id: i64) -> Self {
        self.server_id = Some(server_id);
        self
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {} to {}", self.id, self.address)?;
        if let Some(server_id) = self.server_id {
            write!(f, " (server connection {})", server_id)?;
        }
        Ok(())
    }
}

/// An open logical connection to a server.
pub trait Connection {
    /// The id of this connection.
    fn id(&self) -> &ConnectionId;

    /// The description negotiated during the handshake, if the handshake has completed.
    fn description(&self) -> Option<&ConnectionDescription>;

    /// Marks the reply to the request with id `response_to` as unwanted. The connection must
    /// skip that reply, unread by the caller, before it returns any later reply.
    fn discard_reply(&mut self, response_to: i32);
}

/// A connection that performs blocking I/O.
pub trait SyncConnection: Connection {
    /// Writes `message` to the connection. Implementations should abandon the write and return a
    /// cancellation error once `cancellation` fires, as far as their transport allows.
    fn send_message(
        &mut self,
        message: &RequestMessage,
        cancellation: &CancellationToken,
    ) -> Result<()>;

    /// Reads the framed reply to the request with id `response_to`, header included.
    fn receive_message(
        &mut self,
        response_to: i32,
        cancellation: &CancellationToken,
    ) -> Result<Vec<u8>>;
}

/// A connection that performs asynchronous I/O. Cancellation is handled by the caller dropping
/// the returned futures.
pub trait AsyncConnection: Connection + Send {
    /// Writes `message` to the connection.
    fn send_message<'a>(&'a mut self, message: &'a RequestMessage) -> BoxFuture<'a, Result<()>>;

    /// Reads the framed reply to the request with id `response_to`, header included.
    fn receive_message(&mut self, response_to: i32) -> BoxFuture<'_, Result<Vec<u8>>>;
}
