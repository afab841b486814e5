use std::io::{Read, Write};

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::{
    wire::{read_frame, read_frame_sync, Header, RequestMessage},
    AsyncConnection,
    Connection,
    ConnectionDescription,
    ConnectionId,
    SyncConnection,
};
use crate::{
    error::{Error, Result},
    trace::COMMAND_TRACING_EVENT_TARGET,
    BoxFuture,
};

/// A [`Connection`] over a byte stream that has already completed its handshake.
///
/// Blocking streams (`std::io::Read + Write`) get a [`SyncConnection`] implementation and tokio
/// streams get an [`AsyncConnection`] implementation. Replies are matched to their request by
/// the protocols, so the stream is read strictly in order, skipping the replies to requests
/// passed to [`discard_reply`](Connection::discard_reply).
///
/// The blocking implementation only observes cancellation between reads. Give the stream a read
/// timeout if a silent server must not block the caller indefinitely.
#[derive(Debug)]
pub struct StreamConnection<S> {
    id: ConnectionId,
    description: Option<ConnectionDescription>,
    stream: S,
    discarded: Vec<i32>,
}

impl<S> StreamConnection<S> {
    /// Wraps `stream`. `description` is the result of the handshake, if one has been performed.
    pub fn new(id: ConnectionId, description: Option<ConnectionDescription>, stream: S) -> Self {
        Self {
            id,
            description,
            stream,
            discarded: Vec::new(),
        }
    }

    /// Replaces the description, e.g. after a handshake run over this connection.
    pub fn set_description(&mut self, description: ConnectionDescription) {
        self.description = Some(description);
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consumes the connection, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn max_message_size_bytes(&self) -> Option<i32> {
        self.description
            .as_ref()
            .map(|description| description.max_message_size_bytes)
    }

    /// Whether `frame` answers a request whose reply was discarded. Such a frame is consumed.
    fn skip(&mut self, frame: &[u8]) -> Result<bool> {
        if self.discarded.is_empty() {
            return Ok(false);
        }
        let response_to = Header::read_from(&mut &frame[..])?.response_to;
        let Some(position) = self.discarded.iter().position(|id| *id == response_to) else {
            return Ok(false);
        };
        self.discarded.swap_remove(position);
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            connectionId = self.id.id,
            responseTo = response_to,
            "Ignored reply discarded"
        );
        Ok(true)
    }
}

impl<S> Connection for StreamConnection<S> {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn description(&self) -> Option<&ConnectionDescription> {
        self.description.as_ref()
    }

    fn discard_reply(&mut self, response_to: i32) {
        self.discarded.push(response_to);
    }
}

impl<S: Read + Write> SyncConnection for StreamConnection<S> {
    fn send_message(
        &mut self,
        message: &RequestMessage,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let bytes = message.encode()?;
        if cancellation.is_cancelled() {
            return Err(Error::cancelled());
        }
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn receive_message(
        &mut self,
        _response_to: i32,
        cancellation: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let max_message_size_bytes = self.max_message_size_bytes();
        loop {
            let frame = read_frame_sync(&mut self.stream, max_message_size_bytes, cancellation)?;
            if !self.skip(&frame)? {
                return Ok(frame);
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncConnection for StreamConnection<S> {
    fn send_message<'a>(&'a mut self, message: &'a RequestMessage) -> BoxFuture<'a, Result<()>> {
        async move { message.write_to(&mut self.stream).await }.boxed()
    }

    fn receive_message(&mut self, _response_to: i32) -> BoxFuture<'_, Result<Vec<u8>>> {
        let max_message_size_bytes = self.max_message_size_bytes();
        async move {
            loop {
                let frame = read_frame(&mut self.stream, max_message_size_bytes).await?;
                if !self.skip(&frame)? {
                    return Ok::<_, Error>(frame);
                }
            }
        }
        .boxed()
    }
}
