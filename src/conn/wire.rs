//! Encoding and decoding of the wire protocol messages used to run commands.

mod header;
mod message;
mod query;
mod reply;
mod util;

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub(crate) use self::util::SyncLittleEndianRead;
pub use self::{
    header::{Header, OpCode},
    message::{DocumentSequence, Message, MessageFlags},
    query::{Query, QueryFlags},
    reply::{Reply, ResponseFlags},
    util::{read_frame, read_frame_sync, RequestIdGenerator},
};
use crate::{
    bson::Document,
    error::{Error, Result},
};

/// A request written to a connection.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestMessage {
    /// An `OP_MSG` request.
    Message(Message),
    /// A legacy `OP_QUERY` command request.
    Query(Query),
}

impl RequestMessage {
    /// The id of the request.
    pub fn request_id(&self) -> i32 {
        match self {
            Self::Message(message) => message.request_id,
            Self::Query(query) => query.request_id,
        }
    }

    /// Whether the server will reply to this request.
    pub fn response_expected(&self) -> bool {
        match self {
            Self::Message(message) => !message.flags.contains(MessageFlags::MORE_TO_COME),
            Self::Query(_) => true,
        }
    }

    /// The command carried by the request as a Document, for logging and error reporting.
    pub fn command_document(&self) -> Document {
        match self {
            Self::Message(message) => message.get_command_document(),
            Self::Query(query) => query.get_query_document(),
        }
    }

    /// Serializes the request to bytes, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Message(message) => message.encode(),
            Self::Query(query) => query.encode(),
        }
    }

    /// Serializes the request and writes the bytes to `writer`.
    pub async fn write_to<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Deserializes a framed request.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (header, body) = split_frame(frame)?;
        match header.op_code {
            OpCode::Message => Ok(Self::Message(Message::read_op_common(body, &header)?)),
            OpCode::Query => Ok(Self::Query(Query::read_op_common(body, &header)?)),
            OpCode::Reply => Err(Error::invalid_response(
                "expected a request, but the message was an OP_REPLY",
            )),
        }
    }
}

impl From<Message> for RequestMessage {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<Query> for RequestMessage {
    fn from(query: Query) -> Self {
        Self::Query(query)
    }
}

/// A reply read from a connection.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseMessage {
    /// An `OP_MSG` reply.
    Message(Message),
    /// A legacy `OP_REPLY`.
    Reply(Reply),
}

impl ResponseMessage {
    /// The id of the request this reply answers.
    pub fn response_to(&self) -> i32 {
        match self {
            Self::Message(message) => message.response_to,
            Self::Reply(reply) => reply.response_to,
        }
    }

    /// Serializes the reply to bytes, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Message(message) => message.encode(),
            Self::Reply(reply) => reply.encode(),
        }
    }

    /// Deserializes a framed reply.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (header, body) = split_frame(frame)?;
        match header.op_code {
            OpCode::Message => Ok(Self::Message(Message::read_op_common(body, &header)?)),
            OpCode::Reply => Ok(Self::Reply(Reply::read_op_common(body, &header)?)),
            OpCode::Query => Err(Error::invalid_response(
                "expected a reply, but the message was an OP_QUERY",
            )),
        }
    }
}

impl From<Message> for ResponseMessage {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<Reply> for ResponseMessage {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

fn split_frame(frame: &[u8]) -> Result<(Header, &[u8])> {
    let mut reader = frame;
    let header = Header::read_from(&mut reader)?;
    if usize::try_from(header.length).ok() != Some(frame.len()) {
        return Err(Error::invalid_response(format!(
            "The message header indicated {} bytes, but {} were received",
            header.length,
            frame.len()
        )));
    }
    Ok((header, reader))
}
