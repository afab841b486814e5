use std::io::Read;

use super::util::SyncLittleEndianRead;
use crate::error::{ErrorKind, Result};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpCode {
    /// A reply to an `OP_QUERY`.
    Reply = 1,
    /// A legacy query, used here only for commands against `<db>.$cmd`.
    Query = 2004,
    /// The extensible message format.
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid wire protocol opcode: {}", other),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// The total length of the message, header included.
    pub length: i32,
    /// The id of this message.
    pub request_id: i32,
    /// The id of the request this message responds to.
    pub response_to: i32,
    /// The kind of message that follows the header.
    pub op_code: OpCode,
}

impl Header {
    /// The length of an encoded header in bytes.
    pub const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// Serializes the Header and appends the bytes to `buf`.
    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    /// Reads bytes from `reader` and deserializes them into a header.
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let length = reader.read_i32_sync()?;
        let request_id = reader.read_i32_sync()?;
        let response_to = reader.read_i32_sync()?;
        let op_code = OpCode::from_i32(reader.read_i32_sync()?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}
