use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    message::encoded_length,
    util::{SyncCountReader, SyncLittleEndianRead},
};
use crate::{
    bson::RawDocumentBuf,
    bson_util,
    error::{ErrorKind, Result},
};

bitflags! {
    /// Represents the bitwise flags for an OP_REPLY.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ResponseFlags: u32 {
        /// A getMore referenced a cursor the server no longer has.
        const CURSOR_NOT_FOUND = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        /// The query failed; the single returned document describes the failure.
        const QUERY_FAILURE    = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        /// The server can block on tailable cursors until data arrives.
        const AWAIT_CAPABLE    = 0b_0000_0000_0000_0000_0000_0000_0000_1000;
    }
}

/// Represents a wire protocol OP_REPLY operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// The id of this message.
    pub request_id: i32,
    /// The id of the query this reply answers.
    pub response_to: i32,
    /// The reply flag bits.
    pub response_flags: ResponseFlags,
    /// The cursor the documents came from, or 0.
    pub cursor_id: i64,
    /// The position in the cursor where this reply starts.
    pub starting_from: i32,
    /// The returned documents.
    pub documents: Vec<RawDocumentBuf>,
}

impl Reply {
    /// Creates a single-document reply to `response_to`.
    pub fn new(request_id: i32, response_to: i32, document: RawDocumentBuf) -> Self {
        Self {
            request_id,
            response_to,
            response_flags: ResponseFlags::empty(),
            cursor_id: 0,
            starting_from: 0,
            documents: vec![document],
        }
    }

    /// Deserializes the body of an OP_REPLY whose header has already been read.
    pub(crate) fn read_op_common(mut reader: &[u8], header: &Header) -> Result<Self> {
        let response_flags = ResponseFlags::from_bits_truncate(reader.read_u32_sync()?);
        let cursor_id = reader.read_i64_sync()?;
        let starting_from = reader.read_i32_sync()?;
        let num_returned = reader.read_i32_sync()?;

        let length_remaining = reader.len();
        let mut count_reader = SyncCountReader::new(&mut reader);
        let mut documents = Vec::new();

        while length_remaining > count_reader.bytes_read() {
            let bytes = bson_util::read_document_bytes(&mut count_reader)?;
            documents.push(RawDocumentBuf::from_bytes(bytes)?);
        }

        if usize::try_from(num_returned).ok() != Some(documents.len()) {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The server indicated that the reply would contain {} documents, but it \
                     instead contained {}",
                    num_returned,
                    documents.len(),
                ),
            }
            .into());
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            response_flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    /// Serializes the Reply to bytes, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let documents_len: usize = self
            .documents
            .iter()
            .map(|document| document.as_bytes().len())
            .sum();
        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + std::mem::size_of::<i64>()
            + 2 * std::mem::size_of::<i32>()
            + documents_len;

        let header = Header {
            length: encoded_length(total_length)?,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Reply,
        };

        let mut bytes = Vec::with_capacity(total_length);
        header.write_to(&mut bytes);
        bytes.extend_from_slice(&self.response_flags.bits().to_le_bytes());
        bytes.extend_from_slice(&self.cursor_id.to_le_bytes());
        bytes.extend_from_slice(&self.starting_from.to_le_bytes());
        bytes.extend_from_slice(&encoded_length(self.documents.len())?.to_le_bytes());
        for document in &self.documents {
            bytes.extend_from_slice(document.as_bytes());
        }

        Ok(bytes)
    }
}
