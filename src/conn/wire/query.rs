use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    message::encoded_length,
    util::{SyncCountReader, SyncLittleEndianRead},
};
use crate::{
    bson::{Document, RawDocumentBuf},
    bson_util,
    error::{Error, Result},
};

bitflags! {
    /// Represents the bitwise flags for an OP_QUERY.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// Allow the command to run against a replica set secondary.
        const SECONDARY_OK = 0b_0000_0000_0000_0000_0000_0000_0000_0100;
    }
}

/// Represents an OP_QUERY wire protocol operation. Only used to run commands against the
/// `<db>.$cmd` pseudo-collection on servers that predate `OP_MSG`.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// The id of this message.
    pub request_id: i32,
    /// The query flag bits.
    pub flags: QueryFlags,
    /// The namespace the query targets, e.g. `admin.$cmd`.
    pub full_collection_name: String,
    /// The number of documents to skip.
    pub number_to_skip: i32,
    /// The number of documents to return. Commands use -1: one document, then close the cursor.
    pub number_to_return: i32,
    /// The query document, which for commands wraps the command itself.
    pub query: RawDocumentBuf,
    /// An optional projection.
    pub return_fields_selector: Option<RawDocumentBuf>,
}

impl Query {
    /// Creates a command query against `<database>.$cmd`.
    pub fn command(
        request_id: i32,
        database: &str,
        query: RawDocumentBuf,
        flags: QueryFlags,
    ) -> Self {
        Self {
            request_id,
            flags,
            full_collection_name: format!("{}.$cmd", database),
            number_to_skip: 0,
            number_to_return: -1,
            query,
            return_fields_selector: None,
        }
    }

    /// Gets the query as a Document. If deserialization fails, returns a document containing the
    /// error.
    pub fn get_query_document(&self) -> Document {
        self.query
            .to_document()
            .unwrap_or_else(|error| crate::bson::doc! { "serialization error": error.to_string() })
    }

    /// Serializes the Query to bytes, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + self.full_collection_name.len()
            + 1
            + 2 * std::mem::size_of::<i32>()
            + self.query.as_bytes().len()
            + self
                .return_fields_selector
                .as_ref()
                .map(|selector| selector.as_bytes().len())
                .unwrap_or(0);

        let header = Header {
            length: encoded_length(total_length)?,
            request_id: self.request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };

        let mut bytes = Vec::with_capacity(total_length);
        header.write_to(&mut bytes);
        bytes.extend_from_slice(&self.flags.bits().to_le_bytes());
        bytes.extend_from_slice(self.full_collection_name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&self.number_to_skip.to_le_bytes());
        bytes.extend_from_slice(&self.number_to_return.to_le_bytes());
        bytes.extend_from_slice(self.query.as_bytes());
        if let Some(ref selector) = self.return_fields_selector {
            bytes.extend_from_slice(selector.as_bytes());
        }

        Ok(bytes)
    }

    /// Deserializes the body of an OP_QUERY whose header has already been read.
    pub(crate) fn read_op_common(mut reader: &[u8], header: &Header) -> Result<Self> {
        let length_remaining = reader.len();
        let mut count_reader = SyncCountReader::new(&mut reader);

        let flags = QueryFlags::from_bits_truncate(count_reader.read_u32_sync()?);
        let (full_collection_name, _) = count_reader.read_cstring_sync()?;
        let number_to_skip = count_reader.read_i32_sync()?;
        let number_to_return = count_reader.read_i32_sync()?;
        let query = RawDocumentBuf::from_bytes(bson_util::read_document_bytes(&mut count_reader)?)?;

        let return_fields_selector = if count_reader.bytes_read() < length_remaining {
            Some(RawDocumentBuf::from_bytes(bson_util::read_document_bytes(
                &mut count_reader,
            )?)?)
        } else {
            None
        };

        if count_reader.bytes_read() != length_remaining {
            return Err(Error::invalid_response(format!(
                "The message header indicated {} bytes, but the query was {}",
                header.length,
                Header::LENGTH + count_reader.bytes_read()
            )));
        }

        Ok(Self {
            request_id: header.request_id,
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }
}
