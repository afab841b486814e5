use std::io::Read;

use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    util::{SyncCountReader, SyncLittleEndianRead},
};
use crate::{
    bson::{doc, Array, Document, RawDocumentBuf},
    bson_util,
    error::{Error, ErrorKind, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// OP_MSG payload type 0.
    pub document_payload: RawDocumentBuf,
    /// OP_MSG payload type 1.
    pub document_sequences: Vec<DocumentSequence>,
    /// The id of the request this message responds to, or 0 for requests.
    pub response_to: i32,
    /// The message flag bits.
    pub flags: MessageFlags,
    /// The CRC-32C checksum, if one was present.
    pub checksum: Option<u32>,
    /// The id of this message.
    pub request_id: i32,
}

/// A type 1 section: a named sequence of documents.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSequence {
    /// The name the documents are exposed under in the command, e.g. `documents`.
    pub identifier: String,
    /// The documents in the sequence.
    pub documents: Vec<RawDocumentBuf>,
}

impl DocumentSequence {
    /// The encoded size of this sequence as a type 1 section, the payload type byte included.
    pub(crate) fn section_len(&self) -> usize {
        Self::overhead(&self.identifier)
            + self
                .documents
                .iter()
                .map(|document| document.as_bytes().len())
                .sum::<usize>()
    }

    /// The bytes a type 1 section with `identifier` needs before its first document.
    pub(crate) fn overhead(identifier: &str) -> usize {
        // payload type + size + identifier + null terminator
        1 + 4 + identifier.len() + 1
    }
}

impl Message {
    /// Creates a request message with a single type 0 section.
    pub fn new(request_id: i32, document_payload: RawDocumentBuf) -> Self {
        Self {
            document_payload,
            document_sequences: Vec::new(),
            response_to: 0,
            flags: MessageFlags::empty(),
            checksum: None,
            request_id,
        }
    }

    /// Gets this message's command as a Document, with document sequences folded in as arrays.
    /// If deserialization fails, returns a document containing the error.
    pub fn get_command_document(&self) -> Document {
        let mut command = match self.document_payload.to_document() {
            Ok(document) => document,
            Err(error) => return doc! { "serialization error": error.to_string() },
        };

        for document_sequence in &self.document_sequences {
            let mut documents = Array::new();
            for document in &document_sequence.documents {
                match document.to_document() {
                    Ok(document) => documents.push(document.into()),
                    Err(error) => return doc! { "serialization error": error.to_string() },
                }
            }
            command.insert(document_sequence.identifier.clone(), documents);
        }

        command
    }

    /// Deserializes the body of an OP_MSG whose header has already been read.
    pub(crate) fn read_op_common(mut reader: &[u8], header: &Header) -> Result<Self> {
        let mut length_remaining = reader.len();
        let flags = MessageFlags::from_bits_truncate(reader.read_u32_sync()?);
        length_remaining -= std::mem::size_of::<u32>();

        let mut count_reader = SyncCountReader::new(&mut reader);
        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while length_remaining.saturating_sub(count_reader.bytes_read()) > 4 {
            let next_section = MessageSection::read(&mut count_reader)?;
            match next_section {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "an OP_MSG response must contain exactly one payload type 0 \
                                      section"
                                .into(),
                        }
                        .into());
                    } else {
                        document_payload = Some(document);
                    }
                }
                MessageSection::Sequence(document_sequence) => {
                    document_sequences.push(document_sequence)
                }
            }
        }

        let bytes_read = count_reader.bytes_read();
        length_remaining = length_remaining.checked_sub(bytes_read).ok_or_else(|| {
            Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but its sections \
                 were longer",
                header.length
            ))
        })?;

        let mut checksum = None;

        if length_remaining == 4 && flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            checksum = Some(reader.read_u32_sync()?);
        } else if length_remaining != 0 {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but it instead was {}",
                header.length,
                header.length as usize - length_remaining,
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "an OP_MSG response must contain exactly one payload type 0 section"
                    .into(),
            })?,
            document_sequences,
            checksum,
            request_id: header.request_id,
        })
    }

    /// Serializes the Message to bytes, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let sections = self.get_sections_bytes()?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self
                .checksum
                .as_ref()
                .map(std::mem::size_of_val)
                .unwrap_or(0);

        let header = Header {
            length: encoded_length(total_length)?,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        let mut bytes = Vec::with_capacity(total_length);
        header.write_to(&mut bytes);
        bytes.extend_from_slice(&self.flags.bits().to_le_bytes());
        bytes.extend_from_slice(&sections);

        if let Some(checksum) = self.checksum {
            bytes.extend_from_slice(&checksum.to_le_bytes());
        }

        Ok(bytes)
    }

    fn get_sections_bytes(&self) -> Result<Vec<u8>> {
        let mut sections = Vec::new();

        // Payload type 0
        sections.push(0);
        sections.extend(self.document_payload.as_bytes());

        for document_sequence in &self.document_sequences {
            // Payload type 1
            sections.push(1);

            let identifier_bytes = document_sequence.identifier.as_bytes();

            // Size bytes + identifier bytes + null-terminator byte + document bytes
            let size = document_sequence.section_len() - 1;
            sections.extend(encoded_length(size)?.to_le_bytes());

            sections.extend(identifier_bytes);
            sections.push(0);

            for document in &document_sequence.documents {
                sections.extend(document.as_bytes());
            }
        }

        Ok(sections)
    }
}

pub(crate) fn encoded_length(length: usize) -> Result<i32> {
    i32::try_from(length).map_err(|_| {
        ErrorKind::InvalidArgument {
            message: format!("message length {} exceeds the wire protocol limit", length),
        }
        .into()
    })
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        /// The message ends with a CRC-32C checksum.
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        /// The sender will not wait for a reply.
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        /// The client is prepared for multiple replies to this request.
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section of an OP_MSG.
#[derive(Debug)]
enum MessageSection {
    Document(RawDocumentBuf),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let payload_type = reader.read_u8_sync()?;

        if payload_type == 0 {
            let bytes = bson_util::read_document_bytes(reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)?;
            return Ok(MessageSection::Document(document));
        }
        if payload_type != 1 {
            return Err(Error::invalid_response(format!(
                "unknown OP_MSG payload type {}",
                payload_type
            )));
        }

        let size = reader.read_i32_sync()?;
        let mut length_remaining = usize::try_from(size)
            .ok()
            .and_then(|size| size.checked_sub(std::mem::size_of::<i32>()))
            .ok_or_else(|| Error::invalid_response(format!("invalid section size {}", size)))?;

        let (identifier, identifier_len) = reader.read_cstring_sync()?;
        length_remaining = length_remaining
            .checked_sub(identifier_len)
            .ok_or_else(|| Error::invalid_response(format!("invalid section size {}", size)))?;

        let mut documents = Vec::new();
        let mut count_reader = SyncCountReader::new(reader);

        while length_remaining > count_reader.bytes_read() {
            let bytes = bson_util::read_document_bytes(&mut count_reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)?;
            documents.push(document);
        }

        if length_remaining != count_reader.bytes_read() {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The server indicated that the section would be {} bytes long, but it \
                     instead was {}",
                    size,
                    size as usize - length_remaining + count_reader.bytes_read(),
                ),
            }
            .into());
        }

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}
