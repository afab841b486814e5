use std::time::Instant;

use crate::{
    bson::{Bson, Document, RawDocument},
    conn::ConnectionId,
    error::Error,
};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_wire::command";

pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string()
    }
}

impl TracingRepresentation for Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

/// Truncates `s` to at most `new_length` bytes, rounded up to the next char boundary, and marks
/// the cut with "...".
pub(crate) fn truncate_on_char_boundary(s: &mut String, new_length: usize) {
    if new_length >= s.len() {
        return;
    }

    let mut boundary = new_length;
    while !s.is_char_boundary(boundary) {
        boundary += 1;
    }
    if boundary < s.len() {
        s.truncate(boundary);
        s.push_str("...");
    }
}

pub(crate) fn serialize_command_or_reply(doc: &RawDocument, max_length_bytes: usize) -> String {
    let mut serialized = match crate::bson::Document::try_from(doc) {
        Ok(doc) => doc.tracing_representation(),
        Err(error) => format!("<invalid document: {}>", error),
    };
    truncate_on_char_boundary(&mut serialized, max_length_bytes);
    serialized
}

/// Emits the started, succeeded and failed events for a single command execution.
pub(crate) struct CommandTracer<'a> {
    command_name: &'a str,
    database: &'a str,
    request_id: i32,
    connection_id: &'a ConnectionId,
    wire_protocol: &'static str,
    max_document_length_bytes: usize,
    start: Instant,
}

impl<'a> CommandTracer<'a> {
    pub(crate) fn new(
        command_name: &'a str,
        database: &'a str,
        request_id: i32,
        connection_id: &'a ConnectionId,
        wire_protocol: &'static str,
        max_document_length_bytes: usize,
    ) -> Self {
        Self {
            command_name,
            database,
            request_id,
            connection_id,
            wire_protocol,
            max_document_length_bytes,
            start: Instant::now(),
        }
    }

    fn enabled() -> bool {
        tracing::enabled!(target: COMMAND_TRACING_EVENT_TARGET, tracing::Level::DEBUG)
    }

    pub(crate) fn started(&self, command: &RawDocument) {
        if !Self::enabled() {
            return;
        }
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command = serialize_command_or_reply(command, self.max_document_length_bytes),
            databaseName = self.database,
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id.id,
            serverConnectionId = self.connection_id.server_id,
            serverHost = self.connection_id.address.as_str(),
            wireProtocol = self.wire_protocol,
            "Command started"
        );
    }

    pub(crate) fn succeeded(&self, reply: Option<&RawDocument>) {
        if !Self::enabled() {
            return;
        }
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            reply = reply
                .map(|reply| serialize_command_or_reply(reply, self.max_document_length_bytes)),
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id.id,
            serverConnectionId = self.connection_id.server_id,
            serverHost = self.connection_id.address.as_str(),
            durationMS = self.start.elapsed().as_millis(),
            "Command succeeded"
        );
    }

    pub(crate) fn failed(&self, error: &Error) {
        if !Self::enabled() {
            return;
        }
        let mut failure = error.tracing_representation();
        truncate_on_char_boundary(&mut failure, self.max_document_length_bytes);
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            failure,
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id.id,
            serverConnectionId = self.connection_id.server_id,
            serverHost = self.connection_id.address.as_str(),
            durationMS = self.start.elapsed().as_millis(),
            "Command failed"
        );
    }
}
