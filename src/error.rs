//! Contains the `Error` and `Result` types that `mongodb-wire` uses.


use std::{collections::HashSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    bson::{Bson, Document, RawDocument, RawDocumentBuf},
    bson_util,
    conn::ConnectionId,
};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const EXECUTION_TIMEOUT_CODES: [i32; 4] = [50, 13475, 16986, 16712];

const RECOVERING_MESSAGES: [&str; 2] = ["node is recovering", "not master or secondary"];
const NOTWRITABLEPRIMARY_MESSAGES: [&str; 2] = ["not master", "not writable primary"];
const EXECUTION_TIMEOUT_MESSAGES: [&str; 2] = ["exceeded time limit", "execution terminated"];

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label. This label will be added to a network error that occurs
/// during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// The result type for all methods that can return an error in the `mongodb-wire` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb-wire` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is wrapped in an `Box` to keep the error small.
#[derive(Clone, Debug, Error)]
#[error(
    "Kind: {kind}, labels: {labels:?}, connection: {connection_id:?}, server response: \
     {server_response:?}"
)]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    pub(crate) connection_id: Option<ConnectionId>,

    pub(crate) server_response: Option<Box<RawDocumentBuf>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if let ErrorKind::WriteConcern(ref failure) = kind {
            labels.extend(failure.write_concern_error.labels.iter().cloned());
        }
        Self {
            kind: Box::new(kind),
            labels,
            connection_id: None,
            server_response: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn cancelled() -> Error {
        ErrorKind::Cancelled.into()
    }

    /// Whether this error was caused by a failure of the underlying connection.
    pub fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    /// Whether the operation was cancelled through its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Cancelled)
    }

    /// Whether this error indicates that the server is no longer a writable primary or is
    /// recovering. Such errors describe the topology rather than the command.
    pub fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_not_primary()
    }

    /// If this error corresponds to a "not writable primary" error.
    pub fn is_not_primary(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::NotPrimary(..))
    }

    /// If this error corresponds to a "node is recovering" error.
    pub fn is_recovering(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::NodeIsRecovering(..))
    }

    /// If this error corresponds to the server exceeding the operation's time limit.
    pub fn is_execution_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ExecutionTimeout(..))
    }

    /// Whether the command succeeded but its write concern could not be satisfied.
    pub fn is_write_concern_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::WriteConcern(..))
    }

    /// The [`CommandError`] carried by this error, if it originated from a failed command.
    pub fn command_error(&self) -> Option<&CommandError> {
        match self.kind.as_ref() {
            ErrorKind::Command(err)
            | ErrorKind::NotPrimary(err)
            | ErrorKind::NodeIsRecovering(err)
            | ErrorKind::ExecutionTimeout(err) => Some(err),
            _ => None,
        }
    }

    /// Gets the server error code from this error, if applicable.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::WriteConcern(failure) => Some(failure.write_concern_error.code),
            _ => self.command_error().map(|err| err.code),
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    pub fn add_label<T: AsRef<str>>(&mut self, label: T) {
        let label = label.as_ref().to_string();
        self.labels.insert(label);
    }

    /// The id of the connection the error occurred on, if known.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    /// The full response returned from the server. This can be used to inspect error fields that
    /// are not represented in the `Error` type.
    pub fn server_response(&self) -> Option<&RawDocumentBuf> {
        self.server_response.as_deref()
    }

    pub(crate) fn with_connection_id(mut self, connection_id: &ConnectionId) -> Self {
        if self.connection_id.is_none() {
            self.connection_id = Some(connection_id.clone());
        }
        self
    }

    pub(crate) fn with_server_response(mut self, response: &RawDocument) -> Self {
        if self.server_response.is_none() {
            self.server_response = Some(Box::new(response.to_owned()));
        }
        self
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<crate::bson::de::Error> for ErrorKind {
    fn from(err: crate::bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<crate::bson::ser::Error> for ErrorKind {
    fn from(err: crate::bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<crate::bson::raw::Error> for ErrorKind {
    fn from(err: crate::bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<crate::bson::raw::ValueAccessError> for ErrorKind {
    fn from(err: crate::bson::raw::ValueAccessError) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(crate::bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(crate::bson::ser::Error),

    /// The server returned an error to an attempted command.
    #[error("{0}")]
    Command(CommandError),

    /// The server reported that it is not a writable primary.
    #[error("{0}")]
    NotPrimary(CommandError),

    /// The server reported that it is recovering.
    #[error("{0}")]
    NodeIsRecovering(CommandError),

    /// The command exceeded its server-side time limit.
    #[error("{0}")]
    ExecutionTimeout(CommandError),

    /// The command succeeded but its write concern could not be satisfied.
    #[error("{0}")]
    WriteConcern(WriteConcernFailure),

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an invalid reply to a database command.
    #[error("The server returned an invalid reply to a database command: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// The server does not support sessions but an explicit session was used.
    #[error("Attempted to use an explicit session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// The operation was cancelled through its cancellation token.
    #[error("The operation was cancelled")]
    Cancelled,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error. `-1` when the server did not report a code.
    pub code: i32,

    /// The name associated with the error code.
    pub code_name: String,

    /// A description of the error that occurred.
    pub message: String,

    /// The name of the command that failed.
    pub command_name: String,

    /// The command as it was sent, including injected metadata.
    pub command: Document,

    /// The raw reply document returned by the server.
    pub response: Document,

    /// The connection the command was executed on.
    pub connection_id: ConnectionId,
}

impl CommandError {
    /// Builds a `CommandError` from a failed reply. The message is derived from `errmsg` (or the
    /// legacy `$err` field) when the server provided one.
    pub(crate) fn from_response(
        command_name: &str,
        command: Document,
        response: &RawDocument,
        connection_id: &ConnectionId,
    ) -> Self {
        let message = match server_message(response) {
            Some(errmsg) => format!("Command {} failed: {}.", command_name, errmsg),
            None => format!("Command {} failed.", command_name),
        };
        Self::with_message(command_name, command, response, connection_id, message)
    }

    pub(crate) fn with_message(
        command_name: &str,
        command: Document,
        response: &RawDocument,
        connection_id: &ConnectionId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: error_code(response),
            code_name: response
                .get_str("codeName")
                .map(ToString::to_string)
                .unwrap_or_default(),
            message: message.into(),
            command_name: command_name.to_string(),
            command,
            response: crate::bson::Document::try_from(response).unwrap_or_default(),
            connection_id: connection_id.clone(),
        }
    }

    /// The message the server reported, without the command name prefix.
    pub fn server_message(&self) -> Option<&str> {
        self.response
            .get_str("errmsg")
            .or_else(|_| self.response.get_str("$err"))
            .ok()
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{} (error code {} ({}) on {})",
            self.message, self.code, self.code_name, self.connection_id
        )
    }
}

/// The errors of a failed command that map onto a dedicated [`ErrorKind`], checked in order
/// after the state change checks.
const SERVER_ERROR_MAPPINGS: [(&[i32], &[&str], fn(CommandError) -> ErrorKind); 1] = [(
    &EXECUTION_TIMEOUT_CODES,
    &EXECUTION_TIMEOUT_MESSAGES,
    ErrorKind::ExecutionTimeout,
)];

/// Classifies a failed command reply. State change errors are checked first, then the
/// server-error mapping table; anything else is a generic [`ErrorKind::Command`].
pub(crate) fn classify_command_failure(error: CommandError) -> ErrorKind {
    let code = error.code;
    let message = error.server_message().unwrap_or_default().to_string();

    if NOTWRITABLEPRIMARY_CODES.contains(&code) {
        return ErrorKind::NotPrimary(error);
    }
    if RECOVERING_CODES.contains(&code) {
        return ErrorKind::NodeIsRecovering(error);
    }
    // "not master or secondary" also contains "not master".
    if RECOVERING_MESSAGES.iter().any(|m| message.contains(m)) {
        return ErrorKind::NodeIsRecovering(error);
    }
    if NOTWRITABLEPRIMARY_MESSAGES.iter().any(|m| message.contains(m)) {
        return ErrorKind::NotPrimary(error);
    }

    for (codes, messages, kind) in SERVER_ERROR_MAPPINGS {
        if codes.contains(&code) || messages.iter().any(|m| message.contains(m)) {
            return kind(error);
        }
    }

    ErrorKind::Command(error)
}

/// The `code` of a reply, or `-1` when it is missing or not an integral number.
fn error_code(response: &RawDocument) -> i32 {
    response
        .get("code")
        .ok()
        .flatten()
        .and_then(bson_util::get_int_raw)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(-1)
}

fn server_message(response: &RawDocument) -> Option<&str> {
    response
        .get_str("errmsg")
        .or_else(|_| response.get_str("$err"))
        .ok()
        .filter(|message| !message.is_empty())
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(alias = "errmsg", default = "String::new")]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,

    /// Labels categorizing the error.
    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

impl WriteConcernError {
    /// Reads the nested `writeConcernError` document of a reply. Every field is optional: a
    /// missing or non-integral `code` becomes `-1` and unreadable fields are left empty.
    pub(crate) fn from_reply(document: &RawDocument) -> Self {
        Self {
            code: error_code(document),
            code_name: document
                .get_str("codeName")
                .map(ToString::to_string)
                .unwrap_or_default(),
            message: document
                .get_str("errmsg")
                .map(ToString::to_string)
                .unwrap_or_default(),
            details: document
                .get_document("errInfo")
                .ok()
                .and_then(|details| crate::bson::Document::try_from(details).ok()),
            labels: bson_util::get_string_array(document, "errorLabels"),
        }
    }
}

/// The outcome of a write whose write concern failed. The write itself may have been applied, so
/// the reply fields describing it are kept.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteConcernResult {
    response: Document,
}

impl WriteConcernResult {
    pub(crate) fn new(response: Document) -> Self {
        Self { response }
    }

    /// The number of documents affected by the write.
    pub fn n(&self) -> Option<i64> {
        self.response.get("n").and_then(bson_util::get_int)
    }

    /// Whether an update modified an existing document.
    pub fn updated_existing(&self) -> Option<bool> {
        self.response.get_bool("updatedExisting").ok()
    }

    /// The `_id` of an upserted document, if any.
    pub fn upserted(&self) -> Option<&Bson> {
        self.response.get("upserted")
    }

    /// The full reply document.
    pub fn response(&self) -> &Document {
        &self.response
    }
}

/// A command that succeeded on the server but failed to satisfy its write concern.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct WriteConcernFailure {
    /// The name of the command.
    pub command_name: String,

    /// The command as it was sent.
    pub command: Document,

    /// The nested `writeConcernError` document.
    pub write_concern_error: WriteConcernError,

    /// The parsed result of the write.
    pub result: WriteConcernResult,

    /// The connection the command was executed on.
    pub connection_id: ConnectionId,
}

impl fmt::Display for WriteConcernFailure {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Command {} failed to satisfy its write concern: error code {} ({}): {}",
            self.command_name,
            self.write_concern_error.code,
            self.write_concern_error.code_name,
            self.write_concern_error.message
        )
    }
}
