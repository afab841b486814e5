//! The command model: the document to run plus everything the protocols need to frame it.

mod payload;
mod validator;

use std::sync::Arc;

use derive_where::derive_where;
use typed_builder::TypedBuilder;

pub use self::{
    payload::{
        BatchLimits,
        BatchableSource,
        CommandPayload,
        PayloadBatch,
        PayloadFraming,
        PayloadSection,
    },
    validator::{
        CollectionElementNameValidator,
        ElementNameValidator,
        NoOpElementNameValidator,
        UpdateElementNameValidator,
    },
};
pub(crate) use self::validator::validate_document;
use crate::{
    bson::{Document, RawDocumentBuf},
    bson_util,
    conn::{wire::RequestIdGenerator, RequestMessage},
    selection_criteria::ReadPreference,
    trace::DEFAULT_MAX_DOCUMENT_LENGTH_BYTES,
};

/// Called with the request once it has been written to the connection.
pub type PostWriteHook = Arc<dyn Fn(&RequestMessage) + Send + Sync>;

/// What to do with the server's reply to a command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseHandling {
    /// Read the reply and return its contents.
    #[default]
    Return,

    /// Send the request with the `moreToCome` flag and do not wait for a reply. `OP_MSG` only.
    NoResponseExpected,

    /// Read the reply and discard it. `OP_QUERY` only, since every `OP_QUERY` is answered.
    Ignore,
}

/// A database command and the context it runs in.
///
/// The body is never modified. Fields such as `$db`, `lsid` and `$clusterTime` are added to a
/// copy of it when the message is built, and only when the body does not already contain them.
#[derive(Clone, TypedBuilder)]
#[derive_where(Debug)]
pub struct Command {
    /// The command document. Its first key is the command name.
    body: RawDocumentBuf,

    /// The database the command runs against.
    #[builder(setter(into))]
    database: String,

    #[builder(default, setter(strip_option))]
    read_preference: Option<ReadPreference>,

    /// Documents sent next to the body, e.g. the `documents` of an `insert`.
    #[builder(default)]
    #[derive_where(skip)]
    payloads: Vec<Arc<dyn CommandPayload>>,

    /// Checks the field names of the body before it is sent.
    #[builder(default = Arc::new(NoOpElementNameValidator))]
    validator: Arc<dyn ElementNameValidator>,

    /// Extra top-level fields such as `comment`. Never overwrite fields already present.
    #[builder(default, setter(strip_option))]
    additional_options: Option<Document>,

    #[builder(default, setter(strip_option))]
    #[derive_where(skip)]
    post_write_hook: Option<PostWriteHook>,

    #[builder(default)]
    response_handling: ResponseHandling,
}

impl Command {
    /// The name of the command, i.e. the first key of its body. Empty if the body is empty.
    pub fn name(&self) -> &str {
        bson_util::first_key(&self.body)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// The command document as provided.
    pub fn body(&self) -> &RawDocumentBuf {
        &self.body
    }

    /// The target database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The read preference, if one was set.
    pub fn read_preference(&self) -> Option<&ReadPreference> {
        self.read_preference.as_ref()
    }

    /// The bulk payloads.
    pub fn payloads(&self) -> &[Arc<dyn CommandPayload>] {
        &self.payloads
    }

    /// The validator applied to the body.
    pub fn validator(&self) -> &dyn ElementNameValidator {
        self.validator.as_ref()
    }

    /// The extra top-level fields.
    pub fn additional_options(&self) -> Option<&Document> {
        self.additional_options.as_ref()
    }

    /// The requested response handling.
    pub fn response_handling(&self) -> ResponseHandling {
        self.response_handling
    }

    pub(crate) fn run_post_write_hook(&self, message: &RequestMessage) {
        if let Some(ref hook) = self.post_write_hook {
            hook(message);
        }
    }
}

/// Settings shared by the messages a protocol encodes.
#[derive(Clone, Debug, TypedBuilder)]
#[non_exhaustive]
pub struct EncoderSettings {
    /// The source of request ids.
    #[builder(default = RequestIdGenerator::global())]
    pub request_id_generator: Arc<RequestIdGenerator>,

    /// Lowers the maximum message size reported by the connection.
    #[builder(default, setter(strip_option))]
    pub max_message_size: Option<i32>,

    /// The length at which documents in tracing events are truncated.
    #[builder(default = DEFAULT_MAX_DOCUMENT_LENGTH_BYTES)]
    pub max_document_length: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}
