use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::{
    check_command,
    response::{self, ReplyContext},
    run_async,
    run_sync,
    DecodedReply,
    WireProtocol,
};
use crate::{
    bson::{self, rawdoc, RawArrayBuf, RawDocumentBuf},
    bson_util,
    command::{
        validate_document,
        BatchLimits,
        Command,
        EncoderSettings,
        PayloadFraming,
        ResponseHandling,
    },
    conn::{
        wire::{Query, QueryFlags, ResponseFlags},
        AsyncConnection,
        ConnectionDescription,
        RequestMessage,
        ResponseMessage,
        ServerType,
        SyncConnection,
    },
    error::{Error, ErrorKind, Result},
    session::CoreSession,
};

/// Runs a command as an `OP_QUERY` against `<database>.$cmd`, for servers that predate
/// `OP_MSG`.
///
/// The command is wrapped in `$query`, payloads are embedded in it as arrays, and transaction
/// fields are never sent.
pub struct OpQueryCommandProtocol<'a> {
    command: &'a Command,
    session: &'a mut dyn CoreSession,
    settings: EncoderSettings,
    response_handling: ResponseHandling,
    sent_session_id: bool,
}

impl<'a> OpQueryCommandProtocol<'a> {
    /// Prepares `command` to run in `session`. Fails if the command asks for
    /// [`ResponseHandling::NoResponseExpected`], since every `OP_QUERY` is answered.
    pub fn new(
        command: &'a Command,
        session: &'a mut dyn CoreSession,
        settings: EncoderSettings,
    ) -> Result<Self> {
        Self::with_response_handling(command, session, settings, command.response_handling())
    }

    pub(crate) fn with_response_handling(
        command: &'a Command,
        session: &'a mut dyn CoreSession,
        settings: EncoderSettings,
        response_handling: ResponseHandling,
    ) -> Result<Self> {
        check_command(command)?;
        if response_handling == ResponseHandling::NoResponseExpected {
            return Err(Error::invalid_argument(
                "OP_QUERY always receives a reply; use Ignore instead of NoResponseExpected",
            ));
        }
        Ok(Self {
            command,
            session,
            settings,
            response_handling,
            sent_session_id: false,
        })
    }

    /// Runs the command on a blocking connection.
    pub fn execute<T, C>(self, connection: &mut C, cancellation: &CancellationToken) -> Result<T>
    where
        T: DeserializeOwned + Default,
        C: SyncConnection + ?Sized,
    {
        run_sync(self, connection, cancellation)
    }

    /// Runs the command on an asynchronous connection.
    pub async fn execute_async<T, C>(
        self,
        connection: &mut C,
        cancellation: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned + Default,
        C: AsyncConnection + ?Sized,
    {
        run_async(self, connection, cancellation).await
    }

    /// Embeds one batch of every payload in `body` as an array field.
    fn embed_payloads(
        &self,
        description: &ConnectionDescription,
        body: &mut RawDocumentBuf,
    ) -> Result<()> {
        let payloads = self.command.payloads();
        if payloads.is_empty() {
            return Ok(());
        }

        let max_document_size =
            usize::try_from(description.max_bson_object_size).unwrap_or_default();
        // element type + key + null terminator + array length + array terminator
        let array_overheads: usize = payloads
            .iter()
            .map(|payload| 1 + payload.identifier().len() + 1 + 4 + 1)
            .sum();
        let mut remaining =
            max_document_size.saturating_sub(body.as_bytes().len() + array_overheads);
        let max_batch_count = usize::try_from(description.max_write_batch_size).unwrap_or(1);

        for payload in payloads {
            let batch = payload.encode_batch(&BatchLimits::new(
                max_batch_count,
                max_document_size,
                remaining,
                PayloadFraming::EmbeddedArray,
            ))?;
            remaining = remaining.saturating_sub(batch.size_bytes);

            let mut array = RawArrayBuf::new();
            for document in batch.documents {
                array.push(document);
            }
            bson_util::append_if_absent(body, payload.identifier(), array)?;
        }
        Ok(())
    }
}

impl<'a> WireProtocol<'a> for OpQueryCommandProtocol<'a> {
    const NAME: &'static str = "OP_QUERY";

    fn command(&self) -> &'a Command {
        self.command
    }

    fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    fn response_handling(&self) -> ResponseHandling {
        self.response_handling
    }

    fn session(&mut self) -> &mut dyn CoreSession {
        &mut *self.session
    }

    fn prepare(&mut self, description: &ConnectionDescription) -> Result<RequestMessage> {
        let sessions_supported = description.supports_sessions();
        if self.session.id().is_some() && !self.session.is_implicit() && !sessions_supported {
            return Err(ErrorKind::SessionsNotSupported.into());
        }

        let command = self.command;
        validate_document(command.validator(), command.body())?;
        self.session.about_to_send_command();

        let mut body = command.body().clone();
        self.embed_payloads(description, &mut body)?;

        bson_util::append_if_absent(&mut body, "$db", command.database())?;
        self.sent_session_id = false;
        if sessions_supported {
            if let Some(id) = self.session.id() {
                self.sent_session_id = bson_util::append_if_absent(
                    &mut body,
                    "lsid",
                    RawDocumentBuf::from_document(id)?,
                )?;
            }
        }
        if let Some(cluster_time) = self.session.cluster_time() {
            bson_util::append_if_absent(
                &mut body,
                "$clusterTime",
                bson::to_raw_document_buf(cluster_time)?,
            )?;
        }

        let mut wrapper = rawdoc! { "$query": body };
        let mut flags = QueryFlags::empty();
        if let Some(read_preference) = command.read_preference() {
            if !read_preference.is_primary() {
                flags |= QueryFlags::SECONDARY_OK;
                if description.server_type == ServerType::Mongos
                    && !read_preference.is_plain_secondary_preferred()
                {
                    wrapper.append(
                        "$readPreference",
                        bson::to_raw_document_buf(read_preference)?,
                    );
                }
            }
        }
        if let Some(options) = command.additional_options() {
            bson_util::extend_if_absent(&mut wrapper, &RawDocumentBuf::from_document(options)?)?;
        }

        let request_id = self.settings.request_id_generator.next_id();
        Ok(Query::command(request_id, command.database(), wrapper, flags).into())
    }

    fn message_sent(&mut self, _message: &RequestMessage) {
        if self.sent_session_id {
            self.session.was_used();
        }
    }

    fn decode_reply(&self, context: &ReplyContext<'_>, frame: &[u8]) -> Result<DecodedReply> {
        let mut reply = match ResponseMessage::decode(frame)? {
            ResponseMessage::Reply(reply) => reply,
            ResponseMessage::Message(_) => {
                return Err(Error::invalid_response(
                    "expected an OP_REPLY, but received an OP_MSG",
                ))
            }
        };

        let request_id = context.message.request_id();
        if reply.response_to != request_id {
            return Err(Error::invalid_response(format!(
                "expected a reply to request {}, but the reply was to request {}",
                request_id, reply.response_to
            )));
        }
        if reply.documents.len() != 1 {
            return Err(response::unexpected_document_count(
                context,
                reply.documents.len(),
            ));
        }

        let query_failure = reply.response_flags.contains(ResponseFlags::QUERY_FAILURE);
        let document = reply.documents.remove(0);
        Ok(DecodedReply {
            document,
            query_failure,
        })
    }
}
