use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::{
    check_command,
    response::ReplyContext,
    run_async,
    run_sync,
    DecodedReply,
    WireProtocol,
};
use crate::{
    bson::{self, RawDocumentBuf},
    bson_util,
    command::{
        validate_document,
        BatchLimits,
        Command,
        EncoderSettings,
        PayloadFraming,
        ResponseHandling,
    },
    concern::ReadConcernInternal,
    conn::{
        wire::{DocumentSequence, Header, Message, MessageFlags},
        AsyncConnection,
        ConnectionDescription,
        RequestMessage,
        ResponseMessage,
        ServerType,
        SyncConnection,
    },
    error::{Error, Result},
    session::{CoreSession, TransactionState},
};

/// Runs a command as an `OP_MSG`.
///
/// The body is sent as the type 0 section together with the session, cluster time and
/// transaction fields, and each payload of the command becomes a type 1 section.
pub struct OpMsgCommandProtocol<'a> {
    command: &'a Command,
    session: &'a mut dyn CoreSession,
    settings: EncoderSettings,
    response_handling: ResponseHandling,
}

impl<'a> OpMsgCommandProtocol<'a> {
    /// Prepares `command` to run in `session`. Fails if the command asks for
    /// [`ResponseHandling::Ignore`], which `OP_MSG` does not support.
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
        if response_handling == ResponseHandling::Ignore {
            return Err(Error::invalid_argument(
                "OP_MSG replies cannot be ignored; use NoResponseExpected instead",
            ));
        }
        Ok(Self {
            command,
            session,
            settings,
            response_handling,
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

    /// Copies the body and appends the fields this execution adds to it.
    fn build_body(&self, description: &ConnectionDescription) -> Result<RawDocumentBuf> {
        let command = self.command;
        let mut body = command.body().clone();

        bson_util::append_if_absent(&mut body, "$db", command.database())?;

        if let Some(read_preference) = command.read_preference() {
            if !read_preference.is_primary() && description.server_type != ServerType::Standalone
            {
                bson_util::append_if_absent(
                    &mut body,
                    "$readPreference",
                    bson::to_raw_document_buf(read_preference)?,
                )?;
            }
        }

        if let Some(id) = self.session.id() {
            bson_util::append_if_absent(&mut body, "lsid", RawDocumentBuf::from_document(id)?)?;
        }
        if let Some(cluster_time) = self.session.cluster_time() {
            bson_util::append_if_absent(
                &mut body,
                "$clusterTime",
                bson::to_raw_document_buf(cluster_time)?,
            )?;
        }

        if self.session.is_in_transaction() {
            if let Some(transaction) = self.session.current_transaction() {
                bson_util::append_if_absent(&mut body, "txnNumber", transaction.txn_number())?;
                if transaction.state() == TransactionState::Starting {
                    bson_util::append_if_absent(&mut body, "startTransaction", true)?;

                    let read_concern = ReadConcernInternal {
                        level: transaction
                            .options()
                            .read_concern
                            .as_ref()
                            .map(|read_concern| read_concern.level.clone()),
                        after_cluster_time: if self.session.is_causally_consistent() {
                            self.session.operation_time()
                        } else {
                            None
                        },
                    };
                    if !read_concern.is_empty() {
                        bson_util::append_if_absent(
                            &mut body,
                            "readConcern",
                            bson::to_raw_document_buf(&read_concern)?,
                        )?;
                    }
                }
                bson_util::append_if_absent(&mut body, "autocommit", false)?;
            }
        }

        if let Some(options) = command.additional_options() {
            bson_util::extend_if_absent(&mut body, &RawDocumentBuf::from_document(options)?)?;
        }

        Ok(body)
    }

    /// Encodes one batch of every payload as a type 1 section.
    fn build_sequences(
        &self,
        description: &ConnectionDescription,
        body: &RawDocumentBuf,
    ) -> Result<Vec<DocumentSequence>> {
        let payloads = self.command.payloads();
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let max_message_size = match self.settings.max_message_size {
            Some(max) => max.min(description.max_message_size_bytes),
            None => description.max_message_size_bytes,
        };
        let section_overheads: usize = payloads
            .iter()
            .map(|payload| DocumentSequence::overhead(payload.identifier()))
            .sum();
        // header + flags + type 0 payload byte
        let fixed_size = Header::LENGTH + 4 + 1 + body.as_bytes().len() + section_overheads;
        let mut remaining = usize::try_from(max_message_size)
            .unwrap_or_default()
            .saturating_sub(fixed_size);

        let max_batch_count = usize::try_from(description.max_write_batch_size).unwrap_or(1);
        let max_item_size = usize::try_from(description.max_bson_object_size).unwrap_or_default();

        let mut sequences = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let batch = payload.encode_batch(&BatchLimits::new(
                max_batch_count,
                max_item_size,
                remaining,
                PayloadFraming::DocumentSequence,
            ))?;
            remaining = remaining.saturating_sub(batch.size_bytes);
            sequences.push(DocumentSequence {
                identifier: payload.identifier().to_string(),
                documents: batch.documents,
            });
        }
        Ok(sequences)
    }
}

impl<'a> WireProtocol<'a> for OpMsgCommandProtocol<'a> {
    const NAME: &'static str = "OP_MSG";

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
        validate_document(self.command.validator(), self.command.body())?;
        self.session.about_to_send_command();

        let body = self.build_body(description)?;
        let document_sequences = self.build_sequences(description, &body)?;

        let mut message = Message::new(self.settings.request_id_generator.next_id(), body);
        message.document_sequences = document_sequences;
        if self.response_handling == ResponseHandling::NoResponseExpected {
            message.flags |= MessageFlags::MORE_TO_COME;
        }
        Ok(message.into())
    }

    fn message_sent(&mut self, _message: &RequestMessage) {
        if self.session.id().is_some() {
            self.session.was_used();
        }
        if let Some(transaction) = self.session.current_transaction_mut() {
            if transaction.state() == TransactionState::Starting {
                transaction.set_state(TransactionState::InProgress);
            }
        }
    }

    fn decode_reply(&self, context: &ReplyContext<'_>, frame: &[u8]) -> Result<DecodedReply> {
        match ResponseMessage::decode(frame)? {
            ResponseMessage::Message(reply) => {
                let request_id = context.message.request_id();
                if reply.response_to != request_id {
                    return Err(Error::invalid_response(format!(
                        "expected a reply to request {}, but the reply was to request {}",
                        request_id, reply.response_to
                    )));
                }
                Ok(DecodedReply::new(reply.document_payload))
            }
            ResponseMessage::Reply(_) => Err(Error::invalid_response(
                "expected an OP_MSG reply, but received an OP_REPLY",
            )),
        }
    }
}
