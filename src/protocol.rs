//! Runs commands over a connection, using whichever framing the server supports.

mod op_msg;
mod op_query;
mod response;
#[cfg(test)]
mod test;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use self::response::ReplyContext;
pub use self::{op_msg::OpMsgCommandProtocol, op_query::OpQueryCommandProtocol};
use crate::{
    bson::{RawDocument, RawDocumentBuf},
    command::{Command, EncoderSettings, ResponseHandling},
    conn::{
        AsyncConnection,
        ConnectionDescription,
        ConnectionId,
        RequestMessage,
        SyncConnection,
    },
    error::{Error, Result, TRANSIENT_TRANSACTION_ERROR},
    session::CoreSession,
    trace::CommandTracer,
};

/// Executes a [`Command`] using `OP_MSG` when the connection supports it and `OP_QUERY`
/// otherwise.
///
/// The framing is chosen each time the command is executed, from the description of the
/// connection it runs on. [`ResponseHandling::NoResponseExpected`] and
/// [`ResponseHandling::Ignore`] are translated to whichever of the two the chosen framing
/// supports.
pub struct CommandWireProtocol<'a> {
    command: &'a Command,
    session: &'a mut dyn CoreSession,
    settings: EncoderSettings,
}

impl<'a> CommandWireProtocol<'a> {
    /// Prepares `command` to run in `session`.
    pub fn new(
        command: &'a Command,
        session: &'a mut dyn CoreSession,
        settings: EncoderSettings,
    ) -> Self {
        Self {
            command,
            session,
            settings,
        }
    }

    /// Runs the command on a blocking connection.
    pub fn execute<T, C>(self, connection: &mut C, cancellation: &CancellationToken) -> Result<T>
    where
        T: DeserializeOwned + Default,
        C: SyncConnection + ?Sized,
    {
        let supports_op_msg = connection
            .description()
            .is_some_and(ConnectionDescription::supports_op_msg);
        match self.select(supports_op_msg)? {
            CommandProtocol::OpMsg(protocol) => protocol.execute(connection, cancellation),
            CommandProtocol::OpQuery(protocol) => protocol.execute(connection, cancellation),
        }
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
        let supports_op_msg = connection
            .description()
            .is_some_and(ConnectionDescription::supports_op_msg);
        match self.select(supports_op_msg)? {
            CommandProtocol::OpMsg(protocol) => {
                protocol.execute_async(connection, cancellation).await
            }
            CommandProtocol::OpQuery(protocol) => {
                protocol.execute_async(connection, cancellation).await
            }
        }
    }

    fn select(self, supports_op_msg: bool) -> Result<CommandProtocol<'a>> {
        let handling = self.command.response_handling();
        if supports_op_msg {
            let handling = match handling {
                ResponseHandling::Ignore => ResponseHandling::NoResponseExpected,
                other => other,
            };
            OpMsgCommandProtocol::with_response_handling(
                self.command,
                self.session,
                self.settings,
                handling,
            )
            .map(CommandProtocol::OpMsg)
        } else {
            let handling = match handling {
                ResponseHandling::NoResponseExpected => ResponseHandling::Ignore,
                other => other,
            };
            OpQueryCommandProtocol::with_response_handling(
                self.command,
                self.session,
                self.settings,
                handling,
            )
            .map(CommandProtocol::OpQuery)
        }
    }
}

enum CommandProtocol<'a> {
    OpMsg(OpMsgCommandProtocol<'a>),
    OpQuery(OpQueryCommandProtocol<'a>),
}

/// The steps of an execution that differ between the two framings.
trait WireProtocol<'a> {
    /// The name of the framing, for tracing.
    const NAME: &'static str;

    fn command(&self) -> &'a Command;

    fn settings(&self) -> &EncoderSettings;

    fn response_handling(&self) -> ResponseHandling;

    fn session(&mut self) -> &mut dyn CoreSession;

    /// Builds the request. Fails before anything is written if the command cannot be sent.
    fn prepare(&mut self, description: &ConnectionDescription) -> Result<RequestMessage>;

    /// Applies the session changes that follow an attempt to send `message`.
    fn message_sent(&mut self, message: &RequestMessage);

    /// Extracts the reply document from a framed reply.
    fn decode_reply(&self, context: &ReplyContext<'_>, frame: &[u8]) -> Result<DecodedReply>;
}

pub(crate) struct DecodedReply {
    document: RawDocumentBuf,
    query_failure: bool,
}

impl DecodedReply {
    fn new(document: RawDocumentBuf) -> Self {
        Self {
            document,
            query_failure: false,
        }
    }
}

fn check_command(command: &Command) -> Result<()> {
    if command.name().is_empty() {
        return Err(Error::invalid_argument("the command document must not be empty"));
    }
    if command.database().is_empty() {
        return Err(Error::invalid_argument("the database name must not be empty"));
    }
    Ok(())
}

fn run_sync<'a, P, T, C>(
    mut protocol: P,
    connection: &mut C,
    cancellation: &CancellationToken,
) -> Result<T>
where
    P: WireProtocol<'a>,
    T: DeserializeOwned + Default,
    C: SyncConnection + ?Sized,
{
    let connection_id = connection.id().clone();
    let description = connection.description().cloned().unwrap_or_default();
    let message = protocol
        .prepare(&description)
        .map_err(|error| error.with_connection_id(&connection_id))?;
    let tracer = start_trace(&protocol, &message, &connection_id);

    let exchanged = exchange_sync(&mut protocol, connection, &message, cancellation);
    finish(&mut protocol, &message, exchanged, &tracer, &connection_id)
}

async fn run_async<'a, P, T, C>(
    mut protocol: P,
    connection: &mut C,
    cancellation: &CancellationToken,
) -> Result<T>
where
    P: WireProtocol<'a>,
    T: DeserializeOwned + Default,
    C: AsyncConnection + ?Sized,
{
    let connection_id = connection.id().clone();
    let description = connection.description().cloned().unwrap_or_default();
    let message = protocol
        .prepare(&description)
        .map_err(|error| error.with_connection_id(&connection_id))?;
    let tracer = start_trace(&protocol, &message, &connection_id);

    let exchanged = exchange_async(&mut protocol, connection, &message, cancellation).await;
    finish(&mut protocol, &message, exchanged, &tracer, &connection_id)
}

fn start_trace<'a, 'b, P: WireProtocol<'a>>(
    protocol: &P,
    message: &RequestMessage,
    connection_id: &'b ConnectionId,
) -> CommandTracer<'b>
where
    'a: 'b,
{
    let command = protocol.command();
    let tracer = CommandTracer::new(
        command.name(),
        command.database(),
        message.request_id(),
        connection_id,
        P::NAME,
        protocol.settings().max_document_length,
    );
    tracer.started(traced_document(message));
    tracer
}

fn traced_document(message: &RequestMessage) -> &RawDocument {
    match message {
        RequestMessage::Message(message) => &message.document_payload,
        RequestMessage::Query(query) => &query.query,
    }
}

/// Sends `message` and reads the reply if one is wanted. Returns `None` when there is no reply
/// to process. An ignored reply is left for the connection to skip, so the caller never waits
/// for it.
fn exchange_sync<'a, P, C>(
    protocol: &mut P,
    connection: &mut C,
    message: &RequestMessage,
    cancellation: &CancellationToken,
) -> Result<Option<Vec<u8>>>
where
    P: WireProtocol<'a>,
    C: SyncConnection + ?Sized,
{
    if cancellation.is_cancelled() {
        return Err(Error::cancelled());
    }

    let sent = connection.send_message(message, cancellation);
    protocol.message_sent(message);
    sent?;
    protocol.command().run_post_write_hook(message);

    let request_id = message.request_id();
    match protocol.response_handling() {
        ResponseHandling::Return => connection
            .receive_message(request_id, cancellation)
            .map(Some),
        ResponseHandling::Ignore => {
            connection.discard_reply(request_id);
            Ok(None)
        }
        ResponseHandling::NoResponseExpected => Ok(None),
    }
}

async fn exchange_async<'a, P, C>(
    protocol: &mut P,
    connection: &mut C,
    message: &RequestMessage,
    cancellation: &CancellationToken,
) -> Result<Option<Vec<u8>>>
where
    P: WireProtocol<'a>,
    C: AsyncConnection + ?Sized,
{
    if cancellation.is_cancelled() {
        return Err(Error::cancelled());
    }

    let sent = tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(Error::cancelled()),
        result = connection.send_message(message) => result,
    };
    protocol.message_sent(message);
    sent?;
    protocol.command().run_post_write_hook(message);

    let request_id = message.request_id();
    match protocol.response_handling() {
        ResponseHandling::Return => receive_async(connection, request_id, cancellation)
            .await
            .map(Some),
        ResponseHandling::Ignore => {
            connection.discard_reply(request_id);
            Ok(None)
        }
        ResponseHandling::NoResponseExpected => Ok(None),
    }
}

async fn receive_async<C: AsyncConnection + ?Sized>(
    connection: &mut C,
    response_to: i32,
    cancellation: &CancellationToken,
) -> Result<Vec<u8>> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(Error::cancelled()),
        result = connection.receive_message(response_to) => result,
    }
}

/// Processes the outcome of the exchange into the caller's result.
fn finish<'a, P, T>(
    protocol: &mut P,
    message: &RequestMessage,
    exchanged: Result<Option<Vec<u8>>>,
    tracer: &CommandTracer<'_>,
    connection_id: &ConnectionId,
) -> Result<T>
where
    P: WireProtocol<'a>,
    T: DeserializeOwned + Default,
{
    let context = ReplyContext {
        command_name: protocol.command().name(),
        message,
        connection_id,
    };

    let result = match exchanged {
        Ok(None) => {
            tracer.succeeded(None);
            Ok(T::default())
        }
        Ok(Some(frame)) => process_frame(protocol, &context, &frame, tracer),
        Err(error) => Err(error),
    };

    result.map_err(|mut error| {
        if error.is_network_error() && protocol.session().is_in_transaction() {
            error.add_label(TRANSIENT_TRANSACTION_ERROR);
        }
        let error = error.with_connection_id(connection_id);
        tracer.failed(&error);
        error
    })
}

fn process_frame<'a, P, T>(
    protocol: &mut P,
    context: &ReplyContext<'_>,
    frame: &[u8],
    tracer: &CommandTracer<'_>,
) -> Result<T>
where
    P: WireProtocol<'a>,
    T: DeserializeOwned,
{
    let reply = protocol.decode_reply(context, frame)?;
    if reply.query_failure {
        return Err(response::query_failure(context, &reply.document));
    }
    let value = response::process_reply(protocol.session(), context, &reply.document)?;
    tracer.succeeded(Some(&reply.document));
    Ok(value)
}
