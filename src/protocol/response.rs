use serde::de::DeserializeOwned;

use crate::{
    bson::{self, RawDocument, RawDocumentBuf},
    bson_util,
    conn::{ConnectionId, RequestMessage},
    error::{
        classify_command_failure,
        CommandError,
        Error,
        ErrorKind,
        Result,
        WriteConcernError,
        WriteConcernFailure,
        WriteConcernResult,
    },
    session::{ClusterTime, CoreSession},
    trace::COMMAND_TRACING_EVENT_TARGET,
};

/// What a reply is checked against.
pub(crate) struct ReplyContext<'a> {
    pub(crate) command_name: &'a str,
    pub(crate) message: &'a RequestMessage,
    pub(crate) connection_id: &'a ConnectionId,
}

/// Forwards the clocks in `reply` to the session, then turns the reply into either a `T` or the
/// error it describes.
pub(crate) fn process_reply<T: DeserializeOwned>(
    session: &mut dyn CoreSession,
    context: &ReplyContext<'_>,
    reply: &RawDocument,
) -> Result<T> {
    forward_clocks(session, reply);

    if !bson_util::is_ok(reply.get("ok")?) {
        let error = CommandError::from_response(
            context.command_name,
            context.message.command_document(),
            reply,
            context.connection_id,
        );
        return Err(
            Error::new(classify_command_failure(error), Some(error_labels(reply)))
                .with_server_response(reply),
        );
    }

    if let Ok(write_concern_error) = reply.get_document("writeConcernError") {
        let failure = WriteConcernFailure {
            command_name: context.command_name.to_string(),
            command: context.message.command_document(),
            write_concern_error: WriteConcernError::from_reply(write_concern_error),
            result: WriteConcernResult::new(crate::bson::Document::try_from(reply)?),
            connection_id: context.connection_id.clone(),
        };
        return Err(
            Error::new(ErrorKind::WriteConcern(failure), Some(error_labels(reply)))
                .with_server_response(reply),
        );
    }

    Ok(bson::from_slice(reply.as_bytes())?)
}

/// Advances the session's cluster time and operation time from `reply`. Fields that are missing
/// or malformed are skipped.
fn forward_clocks(session: &mut dyn CoreSession, reply: &RawDocument) {
    if let Ok(cluster_time) = reply.get_document("$clusterTime") {
        match bson::from_slice::<ClusterTime>(cluster_time.as_bytes()) {
            Ok(cluster_time) => session.advance_cluster_time(&cluster_time),
            Err(error) => tracing::debug!(
                target: COMMAND_TRACING_EVENT_TARGET,
                "ignoring unreadable $clusterTime in reply: {}",
                error
            ),
        }
    }
    if let Ok(operation_time) = reply.get_timestamp("operationTime") {
        session.advance_operation_time(operation_time);
    }
}

fn error_labels(reply: &RawDocument) -> Vec<String> {
    bson_util::get_string_array(reply, "errorLabels")
}

/// The error for an `OP_REPLY` with the query failure flag set. The single document it carries
/// describes the failure.
pub(crate) fn query_failure(context: &ReplyContext<'_>, reply: &RawDocument) -> Error {
    let command = context.message.command_document();
    let error = match reply.get_str("$err").or_else(|_| reply.get_str("errmsg")) {
        Ok(_) => CommandError::from_response(
            context.command_name,
            command,
            reply,
            context.connection_id,
        ),
        Err(_) => CommandError::with_message(
            context.command_name,
            command,
            reply,
            context.connection_id,
            "Command failed.",
        ),
    };
    Error::new(classify_command_failure(error), None::<Vec<String>>).with_server_response(reply)
}

/// The error for a legacy reply that does not contain exactly one document.
pub(crate) fn unexpected_document_count(context: &ReplyContext<'_>, count: usize) -> Error {
    let message = if count == 0 {
        "Command returned no documents."
    } else {
        "Command returned multiple documents."
    };
    let error = CommandError::with_message(
        context.command_name,
        context.message.command_document(),
        &RawDocumentBuf::new(),
        context.connection_id,
        message,
    );
    ErrorKind::Command(error).into()
}
