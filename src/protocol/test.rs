use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::{CommandWireProtocol, OpMsgCommandProtocol, OpQueryCommandProtocol};
use crate::{
    bson::{doc, rawdoc, Bson, Document, Timestamp},
    command::{
        BatchableSource,
        Command,
        CommandPayload,
        EncoderSettings,
        PayloadSection,
        ResponseHandling,
        UpdateElementNameValidator,
    },
    concern::ReadConcern,
    conn::{
        wire::{MessageFlags, QueryFlags, RequestIdGenerator, ResponseFlags},
        ConnectionDescription,
        ConnectionId,
        RequestMessage,
        ServerType,
    },
    error::{ErrorKind, Result, TRANSIENT_TRANSACTION_ERROR},
    selection_criteria::ReadPreference,
    session::{
        ClientSession,
        CoreSession,
        NoSession,
        SessionOptions,
        TransactionOptions,
        TransactionState,
    },
    test::{CountingSession, MockConnection, ScriptedReply},
};

fn ping() -> Command {
    Command::builder()
        .body(rawdoc! { "ping": 1 })
        .database("test")
        .build()
}

fn explicit_session() -> CountingSession {
    CountingSession::new(ClientSession::new(SessionOptions::default()))
}

fn legacy_description(server_type: ServerType) -> ConnectionDescription {
    ConnectionDescription::builder()
        .server_type(server_type)
        .max_wire_version(4)
        .build()
}

fn cluster_time_reply(time: u32) -> Document {
    let ts = Timestamp { time, increment: 1 };
    doc! {
        "ok": 1,
        "$clusterTime": { "clusterTime": ts, "signature": { "keyId": 1 } },
        "operationTime": ts,
    }
}

fn execute(
    command: &Command,
    session: &mut dyn CoreSession,
    connection: &mut MockConnection,
) -> Result<Document> {
    CommandWireProtocol::new(command, session, EncoderSettings::default())
        .execute(connection, &CancellationToken::new())
}

#[test]
fn db_is_appended_without_touching_the_command() {
    let command = ping();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });

    let reply = execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(reply, doc! { "ok": 1 });

    assert_eq!(connection.last_command(), doc! { "ping": 1, "$db": "test" });
    assert_eq!(command.body(), &rawdoc! { "ping": 1 });
}

#[test]
fn db_already_present_is_kept() {
    let command = Command::builder()
        .body(rawdoc! { "ping": 1, "$db": "admin" })
        .database("test")
        .build();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });

    execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(connection.last_command(), doc! { "ping": 1, "$db": "admin" });
}

#[test]
fn session_fields_are_appended() {
    let command = ping();
    let mut session = explicit_session();
    session.advance_cluster_time(&crate::session::ClusterTime::new(
        Timestamp {
            time: 5,
            increment: 1,
        },
        doc! { "keyId": 1 },
    ));
    let mut connection = MockConnection::op_msg().with_reply(cluster_time_reply(9));

    execute(&command, &mut session, &mut connection).unwrap();

    let sent = connection.last_command();
    assert_eq!(sent.get_document("lsid").unwrap(), session.id().unwrap());
    assert_eq!(
        sent.get_document("$clusterTime")
            .unwrap()
            .get_timestamp("clusterTime")
            .unwrap(),
        Timestamp {
            time: 5,
            increment: 1
        }
    );
    assert!(!sent.contains_key("txnNumber"));
    assert_eq!(session.was_used_calls, 1);
    assert_eq!(session.about_to_send_calls, 1);

    // The reply's clocks are forwarded.
    assert_eq!(session.cluster_time().unwrap().timestamp().time, 9);
    assert_eq!(session.operation_time().unwrap().time, 9);
}

#[test]
fn read_preference_depends_on_server_type() {
    let command = Command::builder()
        .body(rawdoc! { "find": "coll" })
        .database("test")
        .read_preference(ReadPreference::Secondary { options: None })
        .build();

    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });
    execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(
        connection.last_command().get_document("$readPreference").unwrap(),
        &doc! { "mode": "secondary" }
    );

    let standalone = ConnectionDescription::builder()
        .server_type(ServerType::Standalone)
        .max_wire_version(8)
        .build();
    let mut connection = MockConnection::new(Some(standalone)).with_reply(doc! { "ok": 1 });
    execute(&command, &mut NoSession, &mut connection).unwrap();
    assert!(!connection.last_command().contains_key("$readPreference"));

    let primary = Command::builder()
        .body(rawdoc! { "find": "coll" })
        .database("test")
        .read_preference(ReadPreference::Primary)
        .build();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });
    execute(&primary, &mut NoSession, &mut connection).unwrap();
    assert!(!connection.last_command().contains_key("$readPreference"));
}

#[test]
fn starting_transaction_fields() {
    let mut session = explicit_session();
    session.advance_operation_time(Timestamp {
        time: 3,
        increment: 4,
    });
    session
        .inner
        .start_transaction(
            TransactionOptions::builder()
                .read_concern(ReadConcern::snapshot())
                .build(),
        )
        .unwrap();

    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .build();
    let mut connection = MockConnection::op_msg()
        .with_reply(doc! { "ok": 1 })
        .with_reply(doc! { "ok": 1 });

    execute(&command, &mut session, &mut connection).unwrap();
    let first = connection.last_command();
    assert_eq!(first.get_i64("txnNumber").unwrap(), 1);
    assert_eq!(first.get_bool("startTransaction").unwrap(), true);
    assert_eq!(first.get_bool("autocommit").unwrap(), false);
    assert_eq!(
        first.get_document("readConcern").unwrap(),
        &doc! {
            "level": "snapshot",
            "afterClusterTime": Timestamp { time: 3, increment: 4 },
        }
    );
    assert_eq!(
        session.current_transaction().unwrap().state(),
        TransactionState::InProgress
    );

    execute(&command, &mut session, &mut connection).unwrap();
    let second = connection.last_command();
    assert_eq!(second.get_i64("txnNumber").unwrap(), 1);
    assert_eq!(second.get_bool("autocommit").unwrap(), false);
    assert!(!second.contains_key("startTransaction"));
    assert!(!second.contains_key("readConcern"));
    assert_eq!(session.was_used_calls, 2);
}

#[test]
fn empty_transaction_read_concern_is_omitted() {
    let mut session = CountingSession::new(ClientSession::new(
        SessionOptions::builder().causal_consistency(false).build(),
    ));
    session.advance_operation_time(Timestamp {
        time: 3,
        increment: 4,
    });
    session.inner.start_transaction(None).unwrap();

    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });
    execute(&ping(), &mut session, &mut connection).unwrap();

    let sent = connection.last_command();
    assert_eq!(sent.get_bool("startTransaction").unwrap(), true);
    assert!(!sent.contains_key("readConcern"));
}

#[test]
fn network_error_in_transaction_is_transient() {
    let mut session = explicit_session();
    session.inner.start_transaction(None).unwrap();
    let mut connection =
        MockConnection::op_msg().with_scripted(ScriptedReply::Io(io::ErrorKind::ConnectionReset));

    let error = execute(&ping(), &mut session, &mut connection).unwrap_err();
    assert!(error.is_network_error());
    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert_eq!(
        error.connection_id().map(|id| id.to_string()),
        Some(ConnectionId::new(7, "localhost:27017").to_string())
    );
    assert_eq!(session.was_used_calls, 1);
    assert_eq!(
        session.current_transaction().unwrap().state(),
        TransactionState::InProgress
    );
}

#[test]
fn network_error_outside_transaction_is_not_labeled() {
    let mut session = explicit_session();
    let mut connection =
        MockConnection::op_msg().with_scripted(ScriptedReply::Io(io::ErrorKind::ConnectionReset));

    let error = execute(&ping(), &mut session, &mut connection).unwrap_err();
    assert!(error.is_network_error());
    assert!(error.labels().is_empty());
}

#[test]
fn failed_send_still_counts_as_sent() {
    let mut session = explicit_session();
    session.inner.start_transaction(None).unwrap();
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = hook_calls.clone();
    let command = Command::builder()
        .body(rawdoc! { "ping": 1 })
        .database("test")
        .post_write_hook(Arc::new(move |_: &RequestMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .build();
    let mut connection = MockConnection::op_msg().failing_sends(io::ErrorKind::BrokenPipe);

    let error = execute(&command, &mut session, &mut connection).unwrap_err();
    assert!(error.is_network_error());
    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert_eq!(session.was_used_calls, 1);
    assert_eq!(
        session.current_transaction().unwrap().state(),
        TransactionState::InProgress
    );
    assert_eq!(connection.receive_calls, 0);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn post_write_hook_runs_once_after_the_write() {
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = hook_calls.clone();
    let command = Command::builder()
        .body(rawdoc! { "ping": 1 })
        .database("test")
        .post_write_hook(Arc::new(move |message: &RequestMessage| {
            assert!(message.response_expected());
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .build();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });

    execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn not_primary_reply() {
    let mut session = explicit_session();
    let mut reply = cluster_time_reply(12);
    reply.insert("ok", 0);
    reply.insert("code", 10107);
    reply.insert("errmsg", "not master");
    reply.insert("errorLabels", vec!["RetryableWriteError"]);
    let mut connection = MockConnection::op_msg().with_reply(reply);

    let error = execute(&ping(), &mut session, &mut connection).unwrap_err();
    assert!(error.is_not_primary());
    assert!(error.is_state_change_error());
    assert!(error.contains_label("RetryableWriteError"));
    assert_eq!(error.code(), Some(10107));
    assert!(error.server_response().is_some());

    let command_error = error.command_error().unwrap();
    assert_eq!(command_error.message, "Command ping failed: not master.");
    assert_eq!(command_error.command.get_str("$db").unwrap(), "test");

    // Clocks advance even though the command failed.
    assert_eq!(session.cluster_time().unwrap().timestamp().time, 12);
}

#[test]
fn write_concern_error_reply() {
    let mut connection = MockConnection::op_msg().with_reply(doc! {
        "ok": 1,
        "n": 1,
        "writeConcernError": { "code": 64, "errmsg": "timeout" },
    });

    let error = execute(&ping(), &mut NoSession, &mut connection).unwrap_err();
    assert!(error.is_write_concern_error());
    let ErrorKind::WriteConcern(ref failure) = *error.kind else {
        panic!("expected write concern error, got {:?}", error);
    };
    assert_eq!(failure.write_concern_error.code, 64);
    assert_eq!(failure.write_concern_error.message, "timeout");
    assert_eq!(failure.result.n(), Some(1));
}

#[test]
fn loosely_typed_write_concern_errors() {
    let mut without_code = cluster_time_reply(20);
    without_code.insert("writeConcernError", doc! { "errmsg": "timeout" });
    let mut double_code = cluster_time_reply(21);
    double_code.insert(
        "writeConcernError",
        doc! { "code": 64.0, "errmsg": "timeout", "errorLabels": "not-an-array" },
    );

    for (reply, expected_code, time) in [(without_code, -1, 20), (double_code, 64, 21)] {
        let mut session = explicit_session();
        let mut connection = MockConnection::op_msg().with_reply(reply);

        let error = execute(&ping(), &mut session, &mut connection).unwrap_err();
        let ErrorKind::WriteConcern(ref failure) = *error.kind else {
            panic!("expected write concern error, got {:?}", error);
        };
        assert_eq!(failure.write_concern_error.code, expected_code);
        assert_eq!(failure.write_concern_error.message, "timeout");
        assert_eq!(session.cluster_time().unwrap().timestamp().time, time);
        assert_eq!(session.operation_time().unwrap().time, time);
    }
}

#[test]
fn malformed_labels_do_not_hide_the_error_kind() {
    let mut session = explicit_session();
    let mut reply = cluster_time_reply(30);
    reply.insert("ok", 0);
    reply.insert("code", 10107);
    reply.insert("errmsg", "not master");
    reply.insert("errorLabels", "RetryableWriteError");
    let mut connection = MockConnection::op_msg().with_reply(reply);

    let error = execute(&ping(), &mut session, &mut connection).unwrap_err();
    assert!(error.is_not_primary());
    assert!(error.labels().is_empty());
    assert_eq!(session.cluster_time().unwrap().timestamp().time, 30);

    let mut reply = doc! { "ok": 0, "code": 2, "errmsg": "bad" };
    reply.insert("errorLabels", vec![Bson::Int32(1), Bson::String("Custom".into())]);
    reply.insert("$clusterTime", "not a document");
    let mut connection = MockConnection::op_msg().with_reply(reply);
    let mut session = explicit_session();

    let error = execute(&ping(), &mut session, &mut connection).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Command(..)));
    assert_eq!(error.labels().len(), 1);
    assert!(error.contains_label("Custom"));
    assert!(session.cluster_time().is_none());
}

#[test]
fn typed_reply() {
    #[derive(Debug, Default, serde::Deserialize, PartialEq)]
    struct Count {
        n: i32,
    }

    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1, "n": 3 });
    let count: Count = CommandWireProtocol::new(&ping(), &mut NoSession, EncoderSettings::default())
        .execute(&mut connection, &CancellationToken::new())
        .unwrap();
    assert_eq!(count, Count { n: 3 });
}

#[test]
fn reply_to_another_request_is_rejected() {
    let mut connection =
        MockConnection::op_msg().with_scripted(ScriptedReply::Misdirected(doc! { "ok": 1 }));
    let error = execute(&ping(), &mut NoSession, &mut connection).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }), "{:?}", error);
}

#[test]
fn no_response_expected_sets_more_to_come() {
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .response_handling(ResponseHandling::NoResponseExpected)
        .build();
    let mut connection = MockConnection::op_msg();

    let reply = execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(reply, Document::new());
    assert_eq!(connection.receive_calls, 0);
    let RequestMessage::Message(ref message) = *connection.last_sent() else {
        panic!("expected OP_MSG");
    };
    assert!(message.flags.contains(MessageFlags::MORE_TO_COME));
    assert!(!connection.last_sent().response_expected());
}

#[test]
fn ignore_becomes_no_response_expected_on_op_msg() {
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .response_handling(ResponseHandling::Ignore)
        .build();
    let mut connection = MockConnection::op_msg();

    execute(&command, &mut NoSession, &mut connection).unwrap();
    assert!(!connection.last_sent().response_expected());
    assert_eq!(connection.receive_calls, 0);
}

#[test]
fn constructors_reject_invalid_handling() {
    let ignore = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .response_handling(ResponseHandling::Ignore)
        .build();
    let error = OpMsgCommandProtocol::new(&ignore, &mut NoSession, EncoderSettings::default())
        .err()
        .unwrap();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));

    let no_response = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .response_handling(ResponseHandling::NoResponseExpected)
        .build();
    assert!(
        OpQueryCommandProtocol::new(&no_response, &mut NoSession, EncoderSettings::default())
            .is_err()
    );

    let empty = Command::builder().body(rawdoc! {}).database("test").build();
    assert!(OpMsgCommandProtocol::new(&empty, &mut NoSession, EncoderSettings::default()).is_err());
}

#[test]
fn invalid_body_is_rejected_before_sending() {
    let command = Command::builder()
        .body(rawdoc! { "x": 1 })
        .database("test")
        .validator(Arc::new(UpdateElementNameValidator))
        .build();
    let mut session = explicit_session();
    let mut connection = MockConnection::op_msg();

    let error = execute(&command, &mut session, &mut connection).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
    assert!(connection.sent.is_empty());
    assert_eq!(session.was_used_calls, 0);
}

#[test]
fn additional_options_do_not_overwrite() {
    let command = Command::builder()
        .body(rawdoc! { "find": "coll", "comment": "original" })
        .database("test")
        .additional_options(doc! { "comment": "ignored", "maxTimeMS": 100 })
        .build();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });

    execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(
        connection.last_command(),
        doc! { "find": "coll", "comment": "original", "$db": "test", "maxTimeMS": 100 }
    );
}

#[test]
fn request_ids_come_from_the_settings() {
    let settings = EncoderSettings::builder()
        .request_id_generator(Arc::new(RequestIdGenerator::starting_at(100)))
        .build();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });

    let _: Document = CommandWireProtocol::new(&ping(), &mut NoSession, settings)
        .execute(&mut connection, &CancellationToken::new())
        .unwrap();
    assert_eq!(connection.last_sent().request_id(), 100);
}

#[test]
fn cancelled_before_send() {
    let token = CancellationToken::new();
    token.cancel();
    let mut session = explicit_session();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });

    let error = CommandWireProtocol::new(&ping(), &mut session, EncoderSettings::default())
        .execute::<Document, _>(&mut connection, &token)
        .unwrap_err();
    assert!(error.is_cancelled());
    assert!(connection.sent.is_empty());
    assert_eq!(session.was_used_calls, 0);
}

#[test]
fn payload_is_split_into_a_document_sequence() {
    let documents: Vec<Document> = (0..10).map(|i| doc! { "_id": i }).collect();
    let section = Arc::new(
        PayloadSection::builder()
            .identifier("documents")
            .source(BatchableSource::new(documents))
            .max_batch_count(3)
            .build(),
    );
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .payloads(vec![section.clone() as Arc<dyn CommandPayload>])
        .build();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1, "n": 3 });

    execute(&command, &mut NoSession, &mut connection).unwrap();

    let RequestMessage::Message(ref message) = *connection.last_sent() else {
        panic!("expected OP_MSG");
    };
    assert_eq!(message.document_sequences.len(), 1);
    let sequence = &message.document_sequences[0];
    assert_eq!(sequence.identifier, "documents");
    assert_eq!(sequence.documents.len(), 3);
    assert_eq!(sequence.documents[2].get_i32("_id").unwrap(), 2);
    assert_eq!(section.processed_count(), 3);
    assert_eq!(section.remaining().offset(), 3);
    assert_eq!(section.remaining().count(), 7);

    // The sequence is also visible in the command reported with errors.
    let command = connection.last_sent().command_document();
    assert_eq!(command.get_array("documents").unwrap().len(), 3);
}

#[test]
fn payload_respects_the_message_size_override() {
    let documents: Vec<Document> = (0..20)
        .map(|i| doc! { "_id": i, "padding": "x".repeat(100) })
        .collect();
    let section = Arc::new(
        PayloadSection::builder()
            .identifier("documents")
            .source(BatchableSource::new(documents))
            .build(),
    );
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .payloads(vec![section.clone() as Arc<dyn CommandPayload>])
        .build();
    let settings = EncoderSettings::builder().max_message_size(1000).build();
    let mut connection = MockConnection::op_msg().with_reply(doc! { "ok": 1 });

    let _: Document = CommandWireProtocol::new(&command, &mut NoSession, settings)
        .execute(&mut connection, &CancellationToken::new())
        .unwrap();

    let encoded = connection.last_sent().encode().unwrap();
    assert!(encoded.len() <= 1000, "{} bytes", encoded.len());
    let processed = section.processed_count();
    assert!(processed > 0 && processed < 20, "{} processed", processed);
}

#[test]
fn oversized_payload_item_is_rejected() {
    let section = Arc::new(
        PayloadSection::builder()
            .identifier("documents")
            .source(BatchableSource::new(vec![doc! { "big": "x".repeat(200) }]))
            .max_item_size(100)
            .build(),
    );
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .payloads(vec![section as Arc<dyn CommandPayload>])
        .build();
    let mut connection = MockConnection::op_msg();

    let error = execute(&command, &mut NoSession, &mut connection).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
    assert!(connection.sent.is_empty());
}

#[test]
fn legacy_ping() {
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! { "ok": 1 }], ResponseFlags::empty());

    let reply = execute(&ping(), &mut NoSession, &mut connection).unwrap();
    assert_eq!(reply, doc! { "ok": 1 });

    let RequestMessage::Query(ref query) = *connection.last_sent() else {
        panic!("expected OP_QUERY");
    };
    assert_eq!(query.full_collection_name, "test.$cmd");
    assert_eq!(query.number_to_return, -1);
    assert_eq!(query.flags, QueryFlags::empty());
    assert_eq!(
        query.query.to_document().unwrap(),
        doc! { "$query": { "ping": 1, "$db": "test" } }
    );
}

#[test]
fn missing_description_uses_op_query() {
    let mut connection =
        MockConnection::new(None).with_op_reply(vec![doc! { "ok": 1 }], ResponseFlags::empty());
    execute(&ping(), &mut NoSession, &mut connection).unwrap();
    assert!(matches!(connection.last_sent(), RequestMessage::Query(_)));
}

#[test]
fn legacy_explicit_session_requires_support() {
    let mut session = explicit_session();
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone));

    let error = execute(&ping(), &mut session, &mut connection).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::SessionsNotSupported));
    assert!(connection.sent.is_empty());
    assert_eq!(session.was_used_calls, 0);
}

#[test]
fn legacy_implicit_session_is_omitted() {
    let mut session = CountingSession::new(ClientSession::new_implicit());
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! { "ok": 1 }], ResponseFlags::empty());

    execute(&ping(), &mut session, &mut connection).unwrap();
    let query = connection.last_command();
    assert!(!query.get_document("$query").unwrap().contains_key("lsid"));
    assert_eq!(session.was_used_calls, 0);
}

#[test]
fn legacy_session_and_no_transaction_fields() {
    let description = ConnectionDescription::builder()
        .server_type(ServerType::RsPrimary)
        .max_wire_version(5)
        .logical_session_timeout(Duration::from_secs(1800))
        .build();
    let mut session = explicit_session();
    session.inner.start_transaction(None).unwrap();
    let mut connection = MockConnection::legacy(description)
        .with_op_reply(vec![cluster_time_reply(4)], ResponseFlags::empty());

    execute(&ping(), &mut session, &mut connection).unwrap();

    let query = connection.last_command();
    let inner = query.get_document("$query").unwrap();
    assert_eq!(inner.get_document("lsid").unwrap(), session.id().unwrap());
    assert!(!inner.contains_key("txnNumber"));
    assert!(!inner.contains_key("autocommit"));
    assert_eq!(session.was_used_calls, 1);
    assert_eq!(session.operation_time().unwrap().time, 4);
}

#[test]
fn legacy_read_preference_wrapping() {
    let nearest = Command::builder()
        .body(rawdoc! { "count": "coll" })
        .database("test")
        .read_preference(ReadPreference::Nearest { options: None })
        .build();
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Mongos))
        .with_op_reply(vec![doc! { "ok": 1 }], ResponseFlags::empty());
    execute(&nearest, &mut NoSession, &mut connection).unwrap();

    let RequestMessage::Query(ref query) = *connection.last_sent() else {
        panic!("expected OP_QUERY");
    };
    assert!(query.flags.contains(QueryFlags::SECONDARY_OK));
    assert_eq!(
        query.query.to_document().unwrap(),
        doc! {
            "$query": { "count": "coll", "$db": "test" },
            "$readPreference": { "mode": "nearest" },
        }
    );

    // A bare secondaryPreferred is expressed by the flag alone.
    let secondary_preferred = Command::builder()
        .body(rawdoc! { "count": "coll" })
        .database("test")
        .read_preference(ReadPreference::SecondaryPreferred { options: None })
        .build();
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Mongos))
        .with_op_reply(vec![doc! { "ok": 1 }], ResponseFlags::empty());
    execute(&secondary_preferred, &mut NoSession, &mut connection).unwrap();
    let RequestMessage::Query(ref query) = *connection.last_sent() else {
        panic!("expected OP_QUERY");
    };
    assert!(query.flags.contains(QueryFlags::SECONDARY_OK));
    assert!(query.query.get("$readPreference").unwrap().is_none());

    // Only mongos reads the wrapper field.
    let mut connection = MockConnection::legacy(legacy_description(ServerType::RsSecondary))
        .with_op_reply(vec![doc! { "ok": 1 }], ResponseFlags::empty());
    execute(&nearest, &mut NoSession, &mut connection).unwrap();
    let RequestMessage::Query(ref query) = *connection.last_sent() else {
        panic!("expected OP_QUERY");
    };
    assert!(query.flags.contains(QueryFlags::SECONDARY_OK));
    assert!(query.query.get("$readPreference").unwrap().is_none());
}

#[test]
fn legacy_additional_options_go_in_the_wrapper() {
    let command = Command::builder()
        .body(rawdoc! { "find": "coll" })
        .database("test")
        .additional_options(doc! { "$comment": "hi", "$query": "not used" })
        .build();
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! { "ok": 1 }], ResponseFlags::empty());

    execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(
        connection.last_command(),
        doc! { "$query": { "find": "coll", "$db": "test" }, "$comment": "hi" }
    );
}

#[test]
fn legacy_payload_is_embedded_as_an_array() {
    let documents: Vec<Document> = (0..5).map(|i| doc! { "_id": i }).collect();
    let section = Arc::new(
        PayloadSection::builder()
            .identifier("documents")
            .source(BatchableSource::fixed(documents))
            .max_batch_count(2)
            .build(),
    );
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .payloads(vec![section.clone() as Arc<dyn CommandPayload>])
        .build();
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! { "ok": 1, "n": 5 }], ResponseFlags::empty());

    execute(&command, &mut NoSession, &mut connection).unwrap();

    let query = connection.last_command();
    let inner = query.get_document("$query").unwrap();
    assert_eq!(inner.get_array("documents").unwrap().len(), 5);
    assert_eq!(section.processed_count(), 5);
}

#[test]
fn legacy_ignore_leaves_the_reply_to_the_connection() {
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .response_handling(ResponseHandling::Ignore)
        .build();

    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! { "ok": 0, "code": 2 }], ResponseFlags::empty());
    let reply = execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(reply, Document::new());
    assert_eq!(connection.receive_calls, 0);
    assert_eq!(connection.discarded, vec![connection.last_sent().request_id()]);
}

#[test]
fn no_response_expected_becomes_ignore_on_op_query() {
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .response_handling(ResponseHandling::NoResponseExpected)
        .build();
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! { "ok": 1 }], ResponseFlags::empty());

    execute(&command, &mut NoSession, &mut connection).unwrap();
    assert_eq!(connection.receive_calls, 0);
    assert_eq!(connection.discarded.len(), 1);
    let RequestMessage::Query(ref query) = connection.last_sent() else {
        panic!("expected OP_QUERY");
    };
    assert!(query.flags.is_empty());
}

#[test]
fn legacy_reply_document_count() {
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![], ResponseFlags::empty());
    let error = execute(&ping(), &mut NoSession, &mut connection).unwrap_err();
    assert_eq!(
        error.command_error().unwrap().message,
        "Command returned no documents."
    );

    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! { "ok": 1 }, doc! { "ok": 1 }], ResponseFlags::empty());
    let error = execute(&ping(), &mut NoSession, &mut connection).unwrap_err();
    assert_eq!(
        error.command_error().unwrap().message,
        "Command returned multiple documents."
    );
}

#[test]
fn legacy_query_failure() {
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(
            vec![doc! { "$err": "not master", "code": 10107 }],
            ResponseFlags::QUERY_FAILURE,
        );
    let error = execute(&ping(), &mut NoSession, &mut connection).unwrap_err();
    assert!(error.is_not_primary());

    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! {}], ResponseFlags::QUERY_FAILURE);
    let error = execute(&ping(), &mut NoSession, &mut connection).unwrap_err();
    let command_error = error.command_error().unwrap();
    assert_eq!(command_error.message, "Command failed.");
    assert!(matches!(*error.kind, ErrorKind::Command(_)));
}

#[test]
fn legacy_rejects_op_msg_reply() {
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_reply(doc! { "ok": 1 });
    let error = execute(&ping(), &mut NoSession, &mut connection).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }));
}

#[tokio::test]
async fn async_execution() {
    let mut session = explicit_session();
    let mut connection = MockConnection::op_msg().with_reply(cluster_time_reply(2));

    let reply: Document =
        CommandWireProtocol::new(&ping(), &mut session, EncoderSettings::default())
            .execute_async(&mut connection, &CancellationToken::new())
            .await
            .unwrap();
    assert_eq!(reply.get_i32("ok").unwrap(), 1);
    assert_eq!(session.was_used_calls, 1);
    assert_eq!(session.cluster_time().unwrap().timestamp().time, 2);
}

#[tokio::test]
async fn async_cancellation_while_waiting_for_reply() {
    let mut session = explicit_session();
    session.inner.start_transaction(None).unwrap();
    let mut connection = MockConnection::op_msg().with_scripted(ScriptedReply::Pending);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let error = CommandWireProtocol::new(&ping(), &mut session, EncoderSettings::default())
        .execute_async::<Document, _>(&mut connection, &token)
        .await
        .unwrap_err();
    assert!(error.is_cancelled());
    assert!(!error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert_eq!(connection.sent.len(), 1);
    assert_eq!(session.was_used_calls, 1);
    assert_eq!(
        session.current_transaction().unwrap().state(),
        TransactionState::InProgress
    );
}

#[tokio::test]
async fn async_legacy_execution() {
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_op_reply(vec![doc! { "ok": 1, "value": "x" }], ResponseFlags::empty());

    let reply: Document =
        CommandWireProtocol::new(&ping(), &mut NoSession, EncoderSettings::default())
            .execute_async(&mut connection, &CancellationToken::new())
            .await
            .unwrap();
    assert_eq!(reply.get("value"), Some(&Bson::String("x".into())));
}

#[tokio::test]
async fn async_legacy_ignore_does_not_wait_for_the_reply() {
    let command = Command::builder()
        .body(rawdoc! { "insert": "coll" })
        .database("test")
        .response_handling(ResponseHandling::Ignore)
        .build();
    let mut connection = MockConnection::legacy(legacy_description(ServerType::Standalone))
        .with_scripted(ScriptedReply::Pending);

    let reply: Document = tokio::time::timeout(
        Duration::from_millis(500),
        CommandWireProtocol::new(&command, &mut NoSession, EncoderSettings::default())
            .execute_async(&mut connection, &CancellationToken::new()),
    )
    .await
    .expect("an ignored reply must not be awaited")
    .unwrap();
    assert_eq!(reply, Document::new());
    assert_eq!(connection.receive_calls, 0);
    assert_eq!(connection.discarded, vec![connection.last_sent().request_id()]);
}
