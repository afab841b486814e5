use pretty_assertions::assert_eq;

use super::{
    ClientSession,
    ClusterTime,
    CoreSession,
    NoSession,
    SessionOptions,
    TransactionOptions,
    TransactionState,
};
use crate::{
    bson::{doc, spec::BinarySubtype, Bson, Timestamp},
    concern::{ReadConcern, WriteConcern},
};

fn ts(time: u32) -> Timestamp {
    Timestamp { time, increment: 1 }
}

#[test]
fn lsid_is_a_uuid() {
    let session = ClientSession::new(SessionOptions::default());
    let id = session.id().unwrap();
    match id.get("id") {
        Some(Bson::Binary(binary)) => {
            assert_eq!(binary.subtype, BinarySubtype::Uuid);
            assert_eq!(binary.bytes.len(), 16);
        }
        other => panic!("expected binary lsid, got {:?}", other),
    }

    let other = ClientSession::new(SessionOptions::default());
    assert_ne!(session.id(), other.id());
}

#[test]
fn cluster_time_only_advances() {
    let mut session = ClientSession::new(SessionOptions::default());
    assert!(session.cluster_time().is_none());

    session.advance_cluster_time(&ClusterTime::new(ts(5), doc! { "keyId": 1 }));
    session.advance_cluster_time(&ClusterTime::new(ts(3), doc! { "keyId": 2 }));
    assert_eq!(session.cluster_time().unwrap().timestamp(), ts(5));

    session.advance_cluster_time(&ClusterTime::new(ts(9), doc! {}));
    assert_eq!(session.cluster_time().unwrap().timestamp(), ts(9));
}

#[test]
fn operation_time_only_advances() {
    let mut session = ClientSession::new(SessionOptions::default());
    session.advance_operation_time(ts(7));
    session.advance_operation_time(ts(2));
    assert_eq!(session.operation_time(), Some(ts(7)));
}

#[test]
fn causal_consistency_defaults() {
    assert!(ClientSession::new(SessionOptions::default()).is_causally_consistent());
    assert!(!ClientSession::new_implicit().is_causally_consistent());
    assert!(!ClientSession::new(
        SessionOptions::builder()
            .causal_consistency(false)
            .build()
    )
    .is_causally_consistent());
}

#[test]
fn transaction_numbers_increase() {
    let mut session = ClientSession::new(SessionOptions::default());
    assert!(!session.is_in_transaction());

    session.start_transaction(None).unwrap();
    assert!(session.is_in_transaction());
    let txn = session.current_transaction().unwrap();
    assert_eq!(txn.txn_number(), 1);
    assert_eq!(txn.state(), TransactionState::Starting);

    assert!(session.start_transaction(None).is_err());

    session
        .current_transaction_mut()
        .unwrap()
        .set_state(TransactionState::Committed);
    assert!(!session.is_in_transaction());

    session.start_transaction(None).unwrap();
    assert_eq!(session.current_transaction().unwrap().txn_number(), 2);
}

#[test]
fn finished_transaction_is_cleared_before_next_command() {
    let mut session = ClientSession::new(SessionOptions::default());
    session.start_transaction(None).unwrap();

    session.about_to_send_command();
    assert!(session.current_transaction().is_some());

    session
        .current_transaction_mut()
        .unwrap()
        .set_state(TransactionState::Aborted);
    session.about_to_send_command();
    assert!(session.current_transaction().is_none());
}

#[test]
fn transaction_options_fall_back_to_session_defaults() {
    let mut session = ClientSession::new(
        SessionOptions::builder()
            .default_transaction_options(
                TransactionOptions::builder()
                    .read_concern(ReadConcern::majority())
                    .write_concern(WriteConcern::majority())
                    .build(),
            )
            .build(),
    );

    session
        .start_transaction(
            TransactionOptions::builder()
                .read_concern(ReadConcern::snapshot())
                .build(),
        )
        .unwrap();

    let options = session.current_transaction().unwrap().options();
    assert_eq!(options.read_concern, Some(ReadConcern::snapshot()));
    assert_eq!(options.write_concern, Some(WriteConcern::majority()));
}

#[test]
fn implicit_sessions_cannot_start_transactions() {
    let mut session = ClientSession::new_implicit();
    assert!(session.start_transaction(None).is_err());
}

#[test]
fn was_used_records_last_use() {
    let mut session = ClientSession::new(SessionOptions::default());
    assert!(session.last_use().is_none());
    session.was_used();
    assert!(session.last_use().is_some());
}

#[test]
fn no_session_has_no_state() {
    let mut session = NoSession;
    session.advance_cluster_time(&ClusterTime::new(ts(1), doc! {}));
    session.advance_operation_time(ts(1));
    assert!(session.id().is_none());
    assert!(session.cluster_time().is_none());
    assert!(session.operation_time().is_none());
    assert!(!session.is_in_transaction());
}
