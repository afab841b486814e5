//! Session and transaction state as seen by the command protocols.

mod cluster_time;
#[cfg(test)]
mod test;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;
use uuid::Uuid;

pub use self::cluster_time::ClusterTime;
use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    concern::{ReadConcern, WriteConcern},
    error::{Error, Result},
};

/// The state of a multi-statement transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransactionState {
    /// The transaction has been started but no command has been sent in it yet.
    Starting,
    /// At least one command of the transaction has been sent.
    InProgress,
    /// The transaction has been committed.
    Committed,
    /// The transaction has been aborted.
    Aborted,
}

/// Contains the options that can be used for a transaction.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting a transaction.
    pub write_concern: Option<WriteConcern>,
}

/// A transaction on a session. The transaction number is fixed at creation.
#[derive(Clone, Debug, PartialEq)]
pub struct CoreTransaction {
    txn_number: i64,
    state: TransactionState,
    options: TransactionOptions,
}

impl CoreTransaction {
    /// Creates a transaction in the [`TransactionState::Starting`] state.
    pub fn new(txn_number: i64, options: TransactionOptions) -> Self {
        Self {
            txn_number,
            state: TransactionState::Starting,
            options,
        }
    }

    /// The transaction number.
    pub fn txn_number(&self) -> i64 {
        self.txn_number
    }

    /// The current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Moves the transaction to `state`.
    pub fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// The options the transaction was started with.
    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }
}

/// The session operations the command protocols read and update.
pub trait CoreSession: Send {
    /// The logical session id, if this session has one.
    fn id(&self) -> Option<&Document>;

    /// The highest cluster time seen by this session.
    fn cluster_time(&self) -> Option<&ClusterTime>;

    /// The operation time of the most recent command run in this session.
    fn operation_time(&self) -> Option<Timestamp>;

    /// Whether the session was created by the driver rather than by the user.
    fn is_implicit(&self) -> bool;

    /// Whether reads in this session should observe its earlier writes.
    fn is_causally_consistent(&self) -> bool;

    /// The transaction most recently started on this session, if any.
    fn current_transaction(&self) -> Option<&CoreTransaction>;

    /// Mutable access to the current transaction.
    fn current_transaction_mut(&mut self) -> Option<&mut CoreTransaction>;

    /// Whether a transaction is starting or in progress.
    fn is_in_transaction(&self) -> bool {
        matches!(
            self.current_transaction().map(CoreTransaction::state),
            Some(TransactionState::Starting) | Some(TransactionState::InProgress)
        )
    }

    /// Records that a command carrying this session's id was sent to the server.
    fn was_used(&mut self);

    /// Called once for every command, before the message is built.
    fn about_to_send_command(&mut self);

    /// Advances the cluster time. Never moves backwards.
    fn advance_cluster_time(&mut self, to: &ClusterTime);

    /// Advances the operation time. Never moves backwards.
    fn advance_operation_time(&mut self, to: Timestamp);
}

/// Contains the options that can be used to create a new [`ClientSession`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    pub default_transaction_options: Option<TransactionOptions>,

    /// If true, all operations performed in the context of this session will be causally
    /// consistent. Defaults to true for explicit sessions.
    pub causal_consistency: Option<bool>,
}

/// An in-memory session with a generated logical session id.
#[derive(Debug)]
pub struct ClientSession {
    id: Document,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    options: SessionOptions,
    is_implicit: bool,
    last_use: Option<Instant>,
    txn_number: i64,
    transaction: Option<CoreTransaction>,
}

impl ClientSession {
    /// Creates an explicit session.
    pub fn new(options: SessionOptions) -> Self {
        Self::create(options, false)
    }

    /// Creates an implicit session, as a driver would for an operation run without one.
    pub fn new_implicit() -> Self {
        Self::create(SessionOptions::default(), true)
    }

    fn create(options: SessionOptions, is_implicit: bool) -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            cluster_time: None,
            operation_time: None,
            options,
            is_implicit,
            last_use: None,
            txn_number: 0,
            transaction: None,
        }
    }

    /// The options used to create this session.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// When a command carrying this session's id was last sent.
    pub fn last_use(&self) -> Option<Instant> {
        self.last_use
    }

    /// Starts a new transaction with the next transaction number. Options not provided fall back
    /// to the session's default transaction options.
    pub fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        if self.is_implicit {
            return Err(Error::invalid_argument(
                "transactions cannot be started on implicit sessions",
            ));
        }
        if self.is_in_transaction() {
            return Err(Error::invalid_argument("transaction already in progress"));
        }

        let defaults = self
            .options
            .default_transaction_options
            .clone()
            .unwrap_or_default();
        let options = match options.into() {
            Some(options) => TransactionOptions {
                read_concern: options.read_concern.or(defaults.read_concern),
                write_concern: options.write_concern.or(defaults.write_concern),
            },
            None => defaults,
        };

        self.txn_number += 1;
        self.transaction = Some(CoreTransaction::new(self.txn_number, options));
        Ok(())
    }
}

impl CoreSession for ClientSession {
    fn id(&self) -> Option<&Document> {
        Some(&self.id)
    }

    fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    fn is_causally_consistent(&self) -> bool {
        !self.is_implicit && self.options.causal_consistency.unwrap_or(true)
    }

    fn current_transaction(&self) -> Option<&CoreTransaction> {
        self.transaction.as_ref()
    }

    fn current_transaction_mut(&mut self) -> Option<&mut CoreTransaction> {
        self.transaction.as_mut()
    }

    fn was_used(&mut self) {
        self.last_use = Some(Instant::now());
    }

    fn about_to_send_command(&mut self) {
        // A command after commit or abort runs outside of the finished transaction.
        if matches!(
            self.transaction.as_ref().map(CoreTransaction::state),
            Some(TransactionState::Committed) | Some(TransactionState::Aborted)
        ) {
            self.transaction = None;
        }
    }

    fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    fn advance_operation_time(&mut self, to: Timestamp) {
        if self.operation_time.map(|ts| ts < to).unwrap_or(true) {
            self.operation_time = Some(to);
        }
    }
}

/// The session used for commands that run outside of any session.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSession;

impl CoreSession for NoSession {
    fn id(&self) -> Option<&Document> {
        None
    }

    fn cluster_time(&self) -> Option<&ClusterTime> {
        None
    }

    fn operation_time(&self) -> Option<Timestamp> {
        None
    }

    fn is_implicit(&self) -> bool {
        true
    }

    fn is_causally_consistent(&self) -> bool {
        false
    }

    fn current_transaction(&self) -> Option<&CoreTransaction> {
        None
    }

    fn current_transaction_mut(&mut self) -> Option<&mut CoreTransaction> {
        None
    }

    fn was_used(&mut self) {}

    fn about_to_send_command(&mut self) {}

    fn advance_cluster_time(&mut self, _to: &ClusterTime) {}

    fn advance_operation_time(&mut self, _to: Timestamp) {}
}
