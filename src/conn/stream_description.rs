use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    bson::{self, RawDocument},
    error::Result,
};

/// The wire version that introduced `OP_MSG`.
const OP_MSG_WIRE_VERSION: i32 = 6;

pub(crate) const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_WRITE_BATCH_SIZE: i64 = 100_000;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Enum representing the possible types of servers that a connection can be established to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    RsPrimary,

    /// A secondary node in a replica set.
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the replica
    /// set config.
    RsGhost,

    /// A server that the handshake has not described.
    #[default]
    Unknown,
}

/// Contains information about a given server in a format digestible by a connection.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct ConnectionDescription {
    /// The type of the server when the handshake occurred.
    #[builder(default)]
    pub server_type: ServerType,

    /// The maximum wire version that the server understands.
    #[builder(default, setter(strip_option))]
    pub max_wire_version: Option<i32>,

    /// How long sessions started on this server will stay alive without executing an operation
    /// before the server kills them. Present only when the server supports sessions.
    #[builder(default, setter(strip_option))]
    pub logical_session_timeout: Option<Duration>,

    /// The maximum size of a single document that should be sent to the server.
    #[builder(default = DEFAULT_MAX_BSON_OBJECT_SIZE)]
    pub max_bson_object_size: i64,

    /// The maximum number of inserts, updates, or deletes that can be included in a write batch.
    #[builder(default = DEFAULT_MAX_WRITE_BATCH_SIZE)]
    pub max_write_batch_size: i64,

    /// The maximum permitted size of a BSON wire protocol message.
    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE_BYTES)]
    pub max_message_size_bytes: i32,
}

impl Default for ConnectionDescription {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelloCommandResponse {
    is_writable_primary: Option<bool>,
    #[serde(rename = "ismaster")]
    is_master: Option<bool>,
    msg: Option<String>,
    set_name: Option<String>,
    hidden: Option<bool>,
    secondary: Option<bool>,
    arbiter_only: Option<bool>,
    #[serde(rename = "isreplicaset")]
    is_replica_set: Option<bool>,
    logical_session_timeout_minutes: Option<i64>,
    max_bson_object_size: Option<i64>,
    max_write_batch_size: Option<i64>,
    max_message_size_bytes: Option<i32>,
    max_wire_version: Option<i32>,
}

impl HelloCommandResponse {
    fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

impl ConnectionDescription {
    /// Constructs a description from the reply to a `hello` (or legacy `isMaster`) handshake.
    pub fn from_hello_response(response: &RawDocument) -> Result<Self> {
        let hello: HelloCommandResponse = bson::from_slice(response.as_bytes())?;
        Ok(Self {
            server_type: hello.server_type(),
            max_wire_version: hello.max_wire_version,
            logical_session_timeout: hello
                .logical_session_timeout_minutes
                .and_then(|mins| u64::try_from(mins).ok())
                .map(|mins| Duration::from_secs(mins * 60)),
            max_bson_object_size: hello
                .max_bson_object_size
                .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
            max_write_batch_size: hello
                .max_write_batch_size
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
            max_message_size_bytes: hello
                .max_message_size_bytes
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
        })
    }

    /// Whether the server accepts commands framed as `OP_MSG`.
    pub fn supports_op_msg(&self) -> bool {
        self.max_wire_version
            .map_or(false, |version| version >= OP_MSG_WIRE_VERSION)
    }

    /// Whether the server supports logical sessions.
    pub fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Gets a description of a connection to a server with the provided maxWireVersion.
    #[cfg(test)]
    pub(crate) fn with_wire_version(max_wire_version: i32) -> Self {
        Self::builder()
            .server_type(ServerType::RsPrimary)
            .max_wire_version(max_wire_version)
            .logical_session_timeout(Duration::from_secs(30 * 60))
            .build()
    }

    /// Gets a description of a connection to a 4.2 replica set primary.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self::with_wire_version(8)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ConnectionDescription, ServerType};
    use crate::bson::rawdoc;

    #[test]
    fn op_msg_support_follows_wire_version() {
        assert!(!ConnectionDescription::default().supports_op_msg());
        assert!(!ConnectionDescription::with_wire_version(5).supports_op_msg());
        assert!(ConnectionDescription::with_wire_version(6).supports_op_msg());
        assert!(ConnectionDescription::new_testing().supports_sessions());
    }

    #[test]
    fn from_hello_response() {
        let description = ConnectionDescription::from_hello_response(&rawdoc! {
            "ismaster": true,
            "msg": "isdbgrid",
            "maxWireVersion": 9,
            "logicalSessionTimeoutMinutes": 30,
            "maxBsonObjectSize": 1024,
            "ok": 1.0,
        })
        .unwrap();

        assert_eq!(description.server_type, ServerType::Mongos);
        assert_eq!(description.max_wire_version, Some(9));
        assert_eq!(
            description.logical_session_timeout,
            Some(Duration::from_secs(30 * 60))
        );
        assert_eq!(description.max_bson_object_size, 1024);
        assert_eq!(description.max_write_batch_size, 100_000);

        let secondary = ConnectionDescription::from_hello_response(&rawdoc! {
            "setName": "rs0",
            "secondary": true,
            "maxWireVersion": 4,
        })
        .unwrap();
        assert_eq!(secondary.server_type, ServerType::RsSecondary);
        assert!(!secondary.supports_sessions());
        assert!(!secondary.supports_op_msg());

        let standalone = ConnectionDescription::from_hello_response(&rawdoc! {
            "isWritablePrimary": true,
        })
        .unwrap();
        assert_eq!(standalone.server_type, ServerType::Standalone);
    }
}
