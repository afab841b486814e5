//! Read and write concerns carried by transaction options.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::bson::Timestamp;

/// The consistency a read requires. Sent as `readConcern` with the first command of a
/// transaction.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[non_exhaustive]
pub struct ReadConcern {
    /// The isolation level.
    pub level: ReadConcernLevel,
}

impl ReadConcern {
    /// `majority`
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    /// `local`
    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    /// `snapshot`
    pub fn snapshot() -> Self {
        ReadConcernLevel::Snapshot.into()
    }

    /// A read concern with a level this crate has no variant for.
    pub fn custom(level: impl AsRef<str>) -> Self {
        ReadConcernLevel::from_name(level.as_ref()).into()
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

/// The `readConcern` document as actually sent, where the level is optional and
/// `afterClusterTime` may be added for causal consistency.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReadConcernInternal {
    pub(crate) level: Option<ReadConcernLevel>,
    pub(crate) after_cluster_time: Option<Timestamp>,
}

impl ReadConcernInternal {
    pub(crate) fn is_empty(&self) -> bool {
        self.level.is_none() && self.after_cluster_time.is_none()
    }
}

impl From<ReadConcern> for ReadConcernInternal {
    fn from(read_concern: ReadConcern) -> Self {
        Self {
            level: Some(read_concern.level),
            after_cluster_time: None,
        }
    }
}

/// The level of a [`ReadConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    #[allow(missing_docs)]
    Local,
    #[allow(missing_docs)]
    Majority,
    #[allow(missing_docs)]
    Linearizable,
    #[allow(missing_docs)]
    Available,
    #[allow(missing_docs)]
    Snapshot,
    /// Any other level, sent by name.
    Custom(String),
}

impl ReadConcernLevel {
    const NAMED: [(&'static str, ReadConcernLevel); 5] = [
        ("local", Self::Local),
        ("majority", Self::Majority),
        ("linearizable", Self::Linearizable),
        ("available", Self::Available),
        ("snapshot", Self::Snapshot),
    ];

    fn from_name(name: &str) -> Self {
        Self::NAMED
            .into_iter()
            .find_map(|(known, level)| (known == name).then_some(level))
            .unwrap_or_else(|| Self::Custom(name.to_string()))
    }

    /// The name the server knows this level by.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Custom(name) => name,
            known => Self::NAMED
                .iter()
                .find_map(|(name, level)| (level == known).then_some(*name))
                .unwrap_or_default(),
        }
    }
}

impl Serialize for ReadConcernLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReadConcernLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// The acknowledgement required for a write, used when a transaction is committed or aborted.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// How many (or which) members must acknowledge the write.
    pub w: Option<Acknowledgment>,

    /// How long the server waits for the acknowledgement.
    #[serde(rename = "wtimeout", alias = "wtimeoutMS", default, with = "millis")]
    pub w_timeout: Option<Duration>,

    /// Whether the write must reach the on-disk journal.
    #[serde(rename = "j", alias = "journal")]
    pub journal: Option<bool>,
}

impl WriteConcern {
    /// `w: "majority"`
    pub fn majority() -> Self {
        Acknowledgment::Majority.into()
    }

    /// Whether the server will acknowledge writes at all.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// True when nothing is set, i.e. the server default applies.
    pub fn is_empty(&self) -> bool {
        self.w.is_none() && self.w_timeout.is_none() && self.journal.is_none()
    }
}

impl From<Acknowledgment> for WriteConcern {
    fn from(w: Acknowledgment) -> Self {
        Self {
            w: Some(w),
            ..Default::default()
        }
    }
}

/// The `w` field of a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// A number of members.
    Nodes(u32),

    /// A majority of the voting members.
    Majority,

    /// A tag set configured on the replica set.
    Custom(String),
}

impl From<u32> for Acknowledgment {
    fn from(nodes: u32) -> Self {
        Self::Nodes(nodes)
    }
}

impl From<&str> for Acknowledgment {
    fn from(name: &str) -> Self {
        match name {
            "majority" => Self::Majority,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl Serialize for Acknowledgment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Nodes(nodes) => {
                crate::bson::serde_helpers::serialize_u32_as_i32(nodes, serializer)
            }
            Self::Majority => serializer.serialize_str("majority"),
            Self::Custom(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Nodes(u32),
            Name(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Nodes(nodes) => nodes.into(),
            Raw::Name(name) => name.as_str().into(),
        })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let Some(duration) = value else {
            return serializer.serialize_none();
        };
        match i32::try_from(duration.as_millis()) {
            Ok(millis) => serializer.serialize_i32(millis),
            Err(_) => {
                serializer.serialize_i64(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
            }
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
