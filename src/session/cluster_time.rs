use std::cmp::Ordering;

use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use crate::bson::{Document, Timestamp};

/// The `$clusterTime` gossiped between the server and the sessions that talk to it.
///
/// Only the timestamp takes part in comparisons. The signature is carried back to the server
/// untouched.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[derive_where(PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    #[derive_where(skip)]
    #[serde(default)]
    pub(crate) signature: Document,
}

impl ClusterTime {
    /// Creates a cluster time with the given timestamp and server signature.
    pub fn new(cluster_time: Timestamp, signature: Document) -> Self {
        Self {
            cluster_time,
            signature,
        }
    }

    /// The logical time.
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cluster_time.cmp(&other.cluster_time)
    }
}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
