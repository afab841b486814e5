//! Read preferences, which describe the members of a deployment a read may be routed to.

use std::{collections::HashMap, time::Duration};

use serde::{ser::SerializeMap, Serialize, Serializer};
use typed_builder::TypedBuilder;

/// The members a command may be routed to. Sent as `$readPreference` when it is not `primary`.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only the primary.
    Primary,

    /// Only secondaries.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// The primary, or a secondary when no primary is available.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// A secondary, or the primary when no secondary is available.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Whichever member has the lowest latency.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

/// A set of replica set member tags.
pub type TagSet = HashMap<String, String>;

/// Narrows a non-primary [`ReadPreference`].
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tag sets tried in order until one matches a member.
    pub tag_sets: Option<Vec<TagSet>>,

    /// How far behind the primary a secondary may be. Sent in whole seconds.
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    /// The tag sets worth sending: a single empty tag set matches every member.
    fn effective_tag_sets(&self) -> Option<&[TagSet]> {
        match self.tag_sets.as_deref() {
            None | Some([]) => None,
            Some([only]) if only.is_empty() => None,
            Some(tag_sets) => Some(tag_sets),
        }
    }

    fn is_default(&self) -> bool {
        self.max_staleness.is_none() && self.effective_tag_sets().is_none()
    }
}

impl ReadPreference {
    fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    /// Whether this preference only allows the primary.
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }

    /// Whether this is `secondaryPreferred` without tag sets or max staleness. Legacy servers
    /// express that preference through the `secondaryOk` query flag alone.
    pub(crate) fn is_plain_secondary_preferred(&self) -> bool {
        matches!(self, Self::SecondaryPreferred { .. })
            && self.options().map_or(true, ReadPreferenceOptions::is_default)
    }
}

impl Serialize for ReadPreference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("mode", self.mode())?;
        if let Some(options) = self.options() {
            if let Some(tag_sets) = options.effective_tag_sets() {
                map.serialize_entry("tagSets", tag_sets)?;
            }
            if let Some(max_staleness) = options.max_staleness {
                let seconds = max_staleness.as_secs();
                match i32::try_from(seconds) {
                    Ok(seconds) => map.serialize_entry("maxStalenessSeconds", &seconds)?,
                    Err(_) => map.serialize_entry(
                        "maxStalenessSeconds",
                        &i64::try_from(seconds).unwrap_or(i64::MAX),
                    )?,
                }
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, time::Duration};

    use pretty_assertions::assert_eq;

    use super::{ReadPreference, ReadPreferenceOptions};
    use crate::bson::{self, doc};

    #[test]
    fn serializes_mode_and_options() {
        let read_pref = ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .tag_sets(vec![HashMap::from([("dc".to_string(), "east".to_string())])])
                    .max_staleness(Duration::from_secs(120))
                    .build(),
            ),
        };

        assert_eq!(
            bson::to_document(&read_pref).unwrap(),
            doc! {
                "mode": "secondary",
                "tagSets": [{ "dc": "east" }],
                "maxStalenessSeconds": 120,
            }
        );
        assert_eq!(
            bson::to_document(&ReadPreference::Primary).unwrap(),
            doc! { "mode": "primary" }
        );
        assert_eq!(
            bson::to_document(&ReadPreference::Nearest {
                options: Some(
                    ReadPreferenceOptions::builder()
                        .tag_sets(vec![HashMap::new()])
                        .build()
                )
            })
            .unwrap(),
            doc! { "mode": "nearest" }
        );
    }

    #[test]
    fn plain_secondary_preferred() {
        assert!(
            ReadPreference::SecondaryPreferred { options: None }.is_plain_secondary_preferred()
        );
        assert!(ReadPreference::SecondaryPreferred {
            options: Some(Default::default())
        }
        .is_plain_secondary_preferred());
        assert!(!ReadPreference::SecondaryPreferred {
            options: Some(
                ReadPreferenceOptions::builder()
                    .max_staleness(Duration::from_secs(90))
                    .build()
            )
        }
        .is_plain_secondary_preferred());
        assert!(!ReadPreference::Nearest { options: None }.is_plain_secondary_preferred());
    }
}
