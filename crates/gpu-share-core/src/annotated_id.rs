//! The string carried across the plugin boundary for a single allocatable
//! unit: `"<UUID>[::<replica>]"`, where the replica suffix is present iff
//! the device is participating in time-sharing.

use std::fmt;

const REPLICA_SEPARATOR: &str = "::";

/// A device identifier with an optional replica index, the unit of
/// allocation at the plugin boundary.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnnotatedId {
    base: String,
    replica: Option<u32>,
}

impl AnnotatedId {
    /// A plain device ID with no replica suffix.
    pub fn whole(base: impl Into<String>) -> Self {
        AnnotatedId {
            base: base.into(),
            replica: None,
        }
    }

    /// A replica of `base`, numbered `replica`. Per spec.md's boundary
    /// behavior, a replica count of 1 should use [`AnnotatedId::whole`]
    /// instead of `replica(base, 0)` — callers doing replica expansion are
    /// responsible for that choice, this constructor does not special-case
    /// it.
    pub fn replica(base: impl Into<String>, replica: u32) -> Self {
        AnnotatedId {
            base: base.into(),
            replica: Some(replica),
        }
    }

    /// Parses `"<UUID>"` or `"<UUID>::<replica>"`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(REPLICA_SEPARATOR) {
            Some((base, replica)) => match replica.parse::<u32>() {
                Ok(r) => AnnotatedId {
                    base: base.to_string(),
                    replica: Some(r),
                },
                Err(_) => AnnotatedId::whole(raw),
            },
            None => AnnotatedId::whole(raw),
        }
    }

    /// The base device UUID, with any replica suffix stripped.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The replica index, if this ID is annotated.
    pub fn replica_index(&self) -> Option<u32> {
        self.replica
    }

    /// True if this ID carries a replica suffix.
    pub fn is_annotated(&self) -> bool {
        self.replica.is_some()
    }

    /// True if any ID in `ids` carries a replica suffix.
    pub fn any_annotated<'a>(ids: impl IntoIterator<Item = &'a AnnotatedId>) -> bool {
        ids.into_iter().any(AnnotatedId::is_annotated)
    }
}

impl fmt::Display for AnnotatedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.replica {
            Some(r) => write!(f, "{}{}{}", self.base, REPLICA_SEPARATOR, r),
            None => write!(f, "{}", self.base),
        }
    }
}

impl From<&str> for AnnotatedId {
    fn from(raw: &str) -> Self {
        AnnotatedId::parse(raw)
    }
}

impl From<String> for AnnotatedId {
    fn from(raw: String) -> Self {
        AnnotatedId::parse(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_id_round_trips_without_suffix() {
        let id = AnnotatedId::whole("GPU-A");
        assert_eq!(id.to_string(), "GPU-A");
        assert_eq!(id.base(), "GPU-A");
        assert_eq!(id.replica_index(), None);
        assert!(!id.is_annotated());
    }

    #[test]
    fn replica_id_round_trips_with_suffix() {
        let id = AnnotatedId::replica("GPU-A", 2);
        assert_eq!(id.to_string(), "GPU-A::2");
        let parsed = AnnotatedId::parse(&id.to_string());
        assert_eq!(parsed, id);
    }

    #[test]
    fn construction_then_split_is_identity() {
        for raw in ["GPU-A", "GPU-B::0", "GPU-C::41"] {
            let id = AnnotatedId::parse(raw);
            assert_eq!(id.to_string(), raw);
        }
    }

    #[test]
    fn any_annotated_detects_single_replica() {
        let ids = vec![AnnotatedId::whole("GPU-A"), AnnotatedId::replica("GPU-B", 0)];
        assert!(AnnotatedId::any_annotated(&ids));
        let plain = vec![AnnotatedId::whole("GPU-A"), AnnotatedId::whole("GPU-B")];
        assert!(!AnnotatedId::any_annotated(&plain));
    }

    #[test]
    fn malformed_suffix_is_treated_as_whole_id() {
        let id = AnnotatedId::parse("GPU-A::not-a-number");
        assert_eq!(id.base(), "GPU-A::not-a-number");
        assert!(!id.is_annotated());
    }
}
