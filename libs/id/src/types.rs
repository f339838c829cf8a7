//! Typed ID definitions for cluster-manager resources.

use crate::{define_opaque_id, IdError};

define_opaque_id!(
    ResourceId,
    "Identifies one physical allocation handed back by the cluster broker; unique across the lifetime of the job."
);

define_opaque_id!(Host, "A cluster host name.");

impl ResourceId {
    /// Placeholder ID used to index a failover when the failed active's
    /// prior resource is unknown.
    #[must_use]
    pub fn unknown_for(processor: &ProcessorId) -> Self {
        Self(format!("unknown-{processor}"))
    }
}

/// Identifies one stream processor.
///
/// An active processor is `"<n>"`; its k-th standby replica is
/// `"<n>-<k>"`. The separator makes the standby relationship
/// recognisable without consulting the job model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(String);

const STANDBY_SEPARATOR: char = '-';

impl ProcessorId {
    /// Parses a processor ID, rejecting empty or whitespace-bearing
    /// input and dangling standby separators (`"-0"`, `"3-"`).
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(IdError::Whitespace(s.to_string()));
        }
        if s.starts_with(STANDBY_SEPARATOR) || s.ends_with(STANDBY_SEPARATOR) {
            return Err(IdError::MalformedStandbySuffix(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// An active processor ID from its numeric index.
    #[must_use]
    pub fn active(index: u64) -> Self {
        Self(index.to_string())
    }

    /// The ID of this processor's k-th standby replica.
    #[must_use]
    pub fn standby_replica(&self, replica: u64) -> Self {
        Self(format!("{}{STANDBY_SEPARATOR}{replica}", self.active_id()))
    }

    /// Whether this ID names a standby replica.
    #[must_use]
    pub fn is_standby(&self) -> bool {
        self.0.contains(STANDBY_SEPARATOR)
    }

    /// The active processor this ID belongs to: itself for an active,
    /// the prefix before the separator for a standby.
    #[must_use]
    pub fn active_id(&self) -> ProcessorId {
        match self.0.split_once(STANDBY_SEPARATOR) {
            Some((active, _)) => Self(active.to_string()),
            None => self.clone(),
        }
    }

    /// Returns the underlying string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ProcessorId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ProcessorId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ProcessorId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
