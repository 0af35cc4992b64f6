//! Short status codes attached to cached probe records.
//!
//! The persisted vocabulary is `?P1`..`?P9` (probe failures), `Er1`..`Er9`
//! (encode failures), `OPT`, `---`, `DUN`, and `none` / null for no anomaly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serializer};

/// Highest value a failure counter can reach.
pub const MAX_FAILURE_COUNT: u8 = 9;

/// Why a file is excluded from, or must be retried before, automatic selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anomaly {
    /// The probe tool failed this many times in a row.
    ProbeFailure(u8),
    /// The encoder failed this many times in a row.
    EncodeFailure(u8),
    /// Encoding succeeded but saved too little space.
    InsufficientGain,
    /// Operator asked to never convert this file.
    Skipped,
    /// File already carries the output naming marker.
    AlreadyDone,
}

/// Error for strings outside the anomaly vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown anomaly code: {0:?}")]
pub struct UnknownAnomaly(pub String);

impl Anomaly {
    /// First step of the probe failure counter.
    pub const PROBE_FAILURE: Self = Self::ProbeFailure(1);
    /// First step of the encode failure counter.
    pub const ENCODE_FAILURE: Self = Self::EncodeFailure(1);

    /// Combine the currently stored anomaly with a newly reported one.
    ///
    /// A failure of the same family bumps the stored counter by one, capped at
    /// [`MAX_FAILURE_COUNT`]. Anything else replaces the stored value.
    #[must_use]
    pub fn escalate(current: Option<Self>, incoming: Self) -> Self {
        match (current, incoming) {
            (Some(Self::ProbeFailure(count)), Self::ProbeFailure(_)) => Self::ProbeFailure(bump(count)),
            (Some(Self::EncodeFailure(count)), Self::EncodeFailure(_)) => Self::EncodeFailure(bump(count)),
            (_, Self::ProbeFailure(_)) => Self::PROBE_FAILURE,
            (_, Self::EncodeFailure(_)) => Self::ENCODE_FAILURE,
            (_, other) => other,
        }
    }

    /// Probe failures below the cap are retried automatically on the next access.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ProbeFailure(count) if count < MAX_FAILURE_COUNT)
    }

    /// Failure counter value, if this is a failure anomaly.
    #[must_use]
    pub const fn failure_count(self) -> Option<u8> {
        match self {
            Self::ProbeFailure(count) | Self::EncodeFailure(count) => Some(count),
            _ => None,
        }
    }

    /// Serde helper for an `Option<Anomaly>` field that must be present but may be null.
    pub fn deserialize_field<'de, D>(deserializer: D) -> Result<Option<Self>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value.as_deref() {
            None | Some("none") => Ok(None),
            Some(code) => code.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }

    /// Serde helper writing `None` as JSON null.
    pub fn serialize_field<S>(value: &Option<Self>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(anomaly) => serializer.collect_str(anomaly),
            None => serializer.serialize_none(),
        }
    }
}

const fn bump(count: u8) -> u8 {
    if count >= MAX_FAILURE_COUNT {
        MAX_FAILURE_COUNT
    } else {
        count + 1
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProbeFailure(count) => write!(f, "?P{count}"),
            Self::EncodeFailure(count) => write!(f, "Er{count}"),
            Self::InsufficientGain => write!(f, "OPT"),
            Self::Skipped => write!(f, "---"),
            Self::AlreadyDone => write!(f, "DUN"),
        }
    }
}

impl FromStr for Anomaly {
    type Err = UnknownAnomaly;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let counter = |digits: &str| {
            digits
                .parse::<u8>()
                .ok()
                .filter(|count| (1..=MAX_FAILURE_COUNT).contains(count))
        };
        match s {
            "OPT" => Ok(Self::InsufficientGain),
            "---" => Ok(Self::Skipped),
            "DUN" => Ok(Self::AlreadyDone),
            _ => {
                if let Some(count) = s.strip_prefix("?P").and_then(counter) {
                    Ok(Self::ProbeFailure(count))
                } else if let Some(count) = s.strip_prefix("Er").and_then(counter) {
                    Ok(Self::EncodeFailure(count))
                } else {
                    Err(UnknownAnomaly(s.to_string()))
                }
            }
        }
    }
}
