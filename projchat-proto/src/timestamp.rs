//! Timestamp shapes found on the wire and their normalized form.
//!
//! Backends report `sentAt` as an ISO-8601 string, an epoch-seconds
//! structure (`{seconds, nanoseconds}` or the underscore-prefixed variant),
//! epoch milliseconds, or, for in-process backends, a native [`DateTime`].
//! [`WireTimestamp`] carries whatever arrived; [`SentAt`] is the single
//! instant type the engine works with.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label shown for messages whose timestamp could not be understood.
pub const SENTINEL_LABEL: &str = "--:--";

/// Error produced when a wire timestamp cannot be normalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// The string is not a recognizable ISO-8601 date-time.
    #[error("unparseable timestamp {0:?}")]
    Unparseable(String),
    /// The numeric value is outside the representable range.
    #[error("timestamp out of range")]
    OutOfRange,
    /// The value had none of the supported shapes.
    #[error("unrecognized timestamp shape")]
    UnrecognizedShape,
}

/// A timestamp exactly as the backend sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, from = "RawTimestamp")]
pub enum WireTimestamp {
    /// ISO-8601 / RFC 3339 text.
    Iso(String),
    /// Seconds and nanoseconds since the UNIX epoch.
    EpochSeconds {
        /// Whole seconds since the epoch.
        seconds: i64,
        /// Sub-second part in nanoseconds.
        nanoseconds: u32,
    },
    /// Milliseconds since the UNIX epoch.
    EpochMillis(i64),
    /// An already-parsed instant from an in-process backend.
    Native(DateTime<Utc>),
    /// Anything else (floats, arrays, objects without `seconds`).
    Unrecognized,
}

/// Deserialization helper: every JSON value maps to some variant so that a
/// bad timestamp never makes the whole message undecodable.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Epoch {
        #[serde(alias = "_seconds")]
        seconds: i64,
        #[serde(alias = "_nanoseconds", default)]
        nanoseconds: u32,
    },
    Millis(i64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

impl From<RawTimestamp> for WireTimestamp {
    fn from(raw: RawTimestamp) -> Self {
        match raw {
            RawTimestamp::Epoch {
                seconds,
                nanoseconds,
            } => Self::EpochSeconds {
                seconds,
                nanoseconds,
            },
            RawTimestamp::Millis(millis) => Self::EpochMillis(millis),
            RawTimestamp::Text(text) => Self::Iso(text),
            RawTimestamp::Other(_) => Self::Unrecognized,
        }
    }
}

impl WireTimestamp {
    /// Normalizes this value to a UTC instant.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError`] when the value cannot be interpreted.
    pub fn to_utc(&self) -> Result<DateTime<Utc>, TimestampError> {
        match self {
            Self::Native(dt) => Ok(*dt),
            Self::Iso(text) => parse_iso(text),
            Self::EpochSeconds {
                seconds,
                nanoseconds,
            } => DateTime::from_timestamp(*seconds, *nanoseconds).ok_or(TimestampError::OutOfRange),
            Self::EpochMillis(millis) => {
                DateTime::from_timestamp_millis(*millis).ok_or(TimestampError::OutOfRange)
            }
            Self::Unrecognized => Err(TimestampError::UnrecognizedShape),
        }
    }

    /// Renders `instant` as an epoch-seconds structure.
    #[must_use]
    pub fn epoch_seconds(instant: DateTime<Utc>) -> Self {
        Self::EpochSeconds {
            seconds: instant.timestamp(),
            nanoseconds: instant.timestamp_subsec_nanos(),
        }
    }

    /// Renders `instant` as RFC 3339 text with millisecond precision.
    #[must_use]
    pub fn iso(instant: DateTime<Utc>) -> Self {
        Self::Iso(instant.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }
}

/// Which wire shape a backend uses when it emits timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampStyle {
    /// RFC 3339 text.
    #[default]
    Iso,
    /// `{seconds, nanoseconds}` structure.
    EpochSeconds,
    /// Integer milliseconds.
    EpochMillis,
    /// In-process [`DateTime`] (serialized as RFC 3339 text).
    Native,
}

impl TimestampStyle {
    /// Renders `instant` in this style.
    #[must_use]
    pub fn render(self, instant: DateTime<Utc>) -> WireTimestamp {
        match self {
            Self::Iso => WireTimestamp::iso(instant),
            Self::EpochSeconds => WireTimestamp::epoch_seconds(instant),
            Self::EpochMillis => WireTimestamp::EpochMillis(instant.timestamp_millis()),
            Self::Native => WireTimestamp::Native(instant),
        }
    }
}

/// Error for an unknown [`TimestampStyle`] name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown timestamp style {0:?} (expected iso, epoch-seconds, epoch-millis or native)")]
pub struct UnknownTimestampStyle(pub String);

impl std::str::FromStr for TimestampStyle {
    type Err = UnknownTimestampStyle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iso" => Ok(Self::Iso),
            "epoch-seconds" => Ok(Self::EpochSeconds),
            "epoch-millis" => Ok(Self::EpochMillis),
            "native" => Ok(Self::Native),
            other => Err(UnknownTimestampStyle(other.to_string())),
        }
    }
}

/// Parses RFC 3339 text, accepting offset-less date-times as UTC.
fn parse_iso(text: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(TimestampError::Unparseable(text.to_string()))
}

/// The normalized send instant of a message.
///
/// `Unknown` stands in for timestamps that were missing or malformed. It
/// orders after every known instant so such messages sink to the end of the
/// timeline instead of disappearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SentAt {
    /// A known UTC instant.
    At(DateTime<Utc>),
    /// Missing or malformed timestamp.
    Unknown,
}

impl SentAt {
    /// The current instant from the local clock.
    #[must_use]
    pub fn now() -> Self {
        Self::At(Utc::now())
    }

    /// Creates an instant from milliseconds since the UNIX epoch.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        DateTime::from_timestamp_millis(millis).map_or(Self::Unknown, Self::At)
    }

    /// Normalizes a wire value, mapping failures to [`SentAt::Unknown`].
    #[must_use]
    pub fn from_wire(wire: &WireTimestamp) -> Self {
        wire.to_utc().map_or(Self::Unknown, Self::At)
    }

    /// Returns the instant, if known.
    #[must_use]
    pub const fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::At(dt) => Some(*dt),
            Self::Unknown => None,
        }
    }

    /// Returns `true` unless this is the sentinel.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        matches!(self, Self::At(_))
    }

    /// Returns `true` if both instants are known and at most `window` apart.
    #[must_use]
    pub fn within(&self, other: &Self, window: Duration) -> bool {
        match (self, other) {
            (Self::At(a), Self::At(b)) => {
                let diff = (a.timestamp_millis() - b.timestamp_millis()).unsigned_abs();
                u128::from(diff) <= window.as_millis()
            }
            _ => false,
        }
    }

    /// Formats the instant in local time, or the sentinel label.
    #[must_use]
    pub fn label(&self, format: &str) -> String {
        match self {
            Self::At(dt) => dt.with_timezone(&chrono::Local).format(format).to_string(),
            Self::Unknown => SENTINEL_LABEL.to_string(),
        }
    }
}

impl From<DateTime<Utc>> for SentAt {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::At(dt)
    }
}

impl std::fmt::Display for SentAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::At(dt) => write!(f, "{}", dt.to_rfc3339()),
            Self::Unknown => write!(f, "{SENTINEL_LABEL}"),
        }
    }
}
