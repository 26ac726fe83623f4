//! Route string parsing.
//!
//! Each raw trip carries its route as a literal list of
//! `[date, time, lat, lon, ...]` entries. [`parse_route`] turns that text into
//! an ordered sequence of [`PathSample`]s.
//!
//! Parsing is permissive at two granularities:
//!
//! - If the text cannot be read as a list at all, the result is empty and
//!   carries a single [`SkippedPoint::Malformed`].
//! - If an individual entry is short, has an unparsable timestamp or a
//!   non-numeric coordinate, only that entry is dropped and the reason is
//!   recorded in [`ParsedRoute::skipped`].
//!
//! Source exports are known to omit the fractional seconds on some points,
//! so timestamps are tried with [`PRIMARY_TIME_FORMAT`] first and then with
//! [`FALLBACK_TIME_FORMAT`].

pub mod literal;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use literal::{Literal, RouteSyntaxError, parse_literal};

/// Timestamp format with fractional seconds, e.g. `2023/05/01 00:00:17.660`.
pub const PRIMARY_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.f";

/// Timestamp format without fractional seconds, e.g. `2023/05/01 00:00:17`.
pub const FALLBACK_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Formats accepted for trip-level start/end columns, tried in order.
const TRIP_TIME_FORMATS: [&str; 4] = [
    PRIMARY_TIME_FORMAT,
    FALLBACK_TIME_FORMAT,
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// One timestamped position along a trip.
///
/// Serialized as a plain `[timestamp, latitude, longitude]` array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathSample {
    /// Seconds since the Unix epoch (UTC), with microsecond precision.
    pub timestamp: f64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl PathSample {
    /// Construct a sample.
    pub fn new(timestamp: f64, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
        }
    }
}

impl Serialize for PathSample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp, self.latitude, self.longitude).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PathSample {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (timestamp, latitude, longitude) = <(f64, f64, f64)>::deserialize(deserializer)?;
        Ok(Self::new(timestamp, latitude, longitude))
    }
}

/// Why a point (or the whole route) was left out of a [`ParsedRoute`].
#[derive(Debug, Clone, PartialEq)]
pub enum SkippedPoint {
    /// The route text could not be read as a list of entries.
    Malformed {
        /// Where and why reading stopped.
        error: RouteSyntaxError,
    },
    /// The entry at `index` is not a list of at least four fields.
    TooFewFields {
        /// Position of the entry in the route.
        index: usize,
        /// Number of fields found (0 when the entry is not a list).
        fields: usize,
    },
    /// The date/time pair at `index` matched neither timestamp format.
    BadTimestamp {
        /// Position of the entry in the route.
        index: usize,
        /// The combined `"date time"` text that failed to parse.
        value: String,
    },
    /// Latitude or longitude at `index` is not a number.
    NonNumericCoordinate {
        /// Position of the entry in the route.
        index: usize,
    },
}

/// Result of parsing one route string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRoute {
    /// Samples in source order.
    pub samples: Vec<PathSample>,
    /// Everything that was dropped on the way, in source order.
    pub skipped: Vec<SkippedPoint>,
}

impl ParsedRoute {
    /// True if no sample survived.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True if the route text itself could not be read.
    pub fn is_malformed(&self) -> bool {
        matches!(self.skipped.as_slice(), [SkippedPoint::Malformed { .. }])
    }

    /// Number of individual entries that were dropped.
    pub fn dropped_points(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| !matches!(s, SkippedPoint::Malformed { .. }))
            .count()
    }
}

/// Parse a route string into ordered path samples.
///
/// Never fails: structural errors produce an empty result with a
/// [`SkippedPoint::Malformed`] entry, per-entry errors drop that entry only.
pub fn parse_route(text: &str) -> ParsedRoute {
    let entries = match parse_literal(text) {
        Ok(Literal::List(entries)) => entries,
        Ok(other) => {
            return ParsedRoute {
                samples: Vec::new(),
                skipped: vec![SkippedPoint::Malformed {
                    error: RouteSyntaxError {
                        offset: 0,
                        message: format!("expected a list of entries, found {other}"),
                    },
                }],
            };
        }
        Err(error) => {
            return ParsedRoute {
                samples: Vec::new(),
                skipped: vec![SkippedPoint::Malformed { error }],
            };
        }
    };

    let mut parsed = ParsedRoute {
        samples: Vec::with_capacity(entries.len()),
        skipped: Vec::new(),
    };

    for (index, entry) in entries.iter().enumerate() {
        match parse_entry(index, entry) {
            Ok(sample) => parsed.samples.push(sample),
            Err(skip) => parsed.skipped.push(skip),
        }
    }

    parsed
}

fn parse_entry(index: usize, entry: &Literal) -> Result<PathSample, SkippedPoint> {
    let fields = match entry {
        Literal::List(fields) if fields.len() >= 4 => fields,
        Literal::List(fields) => {
            return Err(SkippedPoint::TooFewFields {
                index,
                fields: fields.len(),
            });
        }
        _ => return Err(SkippedPoint::TooFewFields { index, fields: 0 }),
    };

    let combined = format!(
        "{} {}",
        field_text(&fields[0]),
        field_text(&fields[1])
    );
    let ts = parse_point_timestamp(&combined).ok_or(SkippedPoint::BadTimestamp {
        index,
        value: combined.clone(),
    })?;

    let (Some(latitude), Some(longitude)) = (fields[2].as_f64(), fields[3].as_f64()) else {
        return Err(SkippedPoint::NonNumericCoordinate { index });
    };

    Ok(PathSample::new(epoch_seconds(ts), latitude, longitude))
}

fn field_text(field: &Literal) -> String {
    match field.as_str() {
        Some(s) => s.trim().to_string(),
        None => field.to_string(),
    }
}

fn parse_point_timestamp(combined: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(combined, PRIMARY_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(combined, FALLBACK_TIME_FORMAT))
        .ok()
}

/// Combine a trip's date and time columns into a timestamp.
///
/// Accepts the slash-separated export format (with or without fractional
/// seconds) and ISO dashes. Returns `None` if nothing matches.
pub fn parse_trip_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let combined = format!("{} {}", date.trim(), time.trim());
    TRIP_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
        .or_else(|| {
            // Date-only rows (empty time column) start at midnight.
            if time.trim().is_empty() {
                ["%Y/%m/%d", "%Y-%m-%d"]
                    .iter()
                    .find_map(|fmt| NaiveDate::parse_from_str(date.trim(), fmt).ok())
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            } else {
                None
            }
        })
}

/// Seconds since the Unix epoch, treating `ts` as UTC.
pub fn epoch_seconds(ts: NaiveDateTime) -> f64 {
    ts.and_utc().timestamp_micros() as f64 / 1_000_000.0
}
