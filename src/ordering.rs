//! Run id minting and dotted-order composition.
//!
//! A dotted order places a run in its trace tree with nothing but string comparison. Each run
//! contributes one segment, `<timestamp>Z<run id>`, and a run's full order is its parent's order,
//! a `.`, then its own segment:
//!
//! ```text
//! 20240305T070809000123Z1b4e28ba-2fa1-41d2-883f-0016d3cca427.20240305T070809000456Z6f0c...
//! ```
//!
//! The timestamp is fixed width and zero padded (`YYYYMMDDTHHMMSSffffff`, UTC, microseconds), so
//! sorting orders lexicographically sorts siblings by start time and places every ancestor before
//! its descendants.

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use thiserror::Error;

use crate::api::RunId;

pub const SEGMENT_SEPARATOR: char = '.';
pub const TIMESTAMP_TERMINATOR: char = 'Z';

/// Width of a formatted timestamp.
pub const TIMESTAMP_LEN: usize = 21;
const RUN_ID_LEN: usize = 36;
const SEGMENT_LEN: usize = TIMESTAMP_LEN + 1 + RUN_ID_LEN;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6f";

static LAST_START_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Mint a new, globally unique run id.
pub fn new_run_id() -> RunId {
    RunId::allocate()
}

/// Format a timestamp as `YYYYMMDDTHHMMSSffffff`.
///
/// Lexicographic order of the output matches chronological order for the years 0 through 9999.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp produced by [`format_timestamp`].
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DottedOrderError> {
    let bad = || DottedOrderError::Timestamp(s.to_owned());

    let bytes = s.as_bytes();
    if !s.is_ascii() || bytes.len() != TIMESTAMP_LEN || bytes[8] != b'T' {
        return Err(bad());
    }
    let digits = |range: std::ops::Range<usize>| -> Result<u32, DottedOrderError> {
        let part = &s[range];
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        part.parse::<u32>().map_err(|_| bad())
    };

    let year = digits(0..4)? as i32;
    let month = digits(4..6)?;
    let day = digits(6..8)?;
    let hour = digits(9..11)?;
    let minute = digits(11..13)?;
    let second = digits(13..15)?;
    let micro = digits(15..21)?;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_micro_opt(hour, minute, second, micro))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(bad)
}

/// The current UTC time at microsecond precision, strictly increasing across calls in this
/// process.
///
/// Two spans started within the same microsecond would otherwise order by their (random) run
/// ids; bumping the clock keeps start order and dotted order in agreement.
pub fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_START_MICROS.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_START_MICROS.compare_exchange_weak(
            last,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
            Err(actual) => last = actual,
        }
    }
}

/// Compose the dotted order of a run started at `t`, below `parent` if there is one.
pub fn compose_dotted_order(
    parent: Option<&DottedOrder>,
    t: DateTime<Utc>,
    run_id: RunId,
) -> DottedOrder {
    let segment = format!("{}{}{}", format_timestamp(t), TIMESTAMP_TERMINATOR, run_id);
    match parent {
        Some(parent) => DottedOrder(format!("{}{}{}", parent.0, SEGMENT_SEPARATOR, segment)),
        None => DottedOrder(segment),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DottedOrderError {
    #[error("Dotted order is empty")]
    Empty,

    #[error("Malformed dotted order segment '{0}'")]
    Segment(String),

    #[error("Malformed dotted order timestamp '{0}'")]
    Timestamp(String),
}

/////////////////
// DottedOrder //
/////////////////

/// A run's position in its trace tree, see the [module docs](self).
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct DottedOrder(String);

impl DottedOrder {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw `<timestamp>Z<run id>` segments, root first.
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.split(SEGMENT_SEPARATOR)
    }

    /// Number of segments; 1 for a root run.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// This run's own segment.
    pub fn leaf(&self) -> Segment {
        let raw = self
            .0
            .rsplit(SEGMENT_SEPARATOR)
            .next()
            .unwrap_or(self.0.as_str());
        // segments are validated on construction
        Segment::parse(raw).unwrap_or(Segment {
            start_time: DateTime::<Utc>::MIN_UTC,
            run_id: RunId::nil(),
        })
    }

    /// The enclosing run's dotted order, `None` at the root.
    pub fn parent(&self) -> Option<DottedOrder> {
        self.0
            .rfind(SEGMENT_SEPARATOR)
            .map(|idx| DottedOrder(self.0[..idx].to_owned()))
    }

    pub fn is_ancestor_of(&self, other: &DottedOrder) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0[self.0.len()..].starts_with(SEGMENT_SEPARATOR)
    }

    pub fn is_descendant_of(&self, other: &DottedOrder) -> bool {
        other.is_ancestor_of(self)
    }

    /// Whether both runs share the same parent. Roots are never siblings, even within a trace.
    pub fn is_sibling_of(&self, other: &DottedOrder) -> bool {
        self != other && self.parent().is_some() && self.parent() == other.parent()
    }
}

impl fmt::Display for DottedOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DottedOrder {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DottedOrder {
    type Err = DottedOrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DottedOrderError::Empty);
        }
        for segment in s.split(SEGMENT_SEPARATOR) {
            Segment::parse(segment)?;
        }
        Ok(DottedOrder(s.to_owned()))
    }
}

impl TryFrom<String> for DottedOrder {
    type Error = DottedOrderError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DottedOrder> for String {
    fn from(d: DottedOrder) -> Self {
        d.0
    }
}

/// One parsed `<timestamp>Z<run id>` segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub start_time: DateTime<Utc>,
    pub run_id: RunId,
}

impl Segment {
    pub fn parse(s: &str) -> Result<Segment, DottedOrderError> {
        if !s.is_ascii()
            || s.len() != SEGMENT_LEN
            || s.as_bytes()[TIMESTAMP_LEN] != TIMESTAMP_TERMINATOR as u8
        {
            return Err(DottedOrderError::Segment(s.to_owned()));
        }
        let start_time = parse_timestamp(&s[..TIMESTAMP_LEN])?;
        let run_id = s[TIMESTAMP_LEN + 1..]
            .parse()
            .map_err(|_| DottedOrderError::Segment(s.to_owned()))?;
        Ok(Segment { start_time, run_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::proptest_strategies::{run_id, timestamp};
    use proptest::prelude::*;

    fn at(micros: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(micros).unwrap()
    }

    #[test]
    fn timestamp_layout() {
        let t = Utc
            .with_ymd_and_hms(2024, 3, 5, 7, 8, 9)
            .unwrap()
            .checked_add_signed(chrono::Duration::microseconds(123))
            .unwrap();
        assert_eq!("20240305T070809000123", format_timestamp(t));
        assert_eq!(TIMESTAMP_LEN, format_timestamp(t).len());
        assert_eq!(Ok(t), parse_timestamp("20240305T070809000123"));

        assert!(parse_timestamp("20240305T0708090001").is_err());
        assert!(parse_timestamp("20241305T070809000123").is_err());
        assert!(parse_timestamp("2024-305T070809000123").is_err());
    }

    #[test]
    fn root_and_child_orders() {
        let root_id: RunId = "1b4e28ba-2fa1-41d2-883f-0016d3cca427".parse().unwrap();
        let child_id: RunId = "6f0c3f55-9a3b-4c0e-8d0c-35b9f2d1e7aa".parse().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();

        let root = compose_dotted_order(None, t, root_id);
        assert_eq!(
            "20240305T070809000000Z1b4e28ba-2fa1-41d2-883f-0016d3cca427",
            root.as_str()
        );
        assert_eq!(1, root.depth());
        assert_eq!(None, root.parent());

        let child = compose_dotted_order(Some(&root), t, child_id);
        assert_eq!(
            "20240305T070809000000Z1b4e28ba-2fa1-41d2-883f-0016d3cca427.\
             20240305T070809000000Z6f0c3f55-9a3b-4c0e-8d0c-35b9f2d1e7aa",
            child.as_str()
        );
        assert_eq!(2, child.depth());
        assert_eq!(Some(root.clone()), child.parent());
        assert_eq!(child_id, child.leaf().run_id);
        assert_eq!(t, child.leaf().start_time);
        assert!(root.is_ancestor_of(&child));
        assert!(child.is_descendant_of(&root));
        assert!(!child.is_ancestor_of(&root));
        assert!(!root.is_ancestor_of(&root));
    }

    #[test]
    fn rejects_malformed_orders() {
        assert_eq!(Err(DottedOrderError::Empty), "".parse::<DottedOrder>());
        assert!("garbage".parse::<DottedOrder>().is_err());
        assert!(
            "20240305T070809000000Z1b4e28ba-2fa1-41d2-883f-0016d3cca427."
                .parse::<DottedOrder>()
                .is_err()
        );
        assert!(
            "20240305T070809000000X1b4e28ba-2fa1-41d2-883f-0016d3cca427"
                .parse::<DottedOrder>()
                .is_err()
        );
        assert!(serde_json::from_str::<DottedOrder>("\"nope\"").is_err());

        // multi-byte characters inside the fixed-width fields
        assert!(parse_timestamp("202é305T070809000123").is_err());
        assert!(
            "202é305T070809000123Z1b4e28ba-2fa1-41d2-883f-0016d3cca427"
                .parse::<DottedOrder>()
                .is_err()
        );
        assert!(
            "20240305T070809000123Z1b4e28ba-2fa1-41d2-883f-0016d3cca4é"
                .parse::<DottedOrder>()
                .is_err()
        );
    }

    #[test]
    fn roots_are_not_siblings() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let a = compose_dotted_order(None, t, RunId::allocate());
        let b = compose_dotted_order(None, t, RunId::allocate());
        assert!(!a.is_sibling_of(&b));

        let left = compose_dotted_order(Some(&a), t, RunId::allocate());
        let right = compose_dotted_order(Some(&a), t, RunId::allocate());
        let cousin = compose_dotted_order(Some(&b), t, RunId::allocate());
        assert!(left.is_sibling_of(&right));
        assert!(!left.is_sibling_of(&left));
        assert!(!left.is_sibling_of(&cousin));
    }

    #[test]
    fn monotonic_now_strictly_increases() {
        let mut last = monotonic_now();
        for _ in 0..10_000 {
            let next = monotonic_now();
            assert!(next > last);
            last = next;
        }
    }

    proptest! {
        #[test]
        fn formatted_timestamps_sort_chronologically(a in timestamp(), b in timestamp()) {
            prop_assert_eq!(a.cmp(&b), format_timestamp(a).cmp(&format_timestamp(b)));
            prop_assert_eq!(Ok(a), parse_timestamp(&format_timestamp(a)));
        }

        #[test]
        fn children_extend_their_parent(
            parent_time in timestamp(),
            parent_id in run_id(),
            child_time in timestamp(),
            child_id in run_id(),
        ) {
            let parent = compose_dotted_order(None, parent_time, parent_id);
            let child = compose_dotted_order(Some(&parent), child_time, child_id);
            let prefix = format!("{}.", parent);
            prop_assert!(child.as_str().starts_with(&prefix));
            prop_assert!(parent < child);
            prop_assert_eq!(Ok(child.clone()), child.as_str().parse::<DottedOrder>());
        }

        #[test]
        fn siblings_order_by_start_time(
            parent_id in run_id(),
            first_id in run_id(),
            second_id in run_id(),
            start in 0i64..4_000_000_000_000_000,
            gap in 1i64..1_000_000_000,
        ) {
            let parent = compose_dotted_order(None, at(start), parent_id);
            let first = compose_dotted_order(Some(&parent), at(start), first_id);
            let second = compose_dotted_order(Some(&parent), at(start + gap), second_id);
            prop_assert!(first < second);
            prop_assert!(first.is_sibling_of(&second));
            prop_assert!(!parent.is_sibling_of(&first));
        }
    }
}
