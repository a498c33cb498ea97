//! Deadlines and the `grpc-timeout` wire format.

use std::time::Duration;

use tokio::time::Instant;

/// An absolute point on the monotonic clock by which a call must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    when: Instant,
}

impl Deadline {
    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Deadline {
        Deadline {
            when: Instant::now() + duration,
        }
    }

    pub fn at(when: Instant) -> Deadline {
        Deadline { when }
    }

    pub fn expiration(&self) -> Instant {
        self.when
    }

    /// Time left before expiry, zero once expired.
    pub fn time_remaining(&self) -> Duration {
        self.when.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.when <= Instant::now()
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        if self.when <= other.when {
            self
        } else {
            other
        }
    }
}

// A timeout value on the wire has at most eight digits.
const CUTOFF: u128 = 100_000_000;

const UNITS: [(char, u128); 6] = [
    ('n', 1),
    ('u', 1_000),
    ('m', 1_000_000),
    ('S', 1_000_000_000),
    ('M', 60 * 1_000_000_000),
    ('H', 3_600 * 1_000_000_000),
];

/// Encodes a timeout as a `grpc-timeout` value: at most eight decimal digits
/// followed by a unit in `{n, u, m, S, M, H}`.
///
/// The encoding is greedy with respect to precision: the smallest unit whose
/// value fits eight digits is chosen, so re-encoding a decoded value never
/// increases it. Durations past ~11,000 years cap at the largest encodable
/// value.
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    for (unit, nanos_per_unit) in UNITS {
        let value = nanos / nanos_per_unit;
        if value < CUTOFF {
            return format!("{}{}", value, unit);
        }
    }
    format!("{}H", CUTOFF - 1)
}

/// Errors from [`decode_timeout`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutParseError {
    #[error("timeout is empty")]
    Empty,
    #[error("timeout has more than eight digits")]
    TooLong,
    #[error("invalid timeout digits: {0:?}")]
    BadDigits(String),
    #[error("invalid timeout unit: {0:?}")]
    BadUnit(char),
}

/// Decodes a `grpc-timeout` value.
pub fn decode_timeout(value: &str) -> Result<Duration, TimeoutParseError> {
    if value.is_empty() {
        return Err(TimeoutParseError::Empty);
    }
    if value.len() > 9 {
        return Err(TimeoutParseError::TooLong);
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let unit = unit.chars().next().expect("non-empty suffix");
    let amount: u64 = digits
        .parse()
        .map_err(|_| TimeoutParseError::BadDigits(digits.to_string()))?;
    let nanos_per_unit = UNITS
        .iter()
        .find(|(u, _)| *u == unit)
        .map(|(_, n)| *n)
        .ok_or(TimeoutParseError::BadUnit(unit))?;
    let nanos = amount as u128 * nanos_per_unit;
    let secs = (nanos / 1_000_000_000) as u64;
    let subsec = (nanos % 1_000_000_000) as u32;
    Ok(Duration::new(secs, subsec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_greedily_at_the_smallest_fitting_unit() {
        assert_eq!(encode_timeout(Duration::from_nanos(0)), "0n");
        assert_eq!(encode_timeout(Duration::from_nanos(99_999_999)), "99999999n");
        assert_eq!(encode_timeout(Duration::from_nanos(100_000_000)), "100000u");
        assert_eq!(encode_timeout(Duration::from_secs(2)), "2000000u");
        assert_eq!(
            encode_timeout(Duration::from_nanos(2_000_000_001)),
            "2000000u"
        );
        assert_eq!(encode_timeout(Duration::from_secs(100_000_000)), "1666666M");
    }

    #[test]
    fn decode_multiplies_by_the_unit() {
        assert_eq!(decode_timeout("7n").unwrap(), Duration::from_nanos(7));
        assert_eq!(decode_timeout("7u").unwrap(), Duration::from_micros(7));
        assert_eq!(decode_timeout("7m").unwrap(), Duration::from_millis(7));
        assert_eq!(decode_timeout("7S").unwrap(), Duration::from_secs(7));
        assert_eq!(decode_timeout("7M").unwrap(), Duration::from_secs(420));
        assert_eq!(decode_timeout("7H").unwrap(), Duration::from_secs(25_200));
    }

    #[test]
    fn decode_rejects_malformed_values() {
        assert_eq!(decode_timeout(""), Err(TimeoutParseError::Empty));
        assert_eq!(
            decode_timeout("123456789S"),
            Err(TimeoutParseError::TooLong)
        );
        assert_eq!(decode_timeout("12x"), Err(TimeoutParseError::BadUnit('x')));
        assert!(matches!(
            decode_timeout("1.5S"),
            Err(TimeoutParseError::BadDigits(_))
        ));
        assert!(matches!(
            decode_timeout("S"),
            Err(TimeoutParseError::BadDigits(_))
        ));
    }

    #[test]
    fn re_encoding_never_exceeds_the_original() {
        for nanos in [
            1u64,
            999,
            1_000,
            99_999_999,
            100_000_000,
            2_000_000_001,
            86_400_000_000_000,
        ] {
            let encoded = encode_timeout(Duration::from_nanos(nanos));
            let decoded = decode_timeout(&encoded).unwrap();
            assert!(decoded.as_nanos() <= nanos as u128, "{} via {}", nanos, encoded);
            let re = decode_timeout(&encode_timeout(decoded)).unwrap();
            assert!(re <= decoded);
        }
    }

    #[test]
    fn deadline_min_picks_the_earlier() {
        let near = Deadline::after(Duration::from_secs(1));
        let far = Deadline::after(Duration::from_secs(60));
        assert_eq!(near.min(far), near);
        assert_eq!(far.min(near), near);
        assert!(!far.is_expired());
    }
}
