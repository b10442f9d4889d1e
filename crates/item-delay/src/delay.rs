use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::DelayError;
use crate::period::Period;

/// Longest allowed delay, in seconds.
pub const MAX_DELAY_SECS: u32 = 86_400;

/// How far ahead period boundaries are searched.
const BOUNDARY_HORIZON_DAYS: u64 = 8;

/// Upper bound on boundary hops while computing one check.
const MAX_BOUNDARY_STEPS: usize = 1024;

/// A delay that applies while its period is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlexibleInterval {
    pub delay: u32,
    pub period: Period,
}

/// A parsed item update interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delay {
    /// Delay in seconds outside of any flexible period.
    pub simple: u32,
    pub flexible: Vec<FlexibleInterval>,
}

/// Parse a duration with an optional `s`, `m`, `h`, `d` or `w` suffix.
pub fn parse_duration(s: &str) -> Result<u32, DelayError> {
    let invalid = || DelayError::InvalidDuration(s.to_string());
    let (digits, multiplier) = match s.char_indices().last() {
        None => return Err(DelayError::Empty),
        Some((i, 's')) => (&s[..i], 1u64),
        Some((i, 'm')) => (&s[..i], 60),
        Some((i, 'h')) => (&s[..i], 3_600),
        Some((i, 'd')) => (&s[..i], 86_400),
        Some((i, 'w')) => (&s[..i], 604_800),
        Some(_) => (s, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let seconds = value.checked_mul(multiplier).ok_or_else(invalid)?;
    if seconds > u64::from(MAX_DELAY_SECS) {
        return Err(DelayError::TooLong(s.to_string()));
    }
    Ok(seconds as u32)
}

/// First check time strictly after `t` for a fixed delay.
fn aligned_after(seed: u64, t: i64, delay: u32) -> i64 {
    let d = i64::from(delay);
    let mut next = d * t.div_euclid(d) + (seed % u64::from(delay)) as i64;
    while next <= t {
        next += d;
    }
    next
}

/// First check time at or after `t` for a fixed delay.
fn aligned_from(seed: u64, t: i64, delay: u32) -> i64 {
    let d = i64::from(delay);
    let mut next = d * t.div_euclid(d) + (seed % u64::from(delay)) as i64;
    while next < t {
        next += d;
    }
    next
}

/// Next check for an item whose last check failed, using the
/// refresh-unsupported interval instead of the item delay.
pub fn next_check_unsupported(
    seed: u64,
    from: DateTime<Utc>,
    refresh_secs: u32,
) -> Result<DateTime<Utc>, DelayError> {
    if refresh_secs == 0 {
        return Err(DelayError::ZeroDelay);
    }
    let next = aligned_after(seed, from.timestamp(), refresh_secs);
    DateTime::from_timestamp(next, 0).ok_or(DelayError::NoActiveInterval)
}

impl Delay {
    /// A delay without flexible intervals.
    pub fn simple(seconds: u32) -> Self {
        Self {
            simple: seconds,
            flexible: Vec::new(),
        }
    }

    /// Delay in effect at `t`: the shortest delay among the active flexible
    /// intervals, or the simple delay when none is active.
    pub fn current_delay<Tz: TimeZone>(&self, t: i64, tz: &Tz) -> u32 {
        self.flexible
            .iter()
            .filter(|f| f.period.contains_at(t, tz))
            .map(|f| f.delay)
            .min()
            .unwrap_or(self.simple)
    }

    fn next_boundary<Tz: TimeZone>(&self, t: i64, tz: &Tz) -> Option<i64> {
        self.flexible
            .iter()
            .filter_map(|f| f.period.next_boundary(t, tz, BOUNDARY_HORIZON_DAYS))
            .min()
    }

    /// Compute the next check time strictly after `from`.
    ///
    /// `seed` spreads checks of items sharing a delay across the interval;
    /// the item id is used. Flexible periods are evaluated in `tz`.
    pub fn next_check<Tz: TimeZone>(
        &self,
        seed: u64,
        from: DateTime<Utc>,
        tz: &Tz,
    ) -> Result<DateTime<Utc>, DelayError> {
        let mut t = from.timestamp();
        let mut delay = self.current_delay(t, tz);
        let mut next = (delay != 0).then(|| aligned_after(seed, t, delay));

        if !self.flexible.is_empty() {
            for _ in 0..MAX_BOUNDARY_STEPS {
                let Some(boundary) = self.next_boundary(t, tz) else {
                    break;
                };
                if next.is_some_and(|n| n <= boundary) {
                    break;
                }
                // the delay changes before the computed check, restart there
                t = boundary;
                delay = self.current_delay(t, tz);
                next = (delay != 0).then(|| aligned_from(seed, t, delay));
            }
        }

        next.and_then(|n| DateTime::from_timestamp(n, 0))
            .ok_or(DelayError::NoActiveInterval)
    }
}

impl FromStr for Delay {
    type Err = DelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let simple = parse_duration(parts.next().unwrap_or_default().trim())?;

        let mut flexible = Vec::new();
        for part in parts {
            let part = part.trim();
            match part.split_once('/') {
                Some((delay, period)) => {
                    let delay = parse_duration(delay)
                        .map_err(|_| DelayError::InvalidFlexible(part.to_string()))?;
                    let period = period.parse()?;
                    flexible.push(FlexibleInterval { delay, period });
                }
                None if part.starts_with(['m', 'w', 'h', 's']) => {
                    return Err(DelayError::SchedulingUnsupported(part.to_string()));
                }
                None => return Err(DelayError::InvalidFlexible(part.to_string())),
            }
        }

        if simple == 0 && flexible.iter().all(|f| f.delay == 0) {
            return Err(DelayError::ZeroDelay);
        }

        Ok(Self { simple, flexible })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 11, d, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("30").unwrap(), 30);
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("2h").unwrap(), 7_200);
        assert_eq!(parse_duration("1d").unwrap(), 86_400);
        assert_eq!(parse_duration("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_eq!(parse_duration(""), Err(DelayError::Empty));
        assert!(matches!(parse_duration("abc"), Err(DelayError::InvalidDuration(_))));
        assert!(matches!(parse_duration("10x"), Err(DelayError::InvalidDuration(_))));
        assert!(matches!(parse_duration("-1"), Err(DelayError::InvalidDuration(_))));
        assert!(matches!(parse_duration("s"), Err(DelayError::InvalidDuration(_))));
        assert!(matches!(parse_duration("1w"), Err(DelayError::TooLong(_))));
        assert!(matches!(parse_duration("86401"), Err(DelayError::TooLong(_))));
    }

    #[test]
    fn test_parse_delay() {
        let delay: Delay = "1m;10s/1-5,09:00-18:00".parse().unwrap();
        assert_eq!(delay.simple, 60);
        assert_eq!(delay.flexible.len(), 1);
        assert_eq!(delay.flexible[0].delay, 10);

        assert!("0;60/1-7,00:00-24:00".parse::<Delay>().is_ok());
        assert_eq!("0".parse::<Delay>(), Err(DelayError::ZeroDelay));
        assert_eq!(
            "0;0/1-7,00:00-24:00".parse::<Delay>(),
            Err(DelayError::ZeroDelay)
        );
        assert!(matches!(
            "60;wd1-5h9".parse::<Delay>(),
            Err(DelayError::SchedulingUnsupported(_))
        ));
        assert!(matches!(
            "60;1-5,09:00-18:00".parse::<Delay>(),
            Err(DelayError::InvalidFlexible(_))
        ));
        assert!(matches!(
            "60;x/1-5,09:00-18:00".parse::<Delay>(),
            Err(DelayError::InvalidFlexible(_))
        ));
    }

    #[test]
    fn test_simple_next_check_uses_seed() {
        // 1_700_000_000 % 60 == 20
        let from = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let next = Delay::simple(60).next_check(5, from, &Utc).unwrap();
        assert_eq!(next.timestamp(), 1_700_000_045);

        let next = Delay::simple(60).next_check(25, from, &Utc).unwrap();
        assert_eq!(next.timestamp(), 1_700_000_005);
    }

    #[test]
    fn test_next_check_is_strictly_after() {
        let from = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for delay in [1, 7, 10, 60, 3_600, 86_400] {
            for seed in [0, 1, 99, 12_345] {
                let next = Delay::simple(delay).next_check(seed, from, &Utc).unwrap();
                assert!(next > from);
                assert!(next.timestamp() - from.timestamp() <= i64::from(delay));
            }
        }
    }

    #[test]
    fn test_flexible_interval_applies_inside_period() {
        let delay: Delay = "1h;1m/1-5,09:00-18:00".parse().unwrap();
        // Monday 10:00:30, flexible delay applies
        assert_eq!(delay.next_check(0, at(13, 10, 0, 30), &Utc).unwrap(), at(13, 10, 1, 0));
        // Saturday, simple delay applies
        assert_eq!(delay.next_check(0, at(18, 10, 0, 30), &Utc).unwrap(), at(18, 11, 0, 0));
    }

    #[test]
    fn test_flexible_interval_boundary_moves_check_earlier() {
        let delay: Delay = "1h;1m/1-7,10:30-11:00".parse().unwrap();
        // simple delay would give 11:00, the period starts at 10:30
        assert_eq!(delay.next_check(0, at(13, 10, 0, 10), &Utc).unwrap(), at(13, 10, 30, 0));
    }

    #[test]
    fn test_zero_simple_delay_waits_for_period() {
        let delay: Delay = "0;1m/1-5,09:00-18:00".parse().unwrap();
        // Saturday noon waits until Monday morning
        assert_eq!(delay.next_check(0, at(18, 12, 0, 0), &Utc).unwrap(), at(20, 9, 0, 0));
    }

    #[test]
    fn test_no_active_interval() {
        let delay = Delay {
            simple: 0,
            flexible: Vec::new(),
        };
        assert_eq!(
            delay.next_check(0, at(13, 0, 0, 0), &Utc),
            Err(DelayError::NoActiveInterval)
        );
    }

    #[test]
    fn test_next_check_unsupported() {
        let from = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        // 1_700_000_000 % 600 == 200
        let next = next_check_unsupported(0, from, 600).unwrap();
        assert_eq!(next.timestamp(), 1_700_000_400);
        assert_eq!(next_check_unsupported(0, from, 0), Err(DelayError::ZeroDelay));
    }
}
