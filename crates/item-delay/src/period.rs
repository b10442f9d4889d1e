use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeDelta, TimeZone, Timelike, Utc};

use crate::error::DelayError;

const SECONDS_PER_DAY: u32 = 86_400;

/// A weekly time period such as `1-5,09:00-18:00`.
///
/// Weekdays are numbered 1 (Monday) to 7 (Sunday). The period covers
/// `start..end` seconds of each matching day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub day_from: u8,
    pub day_to: u8,
    pub start: u32,
    pub end: u32,
}

impl Period {
    /// Check whether a weekday and second of day fall into this period.
    pub fn contains(&self, weekday: u8, second_of_day: u32) -> bool {
        (self.day_from..=self.day_to).contains(&weekday)
            && second_of_day >= self.start
            && second_of_day < self.end
    }

    /// Check whether a timestamp falls into this period in the given zone.
    pub fn contains_at<Tz: TimeZone>(&self, t: i64, tz: &Tz) -> bool {
        match DateTime::<Utc>::from_timestamp(t, 0) {
            Some(utc) => {
                let local = utc.with_timezone(tz);
                self.contains(
                    local.weekday().number_from_monday() as u8,
                    local.num_seconds_from_midnight(),
                )
            }
            None => false,
        }
    }

    /// Earliest start or end of this period strictly after `t`, looking at
    /// most `horizon_days` ahead.
    pub fn next_boundary<Tz: TimeZone>(&self, t: i64, tz: &Tz, horizon_days: u64) -> Option<i64> {
        let local = DateTime::<Utc>::from_timestamp(t, 0)?.with_timezone(tz);
        let today = local.date_naive();
        let mut best: Option<i64> = None;

        for offset in 0..=horizon_days {
            let Some(date) = today.checked_add_days(Days::new(offset)) else {
                break;
            };
            let weekday = date.weekday().number_from_monday() as u8;
            if !(self.day_from..=self.day_to).contains(&weekday) {
                continue;
            }
            for second in [self.start, self.end] {
                if let Some(ts) = local_timestamp(tz, date, second) {
                    if ts > t && best.is_none_or(|b| ts < b) {
                        best = Some(ts);
                    }
                }
            }
            if best.is_some() {
                break;
            }
        }
        best
    }
}

fn local_timestamp<Tz: TimeZone>(tz: &Tz, date: NaiveDate, second: u32) -> Option<i64> {
    let naive = date.and_hms_opt(0, 0, 0)? + TimeDelta::seconds(i64::from(second));
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

fn parse_time(s: &str) -> Option<u32> {
    let (hours, minutes) = s.split_once(':')?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return None;
    }
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if minutes > 59 || hours > 24 || (hours == 24 && minutes != 0) {
        return None;
    }
    Some(hours * 3600 + minutes * 60)
}

fn parse_weekday(s: &str) -> Option<u8> {
    match s.parse::<u8>() {
        Ok(day) if (1..=7).contains(&day) => Some(day),
        _ => None,
    }
}

impl FromStr for Period {
    type Err = DelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DelayError::InvalidFlexible(s.to_string());

        let (days, times) = s.split_once(',').ok_or_else(invalid)?;
        let (day_from, day_to) = match days.split_once('-') {
            Some((from, to)) => (parse_weekday(from), parse_weekday(to)),
            None => (parse_weekday(days), parse_weekday(days)),
        };
        let (day_from, day_to) = day_from.zip(day_to).ok_or_else(invalid)?;
        if day_from > day_to {
            return Err(invalid());
        }

        let (start, end) = times.split_once('-').ok_or_else(invalid)?;
        let start = parse_time(start).ok_or_else(invalid)?;
        let end = parse_time(end).ok_or_else(invalid)?;
        if start >= end || end > SECONDS_PER_DAY {
            return Err(invalid());
        }

        Ok(Self {
            day_from,
            day_to,
            start,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period() {
        let p: Period = "1-5,09:00-18:00".parse().unwrap();
        assert_eq!(p.day_from, 1);
        assert_eq!(p.day_to, 5);
        assert_eq!(p.start, 9 * 3600);
        assert_eq!(p.end, 18 * 3600);

        let p: Period = "7,0:00-24:00".parse().unwrap();
        assert_eq!((p.day_from, p.day_to, p.start, p.end), (7, 7, 0, 86_400));
    }

    #[test]
    fn test_parse_invalid_period() {
        for s in [
            "", "1-5", "0,09:00-10:00", "1-8,09:00-10:00", "5-1,09:00-10:00",
            "1,10:00-09:00", "1,10:00-10:00", "1,24:30-25:00", "1,9:60-10:00", "1,9-10",
        ] {
            assert!(s.parse::<Period>().is_err(), "{s} should be rejected");
        }
    }

    #[test]
    fn test_contains() {
        let p: Period = "1-5,09:00-18:00".parse().unwrap();
        assert!(p.contains(1, 9 * 3600));
        assert!(p.contains(5, 18 * 3600 - 1));
        assert!(!p.contains(5, 18 * 3600));
        assert!(!p.contains(6, 10 * 3600));
    }

    #[test]
    fn test_next_boundary() {
        let p: Period = "1-5,09:00-18:00".parse().unwrap();
        // Monday 2023-11-13 08:30 UTC
        let monday = Utc.with_ymd_and_hms(2023, 11, 13, 8, 30, 0).unwrap().timestamp();
        let nine = Utc.with_ymd_and_hms(2023, 11, 13, 9, 0, 0).unwrap().timestamp();
        assert_eq!(p.next_boundary(monday, &Utc, 8), Some(nine));

        let eighteen = Utc.with_ymd_and_hms(2023, 11, 13, 18, 0, 0).unwrap().timestamp();
        assert_eq!(p.next_boundary(nine, &Utc, 8), Some(eighteen));

        // Saturday noon jumps to the following Monday
        let saturday = Utc.with_ymd_and_hms(2023, 11, 18, 12, 0, 0).unwrap().timestamp();
        let next_monday = Utc.with_ymd_and_hms(2023, 11, 20, 9, 0, 0).unwrap().timestamp();
        assert_eq!(p.next_boundary(saturday, &Utc, 8), Some(next_monday));
    }
}
