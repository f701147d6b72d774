//! Extraction units
//!
//! An [`ExtractionUnit`] is the smallest period a source can be marked
//! extracted for: a calendar day (GA4, Google Ads) or a calendar month
//! (Search Console). Units are ordered chronologically within a granularity
//! and serialize as `YYYY-MM-DD` (day) or `YYYYMM` (month).

use crate::error::CommonError;
use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Granularity of an extraction unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Month,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Day => write!(f, "day"),
            Granularity::Month => write!(f, "month"),
        }
    }
}

/// A day or a month that extraction progress is tracked in.
///
/// `Month` always carries the first day of its month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtractionUnit {
    Day(NaiveDate),
    Month(NaiveDate),
}

impl ExtractionUnit {
    /// Unit for a single calendar day
    pub fn day(date: NaiveDate) -> Self {
        ExtractionUnit::Day(date)
    }

    /// Unit for the calendar month containing `date`
    pub fn month_of(date: NaiveDate) -> Self {
        ExtractionUnit::Month(first_of_month(date))
    }

    /// Unit for `year`/`month`, `None` if the month is out of range
    pub fn month(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(ExtractionUnit::Month)
    }

    /// Unit of the given granularity that contains `date`
    pub fn containing(granularity: Granularity, date: NaiveDate) -> Self {
        match granularity {
            Granularity::Day => Self::day(date),
            Granularity::Month => Self::month_of(date),
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            ExtractionUnit::Day(_) => Granularity::Day,
            ExtractionUnit::Month(_) => Granularity::Month,
        }
    }

    /// First calendar day covered by this unit
    pub fn first_day(&self) -> NaiveDate {
        match self {
            ExtractionUnit::Day(d) | ExtractionUnit::Month(d) => *d,
        }
    }

    /// Last calendar day covered by this unit
    pub fn last_day(&self) -> NaiveDate {
        match self {
            ExtractionUnit::Day(d) => *d,
            ExtractionUnit::Month(d) => d
                .checked_add_months(Months::new(1))
                .and_then(|next| next.pred_opt())
                .unwrap_or(NaiveDate::MAX),
        }
    }

    /// Partition month tag (`YYYYMM`) this unit's rows are written under
    pub fn report_month(&self) -> String {
        self.first_day().format("%Y%m").to_string()
    }

    /// The unit immediately after this one
    pub fn next(&self) -> Option<Self> {
        match self {
            ExtractionUnit::Day(d) => d.succ_opt().map(ExtractionUnit::Day),
            ExtractionUnit::Month(d) => d
                .checked_add_months(Months::new(1))
                .map(ExtractionUnit::Month),
        }
    }

    /// The unit `n` steps before this one
    pub fn back(&self, n: u32) -> Option<Self> {
        match self {
            ExtractionUnit::Day(d) => d
                .checked_sub_days(chrono::Days::new(u64::from(n)))
                .map(ExtractionUnit::Day),
            ExtractionUnit::Month(d) => d.checked_sub_months(Months::new(n)).map(ExtractionUnit::Month),
        }
    }

    /// Whether `date` falls inside this unit
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.first_day() <= date && date <= self.last_day()
    }

    /// Every unit in `[start, end]`, oldest first.
    ///
    /// Empty when `start > end` or the granularities differ.
    pub fn range_inclusive(start: Self, end: Self) -> UnitRange {
        let next = if start.granularity() == end.granularity() && start <= end {
            Some(start)
        } else {
            None
        };
        UnitRange { next, end }
    }

    /// Number of units in `[start, end]`
    pub fn count_inclusive(start: Self, end: Self) -> usize {
        if start.granularity() != end.granularity() || start > end {
            return 0;
        }
        match (start, end) {
            (ExtractionUnit::Day(a), ExtractionUnit::Day(b)) => {
                (b - a).num_days().unsigned_abs() as usize + 1
            },
            _ => {
                let months = |d: NaiveDate| d.year() as i64 * 12 + d.month0() as i64;
                (months(end.first_day()) - months(start.first_day())).unsigned_abs() as usize + 1
            },
        }
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Iterator over a closed range of units
#[derive(Debug, Clone)]
pub struct UnitRange {
    next: Option<ExtractionUnit>,
    end: ExtractionUnit,
}

impl Iterator for UnitRange {
    type Item = ExtractionUnit;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = if current < self.end {
            current.next()
        } else {
            None
        };
        Some(current)
    }
}

impl fmt::Display for ExtractionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionUnit::Day(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            ExtractionUnit::Month(d) => write!(f, "{}", d.format("%Y%m")),
        }
    }
}

impl FromStr for ExtractionUnit {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || CommonError::InvalidUnit(s.to_string());

        if s.len() == 10 {
            return NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(ExtractionUnit::Day)
                .map_err(|_| invalid());
        }

        if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
            let year: i32 = s[..4].parse().map_err(|_| invalid())?;
            let month: u32 = s[4..].parse().map_err(|_| invalid())?;
            return ExtractionUnit::month(year, month).ok_or_else(invalid);
        }

        Err(invalid())
    }
}

impl Serialize for ExtractionUnit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExtractionUnit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn day(s: &str) -> ExtractionUnit {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(day("2025-06-01").to_string(), "2025-06-01");
        assert_eq!(day("202506").to_string(), "202506");
        assert_eq!(day("202506").granularity(), Granularity::Month);
        assert!("2025-13-01".parse::<ExtractionUnit>().is_err());
        assert!("202513".parse::<ExtractionUnit>().is_err());
        assert!("2025/06/01".parse::<ExtractionUnit>().is_err());
    }

    #[test]
    fn test_month_bounds() {
        let feb = ExtractionUnit::month(2024, 2).unwrap();
        assert_eq!(feb.first_day(), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(feb.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(feb.next().unwrap().to_string(), "202403");
        assert_eq!(ExtractionUnit::month(2024, 12).unwrap().next().unwrap().to_string(), "202501");
    }

    #[test]
    fn test_range_inclusive_days() {
        let units: Vec<String> = ExtractionUnit::range_inclusive(day("2025-01-30"), day("2025-02-02"))
            .map(|u| u.to_string())
            .collect();
        assert_eq!(units, vec!["2025-01-30", "2025-01-31", "2025-02-01", "2025-02-02"]);
    }

    #[test]
    fn test_range_inclusive_empty_cases() {
        assert_eq!(ExtractionUnit::range_inclusive(day("2025-02-02"), day("2025-01-30")).count(), 0);
        assert_eq!(ExtractionUnit::range_inclusive(day("2025-01-01"), day("202502")).count(), 0);
    }

    #[test]
    fn test_count_inclusive() {
        assert_eq!(ExtractionUnit::count_inclusive(day("2025-01-01"), day("2025-01-31")), 31);
        assert_eq!(ExtractionUnit::count_inclusive(day("202411"), day("202502")), 4);
        assert_eq!(ExtractionUnit::count_inclusive(day("202502"), day("202411")), 0);
    }

    #[test]
    fn test_back_and_report_month() {
        assert_eq!(day("2025-03-02").back(2).unwrap().to_string(), "2025-02-28");
        assert_eq!(day("202501").back(1).unwrap().to_string(), "202412");
        assert_eq!(day("2025-03-02").report_month(), "202503");
    }

    #[test]
    fn test_serde_round_trip_uses_plain_strings() {
        let json = serde_json::to_string(&vec![day("2025-06-01"), day("202506")]).unwrap();
        assert_eq!(json, r#"["2025-06-01","202506"]"#);
        let back: Vec<ExtractionUnit> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![day("2025-06-01"), day("202506")]);
    }
}
