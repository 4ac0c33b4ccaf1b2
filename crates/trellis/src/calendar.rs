//! Working-day arithmetic.
//!
//! A [`WorkingCalendar`] knows which weekdays are non-working and provides
//! the date math used by the scheduler. All functions are pure.

use crate::error::{Error, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Days in a week.
const WEEK: i64 = 7;

/// Calendar of working weekdays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingCalendar {
    /// Indexed by `Weekday::num_days_from_monday`
    non_working: [bool; 7],
}

impl WorkingCalendar {
    /// Create a calendar with the given non-working weekdays.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if every day of the week is non-working.
    pub fn new(non_working: impl IntoIterator<Item = Weekday>) -> Result<Self> {
        let mut days = [false; 7];
        for day in non_working {
            days[day.num_days_from_monday() as usize] = true;
        }
        if days.iter().all(|&off| off) {
            return Err(Error::Config(
                "Calendar must have at least one working day".to_string(),
            ));
        }
        Ok(Self { non_working: days })
    }

    /// Returns `true` if `date` falls on a working weekday.
    pub fn is_working_day(&self, date: NaiveDate) -> bool {
        !self.non_working[date.weekday().num_days_from_monday() as usize]
    }

    /// Number of working days per week.
    pub fn working_days_per_week(&self) -> i64 {
        self.non_working.iter().filter(|&&off| !off).count() as i64
    }

    /// First working day on or after `date`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DateOutOfRange` past the last representable date.
    pub fn next_working_date(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut date = date;
        while !self.is_working_day(date) {
            date = shift(date, 1)?;
        }
        Ok(date)
    }

    /// Move `n` working days away from `date`.
    ///
    /// For positive `n` the result is the `n`-th working day after `date`,
    /// for negative `n` the `|n|`-th working day before it. `n == 0` rounds
    /// forward to the next working day on or after `date`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DateOutOfRange` if the result is not representable.
    pub fn add_working_days(&self, date: NaiveDate, n: i32) -> Result<NaiveDate> {
        if n == 0 {
            return self.next_working_date(date);
        }

        let step = if n > 0 { 1 } else { -1 };
        let per_week = self.working_days_per_week();
        let mut remaining = i64::from(n).abs();

        // Any seven consecutive days hold exactly `per_week` working days.
        // Keep at least one partial week so the final step lands on a
        // working day rather than on `date`'s weekday.
        let mut weeks = remaining / per_week;
        if weeks > 0 && remaining % per_week == 0 {
            weeks -= 1;
        }
        remaining -= weeks * per_week;
        let mut cursor = shift(date, step * weeks * WEEK)?;

        while remaining > 0 {
            cursor = shift(cursor, step)?;
            if self.is_working_day(cursor) {
                remaining -= 1;
            }
        }
        Ok(cursor)
    }

    /// Count working days in `[from, to)`.
    ///
    /// The start is included and the end excluded, so the span between a
    /// Monday and the following Wednesday is 2. Negative when `to < from`.
    pub fn working_days_between(&self, from: NaiveDate, to: NaiveDate) -> i32 {
        if to < from {
            return -self.working_days_between(to, from);
        }

        let days = (to - from).num_days();
        let weeks = days / WEEK;
        let mut count = weeks * self.working_days_per_week();
        let mut cursor = from + Duration::days(weeks * WEEK);
        while cursor < to {
            if self.is_working_day(cursor) {
                count += 1;
            }
            cursor += Duration::days(1);
        }
        i32::try_from(count).unwrap_or(i32::MAX)
    }
}

fn shift(date: NaiveDate, days: i64) -> Result<NaiveDate> {
    date.checked_add_signed(Duration::days(days))
        .ok_or(Error::DateOutOfRange { date, days })
}

impl Default for WorkingCalendar {
    /// Monday to Friday
    fn default() -> Self {
        Self {
            non_working: [false, false, false, false, false, true, true],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[rstest]
    #[case::wed_plus_one(d(2024, 1, 3), 1, d(2024, 1, 4))]
    #[case::fri_plus_one(d(2024, 1, 5), 1, d(2024, 1, 8))]
    #[case::wed_plus_three(d(2024, 1, 3), 3, d(2024, 1, 8))]
    #[case::mon_plus_five(d(2024, 1, 1), 5, d(2024, 1, 8))]
    #[case::sat_plus_five(d(2024, 1, 6), 5, d(2024, 1, 12))]
    #[case::mon_plus_ten(d(2024, 1, 1), 10, d(2024, 1, 15))]
    #[case::mon_minus_one(d(2024, 1, 8), -1, d(2024, 1, 5))]
    #[case::wed_minus_five(d(2024, 1, 10), -5, d(2024, 1, 3))]
    #[case::sat_zero_rounds_forward(d(2024, 1, 6), 0, d(2024, 1, 8))]
    #[case::tue_zero_unchanged(d(2024, 1, 2), 0, d(2024, 1, 2))]
    fn test_add_working_days(#[case] from: NaiveDate, #[case] n: i32, #[case] expected: NaiveDate) {
        let calendar = WorkingCalendar::default();
        assert_eq!(calendar.add_working_days(from, n).unwrap(), expected);
    }

    #[rstest]
    #[case::mon_to_wed(d(2024, 1, 1), d(2024, 1, 3), 2)]
    #[case::same_day(d(2024, 1, 3), d(2024, 1, 3), 0)]
    #[case::across_weekend(d(2024, 1, 5), d(2024, 1, 9), 2)]
    #[case::two_weeks(d(2024, 1, 1), d(2024, 1, 15), 10)]
    #[case::weekend_only(d(2024, 1, 6), d(2024, 1, 8), 0)]
    #[case::reversed(d(2024, 1, 3), d(2024, 1, 1), -2)]
    fn test_working_days_between(
        #[case] from: NaiveDate,
        #[case] to: NaiveDate,
        #[case] expected: i32,
    ) {
        let calendar = WorkingCalendar::default();
        assert_eq!(calendar.working_days_between(from, to), expected);
    }

    #[test]
    fn test_add_then_span_preserves_duration() {
        let calendar = WorkingCalendar::default();
        let start = d(2024, 1, 4);
        for n in 0..20 {
            let due = calendar.add_working_days(start, n).unwrap();
            assert_eq!(calendar.working_days_between(start, due), n);
        }
    }

    #[test]
    fn test_custom_calendar_skips_fridays() {
        let calendar =
            WorkingCalendar::new([Weekday::Fri, Weekday::Sat, Weekday::Sun]).unwrap();
        assert_eq!(calendar.working_days_per_week(), 4);
        assert_eq!(calendar.add_working_days(d(2024, 1, 4), 1).unwrap(), d(2024, 1, 8));
        assert!(!calendar.is_working_day(d(2024, 1, 5)));
    }

    #[test]
    fn test_date_past_range_is_an_error() {
        let calendar = WorkingCalendar::default();
        assert!(matches!(
            calendar.add_working_days(NaiveDate::MAX, 1),
            Err(Error::DateOutOfRange { .. })
        ));
        assert!(matches!(
            calendar.add_working_days(d(2024, 1, 1), i32::MIN),
            Err(Error::DateOutOfRange { .. })
        ));
    }

    #[test]
    fn test_calendar_without_working_days_is_rejected() {
        let all = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        assert!(matches!(WorkingCalendar::new(all), Err(Error::Config(_))));
    }
}
