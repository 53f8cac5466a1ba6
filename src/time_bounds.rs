//! Time coordinates and bounds of transformed records.
//!
//! A record's time window always ends at `window_end` and starts one period
//! (day or month) earlier; the record's time coordinate is the window's
//! midpoint. What differs between datasets is where the window ends, which
//! is decided by a [`TimeBoundsRule`].
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::error::DateTimeError;
use crate::utils;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimeScale {
    Daily,
    Monthly,
}

impl TimeScale {
    /// ISO 8601 duration string for the `time_coverage_resolution` attribute
    pub fn coverage_resolution(&self) -> &'static str {
        match self {
            Self::Daily => "P1D",
            Self::Monthly => "P1M",
        }
    }
}

/// Every date in `year` a series at this time scale has a record for:
/// every calendar day for daily data, the first of each month for monthly data.
pub fn dates_in_year(year: i32, scale: TimeScale) -> Result<Vec<NaiveDate>, DateTimeError> {
    match scale {
        TimeScale::Monthly => (1..=12).map(|m| utils::ymd(year, m, 1)).collect(),
        TimeScale::Daily => {
            let start = utils::ymd(year, 1, 1)?;
            Ok(start.iter_days().take_while(|d| d.year() == year).collect())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    /// The window of one `scale` period ending at `end`.
    pub fn ending_at(end: NaiveDateTime, scale: TimeScale) -> Result<Self, DateTimeError> {
        let start = match scale {
            TimeScale::Daily => end.checked_sub_signed(TimeDelta::days(1)),
            TimeScale::Monthly => end.checked_sub_months(Months::new(1)),
        }
        .ok_or_else(|| DateTimeError::out_of_range(format!("-1 {scale} period"), end))?;
        Ok(Self { start, end })
    }

    pub fn center(&self) -> NaiveDateTime {
        self.start + (self.end - self.start) / 2
    }

    pub fn as_array(&self) -> [NaiveDateTime; 2] {
        [self.start, self.end]
    }
}

/// Decides where a record's time window ends.
pub trait TimeBoundsRule: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// `date` is the granule's catalog date, `record_time` the time stamp
    /// carried by the granule itself (if any).
    fn window_end(
        &self,
        date: NaiveDate,
        record_time: Option<NaiveDateTime>,
        scale: TimeScale,
    ) -> Result<NaiveDateTime, DateTimeError>;

    fn window(
        &self,
        date: NaiveDate,
        record_time: Option<NaiveDateTime>,
        scale: TimeScale,
    ) -> Result<TimeWindow, DateTimeError> {
        TimeWindow::ending_at(self.window_end(date, record_time, scale)?, scale)
    }
}

/// The window covers the calendar day or month containing the granule's date.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalendarWindow;

impl TimeBoundsRule for CalendarWindow {
    fn name(&self) -> &'static str {
        "calendar"
    }

    fn window_end(
        &self,
        date: NaiveDate,
        _record_time: Option<NaiveDateTime>,
        scale: TimeScale,
    ) -> Result<NaiveDateTime, DateTimeError> {
        let end_date = match scale {
            TimeScale::Daily => date
                .succ_opt()
                .ok_or_else(|| DateTimeError::out_of_range("1 day", date))?,
            TimeScale::Monthly => utils::first_of_next_month(date)?,
        };
        Ok(end_date.and_time(NaiveTime::MIN))
    }
}

/// The window ends one day after the granule's own time stamp, for products
/// whose time stamp marks the start of the averaging period.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordTimePlusOneDay;

impl TimeBoundsRule for RecordTimePlusOneDay {
    fn name(&self) -> &'static str {
        "record_time_plus_one_day"
    }

    fn window_end(
        &self,
        date: NaiveDate,
        record_time: Option<NaiveDateTime>,
        _scale: TimeScale,
    ) -> Result<NaiveDateTime, DateTimeError> {
        let t = record_time.unwrap_or_else(|| date.and_time(NaiveTime::MIN));
        t.checked_add_signed(TimeDelta::days(1))
            .ok_or_else(|| DateTimeError::out_of_range("1 day", t))
    }
}

/// Rules that can be selected by name in a dataset configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeBoundsOverride {
    Calendar,
    RecordTimePlusOneDay,
}

/// Datasets that need a non-standard rule even when their configuration does
/// not say so.
const BUILT_IN_OVERRIDES: &[(&str, TimeBoundsOverride)] =
    &[("DEBIAS_LOCEAN", TimeBoundsOverride::RecordTimePlusOneDay)];

/// Pick the time bounds rule for a dataset: the configured override if any,
/// else a built-in override matched by dataset name, else [`CalendarWindow`].
pub fn rule_for_dataset(ds_name: &str, configured: Option<TimeBoundsOverride>) -> Arc<dyn TimeBoundsRule> {
    let choice = configured.or_else(|| {
        BUILT_IN_OVERRIDES
            .iter()
            .find(|(prefix, _)| ds_name.starts_with(prefix))
            .map(|(_, rule)| *rule)
    });

    match choice {
        Some(TimeBoundsOverride::RecordTimePlusOneDay) => Arc::new(RecordTimePlusOneDay),
        Some(TimeBoundsOverride::Calendar) | None => Arc::new(CalendarWindow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ymd;

    fn dt(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        ymd(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn test_daily_calendar_window() {
        let w = CalendarWindow.window(ymd(2010, 7, 3).unwrap(), None, TimeScale::Daily).unwrap();
        assert_eq!(w.start, dt(2010, 7, 3, 0));
        assert_eq!(w.end, dt(2010, 7, 4, 0));
        assert_eq!(w.center(), dt(2010, 7, 3, 12));
    }

    #[test]
    fn test_monthly_calendar_window() {
        let w = CalendarWindow
            .window(ymd(2010, 12, 16).unwrap(), None, TimeScale::Monthly)
            .unwrap();
        assert_eq!(w.start, dt(2010, 12, 1, 0));
        assert_eq!(w.end, dt(2011, 1, 1, 0));
        // 31 days, so the midpoint is the 16th at noon
        assert_eq!(w.center(), dt(2010, 12, 16, 12));
    }

    #[test]
    fn test_record_time_plus_one_day() {
        let rule = rule_for_dataset("DEBIAS_LOCEAN_arctic", None);
        assert_eq!(rule.name(), "record_time_plus_one_day");
        let w = rule
            .window(ymd(2015, 3, 1).unwrap(), Some(dt(2015, 3, 1, 6)), TimeScale::Daily)
            .unwrap();
        assert_eq!(w.start, dt(2015, 3, 1, 6));
        assert_eq!(w.end, dt(2015, 3, 2, 6));

        // A configured rule takes precedence over the built-in table
        let rule = rule_for_dataset("DEBIAS_LOCEAN_arctic", Some(TimeBoundsOverride::Calendar));
        assert_eq!(rule.name(), "calendar");
        assert_eq!(rule_for_dataset("OTHER", None).name(), "calendar");
    }

    #[test]
    fn test_dates_in_year() {
        assert_eq!(dates_in_year(2010, TimeScale::Daily).unwrap().len(), 365);
        assert_eq!(dates_in_year(2012, TimeScale::Daily).unwrap().len(), 366);
        let months = dates_in_year(2010, TimeScale::Monthly).unwrap();
        assert_eq!(months.len(), 12);
        assert_eq!(months[11], ymd(2010, 12, 1).unwrap());
    }
}
