use chrono::{DateTime, Local, NaiveDate, Utc};

use crate::error::PipelineError;

/// Source of "now" for the request path.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    /// The caller's local calendar date.
    fn today(&self) -> NaiveDate;

    /// Calendar date in UTC, the day boundary upstream providers use.
    fn utc_today(&self) -> NaiveDate {
        self.now_utc().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now
    }

    fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }
}

pub fn resolve_input_date(
    input_date: Option<&str>,
    clock: &dyn Clock,
) -> Result<NaiveDate, PipelineError> {
    match input_date {
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
            PipelineError::InvalidDate {
                value: s.to_string(),
            }
        }),
        None => Ok(clock.today()),
    }
}

/// The day after `date`; the last representable date has none.
pub fn next_day(date: NaiveDate) -> Result<NaiveDate, PipelineError> {
    date.succ_opt().ok_or_else(|| PipelineError::InvalidDate {
        value: date.to_string(),
    })
}
