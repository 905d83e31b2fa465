//! Update windows
//!
//! `updateWindow` is a comma-separated list of cron expressions. An upgrade
//! may start when any expression fires before the next poll. An empty window
//! always allows upgrades; an entry equal to `never` (any case) forbids them.

use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use thiserror::Error;

/// Keyword disabling upgrades altogether
pub const NEVER: &str = "never";

/// An update window entry could not be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid update window entry {entry:?}: {message}")]
pub struct WindowError {
    /// The offending entry
    pub entry: String,
    /// Parser error
    pub message: String,
}

/// Parsed update window
#[derive(Clone, Debug)]
pub enum UpdateWindow {
    /// No restriction
    Always,
    /// Upgrades are disabled
    Never,
    /// Upgrades may start when any schedule fires before the next poll
    Schedules(Vec<Cron>),
}

impl UpdateWindow {
    /// Parse a comma-separated window specification
    ///
    /// `never` wins over everything, including entries that fail to parse.
    pub fn parse(spec: &str) -> Result<Self, WindowError> {
        let entries: Vec<&str> = spec
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .collect();

        if entries.is_empty() {
            return Ok(Self::Always);
        }
        if entries.iter().any(|e| e.eq_ignore_ascii_case(NEVER)) {
            return Ok(Self::Never);
        }

        entries
            .into_iter()
            .map(|entry| {
                Cron::new(entry)
                    .with_seconds_optional()
                    .parse()
                    .map_err(|e| WindowError {
                        entry: entry.to_string(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::Schedules)
    }

    /// Whether an upgrade may start at `now`, given the next poll happens
    /// `poll_interval` later
    pub fn allowed(&self, now: DateTime<Utc>, poll_interval: Duration) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Schedules(schedules) => {
                let horizon = now + poll_interval;
                schedules.iter().any(|cron| {
                    cron.find_next_occurrence(&now, false)
                        .is_ok_and(|next| next >= now && next < horizon)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap()
    }

    fn five_minutes() -> Duration {
        Duration::minutes(5)
    }

    #[test]
    fn empty_window_always_allows() {
        let window = UpdateWindow::parse("").unwrap();
        assert!(window.allowed(at(3, 0, 0), five_minutes()));

        let window = UpdateWindow::parse(" , ").unwrap();
        assert!(matches!(window, UpdateWindow::Always));
    }

    #[test]
    fn every_minute_fits_in_a_five_minute_poll() {
        let window = UpdateWindow::parse("* * * * *").unwrap();
        assert!(window.allowed(at(10, 10, 10), five_minutes()));
    }

    #[test]
    fn hourly_window_only_near_the_hour() {
        let window = UpdateWindow::parse("0 * * * *").unwrap();
        assert!(!window.allowed(at(10, 10, 10), five_minutes()));
        assert!(window.allowed(at(10, 57, 10), five_minutes()));
    }

    #[test]
    fn never_beats_other_entries_in_any_case() {
        let window = UpdateWindow::parse("* * * * *,Never").unwrap();
        assert!(!window.allowed(at(10, 10, 10), five_minutes()));

        let window = UpdateWindow::parse("NEVER").unwrap();
        assert!(matches!(window, UpdateWindow::Never));
    }

    #[test]
    fn never_hides_unparsable_entries() {
        assert!(matches!(
            UpdateWindow::parse("not a cron, never").unwrap(),
            UpdateWindow::Never
        ));
    }

    #[test]
    fn any_entry_opens_the_window() {
        let window = UpdateWindow::parse("0 3 * * *, 0 * * * *").unwrap();
        assert!(window.allowed(at(10, 58, 0), five_minutes()));
        assert!(!window.allowed(at(10, 30, 0), five_minutes()));
    }

    #[test]
    fn window_is_deterministic() {
        let window = UpdateWindow::parse("30 2 * * *").unwrap();
        let now = at(2, 27, 0);
        assert_eq!(
            window.allowed(now, five_minutes()),
            window.allowed(now, five_minutes())
        );
        assert!(window.allowed(now, five_minutes()));
    }

    #[test]
    fn invalid_entry_names_itself() {
        let err = UpdateWindow::parse("0 * * * *, every tuesday").unwrap_err();
        assert_eq!(err.entry, "every tuesday");
    }
}
