//! Cron resolution and next-run computation.
//!
//! Expressions use the seconds-first format understood by both the `cron`
//! crate and `tokio-cron-scheduler`: `sec min hour day-of-month month
//! day-of-week [year]`. The expression plus the schedule's IANA timezone are
//! the only inputs to `next_run_at`, so the result is deterministic.
//!
//! Note that the `cron` crate numbers weekdays 1-7 starting at Sunday. Names
//! (`Mon`, `Tue`...) avoid the ambiguity and are what the presets use.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use super::models::ScheduleKind;
use crate::common::{EngineError, EngineResult};

pub fn parse_timezone(name: &str) -> EngineResult<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EngineError::validation(format!("unknown timezone: {name}")))
}

fn parse_schedule(expr: &str) -> EngineResult<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| EngineError::validation(format!("invalid cron expression {expr:?}: {e}")))
}

/// Normalize a user expression to the six/seven-field form and check that it parses.
/// Five-field (classic crontab) input gets a `0` seconds field.
pub fn normalize(expr: &str) -> EngineResult<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 | 7 => fields.join(" "),
        n => {
            return Err(EngineError::validation(format!(
                "cron expression must have 5, 6 or 7 fields, got {n}"
            )))
        }
    };
    parse_schedule(&normalized)?;
    Ok(normalized)
}

/// A seven-field expression matching exactly one instant: `run_at` as seen
/// on the wall clock of `tz`.
pub fn once_expression(run_at: DateTime<Utc>, tz: Tz) -> String {
    let local = run_at.with_timezone(&tz);
    format!(
        "{} {} {} {} {} * {}",
        local.format("%-S"),
        local.format("%-M"),
        local.format("%-H"),
        local.format("%-d"),
        local.format("%-m"),
        local.format("%Y"),
    )
}

/// Resolve a kind to a concrete expression.
pub fn resolve_cron(
    kind: ScheduleKind,
    custom: Option<&str>,
    run_at: Option<DateTime<Utc>>,
    tz: Tz,
) -> EngineResult<String> {
    match kind {
        ScheduleKind::Once => {
            let run_at = run_at
                .ok_or_else(|| EngineError::validation("ONCE schedules require run_at"))?;
            Ok(once_expression(run_at, tz))
        }
        ScheduleKind::Custom => {
            let expr = custom
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| EngineError::validation("CUSTOM schedules require cron_expression"))?;
            normalize(expr)
        }
        preset => preset
            .preset_cron()
            .map(str::to_string)
            .ok_or_else(|| EngineError::validation(format!("no preset for {preset:?}"))),
    }
}

/// First occurrence strictly after `after`, in UTC.
pub fn next_run_after(
    expr: &str,
    tz: Tz,
    after: DateTime<Utc>,
) -> EngineResult<Option<DateTime<Utc>>> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn presets_resolve_without_input() {
        let expr = resolve_cron(ScheduleKind::Every15Minutes, None, None, Tz::UTC).unwrap();
        assert_eq!(expr, "0 */15 * * * *");
    }

    #[test]
    fn five_field_input_gets_seconds() {
        assert_eq!(normalize("*/10 * * * *").unwrap(), "0 */10 * * * *");
        assert_eq!(normalize("  0 30 8 * * Mon-Fri ").unwrap(), "0 30 8 * * Mon-Fri");
    }

    #[test]
    fn bad_expressions_are_validation_errors() {
        assert!(matches!(normalize("* *"), Err(EngineError::Validation(_))));
        assert!(matches!(
            normalize("0 99 * * * *"),
            Err(EngineError::Validation(_))
        ));
        assert!(resolve_cron(ScheduleKind::Custom, Some("  "), None, Tz::UTC).is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert_eq!(parse_timezone("America/Chicago").unwrap(), Tz::America__Chicago);
    }

    #[test]
    fn every_five_minutes_lands_on_boundaries() {
        let next = next_run_after("0 */5 * * * *", Tz::UTC, utc(2030, 1, 1, 10, 3, 12))
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2030, 1, 1, 10, 5, 0));
    }

    #[test]
    fn daily_respects_timezone() {
        // 09:00 in Berlin during winter is 08:00 UTC.
        let tz = parse_timezone("Europe/Berlin").unwrap();
        let next = next_run_after("0 0 9 * * *", tz, utc(2030, 1, 15, 12, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2030, 1, 16, 8, 0, 0));
    }

    #[test]
    fn weekly_runs_on_monday() {
        let next = next_run_after("0 0 9 * * Mon", Tz::UTC, utc(2030, 1, 1, 0, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn next_run_is_deterministic() {
        let tz = parse_timezone("Asia/Tokyo").unwrap();
        let at = utc(2030, 6, 1, 0, 0, 0);
        let a = next_run_after("0 0 * * * *", tz, at).unwrap();
        let b = next_run_after("0 0 * * * *", tz, at).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn once_fires_exactly_once() {
        let tz = parse_timezone("America/New_York").unwrap();
        let run_at = utc(2031, 3, 4, 15, 30, 0);
        let expr = resolve_cron(ScheduleKind::Once, None, Some(run_at), tz).unwrap();
        assert_eq!(expr, "0 30 10 4 3 * 2031");

        let first = next_run_after(&expr, tz, run_at - chrono::Duration::days(1))
            .unwrap()
            .unwrap();
        assert_eq!(first, run_at);
        assert_eq!(next_run_after(&expr, tz, run_at).unwrap(), None);
    }

    #[test]
    fn once_requires_run_at() {
        assert!(resolve_cron(ScheduleKind::Once, None, None, Tz::UTC).is_err());
    }
}
