use chrono::{DateTime, Duration, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use croner::Cron;

use crate::error::ScheduleError;
use crate::types::ScheduleType;

pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn next_cron(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let invalid = |e: croner::errors::CronError| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    };
    let cron = Cron::new(expr).parse().map_err(invalid)?;
    // Cron expressions are written in the operator's local time.
    let next = cron
        .find_next_occurrence(&after.with_timezone(&Local), false)
        .map_err(invalid)?;
    Ok(next.with_timezone(&Utc))
}

fn interval_ms(value: &str) -> Result<i64, ScheduleError> {
    match value.trim().parse::<i64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(ScheduleError::InvalidInterval(value.to_string())),
    }
}

/// Next run after a completed run. `Once` tasks never run again.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    value: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, ScheduleError> {
    match schedule_type {
        ScheduleType::Cron => next_cron(value, now).map(|dt| Some(to_iso(dt))),
        ScheduleType::Interval => {
            let ms = interval_ms(value)?;
            Ok(Some(to_iso(now + Duration::milliseconds(ms))))
        }
        ScheduleType::Once => Ok(None),
    }
}

/// First run for a newly created task. A `once` value is an RFC 3339
/// timestamp, or a local date-time without offset.
pub fn initial_next_run(
    schedule_type: ScheduleType,
    value: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, ScheduleError> {
    match schedule_type {
        ScheduleType::Once => {
            let value = value.trim();
            if let Some(dt) = parse_iso(value) {
                return Ok(Some(to_iso(dt)));
            }
            let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
                .map_err(|_| ScheduleError::InvalidTimestamp(value.to_string()))?;
            let local = Local
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| ScheduleError::InvalidTimestamp(value.to_string()))?;
            Ok(Some(to_iso(local.with_timezone(&Utc))))
        }
        other => compute_next_run(other, value, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn at(s: &str) -> DateTime<Utc> {
        parse_iso(s).unwrap()
    }

    #[test]
    fn test_interval_next_run() {
        let next = compute_next_run(ScheduleType::Interval, "90000", at("2024-01-01T00:00:00.000Z"))
            .unwrap();
        assert_eq!(next.as_deref(), Some("2024-01-01T00:01:30.000Z"));
    }

    #[test]
    fn test_invalid_interval() {
        assert!(compute_next_run(ScheduleType::Interval, "0", Utc::now()).is_err());
        assert!(compute_next_run(ScheduleType::Interval, "soon", Utc::now()).is_err());
    }

    #[test]
    fn test_once_has_no_next_run() {
        assert_eq!(compute_next_run(ScheduleType::Once, "", Utc::now()).unwrap(), None);
    }

    #[test]
    fn test_cron_next_run_in_local_time() {
        let now = Utc::now();
        let next = compute_next_run(ScheduleType::Cron, "30 9 * * *", now)
            .unwrap()
            .unwrap();
        let next = at(&next);
        assert!(next > now);
        let local = next.with_timezone(&Local);
        assert_eq!((local.hour(), local.minute()), (9, 30));
    }

    #[test]
    fn test_invalid_cron() {
        let err = compute_next_run(ScheduleType::Cron, "not a cron", Utc::now()).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { .. }));
    }

    #[test]
    fn test_initial_once_accepts_rfc3339_and_local() {
        let now = Utc::now();
        assert_eq!(
            initial_next_run(ScheduleType::Once, "2030-05-01T12:00:00Z", now)
                .unwrap()
                .as_deref(),
            Some("2030-05-01T12:00:00.000Z")
        );
        assert!(initial_next_run(ScheduleType::Once, "2030-05-01T12:00:00", now)
            .unwrap()
            .is_some());
        assert!(initial_next_run(ScheduleType::Once, "tomorrow", now).is_err());
    }
}
