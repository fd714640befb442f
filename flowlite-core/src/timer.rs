//! Timer expression parsing: ISO-8601 durations (`PT5M`), absolute dates
//! (RFC 3339), and repetition cycles (`R3/PT10S`).

use crate::error::EngineError;
use crate::types::TimerKind;
use chrono::{DateTime, Duration, Utc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerSchedule {
    Duration(Duration),
    Date(DateTime<Utc>),
    Cycle {
        /// None = unbounded repetition (callers cap it).
        repeats: Option<u32>,
        interval: Duration,
    },
}

impl TimerSchedule {
    pub fn kind(&self) -> TimerKind {
        match self {
            TimerSchedule::Duration(_) => TimerKind::Duration,
            TimerSchedule::Date(_) => TimerKind::Date,
            TimerSchedule::Cycle { .. } => TimerKind::Cycle,
        }
    }

    /// When the timer first comes due, relative to `now`.
    pub fn first_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimerSchedule::Duration(d) => now + *d,
            TimerSchedule::Date(at) => *at,
            TimerSchedule::Cycle { interval, .. } => now + *interval,
        }
    }
}

pub fn parse_timer_expression(expr: &str) -> Result<TimerSchedule, EngineError> {
    let text = expr.trim();
    if text.is_empty() {
        return Err(bad(expr, "empty timer expression"));
    }

    if let Some(rest) = text.strip_prefix('R') {
        let (count, duration) = rest
            .split_once('/')
            .ok_or_else(|| bad(expr, "cycle must be R[n]/<duration>"))?;
        let repeats = if count.is_empty() {
            None
        } else {
            Some(
                count
                    .parse::<u32>()
                    .map_err(|_| bad(expr, "invalid repetition count"))?,
            )
        };
        let interval = parse_iso_duration(duration, expr)?;
        return Ok(TimerSchedule::Cycle { repeats, interval });
    }

    if text.starts_with('P') {
        return parse_iso_duration(text, expr).map(TimerSchedule::Duration);
    }

    DateTime::parse_from_rfc3339(text)
        .map(|dt| TimerSchedule::Date(dt.with_timezone(&Utc)))
        .map_err(|e| bad(expr, format!("not a duration, cycle, or date: {e}")))
}

fn bad(expr: &str, reason: impl Into<String>) -> EngineError {
    EngineError::ExpressionError {
        expression: expr.to_string(),
        reason: reason.into(),
    }
}

/// `P[nY][nM][nW][nD][T[nH][nM][nS]]`; years and months use the calendar
/// approximations (365 / 30 days). Seconds may be fractional.
fn parse_iso_duration(text: &str, origin: &str) -> Result<Duration, EngineError> {
    let body = text
        .strip_prefix('P')
        .ok_or_else(|| bad(origin, "duration must start with P"))?;
    if body.is_empty() {
        return Err(bad(origin, "empty duration"));
    }

    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (body, None),
    };

    let mut total_ms: i64 = 0;
    let mut scan = |part: &str, in_time: bool| -> Result<(), EngineError> {
        let mut number = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            if number.is_empty() {
                return Err(bad(origin, format!("designator `{c}` without a number")));
            }
            let n: f64 = number
                .parse()
                .map_err(|_| bad(origin, format!("invalid number `{number}`")))?;
            number.clear();
            let ms = match (c, in_time) {
                ('Y', false) => n * 365.0 * 86_400_000.0,
                ('M', false) => n * 30.0 * 86_400_000.0,
                ('W', false) => n * 7.0 * 86_400_000.0,
                ('D', false) => n * 86_400_000.0,
                ('H', true) => n * 3_600_000.0,
                ('M', true) => n * 60_000.0,
                ('S', true) => n * 1_000.0,
                _ => return Err(bad(origin, format!("unexpected designator `{c}`"))),
            };
            total_ms += ms as i64;
        }
        if !number.is_empty() {
            return Err(bad(origin, "trailing number without designator"));
        }
        Ok(())
    };

    scan(date_part, false)?;
    if let Some(t) = time_part {
        if t.is_empty() {
            return Err(bad(origin, "empty time part after T"));
        }
        scan(t, true)?;
    }

    Ok(Duration::milliseconds(total_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_durations() {
        assert_eq!(
            parse_timer_expression("PT1S").unwrap(),
            TimerSchedule::Duration(Duration::seconds(1))
        );
        assert_eq!(
            parse_timer_expression("PT1H30M").unwrap(),
            TimerSchedule::Duration(Duration::minutes(90))
        );
        assert_eq!(
            parse_timer_expression("P1DT2H").unwrap(),
            TimerSchedule::Duration(Duration::hours(26))
        );
        assert_eq!(
            parse_timer_expression("PT0.5S").unwrap(),
            TimerSchedule::Duration(Duration::milliseconds(500))
        );
        assert_eq!(
            parse_timer_expression("P2W").unwrap(),
            TimerSchedule::Duration(Duration::days(14))
        );
    }

    #[test]
    fn month_is_positional() {
        // M before T is months, after T is minutes.
        assert_eq!(
            parse_timer_expression("P1M").unwrap(),
            TimerSchedule::Duration(Duration::days(30))
        );
        assert_eq!(
            parse_timer_expression("PT1M").unwrap(),
            TimerSchedule::Duration(Duration::minutes(1))
        );
    }

    #[test]
    fn cycles() {
        assert_eq!(
            parse_timer_expression("R3/PT10S").unwrap(),
            TimerSchedule::Cycle {
                repeats: Some(3),
                interval: Duration::seconds(10)
            }
        );
        assert_eq!(
            parse_timer_expression("R/PT10S").unwrap(),
            TimerSchedule::Cycle {
                repeats: None,
                interval: Duration::seconds(10)
            }
        );
    }

    #[test]
    fn absolute_dates() {
        let schedule = parse_timer_expression("2030-01-02T03:04:05Z").unwrap();
        match schedule {
            TimerSchedule::Date(at) => {
                assert_eq!(at.to_rfc3339(), "2030-01-02T03:04:05+00:00");
            }
            other => panic!("expected date, got {other:?}"),
        }
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in ["", "PT", "P", "1S", "R3PT10S", "PTxS", "PT1X", "P1"] {
            assert!(
                parse_timer_expression(bad).is_err(),
                "expected `{bad}` to fail"
            );
        }
    }

    #[test]
    fn first_due_is_relative_for_durations_and_absolute_for_dates() {
        let now = Utc::now();
        let d = parse_timer_expression("PT10S").unwrap();
        assert_eq!(d.first_due(now), now + Duration::seconds(10));

        let at = now + Duration::days(1);
        let date = TimerSchedule::Date(at);
        assert_eq!(date.first_due(now), at);
    }
}
