//! 5-field cron expressions: minute, hour, day-of-month, month,
//! day-of-week. Parsing is strict (range-checked, arity-checked);
//! next-run computation walks forward minute by minute in the target
//! timezone, bounded to one year.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Upper bound on the minute walk: one leap year.
const MAX_WALK_MINUTES: i64 = 366 * 24 * 60;

const DOW_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A parsed cron expression. Serializes back to its source text, so
/// parse → serialize → parse is the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
}

impl CronExpr {
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = input.split_whitespace().collect();
        if fields.len() != 5 {
            anyhow::bail!(
                "cron expression needs 5 fields (minute hour day month weekday), got {}",
                fields.len()
            );
        }
        Ok(Self {
            source: fields.join(" "),
            minute: parse_field(fields[0], 0, 59, None)?,
            hour: parse_field(fields[1], 0, 23, None)?,
            dom: parse_field(fields[2], 1, 31, None)?,
            month: parse_field(fields[3], 1, 12, None)?,
            dow: parse_field(fields[4], 0, 6, Some(&DOW_NAMES))?,
        })
    }

    /// True when all five fields match the given local components.
    /// `dow` is days-from-Sunday (0 = Sunday).
    pub fn matches(&self, minute: u32, hour: u32, dom: u32, month: u32, dow: u32) -> bool {
        bit(self.minute, minute)
            && bit(self.hour, hour)
            && bit(self.dom, dom)
            && bit(self.month, month)
            && bit(self.dow, dow)
    }

    /// First instant strictly after `now` matching this expression in
    /// `tz`. Walks UTC minutes and tests the zone-local components, which
    /// absorbs DST transitions without special cases. None if nothing
    /// matches within a year.
    pub fn next_after(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let mut t = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now)
            + ChronoDuration::minutes(1);

        for _ in 0..MAX_WALK_MINUTES {
            let local = t.with_timezone(&tz);
            if self.matches(
                local.minute(),
                local.hour(),
                local.day(),
                local.month(),
                local.weekday().num_days_from_sunday(),
            ) {
                return Some(t);
            }
            t += ChronoDuration::minutes(1);
        }
        None
    }

}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for CronExpr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CronExpr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CronExpr::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1 << value) != 0
}

/// One field: `*`, value, `a,b,c`, `a-b`, `*/n`, `a-b/n`.
/// Weekday also accepts three-letter English names.
fn parse_field(spec: &str, min: u32, max: u32, names: Option<&[&str]>) -> anyhow::Result<u64> {
    let mut mask: u64 = 0;
    for part in spec.split(',') {
        mask |= parse_part(part, min, max, names)?;
    }
    if mask == 0 {
        anyhow::bail!("empty cron field '{}'", spec);
    }
    Ok(mask)
}

fn parse_part(part: &str, min: u32, max: u32, names: Option<&[&str]>) -> anyhow::Result<u64> {
    let (range_spec, step) = match part.split_once('/') {
        Some((r, s)) => {
            let step: u32 = s
                .parse()
                .map_err(|_| anyhow::anyhow!("bad step '{}' in cron field", s))?;
            if step == 0 {
                anyhow::bail!("cron step must be at least 1");
            }
            (r, step)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range_spec == "*" {
        (min, max)
    } else if let Some((a, b)) = range_spec.split_once('-') {
        (
            parse_value(a, min, max, names)?,
            parse_value(b, min, max, names)?,
        )
    } else {
        if part.contains('/') {
            // Steps only apply to `*` or ranges in this grammar.
            anyhow::bail!("step requires '*' or a range, got '{}'", part);
        }
        let v = parse_value(range_spec, min, max, names)?;
        (v, v)
    };

    if lo > hi {
        anyhow::bail!("inverted cron range {}-{}", lo, hi);
    }

    let mut mask: u64 = 0;
    let mut v = lo;
    while v <= hi {
        mask |= 1 << v;
        v += step;
    }
    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32, names: Option<&[&str]>) -> anyhow::Result<u32> {
    if let Some(names) = names {
        if let Some(idx) = names.iter().position(|n| n.eq_ignore_ascii_case(s)) {
            return Ok(idx as u32);
        }
    }
    let v: u32 = s
        .parse()
        .map_err(|_| anyhow::anyhow!("bad cron value '{}'", s))?;
    if v < min || v > max {
        anyhow::bail!("cron value {} outside {}-{}", v, min, max);
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_round_trips() {
        for expr in ["0 9 * * *", "*/5 * * * *", "0 9 * * 1-5", "30 8-17/2 1,15 * mon"] {
            let parsed = CronExpr::parse(expr).unwrap();
            let reparsed = CronExpr::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed);
            assert_eq!(parsed.to_string(), expr);
        }
    }

    #[test]
    fn rejects_out_of_range_minute() {
        assert!(CronExpr::parse("60 0 * * *").is_err());
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("* * * * * *").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(CronExpr::parse("a b c d e").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(CronExpr::parse("0 25 * * *").is_err());
        assert!(CronExpr::parse("0 0 0 * *").is_err());
        assert!(CronExpr::parse("0 0 * 13 *").is_err());
        assert!(CronExpr::parse("0 0 * * 7").is_err());
    }

    #[test]
    fn weekday_names_parse() {
        let named = CronExpr::parse("0 9 * * mon").unwrap();
        let numeric = CronExpr::parse("0 9 * * 1").unwrap();
        assert!(named.matches(0, 9, 1, 1, 1));
        assert!(numeric.matches(0, 9, 1, 1, 1));
        assert!(!named.matches(0, 9, 1, 1, 0));
    }

    #[test]
    fn steps_and_lists() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        for m in [0, 15, 30, 45] {
            assert!(expr.matches(m, 0, 1, 1, 0));
        }
        assert!(!expr.matches(10, 0, 1, 1, 0));

        let expr = CronExpr::parse("0 9,18 * * *").unwrap();
        assert!(expr.matches(0, 9, 1, 1, 0));
        assert!(expr.matches(0, 18, 1, 1, 0));
        assert!(!expr.matches(0, 12, 1, 1, 0));
    }

    #[test]
    fn next_run_daily_seoul() {
        let tz: Tz = "Asia/Seoul".parse().unwrap();
        let expr = CronExpr::parse("0 9 * * *").unwrap();

        // 08:00 KST -> same day 09:00 KST == 00:00 UTC.
        let now = Utc.with_ymd_and_hms(2025, 1, 14, 23, 0, 0).unwrap();
        let next = expr.next_after(now, tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());

        // 10:00 KST -> next day 09:00 KST.
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 1, 0, 0).unwrap();
        let next = expr.next_after(now, tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn next_run_weekdays_skips_weekend() {
        let tz: Tz = "UTC".parse().unwrap();
        let expr = CronExpr::parse("0 9 * * 1-5").unwrap();
        // Friday 2025-01-17 10:00 -> Monday 2025-01-20 09:00.
        let now = Utc.with_ymd_and_hms(2025, 1, 17, 10, 0, 0).unwrap();
        let next = expr.next_after(now, tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 20, 9, 0, 0).unwrap());
    }

    #[test]
    fn next_run_is_strictly_future() {
        let tz: Tz = "UTC".parse().unwrap();
        let expr = CronExpr::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 15, ).unwrap();
        let next = expr.next_after(now, tz).unwrap();
        assert!(next > now);
        assert_eq!(next.minute(), 31);
    }

    #[test]
    fn impossible_date_returns_none() {
        let tz: Tz = "UTC".parse().unwrap();
        // February 30th never exists.
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(expr.next_after(now, tz).is_none());
    }

    #[test]
    fn dst_spring_forward_is_skipped_not_doubled() {
        // US Eastern jumps 02:00 -> 03:00 on 2025-03-09; 02:30 never
        // exists that day, so the job lands on the 10th.
        let tz: Tz = "America/New_York".parse().unwrap();
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 0, 0, 0).unwrap();
        let next = expr.next_after(now, tz).unwrap();
        let local = next.with_timezone(&tz);
        assert_eq!(local.day(), 10);
        assert_eq!(local.hour(), 2);
        assert_eq!(local.minute(), 30);
    }
}
