//! Natural-language schedules, English and Korean. Each phrase resolves
//! to either a cron expression (recurring) or a concrete future instant
//! (one-shot). Anything without a parseable time is rejected.

use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

/// A recognized schedule phrase.
#[derive(Debug, Clone, PartialEq)]
pub enum NaturalSchedule {
    Cron(String),
    At(DateTime<Utc>),
}

macro_rules! re {
    ($name:ident, $pattern:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| Regex::new($pattern).expect("regex"));
    };
}

// English
re!(EN_DAILY, r"(?i)^(?:every\s+day|daily)\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$");
re!(EN_WEEKDAYS, r"(?i)^weekdays?\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$");
re!(EN_WEEKENDS, r"(?i)^weekends?\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$");
re!(
    EN_WEEKLY,
    r"(?i)^(?:every\s+week\s+on|weekly\s+on|every)\s+(sunday|monday|tuesday|wednesday|thursday|friday|saturday|sun|mon|tue|wed|thu|fri|sat)\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$"
);
re!(
    EN_MONTHLY,
    r"(?i)^every\s+month\s+on\s+the\s+(\d{1,2})(?:st|nd|rd|th)?\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$"
);
re!(EN_EVERY_MIN, r"(?i)^every\s+(\d+)\s*(?:m|min|mins|minutes?)$");
re!(EN_EVERY_HOUR, r"(?i)^every\s+(\d+)\s*(?:h|hr|hrs|hours?)$");
re!(EN_TOMORROW, r"(?i)^tomorrow\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$");
re!(EN_TODAY, r"(?i)^today\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$");
re!(EN_IN, r"(?i)^in\s+(\d+)\s*(m|min|mins|minutes?|h|hr|hrs|hours?)$");
re!(EN_ABSOLUTE, r"^(\d{4})-(\d{2})-(\d{2})\s+(\d{1,2}):(\d{2})$");

// Korean. Weekday tokens are matched as a single day character directly
// before 요일, which is the longest-match reading: 월요일 can never be
// shadowed by the 일 in 일요일.
re!(KO_TIME, r"(오전|오후)?\s*(\d{1,2})시(?:\s*(\d{1,2})분)?");
re!(KO_DAILY, r"^매일\s+(.+)$");
re!(KO_WEEKDAYS, r"^평일\s+(.+)$");
re!(KO_WEEKENDS, r"^주말\s+(.+)$");
re!(KO_WEEKLY, r"^매주\s+([월화수목금토일])요일\s+(.+)$");
re!(KO_MONTHLY, r"^매월\s+(\d{1,2})일\s+(.+)$");
re!(KO_EVERY_MIN, r"^(\d+)분마다$");
re!(KO_EVERY_HOUR, r"^(\d+)시간마다$");
re!(KO_TOMORROW, r"^내일\s+(.+)$");
re!(KO_TODAY, r"^오늘\s+(.+)$");
re!(KO_IN, r"^(\d+)(분|시간)\s*후$");

/// Parse a schedule phrase relative to `now` in `tz`.
pub fn parse_natural(input: &str, now: DateTime<Utc>, tz: Tz) -> anyhow::Result<NaturalSchedule> {
    let input = input.trim();

    if let Some(schedule) = try_english(input, now, tz)? {
        return Ok(schedule);
    }
    if let Some(schedule) = try_korean(input, now, tz)? {
        return Ok(schedule);
    }
    // Raw cron expressions pass straight through.
    if super::cron::CronExpr::parse(input).is_ok() {
        return Ok(NaturalSchedule::Cron(input.to_string()));
    }

    anyhow::bail!("schedule not recognized: '{}'", input)
}

fn try_english(
    input: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> anyhow::Result<Option<NaturalSchedule>> {
    if let Some(caps) = EN_DAILY.captures(input) {
        let (h, m) = time_from_en(&caps, 1)?;
        return Ok(Some(NaturalSchedule::Cron(format!("{} {} * * *", m, h))));
    }
    if let Some(caps) = EN_WEEKDAYS.captures(input) {
        let (h, m) = time_from_en(&caps, 1)?;
        return Ok(Some(NaturalSchedule::Cron(format!("{} {} * * 1-5", m, h))));
    }
    if let Some(caps) = EN_WEEKENDS.captures(input) {
        let (h, m) = time_from_en(&caps, 1)?;
        return Ok(Some(NaturalSchedule::Cron(format!("{} {} * * 0,6", m, h))));
    }
    if let Some(caps) = EN_WEEKLY.captures(input) {
        let dow = english_dow(&caps[1]);
        let (h, m) = time_from_en(&caps, 2)?;
        return Ok(Some(NaturalSchedule::Cron(format!(
            "{} {} * * {}",
            m, h, dow
        ))));
    }
    if let Some(caps) = EN_MONTHLY.captures(input) {
        let day: u32 = caps[1].parse()?;
        if !(1..=31).contains(&day) {
            anyhow::bail!("day of month {} outside 1-31", day);
        }
        let (h, m) = time_from_en(&caps, 2)?;
        return Ok(Some(NaturalSchedule::Cron(format!(
            "{} {} {} * *",
            m, h, day
        ))));
    }
    if let Some(caps) = EN_EVERY_MIN.captures(input) {
        let n: u32 = caps[1].parse()?;
        if n == 0 || n > 59 {
            anyhow::bail!("minute interval must be 1-59");
        }
        return Ok(Some(NaturalSchedule::Cron(format!("*/{} * * * *", n))));
    }
    if let Some(caps) = EN_EVERY_HOUR.captures(input) {
        let n: u32 = caps[1].parse()?;
        if n == 0 || n > 23 {
            anyhow::bail!("hour interval must be 1-23");
        }
        return Ok(Some(NaturalSchedule::Cron(format!("0 */{} * * *", n))));
    }
    if let Some(caps) = EN_TOMORROW.captures(input) {
        let (h, m) = time_from_en(&caps, 1)?;
        let date = now.with_timezone(&tz).date_naive() + ChronoDuration::days(1);
        return Ok(Some(NaturalSchedule::At(local_instant(date, h, m, tz)?)));
    }
    if let Some(caps) = EN_TODAY.captures(input) {
        let (h, m) = time_from_en(&caps, 1)?;
        let date = now.with_timezone(&tz).date_naive();
        let at = local_instant(date, h, m, tz)?;
        if at <= now {
            anyhow::bail!("that time today has already passed");
        }
        return Ok(Some(NaturalSchedule::At(at)));
    }
    if let Some(caps) = EN_IN.captures(input) {
        let n: i64 = caps[1].parse()?;
        let unit = caps[2].to_lowercase();
        let delta = if unit.starts_with('h') {
            ChronoDuration::hours(n)
        } else {
            ChronoDuration::minutes(n)
        };
        return Ok(Some(NaturalSchedule::At(now + delta)));
    }
    if let Some(caps) = EN_ABSOLUTE.captures(input) {
        let date = NaiveDate::from_ymd_opt(caps[1].parse()?, caps[2].parse()?, caps[3].parse()?)
            .ok_or_else(|| anyhow::anyhow!("invalid date"))?;
        let h: u32 = caps[4].parse()?;
        let m: u32 = caps[5].parse()?;
        check_time(h, m)?;
        let at = local_instant(date, h, m, tz)?;
        if at <= now {
            anyhow::bail!("'{}' is in the past", input);
        }
        return Ok(Some(NaturalSchedule::At(at)));
    }
    Ok(None)
}

fn try_korean(input: &str, now: DateTime<Utc>, tz: Tz) -> anyhow::Result<Option<NaturalSchedule>> {
    if let Some(caps) = KO_DAILY.captures(input) {
        let (h, m) = time_from_ko(&caps[1])?;
        return Ok(Some(NaturalSchedule::Cron(format!("{} {} * * *", m, h))));
    }
    if let Some(caps) = KO_WEEKDAYS.captures(input) {
        let (h, m) = time_from_ko(&caps[1])?;
        return Ok(Some(NaturalSchedule::Cron(format!("{} {} * * 1-5", m, h))));
    }
    if let Some(caps) = KO_WEEKENDS.captures(input) {
        let (h, m) = time_from_ko(&caps[1])?;
        return Ok(Some(NaturalSchedule::Cron(format!("{} {} * * 0,6", m, h))));
    }
    if let Some(caps) = KO_WEEKLY.captures(input) {
        let dow = korean_dow(&caps[1])?;
        let (h, m) = time_from_ko(&caps[2])?;
        return Ok(Some(NaturalSchedule::Cron(format!(
            "{} {} * * {}",
            m, h, dow
        ))));
    }
    if let Some(caps) = KO_MONTHLY.captures(input) {
        let day: u32 = caps[1].parse()?;
        if !(1..=31).contains(&day) {
            anyhow::bail!("day of month {} outside 1-31", day);
        }
        let (h, m) = time_from_ko(&caps[2])?;
        return Ok(Some(NaturalSchedule::Cron(format!(
            "{} {} {} * *",
            m, h, day
        ))));
    }
    if let Some(caps) = KO_EVERY_MIN.captures(input) {
        let n: u32 = caps[1].parse()?;
        if n == 0 || n > 59 {
            anyhow::bail!("minute interval must be 1-59");
        }
        return Ok(Some(NaturalSchedule::Cron(format!("*/{} * * * *", n))));
    }
    if let Some(caps) = KO_EVERY_HOUR.captures(input) {
        let n: u32 = caps[1].parse()?;
        if n == 0 || n > 23 {
            anyhow::bail!("hour interval must be 1-23");
        }
        return Ok(Some(NaturalSchedule::Cron(format!("0 */{} * * *", n))));
    }
    if let Some(caps) = KO_TOMORROW.captures(input) {
        let (h, m) = time_from_ko(&caps[1])?;
        let date = now.with_timezone(&tz).date_naive() + ChronoDuration::days(1);
        return Ok(Some(NaturalSchedule::At(local_instant(date, h, m, tz)?)));
    }
    if let Some(caps) = KO_TODAY.captures(input) {
        let (h, m) = time_from_ko(&caps[1])?;
        let date = now.with_timezone(&tz).date_naive();
        let at = local_instant(date, h, m, tz)?;
        if at <= now {
            anyhow::bail!("that time today has already passed");
        }
        return Ok(Some(NaturalSchedule::At(at)));
    }
    if let Some(caps) = KO_IN.captures(input) {
        let n: i64 = caps[1].parse()?;
        let delta = if &caps[2] == "시간" {
            ChronoDuration::hours(n)
        } else {
            ChronoDuration::minutes(n)
        };
        return Ok(Some(NaturalSchedule::At(now + delta)));
    }
    Ok(None)
}

/// Hour/minute from English captures starting at `base` (hour, minute,
/// am/pm).
fn time_from_en(caps: &regex::Captures, base: usize) -> anyhow::Result<(u32, u32)> {
    let mut hour: u32 = caps[base].parse()?;
    let minute: u32 = caps
        .get(base + 1)
        .map_or(Ok(0), |m| m.as_str().parse())?;
    if let Some(ampm) = caps.get(base + 2) {
        let ampm = ampm.as_str().to_lowercase();
        if ampm == "pm" && hour < 12 {
            hour += 12;
        } else if ampm == "am" && hour == 12 {
            hour = 0;
        }
    }
    check_time(hour, minute)?;
    Ok((hour, minute))
}

/// Hour/minute from a Korean time tail like "오후 3시 30분".
fn time_from_ko(tail: &str) -> anyhow::Result<(u32, u32)> {
    let caps = KO_TIME
        .captures(tail.trim())
        .ok_or_else(|| anyhow::anyhow!("no time found in '{}'", tail))?;
    let mut hour: u32 = caps[2].parse()?;
    let minute: u32 = caps.get(3).map_or(Ok(0), |m| m.as_str().parse())?;
    match caps.get(1).map(|m| m.as_str()) {
        Some("오후") if hour < 12 => hour += 12,
        Some("오전") if hour == 12 => hour = 0,
        _ => {}
    }
    check_time(hour, minute)?;
    Ok((hour, minute))
}

fn check_time(hour: u32, minute: u32) -> anyhow::Result<()> {
    if hour > 23 {
        anyhow::bail!("hour {} outside 0-23", hour);
    }
    if minute > 59 {
        anyhow::bail!("minute {} outside 0-59", minute);
    }
    Ok(())
}

fn english_dow(name: &str) -> u32 {
    match name.to_lowercase().get(..3) {
        Some("sun") => 0,
        Some("mon") => 1,
        Some("tue") => 2,
        Some("wed") => 3,
        Some("thu") => 4,
        Some("fri") => 5,
        _ => 6,
    }
}

fn korean_dow(token: &str) -> anyhow::Result<u32> {
    Ok(match token {
        "일" => 0,
        "월" => 1,
        "화" => 2,
        "수" => 3,
        "목" => 4,
        "금" => 5,
        "토" => 6,
        other => anyhow::bail!("unknown weekday '{}'", other),
    })
}

/// UTC instant for a local wall-clock moment. Ambiguous times (DST fall
/// back) take the earlier reading; nonexistent times (spring forward)
/// shift to the next valid instant.
fn local_instant(date: NaiveDate, hour: u32, minute: u32, tz: Tz) -> anyhow::Result<DateTime<Utc>> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid time {}:{:02}", hour, minute))?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(early, _late) => Ok(early.with_timezone(&Utc)),
        LocalResult::None => {
            // Walk forward until the wall clock exists again.
            let mut probe = naive;
            for _ in 0..180 {
                probe += ChronoDuration::minutes(1);
                if let LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
            anyhow::bail!("no valid instant near {} in {}", naive, tz)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    fn utc_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 3, 0, 0).unwrap()
    }

    fn seoul() -> Tz {
        "Asia/Seoul".parse().unwrap()
    }

    fn cron(input: &str) -> String {
        match parse_natural(input, utc_now(), seoul()).unwrap() {
            NaturalSchedule::Cron(c) => c,
            other => panic!("expected cron, got {:?}", other),
        }
    }

    fn at(input: &str) -> DateTime<Utc> {
        match parse_natural(input, utc_now(), seoul()).unwrap() {
            NaturalSchedule::At(t) => t,
            other => panic!("expected instant, got {:?}", other),
        }
    }

    #[test]
    fn english_recurring_phrases() {
        assert_eq!(cron("every day at 9am"), "0 9 * * *");
        assert_eq!(cron("daily at 14:30"), "30 14 * * *");
        assert_eq!(cron("weekdays at 8:30"), "30 8 * * 1-5");
        assert_eq!(cron("weekends at 10am"), "0 10 * * 0,6");
        assert_eq!(cron("every week on monday at 9am"), "0 9 * * 1");
        assert_eq!(cron("every month on the 15th at 9am"), "0 9 15 * *");
        assert_eq!(cron("every 5 minutes"), "*/5 * * * *");
        assert_eq!(cron("every 2 hours"), "0 */2 * * *");
    }

    #[test]
    fn korean_recurring_phrases() {
        assert_eq!(cron("매일 오후 3시"), "0 15 * * *");
        assert_eq!(cron("평일 오후 6시"), "0 18 * * 1-5");
        assert_eq!(cron("주말 오전 10시"), "0 10 * * 0,6");
        assert_eq!(cron("매주 월요일 오전 9시"), "0 9 * * 1");
        assert_eq!(cron("매주 일요일 오전 9시"), "0 9 * * 0");
        assert_eq!(cron("매월 1일 오전 9시"), "0 9 1 * *");
        assert_eq!(cron("10분마다"), "*/10 * * * *");
        assert_eq!(cron("3시간마다"), "0 */3 * * *");
        assert_eq!(cron("매일 오후 3시 30분"), "30 15 * * *");
    }

    #[test]
    fn phrases_without_time_are_rejected() {
        assert!(parse_natural("매일", utc_now(), seoul()).is_err());
        assert!(parse_natural("sometime soon", utc_now(), seoul()).is_err());
        assert!(parse_natural("every day", utc_now(), seoul()).is_err());
    }

    #[test]
    fn one_shot_phrases_resolve_to_instants() {
        // now = 2025-01-15 12:00 KST
        let t = at("in 30 minutes");
        assert_eq!(t, utc_now() + ChronoDuration::minutes(30));

        let t = at("오늘 오후 11시");
        let local = t.with_timezone(&seoul());
        assert_eq!((local.hour(), local.minute()), (23, 0));

        let t = at("tomorrow at 9am");
        let local = t.with_timezone(&seoul());
        assert_eq!(local.date_naive().day(), 16);
        assert_eq!(local.hour(), 9);

        let t = at("2025-06-01 08:00");
        let local = t.with_timezone(&seoul());
        assert_eq!((local.month(), local.day(), local.hour()), (6, 1, 8));

        let t = at("1시간 후");
        assert_eq!(t, utc_now() + ChronoDuration::hours(1));
    }

    #[test]
    fn past_today_times_are_rejected() {
        // 09:00 KST has passed by 12:00 KST.
        assert!(parse_natural("today at 9am", utc_now(), seoul()).is_err());
        assert!(parse_natural("오늘 오전 9시", utc_now(), seoul()).is_err());
    }

    #[test]
    fn raw_cron_passes_through() {
        assert_eq!(cron("0 9 * * 1-5"), "0 9 * * 1-5");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(parse_natural("daily at 25:00", utc_now(), seoul()).is_err());
        assert!(parse_natural("every 0 minutes", utc_now(), seoul()).is_err());
        assert!(parse_natural("every 99 hours", utc_now(), seoul()).is_err());
    }
}
