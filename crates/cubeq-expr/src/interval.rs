//! Bucket widths for time and duration values

use chrono::{Datelike, NaiveDate};
use serde_json::Value;

const SECOND: i64 = 1_000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// Width of a time bucket: a fixed number of milliseconds, or a number of
/// calendar months
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    Millis(i64),
    Months(u32),
}

impl Interval {
    /// Parse `"day"`, `"2hour"`, `"3 weeks"`, `"quarter"`, or a number of
    /// milliseconds
    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .filter(|ms| *ms > 0)
                .map(Interval::Millis),
            Value::String(text) => Self::parse_str(text),
            _ => None,
        }
    }

    pub fn parse_str(text: &str) -> Option<Self> {
        let text = text.trim();
        let digits = text.chars().take_while(char::is_ascii_digit).count();
        let count: i64 = if digits == 0 {
            1
        } else {
            text[..digits].parse().ok()?
        };
        if count <= 0 {
            return None;
        }
        let unit = text[digits..].trim();
        let unit = match unit {
            "ms" => unit,
            _ => unit.strip_suffix('s').unwrap_or(unit),
        };

        let fixed = match unit {
            "ms" | "milli" | "millisecond" => 1,
            "second" | "sec" => SECOND,
            "minute" | "min" => MINUTE,
            "hour" => HOUR,
            "day" => DAY,
            "week" => WEEK,
            "" if digits > 0 => 1,
            "month" => return u32::try_from(count).ok().map(Interval::Months),
            "quarter" => return u32::try_from(count * 3).ok().map(Interval::Months),
            "year" => return u32::try_from(count * 12).ok().map(Interval::Months),
            _ => return None,
        };
        Some(Interval::Millis(count * fixed))
    }

    /// Start of the bucket containing `millis`
    pub fn floor(self, millis: i64) -> i64 {
        match self {
            Interval::Millis(width) => millis.div_euclid(width) * width,
            Interval::Months(months) => {
                let index = month_index(millis).div_euclid(months as i64) * months as i64;
                month_start(index).unwrap_or(millis)
            }
        }
    }

    /// `millis` moved forward by `steps` buckets
    pub fn step(self, millis: i64, steps: i64) -> i64 {
        match self {
            Interval::Millis(width) => millis + steps * width,
            Interval::Months(months) => {
                month_start(month_index(millis) + steps * months as i64).unwrap_or(millis)
            }
        }
    }

    /// Whole buckets between two bucket starts
    pub fn steps_between(self, from: i64, to: i64) -> i64 {
        match self {
            Interval::Millis(width) => (to - from).div_euclid(width),
            Interval::Months(months) => {
                (month_index(to) - month_index(from)).div_euclid(months as i64)
            }
        }
    }

    /// Approximate width, used only to pick label precision
    pub fn approx_millis(self) -> i64 {
        match self {
            Interval::Millis(width) => width,
            Interval::Months(months) => months as i64 * 30 * DAY,
        }
    }

    /// `"<n> <unit>"` rendering of a duration of `millis`
    pub fn describe(self, millis: i64) -> String {
        match self {
            Interval::Months(_) => {
                let months = millis / (30 * DAY);
                plural(months, "month")
            }
            Interval::Millis(width) => {
                let unit = [(WEEK, "week"), (DAY, "day"), (HOUR, "hour"), (MINUTE, "minute"), (SECOND, "second")]
                    .into_iter()
                    .find(|(size, _)| width % size == 0 && millis % size == 0);
                match unit {
                    Some((size, name)) => plural(millis / size, name),
                    None => plural(millis, "millisecond"),
                }
            }
        }
    }
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

fn month_index(millis: i64) -> i64 {
    match cubeq_ir::from_millis(millis) {
        Some(t) => (t.year() as i64 - 1970) * 12 + t.month0() as i64,
        None => 0,
    }
}

fn month_start(index: i64) -> Option<i64> {
    let year = 1970 + index.div_euclid(12);
    let month = index.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, 1)?
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_units() {
        assert_eq!(Interval::parse(&json!("day")), Some(Interval::Millis(DAY)));
        assert_eq!(Interval::parse(&json!("2hour")), Some(Interval::Millis(2 * HOUR)));
        assert_eq!(Interval::parse(&json!("3 weeks")), Some(Interval::Millis(3 * WEEK)));
        assert_eq!(Interval::parse(&json!("quarter")), Some(Interval::Months(3)));
        assert_eq!(Interval::parse(&json!(500)), Some(Interval::Millis(500)));
        assert_eq!(Interval::parse(&json!("fortnight")), None);
        assert_eq!(Interval::parse(&json!(0)), None);
    }

    #[test]
    fn test_calendar_floor_and_step() {
        let march_15 = cubeq_ir::to_millis(&json!("2024-03-15T10:00:00Z")).unwrap();
        let march_1 = cubeq_ir::to_millis(&json!("2024-03-01")).unwrap();
        let jan_1 = cubeq_ir::to_millis(&json!("2024-01-01")).unwrap();

        assert_eq!(Interval::Months(1).floor(march_15), march_1);
        assert_eq!(Interval::Months(3).floor(march_15), jan_1);
        assert_eq!(Interval::Months(1).step(jan_1, 2), march_1);
        assert_eq!(Interval::Months(1).steps_between(jan_1, march_1), 2);
    }

    #[test]
    fn test_fixed_floor_before_epoch() {
        assert_eq!(Interval::Millis(DAY).floor(-1), -DAY);
        assert_eq!(Interval::Millis(DAY).describe(2 * DAY), "2 days");
        assert_eq!(Interval::Millis(HOUR).describe(HOUR), "1 hour");
    }
}
