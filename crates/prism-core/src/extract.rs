//! Due-date extraction from free text.
//!
//! Recognizes, in priority order:
//!
//! - absolute dates `YYYY/MM/DD` (also `-` and `.` separators),
//! - `M月D日` and `MM/DD` in the current year,
//! - relative words: `明後日` / `day after tomorrow` (+2), `明日` /
//!   `tomorrow` (+1), `今日` / `today` (+0).
//!
//! Invalid calendar dates (e.g. `2025/02/30`) are ignored.

use std::sync::OnceLock;

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;

fn re_full_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})[/.\-](\d{1,2})[/.\-](\d{1,2})").unwrap())
}

fn re_month_day_kanji() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2})月(\d{1,2})日").unwrap())
}

fn re_month_day() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[^\d/.\-])(\d{1,2})[/.\-](\d{1,2})(?:$|[^\d/.\-])").unwrap())
}

fn ymd(year: i32, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month.parse().ok()?, day.parse().ok()?)
}

/// Extract the first recognizable due date from `text`.
///
/// `today` anchors relative words and supplies the year for month/day
/// forms.
pub fn due_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    for caps in re_full_date().captures_iter(text) {
        if let Some(d) = caps[1].parse().ok().and_then(|y| ymd(y, &caps[2], &caps[3])) {
            return Some(d);
        }
    }
    for caps in re_month_day_kanji().captures_iter(text) {
        if let Some(d) = ymd(today.year(), &caps[1], &caps[2]) {
            return Some(d);
        }
    }
    for caps in re_month_day().captures_iter(text) {
        if let Some(d) = ymd(today.year(), &caps[1], &caps[2]) {
            return Some(d);
        }
    }

    let lower = text.to_lowercase();
    if text.contains("明後日") || lower.contains("day after tomorrow") {
        return Some(today + Duration::days(2));
    }
    if text.contains("明日") || lower.contains("tomorrow") {
        return Some(today + Duration::days(1));
    }
    if text.contains("今日") || lower.contains("today") {
        return Some(today);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 19).unwrap()
    }

    #[test]
    fn absolute_dates_with_any_separator() {
        let want = NaiveDate::from_ymd_opt(2025, 11, 3);
        assert_eq!(due_date("提出 2025/11/03 まで", today()), want);
        assert_eq!(due_date("deadline 2025-11-3", today()), want);
        assert_eq!(due_date("2025.11.03", today()), want);
    }

    #[test]
    fn month_day_uses_current_year() {
        assert_eq!(due_date("12/24 party", today()), NaiveDate::from_ymd_opt(2025, 12, 24));
        assert_eq!(due_date("締切は11月5日", today()), NaiveDate::from_ymd_opt(2025, 11, 5));
    }

    #[test]
    fn relative_words() {
        assert_eq!(due_date("明日の会議の準備をする", today()), NaiveDate::from_ymd_opt(2025, 10, 20));
        assert_eq!(due_date("明後日までに返信", today()), NaiveDate::from_ymd_opt(2025, 10, 21));
        assert_eq!(due_date("Call Bob tomorrow", today()), NaiveDate::from_ymd_opt(2025, 10, 20));
    }

    #[test]
    fn invalid_dates_ignored() {
        assert_eq!(due_date("2025/02/30", today()), None);
        assert_eq!(due_date("version 1.2.3 notes", today()), None);
        assert_eq!(due_date("no dates here", today()), None);
    }
}
