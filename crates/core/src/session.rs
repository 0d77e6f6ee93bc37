use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// The exchange trades on India Standard Time; every wall-clock rule below
/// is evaluated in this zone. IST has no daylight-saving transitions.
pub const EXCHANGE_TZ: Tz = chrono_tz::Asia::Kolkata;

const MARKET_OPEN: (u32, u32) = (9, 15);
const MARKET_CLOSE: (u32, u32) = (15, 30);
const WINDOW_START: (u32, u32) = (9, 0);
const WINDOW_END: (u32, u32) = (15, 31);
const SQUARE_OFF: (u32, u32) = (15, 5);
const ENTRY_CUTOFF: (u32, u32) = (14, 55);

/// Current exchange-local wall-clock time.
#[must_use]
pub fn now_local() -> NaiveDateTime {
    Utc::now().with_timezone(&EXCHANGE_TZ).naive_local()
}

fn at(date: NaiveDate, (hour, minute): (u32, u32)) -> NaiveDateTime {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    date.and_time(time)
}

/// 09:15 on the given session date.
#[must_use]
pub fn market_open(date: NaiveDate) -> NaiveDateTime {
    at(date, MARKET_OPEN)
}

/// 15:30 on the given session date.
#[must_use]
pub fn market_close(date: NaiveDate) -> NaiveDateTime {
    at(date, MARKET_CLOSE)
}

/// Session open as a UTC instant, for range queries against stored ticks.
#[must_use]
pub fn market_open_utc(date: NaiveDate) -> DateTime<Utc> {
    to_utc(market_open(date))
}

/// Interprets an exchange-local wall-clock time as a UTC instant.
#[must_use]
pub fn to_utc(local: NaiveDateTime) -> DateTime<Utc> {
    EXCHANGE_TZ
        .from_local_datetime(&local)
        .earliest()
        .map_or_else(|| Utc.from_utc_datetime(&local), |dt| dt.with_timezone(&Utc))
}

/// The engine only runs inside 09:00..=15:31; outside it the loop exits.
#[must_use]
pub fn in_trading_window(now: NaiveDateTime) -> bool {
    now >= at(now.date(), WINDOW_START) && now <= at(now.date(), WINDOW_END)
}

/// Past 15:05 every position is squared off regardless of lifecycle state.
#[must_use]
pub fn past_square_off(now: NaiveDateTime) -> bool {
    now > at(now.date(), SQUARE_OFF)
}

/// No new entries after 14:55; the tail of the session only manages exits.
#[must_use]
pub fn past_entry_cutoff(now: NaiveDateTime) -> bool {
    now > at(now.date(), ENTRY_CUTOFF)
}

/// Number of complete 5-minute bars between 09:15 and `now` on the same day.
#[must_use]
pub fn elapsed_buckets(now: NaiveDateTime) -> i64 {
    let open = market_open(now.date());
    if now <= open {
        return 0;
    }
    (now - open).num_minutes() / 5
}

/// Start of the 5-minute bar containing `ts`.
#[must_use]
pub fn bucket_start(ts: NaiveDateTime) -> NaiveDateTime {
    use chrono::Timelike;
    at(ts.date(), (ts.hour(), ts.minute() / 5 * 5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn trading_window_bounds() {
        assert!(!in_trading_window(day(8, 59, 59)));
        assert!(in_trading_window(day(9, 0, 0)));
        assert!(in_trading_window(day(12, 30, 0)));
        assert!(in_trading_window(day(15, 31, 0)));
        assert!(!in_trading_window(day(15, 31, 1)));
        assert!(!in_trading_window(day(15, 32, 0)));
    }

    #[test]
    fn square_off_cutoff() {
        assert!(!past_square_off(day(15, 5, 0)));
        assert!(past_square_off(day(15, 5, 1)));
        assert!(past_square_off(day(15, 20, 0)));
        assert!(!past_square_off(day(14, 59, 0)));
    }

    #[test]
    fn entry_cutoff_precedes_square_off() {
        assert!(!past_entry_cutoff(day(14, 55, 0)));
        assert!(past_entry_cutoff(day(14, 55, 1)));
        assert!(past_entry_cutoff(day(15, 0, 0)));
    }

    #[test]
    fn bucket_start_floors_to_the_bar_boundary() {
        assert_eq!(bucket_start(day(10, 7, 42)), day(10, 5, 0));
        assert_eq!(bucket_start(day(10, 5, 0)), day(10, 5, 0));
        assert_eq!(bucket_start(day(9, 59, 59)), day(9, 55, 0));
    }

    #[test]
    fn utc_conversion_subtracts_the_offset() {
        // 09:15 IST is 03:45 UTC.
        let date = NaiveDate::from_ymd_opt(2025, 3, 17).unwrap();
        let open = market_open_utc(date);
        assert_eq!(open.to_rfc3339(), "2025-03-17T03:45:00+00:00");
    }

    #[test]
    fn elapsed_buckets_counts_full_bars_only() {
        assert_eq!(elapsed_buckets(day(9, 15, 0)), 0);
        assert_eq!(elapsed_buckets(day(9, 19, 59)), 0);
        assert_eq!(elapsed_buckets(day(9, 20, 0)), 1);
        assert_eq!(elapsed_buckets(day(10, 0, 0)), 9);
        assert_eq!(elapsed_buckets(day(8, 0, 0)), 0);
    }
}
