/// Regular US equity session, in UTC: 14:30 to 21:00 (9:30-4:00 ET, ignoring
/// DST — Polygon timestamps the session in UTC and callers that need DST
/// awareness feed a pre-adjusted cutoff via config instead).
const SESSION_START_SECONDS_UTC: u64 = 14 * 3600 + 30 * 60;
const SESSION_END_SECONDS_UTC: u64 = 21 * 3600;
const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Is `ts_ms` (Unix epoch milliseconds) inside the regular trading session?
/// Weekends are not excluded here — a real market-closed day still has no
/// trades to filter, so this check only needs to police the intraday
/// extended-hours boundary the filtered proxy applies.
pub fn is_regular_session(ts_ms: i64) -> bool {
    if ts_ms < 0 {
        return false;
    }
    let seconds_since_epoch = (ts_ms as u64) / 1000;
    let seconds_of_day = seconds_since_epoch % SECONDS_PER_DAY;
    (SESSION_START_SECONDS_UTC..SESSION_END_SECONDS_UTC).contains(&seconds_of_day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms_at(hour: u64, minute: u64) -> i64 {
        // Anchored to an arbitrary epoch day boundary; only time-of-day matters.
        ((hour * 3600 + minute * 60) * 1000) as i64
    }

    #[test]
    fn before_open_is_extended_hours() {
        assert!(!is_regular_session(ms_at(14, 29)));
    }

    #[test]
    fn at_open_is_regular_session() {
        assert!(is_regular_session(ms_at(14, 30)));
    }

    #[test]
    fn just_before_close_is_regular_session() {
        assert!(is_regular_session(ms_at(20, 59)));
    }

    #[test]
    fn at_close_is_extended_hours() {
        assert!(!is_regular_session(ms_at(21, 0)));
    }

    #[test]
    fn midnight_is_extended_hours() {
        assert!(!is_regular_session(ms_at(0, 0)));
    }

    #[test]
    fn negative_timestamp_is_not_regular_session() {
        assert!(!is_regular_session(-1));
    }
}
