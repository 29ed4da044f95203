use chrono::NaiveDate;

/// 获取当前 UTC 时间戳（毫秒）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Number of calendar days in `[from, to]`, counting both ends.
///
/// Returns a value <= 0 when `from > to`.
pub fn inclusive_days(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days() + 1
}
