use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole milliseconds since the Unix epoch.
/// All cooldown / TTL / backoff arithmetic in this crate is expressed in
/// this unit so it can be compared directly against persisted timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}
