use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as the 32-bit epoch seconds the on-disk format
/// stores.
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

/// Convert an on-disk timestamp back into a `SystemTime` for FUSE replies.
pub fn to_system_time(seconds: u32) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(seconds as u64)
}
