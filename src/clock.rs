//! A single monotonic nanosecond clock shared by the capture reader and
//! the mix engine so that `os_time` comparisons inside [`crate::audio_channel`]
//! are taken against one consistent origin.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since this process's first call to `now_ns`.
pub fn now_ns() -> u64 {
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}
