//! Monotonic local clock.
//!
//! All local timestamps in the player are microseconds on a single monotonic
//! timeline anchored at first use. Conversions into the server domain go
//! exclusively through [`crate::time_filter::TimeFilter`].

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current local monotonic time in microseconds.
pub fn now_local_us() -> i64 {
    // ---
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as i64
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_local_clock_is_monotonic() {
        // ---
        let a = now_local_us();
        let b = now_local_us();
        assert!(b >= a);
    }
}
