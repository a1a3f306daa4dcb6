//! Monotonic clocks for pacing and wire latency stamps
//!
//! Pacing runs off `now_ns`. Latency stamps placed on the wire use
//! `stamp_us`, microseconds on the same clock. On unix both read
//! `CLOCK_MONOTONIC`, whose origin is shared by every process on the host,
//! so a stamp written by a provider process can be diffed against a
//! consumer process's clock when both run on one machine. Elsewhere the
//! clock is process-local and stamps are only comparable in-process.

#[cfg(not(unix))]
use std::sync::OnceLock;
#[cfg(not(unix))]
use std::time::Instant;

#[cfg(not(unix))]
static START: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time in nanoseconds
#[cfg(unix)]
#[inline]
pub fn now_ns() -> u64 {
    // clock_gettime on CLOCK_MONOTONIC does not fail for a valid clock id
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .unwrap_or_else(|_| nix::sys::time::TimeSpec::new(0, 0));
    ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
}

/// Current monotonic time in nanoseconds
#[cfg(not(unix))]
#[inline]
pub fn now_ns() -> u64 {
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Current monotonic time in microseconds, the unit carried in wire stamps
#[inline]
pub fn stamp_us() -> i64 {
    (now_ns() / 1_000) as i64
}

/// Length of one pacing tick in nanoseconds
#[inline]
pub fn tick_interval_ns(ticks_per_sec: u64) -> u64 {
    1_000_000_000 / ticks_per_sec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_monotonic() {
        let t1 = now_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = now_ns();

        assert!(t2 > t1, "time should be monotonic");
        assert!(t2 - t1 >= 1_000_000, "should have elapsed at least 1ms");
    }

    #[test]
    fn test_stamp_tracks_now() {
        let ns = now_ns();
        let us = stamp_us();
        let diff = (ns / 1_000) as i64 - us;
        assert!(diff.abs() < 10_000, "stamp and now should share a clock");
    }

    #[test]
    fn test_tick_interval() {
        assert_eq!(tick_interval_ns(1000), 1_000_000);
        assert_eq!(tick_interval_ns(1), 1_000_000_000);
        assert_eq!(tick_interval_ns(10_000), 100_000);
    }
}
