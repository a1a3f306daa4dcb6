//! Tick pacing and latency-sample scheduling
//!
//! Rates are expressed per second and spread across a fixed number of ticks.
//! [`RateSchedule`] answers "how many messages does tick `t` send" so that one
//! full cycle of ticks sends exactly the target. [`LatencyRandomArray`] answers
//! "which message of this tick's burst carries a timestamp" so that one full
//! cycle stamps exactly the configured number of messages, at positions chosen
//! once at startup rather than per send.

use crate::config::LatencyRate;
use crate::error::{Error, Result};
use rand::rngs::SmallRng;
use rand::Rng;

/// Number of independent one-second cycles in a latency schedule
pub const LATENCY_ARRAY_CYCLES: usize = 20;

/// Redraw limit when a cycle duplicates an earlier one. Tiny parameter spaces
/// run out of distinct tick sets, so the distinctness check is bounded.
const MAX_SET_REDRAWS: usize = 64;

/// Per-tick burst sizes for a per-second target rate.
///
/// The target decomposes as `per_tick * ticks_per_sec + remainder`; the first
/// `remainder` ticks of each cycle send one extra message, so a full cycle
/// sends exactly the target. A zero target yields a schedule that never sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSchedule {
    per_tick: u64,
    remainder: u64,
    ticks_per_sec: u64,
}

impl RateSchedule {
    pub fn new(target_per_sec: u64, ticks_per_sec: u64) -> Self {
        if target_per_sec == 0 {
            return Self { per_tick: 0, remainder: 0, ticks_per_sec };
        }
        Self {
            per_tick: target_per_sec / ticks_per_sec,
            remainder: target_per_sec % ticks_per_sec,
            ticks_per_sec,
        }
    }

    /// Burst size for the given tick index; indices wrap at `ticks_per_sec`
    pub fn burst_for_tick(&self, tick: u64) -> u64 {
        self.per_tick + u64::from(tick % self.ticks_per_sec < self.remainder)
    }

    pub fn target_per_sec(&self) -> u64 {
        self.per_tick * self.ticks_per_sec + self.remainder
    }

    pub fn is_zero(&self) -> bool {
        self.per_tick == 0 && self.remainder == 0
    }
}

/// Inputs for building a [`LatencyRandomArray`]
#[derive(Debug, Clone, Copy)]
pub struct SamplingOptions {
    pub total_msgs_per_sec: u64,
    pub latency_msgs_per_sec: u64,
    pub ticks_per_sec: u64,
    pub array_count: usize,
}

/// Precomputed schedule of which burst position gets a latency stamp.
///
/// One entry per tick; the entry is the in-burst position to stamp for that
/// tick, or negative for a tick that stamps nothing. A cycle of
/// `ticks_per_sec` entries carries exactly `latency_msgs_per_sec` stamped
/// positions, and the ticks chosen differ from cycle to cycle.
#[derive(Debug, Clone)]
pub struct LatencyRandomArray {
    values: Vec<i32>,
    cursor: usize,
}

impl LatencyRandomArray {
    pub fn build(opts: &SamplingOptions, rng: &mut SmallRng) -> Result<Self> {
        if opts.array_count == 0 {
            return Err(Error::Config("latency schedule needs at least one cycle".to_string()));
        }
        if opts.ticks_per_sec == 0 {
            return Err(Error::Config(
                "latency schedule needs a positive tick rate".to_string(),
            ));
        }
        if opts.latency_msgs_per_sec == 0 {
            return Err(Error::Config(
                "latency rate of zero cannot be scheduled; disable sampling instead".to_string(),
            ));
        }
        if opts.latency_msgs_per_sec > opts.total_msgs_per_sec {
            return Err(Error::Config(format!(
                "latency rate {}/s exceeds message rate {}/s",
                opts.latency_msgs_per_sec, opts.total_msgs_per_sec
            )));
        }
        if opts.latency_msgs_per_sec > opts.ticks_per_sec {
            return Err(Error::Config(format!(
                "latency rate {}/s exceeds tick rate {}; at most one message per tick \
                 can carry a stamp",
                opts.latency_msgs_per_sec, opts.ticks_per_sec
            )));
        }
        if opts.total_msgs_per_sec % opts.ticks_per_sec != 0 {
            return Err(Error::Config(format!(
                "message rate {}/s does not divide evenly into {} ticks; sampled latency \
                 scheduling needs a uniform burst size",
                opts.total_msgs_per_sec, opts.ticks_per_sec
            )));
        }

        let ticks = opts.ticks_per_sec as usize;
        let per_tick = opts.total_msgs_per_sec / opts.ticks_per_sec;
        let per_tick = i32::try_from(per_tick).map_err(|_| {
            Error::Config(format!("per-tick burst of {per_tick} messages is too large"))
        })?;
        let marks = opts.latency_msgs_per_sec as usize;

        let mut values = vec![-1i32; ticks * opts.array_count];
        let mut seen_sets: Vec<Vec<u32>> = Vec::with_capacity(opts.array_count);
        for cycle in 0..opts.array_count {
            let mut set = draw_tick_set(rng, ticks, marks);
            let mut redraws = 0;
            while seen_sets.contains(&set) && redraws < MAX_SET_REDRAWS {
                set = draw_tick_set(rng, ticks, marks);
                redraws += 1;
            }
            let base = cycle * ticks;
            for &tick in &set {
                values[base + tick as usize] = rng.random_range(0..per_tick);
            }
            seen_sets.push(set);
        }

        Ok(Self { values, cursor: 0 })
    }

    /// Consume the entry for the next tick. `Some(p)` stamps the message at
    /// in-burst position `p`; `None` stamps nothing this tick. Wraps at the
    /// end of the last cycle.
    pub fn next(&mut self) -> Option<u64> {
        let value = self.values[self.cursor];
        self.cursor += 1;
        if self.cursor == self.values.len() {
            self.cursor = 0;
        }
        if value < 0 {
            None
        } else {
            Some(value as u64)
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Pick `marks` distinct tick indices by rejection sampling
fn draw_tick_set(rng: &mut SmallRng, ticks: usize, marks: usize) -> Vec<u32> {
    let mut chosen = vec![false; ticks];
    let mut set = Vec::with_capacity(marks);
    while set.len() < marks {
        let tick = rng.random_range(0..ticks);
        if !chosen[tick] {
            chosen[tick] = true;
            set.push(tick as u32);
        }
    }
    set.sort_unstable();
    set
}

/// How a stream decides which messages carry a latency stamp
#[derive(Debug, Clone)]
pub enum LatencyPlan {
    /// No message is stamped
    Off,
    /// Every message is stamped
    EveryMessage,
    /// One message per marked tick, per the precomputed schedule
    Sampled(LatencyRandomArray),
}

impl LatencyPlan {
    pub fn new(
        rate: LatencyRate,
        total_per_sec: u64,
        ticks_per_sec: u64,
        rng: &mut SmallRng,
    ) -> Result<Self> {
        match rate {
            LatencyRate::Off => Ok(LatencyPlan::Off),
            LatencyRate::All => Ok(LatencyPlan::EveryMessage),
            LatencyRate::PerSec(n) => {
                let opts = SamplingOptions {
                    total_msgs_per_sec: total_per_sec,
                    latency_msgs_per_sec: n,
                    ticks_per_sec,
                    array_count: LATENCY_ARRAY_CYCLES,
                };
                Ok(LatencyPlan::Sampled(LatencyRandomArray::build(&opts, rng)?))
            }
        }
    }

    /// Stamping decision for the tick whose burst is about to be sent.
    /// Consumes one schedule entry when sampling is active, so call it exactly
    /// once per burst.
    pub fn burst_mark(&mut self) -> BurstMark {
        match self {
            LatencyPlan::Off => BurstMark::None,
            LatencyPlan::EveryMessage => BurstMark::Every,
            LatencyPlan::Sampled(array) => match array.next() {
                Some(position) => BurstMark::Slot(position),
                None => BurstMark::None,
            },
        }
    }
}

/// Stamping decision for one burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstMark {
    None,
    Every,
    Slot(u64),
}

impl BurstMark {
    pub fn applies_to(&self, position: u64) -> bool {
        match self {
            BurstMark::None => false,
            BurstMark::Every => true,
            BurstMark::Slot(slot) => *slot == position,
        }
    }
}
