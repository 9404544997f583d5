//! The scaling policy: a pure function from input/output load to a scale direction and
//! magnitude. No I/O, no state — the Supervisor samples load and calls [`decide`] once per tick.

/// Backlog tier boundaries. `Load` is `queue_depth as f64 / max_queue_client_count as f64`.
const MEDIUM_THRESHOLD: f64 = 0.40;
const HIGH_THRESHOLD: f64 = 0.75;
const CRITICAL_THRESHOLD: f64 = 1.00;

/// A coarse bucket for a load ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// `load < 0.40`
    Low,
    /// `0.40 <= load < 0.75`
    Medium,
    /// `0.75 <= load < 1.00`
    High,
    /// `load >= 1.00`
    Critical,
}

impl Tier {
    /// Buckets a load ratio into a [`Tier`].
    pub fn of(load: f64) -> Self {
        if load >= CRITICAL_THRESHOLD {
            Tier::Critical
        } else if load >= HIGH_THRESHOLD {
            Tier::High
        } else if load >= MEDIUM_THRESHOLD {
            Tier::Medium
        } else {
            Tier::Low
        }
    }

    fn index(self) -> i32 {
        match self {
            Tier::Low => 0,
            Tier::Medium => 1,
            Tier::High => 2,
            Tier::Critical => 3,
        }
    }
}

/// Which way the pool should move, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Grow the pool.
    Up,
    /// Shrink the pool.
    Down,
    /// Leave the pool as-is.
    Hold,
}

/// A scaling decision for the current tick: a direction and a magnitude (workers to add or
/// remove). `magnitude` is always `0` when `direction` is [`Direction::Hold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Which way to move the pool.
    pub direction: Direction,
    /// How many workers to add or remove this tick.
    pub magnitude: u32,
}

impl Decision {
    const HOLD: Decision = Decision {
        direction: Direction::Hold,
        magnitude: 0,
    };
}

/// Decides how to move the worker pool given the current input and output queue load ratios.
///
/// `gap = tier(input) - tier(output)`. When `gap == 0` the pool holds. Otherwise
/// `magnitude = 2 * |gap| - 1` and direction is `Up` when the input tier outranks the output
/// tier, `Down` otherwise. This replaces a magnitude formula that operated on decimal-string
/// digit counts with one that operates purely on the tier-index distance, so the same gap always
/// produces the same decision regardless of where within a tier the raw loads fall.
pub fn decide(input_load: f64, output_load: f64) -> Decision {
    let gap = Tier::of(input_load).index() - Tier::of(output_load).index();
    if gap == 0 {
        return Decision::HOLD;
    }
    let direction = if gap > 0 { Direction::Up } else { Direction::Down };
    let magnitude = (2 * gap.abs() - 1) as u32;
    Decision { direction, magnitude }
}
