//! Millisecond time base and the debounce primitive.

/// Engine time, milliseconds since an arbitrary origin.
pub type Instant = fugit::Instant<u64, 1, 1000>;
/// Millisecond duration.
pub type Duration = fugit::Duration<u64, 1, 1000>;

/// Build an [`Instant`] from milliseconds since the origin.
pub const fn millis(ms: u64) -> Instant {
    Instant::from_ticks(ms)
}

/// Time elapsed from `earlier` to `now`, saturating at zero.
pub fn elapsed_since(now: Instant, earlier: Instant) -> Duration {
    now.checked_duration_since(earlier)
        .unwrap_or(Duration::from_ticks(0))
}

/// Requires a condition to hold continuously for a window before it counts.
///
/// Armed on the first true observation, cleared on any false one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Debounce {
    armed_since: Option<Instant>,
}

impl Debounce {
    pub const fn new() -> Self {
        Self { armed_since: None }
    }

    /// Feed one observation. Returns true once `condition` has been true for at least `window`.
    pub fn update(&mut self, condition: bool, now: Instant, window: Duration) -> bool {
        if !condition {
            self.armed_since = None;
            return false;
        }
        let since = *self.armed_since.get_or_insert(now);
        elapsed_since(now, since) >= window
    }

    pub fn reset(&mut self) {
        self.armed_since = None;
    }

    pub fn armed_since(&self) -> Option<Instant> {
        self.armed_since
    }
}
