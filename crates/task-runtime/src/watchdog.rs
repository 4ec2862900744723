use tokio::time::{Duration, Instant};

/// Wall-clock budget for one run, checked only at step boundaries.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudgetWatchdog {
    started_at: Instant,
    budget: Duration,
}

impl TimeBudgetWatchdog {
    pub fn start(budget: Duration) -> Self {
        Self::started_at(Instant::now(), budget)
    }

    pub fn started_at(started_at: Instant, budget: Duration) -> Self {
        Self { started_at, budget }
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// True once strictly more than the budget has elapsed at `now`.
    pub fn check(&self, now: Instant) -> bool {
        self.elapsed_at(now) > self.budget
    }

    pub fn timeout_summary(&self, now: Instant, steps_observed: usize) -> String {
        let millis = u64::try_from(self.elapsed_at(now).as_millis()).unwrap_or(u64::MAX);
        let elapsed = Duration::from_millis(millis);
        format!(
            "task exceeded its time budget of {} (elapsed {}); stopped after {} step(s)",
            humantime::format_duration(self.budget),
            humantime::format_duration(elapsed),
            steps_observed
        )
    }
}
