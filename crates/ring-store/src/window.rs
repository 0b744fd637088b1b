//! Fixed-time-window aggregation attached to a ring buffer.

/// Which window query a condition's AST is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowQuery {
    /// Average of the most recently closed window.
    LastAvg,
    /// Minimum of the most recently closed window.
    LastMin,
    /// Maximum of the most recently closed window.
    LastMax,
    /// Average of the window closed before that.
    PrevLastAvg,
    /// Minimum of the window closed before that.
    PrevLastMin,
    /// Maximum of the window closed before that.
    PrevLastMax,
}

/// The accumulated min/max/sum/count for one window period.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSnapshot {
    /// Whether at least one sample was observed in this window.
    pub available: bool,
    /// Sum of observed values, for computing the average.
    pub sum: f64,
    /// Number of observed values.
    pub count: u64,
    /// Minimum observed value.
    pub min: f64,
    /// Maximum observed value.
    pub max: f64,
}

impl WindowSnapshot {
    fn observe(&mut self, value: f64) {
        if !self.available {
            self.available = true;
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    fn avg(&self) -> Option<f64> {
        self.available.then(|| self.sum / self.count as f64)
    }

    fn min(&self) -> Option<f64> {
        self.available.then_some(self.min)
    }

    fn max(&self) -> Option<f64> {
        self.available.then_some(self.max)
    }
}

fn floor_to_period(ts_ms: u64, period_ms: u32) -> u64 {
    let period_ms = u64::from(period_ms);
    ts_ms - (ts_ms % period_ms)
}

/// Tracks the currently-open window's running accumulation plus the final
/// accumulation of the two most recently closed windows (`last`, the most
/// recent; `prev_last`, the one before it), so a condition can query either
/// closed window at any time without ever seeing a partially-filled one.
pub struct WindowAggregator {
    period_ms: u32,
    window_start_ms: Option<u64>,
    accum: WindowSnapshot,
    last: WindowSnapshot,
    prev_last: WindowSnapshot,
}

impl WindowAggregator {
    /// Creates an aggregator for a window of `period_ms` milliseconds.
    pub fn new(period_ms: u32) -> Self {
        Self {
            period_ms,
            window_start_ms: None,
            accum: WindowSnapshot::default(),
            last: WindowSnapshot::default(),
            prev_last: WindowSnapshot::default(),
        }
    }

    /// The configured window period.
    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }

    /// Folds `value`, observed at `ts_ms`, into the currently-open window. If
    /// no window is open yet, one is started floor-aligned to an epoch
    /// multiple of `period_ms`. If `ts_ms` has crossed the open window's end,
    /// the open window is closed (rolling its accumulation into `last`, and
    /// the prior `last` into `prev_last`) and a fresh window starting at the
    /// epoch-aligned boundary `ts_ms` falls into is opened before folding in.
    pub fn observe(&mut self, ts_ms: u64, value: f64) {
        match self.window_start_ms {
            None => self.window_start_ms = Some(floor_to_period(ts_ms, self.period_ms)),
            Some(start) => {
                let period = u64::from(self.period_ms);
                if ts_ms >= start + period {
                    let periods_elapsed = (ts_ms - start) / period;
                    self.roll_to(start + periods_elapsed * period);
                }
            }
        }
        self.accum.observe(value);
    }

    /// Closes the open window if its period has elapsed as of `now_ms`, even
    /// without a new sample arriving. Returns whether a window closed.
    pub fn close_elapsed(&mut self, now_ms: u64) -> bool {
        let Some(start) = self.window_start_ms else {
            return false;
        };
        let period = u64::from(self.period_ms);
        if now_ms < start + period {
            return false;
        }

        let periods_elapsed = (now_ms - start) / period;
        self.roll_to(start + periods_elapsed * period);
        true
    }

    fn roll_to(&mut self, new_start_ms: u64) {
        self.prev_last = self.last;
        self.last = self.accum;
        self.accum = WindowSnapshot::default();
        self.window_start_ms = Some(new_start_ms);
    }

    /// The next time this window will close, if it has started accumulating.
    pub fn next_close_at(&self) -> Option<u64> {
        self.window_start_ms.map(|start| start + u64::from(self.period_ms))
    }

    /// Answers a query against this window. `None` means
    /// `FUNCTION_DATA_NOT_AVAILABLE`: the relevant window never closed with a
    /// sample in it.
    pub fn query(&self, query: WindowQuery) -> Option<f64> {
        match query {
            WindowQuery::LastAvg => self.last.avg(),
            WindowQuery::LastMin => self.last.min(),
            WindowQuery::LastMax => self.last.max(),
            WindowQuery::PrevLastAvg => self.prev_last.avg(),
            WindowQuery::PrevLastMin => self.prev_last.min(),
            WindowQuery::PrevLastMax => self.prev_last.max(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_before_any_sample_is_unavailable() {
        let window = WindowAggregator::new(1_000);
        assert_eq!(window.query(WindowQuery::LastAvg), None);
    }

    #[test]
    fn the_open_window_is_not_queryable_until_it_closes() {
        let mut window = WindowAggregator::new(1_000);
        window.observe(0, 1.0);
        window.observe(100, 3.0);
        assert_eq!(window.query(WindowQuery::LastAvg), None, "window [0,1000) hasn't closed yet");
    }

    #[test]
    fn close_elapsed_rolls_the_open_window_into_last() {
        let mut window = WindowAggregator::new(1_000);
        window.observe(0, 10.0);
        assert!(!window.close_elapsed(500));
        assert!(window.close_elapsed(1_000));

        assert_eq!(window.query(WindowQuery::LastAvg), Some(10.0));
        assert_eq!(window.query(WindowQuery::PrevLastAvg), None, "only one window has closed so far");
    }

    #[test]
    fn prev_last_is_unavailable_before_a_second_close() {
        let window = WindowAggregator::new(1_000);
        assert_eq!(window.query(WindowQuery::PrevLastMax), None);
    }

    #[test]
    fn window_start_floor_aligns_to_the_period_instead_of_the_first_sample() {
        let mut window = WindowAggregator::new(1_000);
        window.observe(700, 1.0);
        assert_eq!(window.next_close_at(), Some(1_000), "window [0,1000) closes at 1000, not 1700");
    }

    #[test]
    fn a_sample_past_the_boundary_closes_the_prior_window_on_observe() {
        // Reproduces the window-aggregate worked example: samples at 100 and
        // 900 belong to window [0,1000), and the sample at 1100 starts
        // window [1000,2000) rather than extending the first one.
        let mut window = WindowAggregator::new(1_000);
        window.observe(100, 5.0);
        window.observe(900, 15.0);
        window.observe(1_100, 20.0);

        assert_eq!(window.query(WindowQuery::LastAvg), Some(10.0), "avg of 5 and 15");

        window.observe(1_500, 30.0);
        assert!(window.close_elapsed(2_001));
        assert_eq!(window.query(WindowQuery::LastAvg), Some(25.0), "avg of 20 and 30");
        assert_eq!(window.query(WindowQuery::PrevLastAvg), Some(10.0));
    }

    #[test]
    fn a_gap_spanning_several_periods_still_closes_cleanly() {
        let mut window = WindowAggregator::new(1_000);
        window.observe(0, 1.0);
        // Nothing observed in [1000,2000) or [2000,3000); the next sample
        // lands three periods later.
        window.observe(3_050, 2.0);

        assert_eq!(window.query(WindowQuery::LastAvg), Some(1.0));
        assert_eq!(window.next_close_at(), Some(4_000));
    }
}
