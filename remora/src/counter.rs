use std::ops::AddAssign;

/// Used for counting the running average of throughput rates.
///
/// This counts the total bytes transferred as well as the current round's
/// tally. At the end of each round the owner calls [`Counter::reset`], which
/// folds the round into a 5 second weighed running average:
///
/// avg = (avg * 4/5) + (this_round / 5)
///
/// This way a temporary deviation in one round does not punish the overall
/// rate disproportionately.
#[derive(Debug, Default)]
pub(crate) struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {
    const WEIGHT: u64 = 5;

    /// Finishes counting this round and updates the moving average. Assumed
    /// to be called once a second.
    pub fn reset(&mut self) {
        self.avg = (self.avg * (Self::WEIGHT - 1) as f64 / Self::WEIGHT as f64)
            + (self.round as f64 / Self::WEIGHT as f64);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    /// Returns the 5 second moving average, rounded to the nearest integer.
    pub fn avg(&self) -> u64 {
        self.avg.round() as u64
    }

    /// Returns the highest average recorded so far.
    #[allow(dead_code)]
    pub fn peak(&self) -> u64 {
        self.peak.round() as u64
    }

    /// Returns the total number recorded.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl AddAssign<u64> for Counter {
    fn add_assign(&mut self, bytes: u64) {
        self.total += bytes;
        self.round += bytes;
    }
}
