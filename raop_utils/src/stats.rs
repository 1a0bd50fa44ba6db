//! Running statistics over a stream of samples, computed in a single pass with Welford's
//! online algorithm. Used only for diagnostics.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
    max: f64,
}

impl OnlineStats {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            n: 0,
            mean: 0.,
            m2: 0.,
            max: 0.,
        }
    }

    #[inline]
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);

        if self.n == 1 || x > self.max {
            self.max = x;
        }
    }

    #[inline(always)]
    pub const fn count(&self) -> u64 {
        self.n
    }

    #[inline(always)]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    #[inline(always)]
    pub const fn max(&self) -> f64 {
        self.max
    }

    /// Sample variance. `None` with fewer than two samples.
    #[inline]
    pub fn variance(&self) -> Option<f64> {
        (self.n > 1).then(|| self.m2 / (self.n - 1) as f64)
    }

    #[inline]
    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
