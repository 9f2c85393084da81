use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicI16, Ordering},
    },
};

/// Forwards encode progress as whole percentages, never going backwards and
/// never repeating a value.
#[derive(Clone)]
pub struct ProgressReporter {
    last: Arc<AtomicI16>,
    sink: Arc<dyn Fn(u8) + Send + Sync>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self {
            last: Arc::new(AtomicI16::new(-1)),
            sink: Arc::new(sink),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Reports `done / total`; ignored when `total` is zero.
    pub fn fraction(&self, done: f64, total: f64) {
        if total > 0.0 && done.is_finite() {
            self.percent(done / total * 100.0);
        }
    }

    pub fn percent(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let value = value.clamp(0.0, 100.0).floor() as i16;
        let previous = self.last.fetch_max(value, Ordering::AcqRel);
        if value > previous {
            (self.sink)(value as u8);
        }
    }

    /// Highest percentage reported so far.
    pub fn current(&self) -> Option<u8> {
        u8::try_from(self.last.load(Ordering::Acquire)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn reports_are_monotonic_and_clamped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reporter = {
            let seen = Arc::clone(&seen);
            ProgressReporter::new(move |p| seen.lock().push(p))
        };

        reporter.percent(10.4);
        reporter.percent(10.9);
        reporter.percent(5.0);
        reporter.fraction(1.0, 2.0);
        reporter.percent(250.0);
        reporter.fraction(1.0, 0.0);
        reporter.percent(f64::NAN);

        assert_eq!(*seen.lock(), vec![10, 50, 100]);
        assert_eq!(reporter.current(), Some(100));
        assert_eq!(ProgressReporter::noop().current(), None);
    }
}
