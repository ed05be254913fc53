//! ## tfc-telemetry::metrics
//! **Prometheus counters for the arbiter**
//!
//! Every arbiter owns its own registry, so several arbiters in one process
//! (one per test, typically) never collide on metric names.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    /// Times every live thread was found blocked with nobody about to wake.
    pub quiescence: IntCounter,
    /// Times the virtual clocks were moved forward.
    pub clock_advances: IntCounter,
    /// Timed waits resolved by a clock advance or an expired deadline.
    pub timeouts_fired: IntCounter,
    /// Clock advances that resumed more than one thread.
    pub simultaneous_resumes: IntCounter,
    pub threads_started: IntCounter,
    /// Size of each clock advance in virtual nanoseconds.
    pub clock_advance_ns: Histogram,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("static counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("fresh registry has no duplicates");
    counter
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();

        let quiescence = counter(
            &registry,
            "tfc_quiescence_total",
            "Full stops where every managed thread was blocked",
        );
        let clock_advances = counter(
            &registry,
            "tfc_clock_advances_total",
            "Virtual clock advances",
        );
        let timeouts_fired = counter(
            &registry,
            "tfc_timeouts_fired_total",
            "Timed waits resolved by timeout",
        );
        let simultaneous_resumes = counter(
            &registry,
            "tfc_simultaneous_resumes_total",
            "Clock advances resuming more than one thread",
        );
        let threads_started = counter(
            &registry,
            "tfc_threads_started_total",
            "Managed threads registered with the arbiter",
        );

        let clock_advance_ns = Histogram::with_opts(
            HistogramOpts::new("tfc_clock_advance_ns", "Size of virtual clock advances").buckets(
                vec![1_000.0, 1_000_000.0, 10_000_000.0, 100_000_000.0, 1_000_000_000.0],
            ),
        )
        .expect("static histogram definition");
        registry
            .register(Box::new(clock_advance_ns.clone()))
            .expect("fresh registry has no duplicates");

        Self {
            registry,
            quiescence,
            clock_advances,
            timeouts_fired,
            simultaneous_resumes,
            threads_started,
            clock_advance_ns,
        }
    }

    /// Renders all metrics in the prometheus text format.
    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn record_advance(&self, delta_ns: u64) {
        self.clock_advances.inc();
        self.clock_advance_ns.observe(delta_ns as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() {
        let a = MetricsRecorder::new();
        let b = MetricsRecorder::new();
        a.quiescence.inc();
        assert_eq!(a.quiescence.get(), 1);
        assert_eq!(b.quiescence.get(), 0);
    }

    #[test]
    fn renders_text_format() {
        let metrics = MetricsRecorder::new();
        metrics.record_advance(100_000_000);
        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("tfc_clock_advances_total 1"));
        assert!(text.contains("tfc_clock_advance_ns_count 1"));
    }
}
