//! Host CPU, memory, and load sampling.

use sysinfo::System;

use crate::store::models::{MetricSample, MetricSource};

pub struct SystemCollector {
    sys: System,
}

impl SystemCollector {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// Take one sample of each system metric, all stamped with one
    /// timestamp so they roll up into the same windows.
    pub fn sample(&mut self) -> Vec<MetricSample> {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let mut samples = Vec::with_capacity(8);
        let mut push = |name: &str, value: f64| {
            samples.push(MetricSample::now(MetricSource::System, name, value));
        };

        push("cpu_percent", self.sys.global_cpu_usage() as f64);
        push("cpu_count", self.sys.cpus().len() as f64);

        let total = self.sys.total_memory();
        let available = self.sys.available_memory();
        push("memory_total_bytes", total as f64);
        push("memory_available_bytes", available as f64);
        if total > 0 {
            let used = total.saturating_sub(available);
            push("memory_percent", used as f64 / total as f64 * 100.0);
        }

        let load = System::load_average();
        push("load_1m", load.one);
        push("load_5m", load.five);
        push("load_15m", load.fifteen);

        let timestamp = samples
            .first()
            .map(|s| s.timestamp)
            .unwrap_or_default();
        for sample in &mut samples {
            sample.timestamp = timestamp;
        }
        samples
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}
