//! Network interface counter sampling.
//!
//! Counters are cumulative since boot; rate computation is left to
//! consumers of the aggregates.

use sysinfo::Networks;

use crate::store::models::{MetricSample, MetricSource};

pub struct NetworkCollector {
    networks: Networks,
}

impl NetworkCollector {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }

    /// Sample totals across all interfaces, loopback excluded.
    pub fn sample(&mut self) -> Vec<MetricSample> {
        self.networks.refresh();

        let mut bytes_recv = 0u64;
        let mut bytes_sent = 0u64;
        let mut packets_recv = 0u64;
        let mut packets_sent = 0u64;
        let mut errors_recv = 0u64;
        let mut errors_sent = 0u64;
        for (name, data) in self.networks.iter() {
            if name == "lo" {
                continue;
            }
            bytes_recv += data.total_received();
            bytes_sent += data.total_transmitted();
            packets_recv += data.total_packets_received();
            packets_sent += data.total_packets_transmitted();
            errors_recv += data.total_errors_on_received();
            errors_sent += data.total_errors_on_transmitted();
        }

        let samples = vec![
            MetricSample::now(MetricSource::Network, "bytes_recv_total", bytes_recv as f64),
            MetricSample::now(MetricSource::Network, "bytes_sent_total", bytes_sent as f64),
            MetricSample::now(
                MetricSource::Network,
                "packets_recv_total",
                packets_recv as f64,
            ),
            MetricSample::now(
                MetricSource::Network,
                "packets_sent_total",
                packets_sent as f64,
            ),
            MetricSample::now(
                MetricSource::Network,
                "errors_recv_total",
                errors_recv as f64,
            ),
            MetricSample::now(
                MetricSource::Network,
                "errors_sent_total",
                errors_sent as f64,
            ),
        ];
        let timestamp = samples[0].timestamp;
        samples
            .into_iter()
            .map(|mut s| {
                s.timestamp = timestamp;
                s
            })
            .collect()
    }
}

impl Default for NetworkCollector {
    fn default() -> Self {
        Self::new()
    }
}
