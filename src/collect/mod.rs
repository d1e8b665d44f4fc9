//! Metric and log collection.

pub mod logs;
pub mod network;
pub mod parse;
pub mod system;

pub use logs::{LogCollector, LogTailer};
pub use network::NetworkCollector;
pub use system::SystemCollector;

use crate::error::Result;
use crate::store::models::MetricSample;

/// A source of metric samples polled on a timer.
pub trait Collector: Send {
    fn collect(&mut self) -> Result<Vec<MetricSample>>;
}

impl Collector for SystemCollector {
    fn collect(&mut self) -> Result<Vec<MetricSample>> {
        Ok(self.sample())
    }
}

impl Collector for NetworkCollector {
    fn collect(&mut self) -> Result<Vec<MetricSample>> {
        Ok(self.sample())
    }
}
