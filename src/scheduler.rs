//! Periodic task scheduling.
//!
//! Each concern runs on its own tokio interval. SQLite work happens inside
//! `spawn_blocking` so a slow sweep never stalls the timer loops. A task
//! failure is logged and the next tick tries again; only shutdown stops a
//! loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregate::{AggregationEngine, Resolution};
use crate::collect::{Collector, LogCollector, NetworkCollector, SystemCollector};
use crate::config::LoglyConfig;
use crate::correlate::CorrelationEngine;
use crate::error::Result;
use crate::retention::RetentionManager;
use crate::store::ingest::IngestWriter;
use crate::store::Store;

pub struct Scheduler {
    config: LoglyConfig,
    store: Arc<Store>,
}

impl Scheduler {
    pub fn new(config: LoglyConfig, store: Arc<Store>) -> Self {
        Self { config, store }
    }

    /// Spawn all periodic tasks and run until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let config = &self.config;
        let skew = config.correlation.max_clock_skew_secs;
        let keep_raw = config.database.keep_raw_data_days;

        if config.system.enabled {
            let writer = IngestWriter::new(self.store.clone(), skew, keep_raw);
            handles.push(spawn_periodic(
                "system_metrics",
                Duration::from_secs(config.collection.system_metrics_secs),
                shutdown.clone(),
                SystemCollector::new(),
                move |mut collector| {
                    let outcome = collector
                        .collect()
                        .and_then(|samples| writer.write_metrics(&samples))
                        .map(|_| ());
                    (collector, outcome)
                },
            ));
        }

        if config.network.enabled {
            let writer = IngestWriter::new(self.store.clone(), skew, keep_raw);
            handles.push(spawn_periodic(
                "network_metrics",
                Duration::from_secs(config.collection.network_metrics_secs),
                shutdown.clone(),
                NetworkCollector::new(),
                move |mut collector| {
                    let outcome = collector
                        .collect()
                        .and_then(|samples| writer.write_metrics(&samples))
                        .map(|_| ());
                    (collector, outcome)
                },
            ));
        }

        if config.logs.enabled {
            let sources: Vec<_> = config
                .logs
                .sources
                .iter()
                .filter(|(_, s)| s.enabled)
                .map(|(name, s)| (name.clone(), s.path.clone()))
                .collect();
            let writer = IngestWriter::new(self.store.clone(), skew, keep_raw)
                .with_known_sources(sources.iter().map(|(name, _)| name.clone()));
            let collector = LogCollector::new(self.store.clone(), writer, sources)?;
            handles.push(spawn_periodic(
                "log_parsing",
                Duration::from_secs(config.collection.log_parsing_secs),
                shutdown.clone(),
                collector,
                |mut collector| {
                    let outcome = collector.poll().map(|_| ());
                    (collector, outcome)
                },
            ));
        }

        let correlator =
            CorrelationEngine::new(self.store.clone(), config.correlation.clone());
        handles.push(spawn_periodic(
            "correlation",
            Duration::from_secs(config.correlation.interval_secs),
            shutdown.clone(),
            correlator,
            |mut engine| {
                let outcome = engine.run_cycle().map(|_| ());
                (engine, outcome)
            },
        ));

        if config.aggregation.enabled {
            handles.push(spawn_periodic(
                "hourly_aggregation",
                Duration::from_secs(config.aggregation.hourly_interval_secs),
                shutdown.clone(),
                AggregationEngine::new(self.store.clone()),
                |engine| {
                    let outcome = engine.run(Resolution::Hourly).map(|_| ());
                    (engine, outcome)
                },
            ));
            handles.push(spawn_periodic(
                "daily_aggregation",
                Duration::from_secs(config.aggregation.daily_interval_secs),
                shutdown.clone(),
                AggregationEngine::new(self.store.clone()),
                |engine| {
                    let outcome = engine.run(Resolution::Daily).map(|_| ());
                    (engine, outcome)
                },
            ));
        } else {
            tracing::warn!(
                "aggregation disabled; raw metric rows stay behind the rollup \
                 watermarks and retention will never delete them"
            );
        }

        let retention = RetentionManager::new(
            self.store.clone(),
            &config.database,
            config.retention.batch_size,
        );
        handles.push(spawn_periodic(
            "retention",
            Duration::from_secs(config.retention.interval_secs),
            shutdown.clone(),
            retention,
            |manager| {
                let outcome = manager.sweep().map(|_| ());
                (manager, outcome)
            },
        ));

        tracing::info!(tasks = handles.len(), "scheduler started");
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler task panicked");
            }
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}

/// Run `work` on a blocking thread every `period` until shutdown. The task
/// state threads through each invocation, so the worker keeps collectors
/// and engines across ticks.
fn spawn_periodic<S, F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    state: S,
    work: F,
) -> JoinHandle<()>
where
    S: Send + 'static,
    F: Fn(S) -> (S, Result<()>) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut state = Some(state);
        let work = Arc::new(work);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let current = match state.take() {
                        Some(current) => current,
                        None => break,
                    };
                    let work = work.clone();
                    match tokio::task::spawn_blocking(move || (work.as_ref())(current)).await {
                        Ok((returned, outcome)) => {
                            if let Err(e) = outcome {
                                tracing::error!(task = name, error = %e, "periodic task failed");
                            }
                            state = Some(returned);
                        }
                        Err(e) => {
                            tracing::error!(task = name, error = %e, "periodic task panicked");
                            break;
                        }
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    tracing::debug!(task = name, "task shutting down");
                    break;
                }
            }
        }
    })
}

fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) -> impl Future<Output = ()> + '_ {
    async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}
