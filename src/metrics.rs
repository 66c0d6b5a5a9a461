//! Prometheus metrics for EC object I/O
//!
//! Counters live in a private registry so several objects or test cases
//! never collide on the process-global one.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Counters of one EC I/O context
#[derive(Clone)]
pub struct EcMetrics {
    registry: Registry,
    /// Requests by operation (`update`, `fetch`)
    pub requests: IntCounterVec,
    /// Fetches that needed recovery or redirection
    pub degraded_fetches: IntCounter,
    /// Recovery tasks decoded
    pub recovery_tasks: IntCounter,
    /// Fetches re-issued after a concurrent write was detected
    pub fetch_again: IntCounter,
    /// Requests failed with data loss
    pub data_loss: IntCounter,
    /// Shard operations by outcome (`ok`, `error`, `timeout`)
    pub shard_ops: IntCounterVec,
}

impl EcMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("ecobj_requests_total", "EC object requests by operation"),
            &["op"],
        )
        .map_err(metric_err)?;
        let degraded_fetches = IntCounter::new(
            "ecobj_degraded_fetches_total",
            "Fetches served with recovery or redirection",
        )
        .map_err(metric_err)?;
        let recovery_tasks = IntCounter::new(
            "ecobj_recovery_tasks_total",
            "Recovery tasks decoded",
        )
        .map_err(metric_err)?;
        let fetch_again = IntCounter::new(
            "ecobj_fetch_again_total",
            "Fetches re-issued after a concurrent write",
        )
        .map_err(metric_err)?;
        let data_loss = IntCounter::new(
            "ecobj_data_loss_total",
            "Requests failed with data loss",
        )
        .map_err(metric_err)?;
        let shard_ops = IntCounterVec::new(
            Opts::new("ecobj_shard_ops_total", "Shard operations by outcome"),
            &["op", "outcome"],
        )
        .map_err(metric_err)?;

        registry.register(Box::new(requests.clone())).map_err(metric_err)?;
        registry
            .register(Box::new(degraded_fetches.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(recovery_tasks.clone()))
            .map_err(metric_err)?;
        registry.register(Box::new(fetch_again.clone())).map_err(metric_err)?;
        registry.register(Box::new(data_loss.clone())).map_err(metric_err)?;
        registry.register(Box::new(shard_ops.clone())).map_err(metric_err)?;

        Ok(Self {
            registry,
            requests,
            degraded_fetches,
            recovery_tasks,
            fetch_again,
            data_loss,
            shard_ops,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every counter in the text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics text: {}", e)))
    }
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
