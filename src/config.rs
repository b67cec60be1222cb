//! Engine configuration.

use std::time::Duration;

use crate::{Error, Result};

/// Environment variable overriding the number of graph worker threads.
pub const ENV_DSP_THREADS: &str = "ROUTEGRAPH_DSP_THREADS";

/// Upper bound for graph worker threads.
pub const MAX_GRAPH_THREADS: usize = 128;

/// Configuration shared by the engine, router and graph.
///
/// Use [`EngineConfig::default`] and the `with_*` builder methods:
///
/// ```
/// use routegraph::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_buffer_size(256)
///     .with_num_threads(2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Largest number of frames a single cycle may process.
    pub buffer_size: u32,
    /// Extra worker threads besides the main graph thread.
    /// `None` reserves two cores (OS + audio callback) and uses the rest.
    pub num_threads: Option<usize>,
    /// Cap on how long a hard recalc waits for the running cycle.
    pub quiesce_timeout: Duration,
    /// Sleep between polls while waiting for the running cycle.
    pub quiesce_poll: Duration,
    /// Skip nodes for automatable control ports nothing writes to.
    pub drop_unnecessary_ports: bool,
    /// Panic on structural graph errors instead of rejecting the rebuild.
    pub strict_validation: bool,
    /// Capacity of the control-port change queue.
    pub control_queue_capacity: usize,
    /// Capacity of the node error report queue.
    pub error_queue_capacity: usize,
    /// Record node execution order when non-zero (instrumentation).
    pub execution_trace_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_size: 512,
            num_threads: None,
            quiesce_timeout: Duration::from_secs(2),
            quiesce_poll: Duration::from_micros(100),
            drop_unnecessary_ports: true,
            strict_validation: cfg!(debug_assertions),
            control_queue_capacity: 128,
            error_queue_capacity: 64,
            execution_trace_capacity: 0,
        }
    }
}

impl EngineConfig {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: u32) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn with_quiesce_timeout(mut self, timeout: Duration) -> Self {
        self.quiesce_timeout = timeout;
        self
    }

    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }

    pub fn with_drop_unnecessary_ports(mut self, drop: bool) -> Self {
        self.drop_unnecessary_ports = drop;
        self
    }

    pub fn with_execution_trace(mut self, capacity: usize) -> Self {
        self.execution_trace_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(8000..=384_000).contains(&self.sample_rate) {
            return Err(Error::InvalidConfig(format!(
                "sample_rate {} out of range (8000-384000 Hz)",
                self.sample_rate
            )));
        }
        if !(16..=8192).contains(&self.buffer_size) {
            return Err(Error::InvalidConfig(format!(
                "buffer_size {} out of range (16-8192 frames)",
                self.buffer_size
            )));
        }
        if self.control_queue_capacity == 0 || self.error_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue capacities must be non-zero".into(),
            ));
        }
        if self.quiesce_poll > self.quiesce_timeout {
            return Err(Error::InvalidConfig(format!(
                "quiesce_poll {:?} exceeds quiesce_timeout {:?}",
                self.quiesce_poll, self.quiesce_timeout
            )));
        }
        Ok(())
    }

    /// Number of extra worker threads to spawn.
    ///
    /// [`ENV_DSP_THREADS`] takes precedence over `num_threads`.
    pub fn resolve_num_threads(&self) -> Result<usize> {
        let requested = match std::env::var(ENV_DSP_THREADS) {
            Ok(val) => val.trim().parse::<usize>().map_err(|_| {
                Error::InvalidConfig(format!("{} must be a thread count, got {:?}", ENV_DSP_THREADS, val))
            })?,
            Err(_) => match self.num_threads {
                Some(n) => n,
                None => std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .saturating_sub(2),
            },
        };
        Ok(requested.min(MAX_GRAPH_THREADS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.buffer_size, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_buffer_size() {
        let config = EngineConfig::default().with_buffer_size(4);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_sample_rate() {
        let config = EngineConfig::default().with_sample_rate(1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thread_count_is_capped() {
        let config = EngineConfig::default().with_num_threads(10_000);
        if std::env::var(ENV_DSP_THREADS).is_err() {
            assert_eq!(config.resolve_num_threads().unwrap(), MAX_GRAPH_THREADS);
        }
    }
}
