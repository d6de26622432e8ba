//! Runtime configuration (SPEC_FULL §6 AMBIENT Configuration): every
//! tunable named throughout the orchestration logic, collected into one
//! struct and loaded from `YORC_`-prefixed environment variables,
//! matching `RunnerConfig::from_env()` in the teacher's worker crate.

use std::time::Duration;

use yorc_workflow::ExecutorConfig;

#[derive(Debug, Clone)]
pub struct Configuration {
    pub bind_addr: String,
    /// §4.6.3 `WfStepGracefulTerminationTimeout`.
    pub graceful_termination_timeout: Duration,
    /// §4.1 advisory lock `max_wait`, carried here for call sites (e.g.
    /// the host pool) that acquire locks against the shared store.
    pub lock_max_wait: Duration,
    /// §4.6.1 worker pool size.
    pub executor_max_concurrency: usize,
}

impl Configuration {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("YORC_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8800".to_string()),
            graceful_termination_timeout: Duration::from_secs(env_u64(
                "YORC_WF_STEP_GRACEFUL_TERMINATION_TIMEOUT_SECS",
                300,
            )),
            lock_max_wait: Duration::from_secs(env_u64("YORC_LOCK_MAX_WAIT_SECS", 30)),
            executor_max_concurrency: env_u64("YORC_EXECUTOR_MAX_CONCURRENCY", 16) as usize,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            graceful_termination_timeout: self.graceful_termination_timeout,
            max_concurrency: self.executor_max_concurrency,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
