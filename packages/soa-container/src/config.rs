//! Static container configuration.
//!
//! Read once at startup. Every field can come from the environment (the
//! variable names match the container's system properties), and the struct
//! derives `clap::Args` so a host binary can flatten it into its own CLI.

use std::time::Duration;

use clap::{Args, Parser};

/// Static settings for the container: transport, worker pool and reporting.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ContainerConfig {
    /// Run requests on the worker pool unless the dynamic configuration
    /// opts a method out. `false` executes every request inline.
    #[arg(
        long = "use-thread-pool",
        env = "SOA_CONTAINER_USETHREADPOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub use_thread_pool: bool,

    /// Number of worker threads.
    #[arg(long, env = "SOA_CORE_POOL_SIZE", default_value_t = 100)]
    pub core_pool_size: usize,

    /// Maximum number of requests waiting for a worker before submissions
    /// are rejected.
    #[arg(long, env = "SOA_POOL_QUEUE_CAPACITY", default_value_t = 10_000)]
    pub pool_queue_capacity: usize,

    /// Bind address.
    #[arg(long, env = "SOA_CONTAINER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port. 0 means OS-assigned.
    #[arg(long, env = "SOA_CONTAINER_PORT", default_value_t = 9090)]
    pub port: u16,

    /// Largest accepted frame payload in bytes.
    #[arg(long, env = "SOA_MAX_FRAME_LENGTH", default_value_t = 16 * 1024 * 1024)]
    pub max_frame_length: usize,

    /// Interval between metrics reports in milliseconds.
    #[arg(long, env = "SOA_METRICS_REPORT_INTERVAL_MS", default_value_t = 60_000)]
    pub metrics_report_interval_ms: u64,

    /// How long shutdown waits for in-flight requests, in milliseconds.
    #[arg(long, env = "SOA_DRAIN_TIMEOUT_MS", default_value_t = 30_000)]
    pub drain_timeout_ms: u64,
}

#[derive(Parser)]
#[command(name = "soa-container")]
struct EnvOnly {
    #[command(flatten)]
    config: ContainerConfig,
}

impl ContainerConfig {
    /// Builds the configuration from environment variables, falling back to
    /// the defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns a `clap::Error` when a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self, clap::Error> {
        EnvOnly::try_parse_from(["soa-container"]).map(|parsed| parsed.config)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Address string suitable for `TcpListener::bind`.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            use_thread_pool: true,
            core_pool_size: 100,
            pool_queue_capacity: 10_000,
            host: "0.0.0.0".to_string(),
            port: 9090,
            max_frame_length: 16 * 1024 * 1024,
            metrics_report_interval_ms: 60_000,
            drain_timeout_ms: 30_000,
        }
    }
}
