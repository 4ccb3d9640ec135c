//! Stand-alone container serving a single echo service.
//!
//! Useful for smoke-testing clients and the dispatch configuration:
//!
//! ```text
//! soa-echo-server --port 9090 --dynamic-config dispatch.json --log-format json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use soa_container::{
    init_tracing, shutdown_signal, ContainerConfig, LogFormat, SoaContainer, StaticConfigSource,
};
use soa_core::{FnProcessor, Reply};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "soa-echo-server", about = "SOA container serving an echo service")]
struct Cli {
    #[command(flatten)]
    container: ContainerConfig,

    /// Interface name the echo service is registered under.
    #[arg(long, default_value = "com.isuwang.soa.echo.EchoService")]
    service: String,

    /// Version the echo service is registered under.
    #[arg(long = "service-version", default_value = "1.0.0")]
    service_version: String,

    /// JSON file mapping `service.version.method.producer` keys to settings.
    #[arg(long, env = "SOA_DYNAMIC_CONFIG")]
    dynamic_config: Option<PathBuf>,

    #[arg(long, value_enum, env = "SOA_LOG_FORMAT", default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let dynamic = match &cli.dynamic_config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            StaticConfigSource::from_json(&json)?
        }
        None => StaticConfigSource::new(),
    };

    let echo = FnProcessor::new(cli.service, cli.service_version, |ctx, body| {
        info!(call = %ctx.header().identity(), bytes = body.len(), "echo");
        Ok(Reply::new(body))
    })
    .shared();

    let mut container = SoaContainer::builder(cli.container)
        .processor(echo)
        .dynamic_config(Arc::new(dynamic))
        .build()?;
    let port = container.start().await?;
    info!(port, "echo server listening");

    container.serve(shutdown_signal()).await
}
