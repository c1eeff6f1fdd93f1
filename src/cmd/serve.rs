//! HTTP API command: `phaseline serve`.

use anyhow::Result;

use phaseline::config::Config;
use phaseline::server::{self, ServeOptions};

pub async fn cmd_serve(
    config: &Config,
    host: Option<String>,
    port: Option<u16>,
    workers: Option<usize>,
    dev: bool,
) -> Result<()> {
    let defaults = &config.settings.server;
    let options = ServeOptions {
        host: host.unwrap_or_else(|| {
            if dev {
                "0.0.0.0".to_string()
            } else {
                defaults.host.clone()
            }
        }),
        port: port.unwrap_or(defaults.port),
        workers: workers.unwrap_or(defaults.workers),
        dev,
    };
    let pipeline = config.pipeline()?;
    println!(
        "phaseline API on http://{}:{} with {} worker(s)",
        options.host, options.port, options.workers
    );
    server::serve(pipeline, options).await
}
