//! Command-line front end for restflow.
//!
//! Sends one request per URL through a bounded scheduler and prints each
//! result as one JSON line on stdout. Logs go to stderr.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use restflow::{bind_logger, Method, Request, Scheduler, SchedulerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "restflow")]
#[command(about = "Send REST requests with bounded concurrency, print results as JSON lines")]
struct Cli {
    /// Target URLs, one request each
    #[arg(required = true)]
    urls: Vec<String>,

    /// Maximum requests in flight (overrides RESTFLOW_MAX_ACTIVE_REQUESTS)
    #[arg(long)]
    max_active: Option<usize>,

    /// Pause between launches in milliseconds (overrides RESTFLOW_LAUNCH_DELAY_MS)
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Attempts per request; transport failures are retried
    #[arg(long, default_value_t = 1)]
    retries: u32,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// HTTP status to ignore instead of failing (repeatable)
    #[arg(long = "ignore-status")]
    ignore_status: Vec<u16>,

    /// Header sent with every request, as NAME:VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Query param sent with every request, as NAME=VALUE (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// HTTP method
    #[arg(long, default_value = "GET", value_parser = parse_method)]
    method: Method,
}

impl Cli {
    fn config(&self, base: SchedulerConfig) -> SchedulerConfig {
        let mut config = base;
        if let Some(max) = self.max_active {
            config = config.with_max_active_requests(max);
        }
        if let Some(ms) = self.delay_ms {
            config = config.with_launch_delay(Duration::from_millis(ms));
        }
        for (name, value) in &self.headers {
            config = config.with_header(name.clone(), value.clone());
        }
        for (name, value) in &self.params {
            config = config.with_param(name.clone(), value.clone());
        }
        config
    }

    fn requests(&self) -> Vec<Request> {
        self.urls
            .iter()
            .map(|url| {
                let mut request = Request::new(self.method, url.clone())
                    .with_retry_budget(self.retries);
                if let Some(ms) = self.timeout_ms {
                    request = request.with_timeout(Duration::from_millis(ms));
                }
                if !self.ignore_status.is_empty() {
                    request = request.ignore_status(self.ignore_status.iter().copied());
                }
                request
            })
            .collect()
    }
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))?;
    if name.is_empty() {
        return Err(format!("empty param name in `{raw}`"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn parse_method(raw: &str) -> std::result::Result<Method, String> {
    raw.parse().map_err(|e: restflow::RestError| e.to_string())
}

/// Stream every result to `out`; returns the number of lines written.
async fn execute(cli: &Cli, scheduler: &Scheduler, out: &mut impl Write) -> Result<usize> {
    let mut results = scheduler
        .stream(cli.requests())
        .context("Failed to submit requests")?;

    let mut written = 0;
    while let Some(value) = results.next().await {
        let value = value.context("Request failed")?;
        writeln!(out, "{}", serde_json::to_string(&value)?)?;
        written += 1;
    }
    Ok(written)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (stderr, stdout carries results)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,restflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = cli.config(SchedulerConfig::from_env().context("Failed to load configuration")?);
    tracing::debug!(?config, "configuration loaded");

    let scheduler = Scheduler::http(config).context("Failed to create scheduler")?;
    bind_logger(scheduler.events(), "[restflow] ");

    let stdout = std::io::stdout();
    let written = execute(&cli, &scheduler, &mut stdout.lock()).await?;
    tracing::info!(results = written, "done");

    Ok(())
}
