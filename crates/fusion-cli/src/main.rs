//! # fusion-watch
//!
//! Subscribe to one endpoint and print every state change as a JSON line
//! until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{debug, info};

use fusion_client::{
    ConfigOverride, FetchParams, FusionContext, HttpFetcher, SubscriptionRequest, SubscriptionResult,
};
use fusion_settings::loader::{apply_env_overrides, load_settings_from_path};
use fusion_settings::{FusionSettings, types::socket_uri_for_origin};

/// Watch a live value.
#[derive(Parser, Debug)]
#[command(name = "fusion-watch", about = "Subscribe to an endpoint and print every update")]
struct Cli {
    /// Endpoint to fetch, absolute or relative to `--origin`.
    url: String,

    /// HTTP origin. Relative URLs resolve against it and the socket
    /// endpoint is derived from it unless `--uri` is given.
    #[arg(long)]
    origin: Option<String>,

    /// Socket endpoint (`ws://` or `wss://`).
    #[arg(long)]
    uri: Option<String>,

    /// Refetch throttle window in milliseconds.
    #[arg(long)]
    wait: Option<u64>,

    /// Settings file (JSON). Missing files fall back to defaults.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level or filter directive. `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Extra request header, repeatable.
    #[arg(long = "header", value_name = "K=V", value_parser = parse_header)]
    headers: Vec<(String, String)>,
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected K=V, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{raw}`"));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

fn load_settings(path: Option<&PathBuf>) -> Result<FusionSettings> {
    match path {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => {
            let mut settings = FusionSettings::default();
            apply_env_overrides(&mut settings);
            Ok(settings)
        }
    }
}

fn overrides(cli: &Cli) -> Result<ConfigOverride> {
    let mut config = ConfigOverride::default();
    match (&cli.uri, &cli.origin) {
        (Some(uri), _) => config = config.uri(uri.clone()),
        (None, Some(origin)) => {
            let uri = socket_uri_for_origin(origin).context("Invalid --origin")?;
            config = config.uri(uri);
        }
        (None, None) => {}
    }
    if let Some(wait) = cli.wait {
        config = config.wait(wait);
    }
    Ok(config)
}

fn render(result: &SubscriptionResult<Value>) -> Value {
    json!({
        "loading": result.loading,
        "error": result.error.as_ref().map(ToString::to_string),
        "data": result.data,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    fusion_core::logging::init_subscriber(&cli.log_level);

    let settings = load_settings(cli.settings.as_ref())?;
    let fetcher = match &cli.origin {
        Some(origin) => HttpFetcher::new()
            .with_base_url(origin)
            .context("Invalid --origin")?,
        None => HttpFetcher::new(),
    };
    let context = FusionContext::builder()
        .settings(settings)
        .fetcher(Arc::new(fetcher))
        .build();
    context.configure(overrides(&cli)?);
    info!(url = %cli.url, uri = %context.settings().uri, "watching");

    let params = cli
        .headers
        .iter()
        .fold(FetchParams::default(), |params, (k, v)| params.header(k, v));
    let mut subscription = context.subscribe(
        Value::Null,
        SubscriptionRequest::new(cli.url.clone()).with_params(params),
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            update = subscription.next_update() => {
                let Some(result) = update else { break };
                println!("{}", render(&result));
                debug!(
                    connections = context.connection_count(),
                    parked = context.pending_reconnects(),
                    "state changed"
                );
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    let _ = subscription.unsubscribe();
    let closed = context.close_connections();
    debug!(closed, "shut down");
    Ok(())
}
