use anyhow::Context;
use clap::Parser;
use hub_relay::config::{LogFormat, LogLevel, RelayConfig};
use hub_relay::{logging, Relay, RelayError, TlsUpstream};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;

const EXIT_INTERRUPTED: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[derive(Parser)]
#[clap(
    version,
    about = "Relay a local notebook client to a remote hub, scoping API requests to one user"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Write a sample configuration file and exit")]
    generate_config: Option<String>,

    #[clap(long, env = "JUPYTER_PROXY_IP_OR_NAME", value_name = "HOST", help = "Local address to listen on")]
    listen_host: Option<String>,

    #[clap(long, env = "JUPYTER_PROXY_PORT", value_name = "PORT", help = "Local port to listen on")]
    listen_port: Option<u16>,

    #[clap(long, env = "JUPYTER_SERVER_IP_OR_NAME", value_name = "HOST", help = "Remote hub host to connect to")]
    server_host: Option<String>,

    #[clap(long, env = "JUPYTER_SERVER_PORT", value_name = "PORT", help = "Remote hub port")]
    server_port: Option<u16>,

    #[clap(long, env = "JUPYTER_SERVER_NAME", value_name = "NAME", help = "Name the hub certificate must be valid for")]
    server_name: Option<String>,

    #[clap(long, env = "JUPYTER_USERNAME", value_name = "USER", help = "Hub user that API requests are scoped to")]
    username: Option<String>,

    #[clap(long, env = "JUPYTER_CLUSTER_CA_CERT", value_name = "FILE", help = "CA certificate file (PEM) trusted for the hub")]
    ca_cert: Option<PathBuf>,

    #[clap(long, env = "RELAY_BUFFER_SIZE", value_name = "BYTES", help = "Maximum bytes read per socket read")]
    buffer_size: Option<usize>,

    #[clap(long, env = "RELAY_POLL_DELAY_MICROS", value_name = "MICROS", help = "Pause between loop iterations")]
    poll_delay_micros: Option<u64>,

    #[clap(long, env = "RELAY_BACKLOG", value_name = "NUM", help = "Listen backlog")]
    backlog: Option<u32>,

    #[clap(long, env = "RELAY_CONNECT_TIMEOUT", value_name = "SECONDS", help = "Upstream connect and handshake timeout")]
    connect_timeout: Option<u64>,

    #[clap(long, env = "RELAY_WRITE_TIMEOUT", value_name = "SECONDS", help = "Timeout for forwarding one chunk")]
    write_timeout: Option<u64>,

    #[clap(long, env = "RELAY_LOG_LEVEL", value_name = "LEVEL", help = "trace, debug, info, warn or error")]
    log_level: Option<String>,

    #[clap(long, env = "RELAY_LOG_FORMAT", value_name = "FORMAT", help = "text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("hub-relay: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    if let Some(config_file) = &args.generate_config {
        RelayConfig::default()
            .to_file(config_file)
            .with_context(|| format!("writing {}", config_file))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&args)?;
    config.validate()?;
    logging::init(config.log_level, config.log_format).context("initializing logging")?;

    print_banner(&config);

    let interrupt = interrupted()?;
    let connector = TlsUpstream::from_config(&config).context("loading upstream TLS settings")?;
    let relay = Relay::bind(&config, Arc::new(connector))
        .await
        .with_context(|| format!("binding {}", config.listen_url()))?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let stopped = async move {
        let reason = interrupt.await;
        let _ = stop_tx.send(reason);
    };

    match relay.run_until(stopped).await {
        Ok(relay) => {
            drop(relay);
            let reason = stop_rx.await.unwrap_or("Interrupted");
            info!("{} - Stopping relay", reason);
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(RelayError::Trust { server_name, reason }) => {
            error!(
                "Upstream certificate for '{}' is not trusted by {}: {}",
                server_name,
                config.ca_cert.display(),
                reason
            );
            Ok(ExitCode::from(EXIT_FATAL))
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one, naming which. The
/// SIGTERM handler is installed before this returns.
fn interrupted() -> anyhow::Result<impl Future<Output = &'static str>> {
    #[cfg(unix)]
    let mut sigterm =
        signal::unix::signal(signal::unix::SignalKind::terminate()).context("listening for SIGTERM")?;

    Ok(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => "Ctrl C",
            _ = terminate => "SIGTERM",
        }
    })
}

/// Defaults, then the config file, then environment and command line.
fn load_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    if let Some(v) = &args.listen_host {
        config.listen_host = v.clone();
    }
    if let Some(v) = args.listen_port {
        config.listen_port = v;
    }
    if let Some(v) = &args.server_host {
        config.server_host = v.clone();
    }
    if let Some(v) = args.server_port {
        config.server_port = v;
    }
    if let Some(v) = &args.server_name {
        config.server_name = v.clone();
    }
    if let Some(v) = &args.username {
        config.username = v.clone();
    }
    if let Some(v) = &args.ca_cert {
        config.ca_cert = v.clone();
    }
    if let Some(v) = args.buffer_size {
        config.buffer_size = v;
    }
    if let Some(v) = args.poll_delay_micros {
        config.poll_delay_micros = v;
    }
    if let Some(v) = args.backlog {
        config.backlog = v;
    }
    if let Some(v) = args.connect_timeout {
        config.connect_timeout_secs = v;
    }
    if let Some(v) = args.write_timeout {
        config.write_timeout_secs = v;
    }
    if let Some(v) = &args.log_level {
        config.log_level = v.parse::<LogLevel>()?;
    }
    if let Some(v) = &args.log_format {
        config.log_format = v.parse::<LogFormat>()?;
    }

    Ok(config)
}

fn print_banner(config: &RelayConfig) {
    info!("Server running at: {}", config.listen_url());
    info!("Forwarding requests to: {}", config.upstream_url());
    info!("Jupyter username: {}", config.username);
    info!("CA certificate file: {}", config.ca_cert.display());
    info!("Jupyter authorized server name: {}", config.server_name);
    info!(
        "Authorization URL with token for IDE: {}/?token=<YOUR_API_TOKEN>",
        config.listen_url()
    );
}
