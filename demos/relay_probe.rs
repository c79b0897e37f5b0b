use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::select;
use tracing::{error, info, Level};

use ssh_relay::endpoint::{IapTunnelConfig, IapTunnelEndpoint, IapTunnelTarget, StaticToken};
use ssh_relay::stream::{MAX_WRITE_SIZE, MIN_READ_SIZE};
use ssh_relay::{RelayConfig, RelayStream};

/// Probes a VM port through the IAP relay, or forwards stdin / stdout through it
#[derive(Parser)]
struct Args {
    project: String,
    zone: String,
    instance: String,

    #[clap(long, default_value_t = 22)]
    port: u16,

    /// OAuth access token; falls back to the IAP_ACCESS_TOKEN environment variable
    #[clap(long)]
    token: Option<String>,

    #[clap(long)]
    base_url: Option<String>,

    #[clap(long, default_value_t = false)]
    mtls: bool,

    #[clap(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Pipe stdin and stdout through the tunnel instead of probing
    #[clap(long, default_value_t = false)]
    forward: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let token = match args.token.clone() {
        Some(token) => token,
        None => std::env::var("IAP_ACCESS_TOKEN")
            .map_err(|_| anyhow!("missing access token: pass --token or set IAP_ACCESS_TOKEN"))?,
    };

    let mut tunnel_config = IapTunnelConfig::new();
    tunnel_config.use_mtls = args.mtls;
    tunnel_config.base_url_override = args.base_url.clone();
    tunnel_config.validate()?;

    let target = IapTunnelTarget::new(args.project.clone(), args.zone.clone(), args.instance.clone(), args.port);
    info!("connecting to {}", target);

    let endpoint = IapTunnelEndpoint::new(target, tunnel_config, Arc::new(StaticToken(token)));
    let stream = Arc::new(RelayStream::with_config(Arc::new(endpoint), RelayConfig::new())?);

    if !args.forward {
        stream.probe(Duration::from_secs(args.timeout_secs)).await?;
        info!("probe succeeded: {}", stream);
        return Ok(());
    }

    let result = select! {
        result = upstream(stream.clone()) => result,
        result = downstream(stream.clone()) => result,
    };
    stream.close().await;

    if let Err(e) = &result {
        error!("{}: forwarding failed: {}", stream, e);
    }
    result
}

async fn upstream(stream: Arc<RelayStream>) -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; MAX_WRITE_SIZE];
    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.write(&buf[..n]).await?;
    }
}

async fn downstream(stream: Arc<RelayStream>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; MIN_READ_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stdout.write_all(&buf[..n]).await?;
        stdout.flush().await?;
    }
}
