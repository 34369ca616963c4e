use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vela_server::{Config, Node};

#[derive(Parser, Debug)]
#[command(name = "vela-server")]
#[command(about = "Vela vector search peer")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "vela.toml", env = "VELA_CONFIG")]
    config: PathBuf,

    /// HTTP address, overrides `server.bind_addr`
    #[arg(long)]
    bind: Option<String>,

    /// Log as JSON lines, overrides `logging.json`
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,vela=debug".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    init_tracing(args.json_logs || config.logging.json);

    tracing::info!("Starting Vela peer {}", config.cluster.node_id);
    tracing::info!("Config file: {}", args.config.display());

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let http = TcpListener::bind(&config.server.bind_addr).await?;
    let rpc = TcpListener::bind(&config.cluster.bind_addr).await?;

    let node = Node::new(config)?;
    let running = node.start(http, rpc, Some(prometheus))?;

    tokio::signal::ctrl_c().await?;
    running.shutdown();
    running.wait().await;

    Ok(())
}
