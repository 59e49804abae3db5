use clap::Parser;
use sandbox_server::config::{DocumentSource, SandboxConfig};
use sandbox_server::pipeline::Sandbox;
use sandbox_server::server::SandboxServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "sandbox-server", about = "Stateful, specification-driven HTTP mock server")]
struct Args {
    /// OpenAPI document (JSON or YAML)
    #[arg(long)]
    spec: Option<PathBuf>,
    /// Scenarios file (JSON or YAML)
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Configuration file; explicit flags override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value = "8080")]
    port: u16,
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let mut config = match &args.config {
        Some(path) => SandboxConfig::from_file(path)?,
        None => SandboxConfig::default(),
    };
    if let Some(spec) = args.spec {
        config.oas = Some(DocumentSource::Path(spec));
    }
    if let Some(rules) = args.rules {
        config.scenarios = Some(DocumentSource::Path(rules));
    }

    let sandbox = Sandbox::from_config(config)?;
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    SandboxServer::new(addr, Arc::new(sandbox)).run().await
}
