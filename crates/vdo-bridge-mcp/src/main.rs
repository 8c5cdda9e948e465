//! vdo-bridge MCP server binary
//!
//! Runs the bridge behind MCP over stdio (default) or streamable HTTP.
//! Sessions created by this binary ride the in-process signalling hub, so
//! agents sharing the server see each other directly; a production WebRTC
//! adapter plugs in at the `PeerTransport` seam.

use clap::Parser;
use std::sync::Arc;

use vdo_bridge_core::tools::ToolSurface;
use vdo_bridge_harness::{fake_transport_factory, SignalHub};
use vdo_bridge_mcp::{EnvDefaults, HttpSettings, McpService, ToolProfile};

#[derive(Debug, Parser)]
#[command(name = "vdo-bridge-mcp", version, about = "MCP bridge for peer-to-peer data channels")]
struct Cli {
    /// Serve streamable HTTP instead of stdio.
    #[arg(long)]
    http: bool,

    /// HTTP listen host.
    #[arg(long)]
    host: Option<String>,

    /// HTTP listen port.
    #[arg(long)]
    port: Option<u16>,

    /// HTTP endpoint path.
    #[arg(long)]
    path: Option<String>,

    /// Tool profile: full, core, messaging, files, or state.
    #[arg(long)]
    profile: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs must stay off stdout; the stdio transport owns it.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env = EnvDefaults::from_env();

    let profile_name = cli
        .profile
        .or_else(|| env.tool_profile.clone())
        .unwrap_or_else(|| "full".to_string());
    let profile = ToolProfile::by_name(&profile_name)
        .ok_or_else(|| format!("unknown tool profile {profile_name}"))?;

    let hub = SignalHub::new();
    let surface = Arc::new(ToolSurface::new(fake_transport_factory(&hub)));
    let service = Arc::new(McpService::new(surface, profile, env.clone()));

    if cli.http {
        let mut settings = env.http.unwrap_or_default();
        if let Some(host) = cli.host {
            settings.host = host;
        }
        if let Some(port) = cli.port {
            settings.port = port;
        }
        if let Some(path) = cli.path {
            settings.path = path;
        }
        run_http(service, settings).await?;
    } else {
        tracing::info!(profile = %profile_name, "serving MCP over stdio");
        vdo_bridge_mcp::stdio::run_stdio(service).await?;
    }
    Ok(())
}

async fn run_http(service: Arc<McpService>, settings: HttpSettings) -> std::io::Result<()> {
    tracing::info!(profile = %service.profile().name(), "serving MCP over http");
    vdo_bridge_mcp::http::run_http(service, settings).await
}
