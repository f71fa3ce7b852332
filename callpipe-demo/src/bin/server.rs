use callpipe::{Server, ServerConfig, TcpTransport};
use callpipe_demo::router;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "127.0.0.1:8000")]
    pub addr: std::net::SocketAddr,

    /// Bind attempts while the address is still in use.
    #[arg(long, default_value = "3")]
    pub bind_retries: u32,

    /// Seconds a call may still send its status after its deadline.
    #[arg(long, default_value = "5")]
    pub status_grace: u64,
}

#[tokio::main]
async fn main() -> callpipe::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let config = ServerConfig {
        addr: Some(args.addr),
        bind_retries: args.bind_retries,
        status_grace: Duration::from_secs(args.status_grace),
        ..Default::default()
    };
    let server = Server::create(router(), config);
    server.on_call_completed().add(|summary, _| async move {
        tracing::info!(
            "{} from {}: {} in {:?}",
            summary.method,
            summary.peer,
            summary.status,
            summary.elapsed
        );
        Ok(())
    });

    let addr = server.start(TcpTransport::new()).await?;
    tracing::info!("serving on {addr}");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to wait for ctrl-c: {e}");
    }
    server.shutdown().await
}
