use callpipe::{CallOptions, Client, ClientConfig, TcpTransport};
use callpipe_demo::{Countdown, EchoService, Request};
use clap::Parser;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address.
    #[arg(default_value = "127.0.0.1:8000")]
    pub addr: std::net::SocketAddr,

    /// Request value.
    #[arg(short, long, default_value = "alice")]
    pub value: String,

    /// Enable stress testing of the unary echo.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(args: Args) {
    let counters = Arc::new(Counters::default());
    let client = Arc::new(Client::new(
        TcpTransport::new(),
        args.addr,
        ClientConfig::default(),
    ));
    let start_time = std::time::Instant::now();
    let secs = args.secs;
    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let value = Request(args.value.clone());
        let counters = counters.clone();
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < secs {
                let result: callpipe::Result<String> = client
                    .unary(EchoService::ECHO, &value, CallOptions::default())
                    .await;
                counters.total.fetch_add(1, Ordering::AcqRel);
                if result.is_err() {
                    counters.fails.fetch_add(1, Ordering::AcqRel);
                }
            }
        }));
    }
    tokio::select! {
        _ = futures_util::future::join_all(tasks) => {}
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = counters.total.swap(0, Ordering::AcqRel);
                let fails = counters.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {}
    }
}

async fn run_all(args: Args) -> callpipe::Result<()> {
    let client = Client::new(TcpTransport::new(), args.addr, ClientConfig::default());

    let rsp: String = client
        .unary(EchoService::ECHO, &Request(args.value.clone()), CallOptions::default())
        .await?;
    tracing::info!("echo rsp: {rsp}");

    let countdown = Countdown {
        from: 3,
        interval_ms: 100,
    };
    let mut receiver = client
        .server_streaming::<_, u32>(EchoService::COUNTDOWN, &countdown, CallOptions::default())
        .await?;
    while let Some(i) = receiver.message().await? {
        tracing::info!("countdown: {i}");
    }

    let sum: i64 = client
        .client_streaming(EchoService::SUM, [1i64, 2, 3, 4], CallOptions::default())
        .await?;
    tracing::info!("sum rsp: {sum}");

    let (sender, receiver) = client
        .duplex_streaming::<Request, String>(EchoService::CHAT, CallOptions::default())
        .await?;
    for line in ["hello", "how are you", args.value.as_str()] {
        sender.send(&Request(line.to_string())).await?;
    }
    sender.complete().await?;
    let lines = receiver.collect().await?;
    tracing::info!("chat rsp: {lines:?}");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    if args.stress {
        stress_test(args).await;
    } else if let Err(e) = run_all(args).await {
        tracing::error!("demo failed: {e}");
    }
}
