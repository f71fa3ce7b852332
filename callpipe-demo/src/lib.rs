use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use callpipe::{Error, Method, Router, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Request(pub String);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    pub from: u32,
    /// Pause between two responses.
    pub interval_ms: u64,
}

/// Method table shared by the demo server and client.
pub struct EchoService;

impl EchoService {
    pub const ECHO: Method = Method::unary("EchoService/echo");
    pub const COUNTDOWN: Method = Method::server_streaming("EchoService/countdown");
    pub const SUM: Method = Method::client_streaming("EchoService/sum");
    pub const CHAT: Method = Method::duplex_streaming("EchoService/chat");

    /// Registers every demo method on `router`.
    pub fn register(router: &mut Router) {
        let served = AtomicU64::new(0);

        router.add_unary(Self::ECHO, move |ctx, r: Request| {
            let n = served.fetch_add(1, Ordering::AcqRel);
            async move {
                tracing::debug!("echo #{n} from {}", ctx.peer());
                Ok(r.0)
            }
        });

        router.add_server_streaming(Self::COUNTDOWN, |_ctx, r: Countdown, responses| async move {
            for i in (0..=r.from).rev() {
                responses.write(&i).await?;
                if i > 0 {
                    tokio::time::sleep(Duration::from_millis(r.interval_ms)).await;
                }
            }
            Ok(())
        });

        router.add_client_streaming(Self::SUM, |ctx, requests| async move {
            let mut sum = 0i64;
            while let Some(value) = requests.next().await? {
                sum = sum.checked_add(value).ok_or_else(|| {
                    Error::status(StatusCode::OutOfRange, "sum overflowed")
                })?;
            }
            ctx.add_trailer("item-sum", sum.to_string());
            Ok::<i64, Error>(sum)
        });

        router.add_duplex_streaming(Self::CHAT, |ctx, requests, responses| async move {
            let mut count = 0u64;
            while let Some(Request(line)) = requests.next().await? {
                count += 1;
                responses.write(&format!("{}: {line}", ctx.peer())).await?;
            }
            ctx.add_trailer("lines", count.to_string());
            Ok(())
        });
    }
}

#[must_use]
pub fn router() -> Router {
    let mut router = Router::default();
    EchoService::register(&mut router);
    router
}

