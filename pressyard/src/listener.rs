use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::Router;
use pressyard_task::{ShutdownSignal, Task};
use tokio::net::TcpListener;

pub struct HttpListener {
    addr: SocketAddr,
    listener: TcpListener,
    router: Router,
}

impl HttpListener {
    pub async fn init_and_bind(addr: SocketAddr, router: Router) -> anyhow::Result<Self> {
        info!(%addr, "Initiating listener…");

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!(%addr, "Listener started successfully");

        Ok(Self { addr, listener, router })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Task for HttpListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let shutdown = async move { shutdown_signal.wait().await };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server failure")
    }
}
