//! Binds the listener(s), owns the router's lifetime, and runs the
//! periodic TTL sweep and optional metrics endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use crate::config::RelayConfig;
use crate::connection;
use crate::metrics::AtomicMetrics;
use crate::router::{MAX_PAYLOAD_BYTES, Router};

/// Periodic TTL sweep interval (§4.6: "default every 10 seconds").
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub struct Server {
    config: RelayConfig,
    router: Arc<Router>,
    metrics: Arc<AtomicMetrics>,
}

impl Server {
    pub fn new(config: RelayConfig) -> Self {
        let metrics = Arc::new(AtomicMetrics::new());
        let router = Arc::new(Router::new(
            config.max_queue_per_wallet,
            config.max_queue_global,
            metrics.clone(),
        ));
        Self {
            config,
            router,
            metrics,
        }
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        if !self.config.tls_enabled() {
            return Ok(None);
        }
        let cert_path = self.config.cert.as_deref().unwrap();
        let key_path = self.config.key.as_deref().unwrap();

        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("failed to read TLS cert: {cert_path}"))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("failed to read TLS key: {key_path}"))?;

        let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("failed to parse TLS certificates")?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("failed to parse TLS private key")?
            .context("no private key found in PEM file")?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("invalid TLS configuration")?;

        Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
    }

    /// Run the relay, blocking until shutdown. Returns an error for bind
    /// failures; the caller maps that to the config/bind exit codes.
    pub async fn run(self) -> Result<()> {
        let tls_acceptor = self.build_tls_acceptor()?;
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen))?;
        tracing::info!(addr = %self.config.listen, tls = tls_acceptor.is_some(), "relay listening");

        if let Some(ref addr) = self.config.metrics_listen {
            spawn_metrics_endpoint(addr.clone(), self.metrics.clone()).await?;
        }

        spawn_sweep_task(self.router.clone());

        let shutdown = shutdown_signal();
        let max_payload_len = MAX_PAYLOAD_BYTES as u32;

        tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown signal received");
            }
            result = accept_loop(listener, tls_acceptor, self.router.clone(), max_payload_len) => {
                result?;
            }
        }

        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    router: Arc<Router>,
    max_payload_len: u32,
) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("accept failed")?;
        let router = router.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let result = match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        connection::handle_connection(tls_stream, router, max_payload_len).await
                    }
                    Err(e) => {
                        tracing::warn!(%addr, "TLS handshake failed: {e}");
                        return;
                    }
                },
                None => connection::handle_connection(stream, router, max_payload_len).await,
            };
            if let Err(e) = result {
                tracing::debug!(%addr, "connection closed: {e}");
            }
        });
    }
}

fn spawn_sweep_task(router: Arc<Router>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            router.sweep_expired().await;
        }
    });
}

async fn spawn_metrics_endpoint(addr: String, metrics: Arc<AtomicMetrics>) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    tracing::info!(%addr, "metrics endpoint listening");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                continue;
            };
            let metrics = metrics.clone();
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut discard = [0u8; 1024];
                // Best-effort drain of the request line; we don't parse it,
                // every connection gets the same snapshot.
                let _ = stream.read(&mut discard).await;
                let body = serde_json::to_vec(&metrics.snapshot()).unwrap_or_default();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.write_all(&body).await;
            });
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
