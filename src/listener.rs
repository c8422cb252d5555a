//! TCP listener: binds the main port (retrying a busy bind), wraps accepted
//! sockets in TLS, and spawns one session task per connection.

use crate::server::Server;
use crate::session;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

const BIND_RETRY_PERIOD: Duration = Duration::from_secs(5);
const MAX_BIND_ATTEMPTS: u32 = 600;

/// Build the TLS server config from PEM cert and key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    use anyhow::Context;

    let cert_bytes = std::fs::read(cert_path)
        .with_context(|| format!("reading certificate '{}'", cert_path.display()))?;
    let key_bytes = std::fs::read(key_path)
        .with_context(|| format!("reading private key '{}'", key_path.display()))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()
        .context("parsing certificate PEM")?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .context("parsing private key PEM")?
        .ok_or_else(|| anyhow::anyhow!("no private key in '{}'", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Bind and accept until shutdown.  A busy port is retried every 5 s; a
/// never-clearing bind failure is fatal (the binary exits 1).
pub async fn run(
    server: Arc<Server>,
    acceptor: TlsAcceptor,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], server.config.listen_port).into();

    let listener = {
        let mut listener = None;
        for attempt in 0..MAX_BIND_ATTEMPTS {
            match TcpListener::bind(bind_addr).await {
                Ok(l) => {
                    listener = Some(l);
                    break;
                }
                Err(e) => {
                    warn!(
                        "bind to {} failed (attempt {}): {}, retrying in {}s",
                        bind_addr,
                        attempt + 1,
                        e,
                        BIND_RETRY_PERIOD.as_secs()
                    );
                    tokio::time::sleep(BIND_RETRY_PERIOD).await;
                }
            }
        }
        listener.ok_or_else(|| anyhow::anyhow!("failed to bind and listen on {}", bind_addr))?
    };
    info!("listening on port {}", server.config.listen_port);

    let mut shutdown_accept = shutdown.clone();
    loop {
        let (tcp, remote_addr) = tokio::select! {
            r = listener.accept() => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown_accept.changed() => return Ok(()),
        };
        info!("client connected from {}", remote_addr);
        tokio::spawn(session::handle_connection(
            server.clone(),
            acceptor.clone(),
            tcp,
            remote_addr,
            shutdown.clone(),
        ));
    }
}
