//! UDP voice broadcast: every received datagram is echoed to each connected
//! client's advertised UDP endpoint.
//!
//! Datagrams carry no authentication beyond the sender having a TCP/TLS
//! connection from the same address; see DESIGN.md.

use crate::server::Server;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

const MAX_DATAGRAM: usize = 4096;

pub async fn run(server: Arc<Server>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], server.config.udp_port).into();
    let socket = UdpSocket::bind(bind_addr).await?;
    info!("listening for voice datagrams on UDP port {}", server.config.udp_port);

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut endpoints: Vec<SocketAddr> = Vec::new();

    loop {
        let (len, _sender_addr) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => return Ok(()),
        };

        // Rebuild the endpoint list only when the connection table changed.
        if server
            .connected_clients_changed
            .swap(false, Ordering::AcqRel)
        {
            endpoints = server
                .connected_udp_endpoints()
                .into_iter()
                .filter(|(_, port)| *port != 0)
                .map(|(addr, port)| SocketAddr::new(addr.ip(), port))
                .collect();
        }

        // Every connected client gets the datagram, the sender included.
        for endpoint in &endpoints {
            if let Err(e) = socket.send_to(&buf[..len], *endpoint).await {
                warn!("UDP send to {} failed: {}", endpoint, e);
            }
        }
    }
}
