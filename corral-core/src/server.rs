//! UDP server loop for DHCPv4
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result};
use dhcproto::{Decodable, Decoder, Encodable, v4};
use lease_manager::LeaseStore;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::handler::DhcpHandler;

/// Receives datagrams on a broadcast-capable socket, decodes them, and
/// sends whatever reply the [`DhcpHandler`] produces. Each datagram is
/// handled on its own task so a slow db never blocks the recv loop.
#[derive(Debug)]
pub struct Server<S> {
    soc: Arc<UdpSocket>,
    handler: Arc<DhcpHandler<S>>,
}

impl<S: LeaseStore> Server<S> {
    /// Bind `addr` and create the server
    pub fn bind(addr: SocketAddr, handler: DhcpHandler<S>) -> Result<Self> {
        let soc = broadcast_socket(addr)?;
        info!(?addr, "bound dhcpv4 socket");
        Ok(Self {
            soc: Arc::new(soc),
            handler: Arc::new(handler),
        })
    }

    /// the address actually bound, useful when `addr` had port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.soc.local_addr().context("no local addr")
    }

    /// Run the recv loop until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("dhcpv4 listener shutting down");
                    return Ok(());
                }
                res = self.soc.recv_from(&mut buf) => {
                    let (len, src) = match res {
                        Ok(recvd) => recvd,
                        Err(err) => {
                            error!(%err, "recv failed");
                            continue;
                        }
                    };
                    let datagram = buf[..len].to_vec();
                    let soc = Arc::clone(&self.soc);
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(err) = handle_datagram(soc, handler, datagram, src).await {
                            warn!(%err, %src, "error handling message");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_datagram<S: LeaseStore>(
    soc: Arc<UdpSocket>,
    handler: Arc<DhcpHandler<S>>,
    buf: Vec<u8>,
    src: SocketAddr,
) -> Result<()> {
    let req = v4::Message::decode(&mut Decoder::new(&buf)).context("failed to decode message")?;
    trace!(%src, xid = req.xid(), "decoded message");
    if let Some(resp) = handler.handle(&req).await {
        let dest = reply_dest(&req, src);
        let buf = resp.to_vec().context("failed to encode reply")?;
        soc.send_to(&buf, dest).await?;
        debug!(%dest, msg_type = ?resp.opts().msg_type(), "sent reply");
    }
    Ok(())
}

/// Where a reply goes, per RFC 2131 section 4.1. Replies that would
/// need an ARP cache entry to unicast are broadcast instead.
fn reply_dest(req: &v4::Message, _src: SocketAddr) -> SocketAddr {
    let ciaddr = req.ciaddr();
    if !req.giaddr().is_unspecified() {
        // relayed, the relay agent forwards to the client
        (req.giaddr(), v4::SERVER_PORT).into()
    } else if !ciaddr.is_unspecified() && !req.flags().broadcast() {
        (ciaddr, v4::CLIENT_PORT).into()
    } else {
        (Ipv4Addr::BROADCAST, v4::CLIENT_PORT).into()
    }
}

/// SO_BROADCAST & SO_REUSEADDR have to go on before bind, so the socket
/// starts life as a `socket2` socket and is handed to tokio after.
fn broadcast_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let soc = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create socket")?;
    soc.set_broadcast(true)
        .context("failed to set SO_BROADCAST")?;
    soc.set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    soc.bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;
    let soc: std::net::UdpSocket = soc.into();
    soc.set_nonblocking(true)
        .context("failed to set non-blocking")?;
    UdpSocket::from_std(soc).context("failed to register socket with tokio")
}
