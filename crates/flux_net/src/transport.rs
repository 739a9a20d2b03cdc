use crate::ProxyError;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

pub struct TransportBuilder;

impl TransportBuilder {
    /// Plain TCP connect to the upstream peer. Every resolved address is
    /// tried in order; the first one that accepts wins. No retries.
    pub async fn connect_upstream(addr: &str) -> Result<TcpStream, ProxyError> {
        let targets: Vec<SocketAddr> = lookup_host(addr)
            .await
            .map_err(|source| ProxyError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .collect();

        let mut last_err = None;
        for target in targets {
            match Self::connect_tuned(target).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("TransportBuilder: {} refused: {}", target, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(source) => ProxyError::Connect {
                addr: addr.to_string(),
                source,
            },
            None => ProxyError::NoAddress {
                addr: addr.to_string(),
            },
        })
    }

    /// Socket options are applied before the handshake, then tokio drives the connect.
    async fn connect_tuned(addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))?;
        socket.set_nonblocking(true)?;

        let std_stream: std::net::TcpStream = socket.into();
        TcpSocket::from_std_stream(std_stream).connect(addr).await
    }

    /// Shuts both halves of `stream` down at the OS level. Any task blocked
    /// reading it wakes with end-of-stream and any pending write fails, which
    /// is how one direction of a connection stops its peer direction.
    pub fn sever(stream: &TcpStream) {
        if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("TransportBuilder: shutdown failed: {}", e);
            }
        }
    }
}
