//! Upstream connector seam and the SOCKS5 client behind it.
//!
//! Every tunneled TCP flow terminates in a byte stream obtained from an
//! [`UpstreamConnector`]; production uses CONNECT through the local Tor
//! SOCKS port, tests hand out in-memory pipes.

use async_trait::async_trait;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const REPLY_SUCCEEDED: u8 = 0x00;

pub trait UpstreamStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamStream for T {}

pub type BoxedStream = Box<dyn UpstreamStream>;

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, dst: SocketAddrV4) -> io::Result<BoxedStream>;
}

/// CONNECT client for an upstream SOCKS5 endpoint, no authentication.
pub struct Socks5Connector {
    proxy: SocketAddr,
}

impl Socks5Connector {
    pub fn new(proxy: SocketAddr) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl UpstreamConnector for Socks5Connector {
    async fn connect(&self, dst: SocketAddrV4) -> io::Result<BoxedStream> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.proxy))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socks connect timed out"))??;
        stream.set_nodelay(true).ok();

        tokio::time::timeout(CONNECT_TIMEOUT, handshake(&mut stream, dst))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socks handshake timed out"))??;

        Ok(Box::new(stream))
    }
}

async fn handshake(stream: &mut TcpStream, dst: SocketAddrV4) -> io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("socks method selection {method:02x?} refused"),
        ));
    }

    let mut request = [0u8; 10];
    request[0] = SOCKS_VERSION;
    request[1] = CMD_CONNECT;
    request[3] = ATYP_IPV4;
    request[4..8].copy_from_slice(&dst.ip().octets());
    request[8..10].copy_from_slice(&dst.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION || reply[1] != REPLY_SUCCEEDED {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("socks connect to {dst} failed with code {:#04x}", reply[1]),
        ));
    }
    Ok(())
}
