//! Command transport.
//!
//! [`CommandLink`] is the seam between the dispatcher and the vehicle: one
//! request in, one [`LinkReply`] out. It never applies timeouts itself; the
//! dispatcher wraps every `send` in its own effective timeout and may drop
//! the future at any point.

use crate::config::ConnectConfig;
use crate::error::LinkError;
use crate::protocol::{CommandRequest, LinkReply, MAX_REPLY_SIZE};
use crate::telemetry::{TelemetrySnapshot, TelemetrySource};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, trace, warn};

pub const COMMAND_PORT: u16 = 8889;
pub const STATE_PORT: u16 = 8890;
pub const DEFAULT_VEHICLE_ADDR: &str = "192.168.10.1:8889";

const SDK_MODE_KEYWORD: &str = "command";
const RESYNC_TIMEOUT: Duration = Duration::from_secs(2);
const DATAGRAM_BUFFER_SIZE: usize = 1518;

static_assertions::const_assert!(DATAGRAM_BUFFER_SIZE > MAX_REPLY_SIZE);

pub trait CommandLink: Send + 'static {
    /// Transmit one request and wait for the vehicle's reply. Requests that
    /// expect no reply resolve to `Ack` once written.
    fn send(&mut self, request: &CommandRequest) -> impl Future<Output = Result<LinkReply, LinkError>> + Send;

    /// Bring the vehicle back into command mode after a suspected desync.
    fn resync(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send {
        async { Ok(()) }
    }
}

/// Text-SDK transport over UDP.
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    vehicle: SocketAddr,
    buf: Vec<u8>,
}

impl UdpLink {
    pub async fn connect(local: SocketAddr, vehicle: SocketAddr) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(vehicle).await?;
        info!("command link {} -> {}", socket.local_addr()?, vehicle);
        Ok(Self { socket, vehicle, buf: vec![0u8; DATAGRAM_BUFFER_SIZE] })
    }

    /// Connect and enter command mode, retrying with a fixed backoff until
    /// the configured number of attempts is spent.
    pub async fn establish(local: SocketAddr, vehicle: SocketAddr, config: &ConnectConfig) -> Result<Self, LinkError> {
        let attempts = config.attempts.max(1);
        let mut attempt = 1;
        loop {
            info!("connecting to {} (attempt {}/{})", vehicle, attempt, attempts);
            let result = match Self::connect(local, vehicle).await {
                Ok(mut link) => link.command_mode(config.reply_timeout()).await.map(|()| link),
                Err(e) => Err(e),
            };
            match result {
                Ok(link) => return Ok(link),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => warn!("connect attempt {} failed: {}", attempt, e),
            }
            attempt += 1;
            time::sleep(config.backoff()).await;
        }
    }

    pub fn vehicle(&self) -> SocketAddr {
        self.vehicle
    }

    /// Enter SDK command mode. Required once before any other command.
    pub async fn enter_command_mode(&mut self) -> Result<(), LinkError> {
        self.command_mode(RESYNC_TIMEOUT).await
    }

    async fn command_mode(&mut self, wait: Duration) -> Result<(), LinkError> {
        match time::timeout(wait, self.transact(SDK_MODE_KEYWORD, true)).await {
            Ok(Ok(LinkReply::Ack)) => Ok(()),
            Ok(Ok(LinkReply::Rejected(reason) | LinkReply::Busy(reason))) => Err(LinkError::Malformed(reason)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LinkError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "vehicle did not answer 'command'",
            ))),
        }
    }

    /// Throw away replies that arrived after their command timed out.
    fn drain_stale(&mut self) {
        loop {
            match self.socket.try_recv(&mut self.buf) {
                Ok(len) => {
                    let stale = String::from_utf8_lossy(&self.buf[..len]);
                    debug!("dropping stale reply '{}'", stale.trim());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    trace!("drain stopped: {}", e);
                    break;
                }
            }
        }
    }

    async fn transact(&mut self, text: &str, expects_reply: bool) -> Result<LinkReply, LinkError> {
        self.drain_stale();
        self.socket.send(text.as_bytes()).await?;
        trace!("-> {}", text);
        if !expects_reply {
            return Ok(LinkReply::Ack);
        }
        let len = self.socket.recv(&mut self.buf).await?;
        let reply = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| LinkError::Malformed(format!("{len} bytes of non-UTF-8")))?;
        trace!("<- {}", reply.trim());
        Ok(LinkReply::from_text(reply))
    }
}

impl CommandLink for UdpLink {
    async fn send(&mut self, request: &CommandRequest) -> Result<LinkReply, LinkError> {
        let wire = request.kind.to_wire();
        self.transact(&wire, request.kind.expects_reply()).await
    }

    async fn resync(&mut self) -> Result<(), LinkError> {
        self.enter_command_mode().await
    }
}

/// Listener for the vehicle's state broadcast.
#[derive(Debug)]
pub struct UdpTelemetry {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpTelemetry {
    pub async fn bind(local: SocketAddr) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(local).await?;
        info!("telemetry listener on {}", socket.local_addr()?);
        Ok(Self { socket, buf: vec![0u8; DATAGRAM_BUFFER_SIZE] })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }
}

impl TelemetrySource for UdpTelemetry {
    async fn poll(&mut self) -> Result<TelemetrySnapshot, LinkError> {
        let mut len = self.socket.recv(&mut self.buf).await?;
        // Skip to the newest datagram already queued.
        loop {
            match self.socket.try_recv(&mut self.buf) {
                Ok(newer) => len = newer,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("state socket error while skipping backlog: {}", e);
                    break;
                }
            }
        }
        let text = String::from_utf8_lossy(&self.buf[..len]);
        TelemetrySnapshot::parse_state(&text, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in vehicle that refuses the first `refusals` handshakes.
    async fn vehicle(refusals: usize) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut seen = 0;
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let reply: &[u8] = if seen < refusals { b"error Not ready" } else { b"ok" };
                seen += 1;
                let _ = socket.send_to(reply, from).await;
            }
        });
        addr
    }

    fn quick(attempts: u32) -> ConnectConfig {
        ConnectConfig { attempts, backoff_s: 0.01, reply_timeout_s: 1.0, ..ConnectConfig::default() }
    }

    #[tokio::test]
    async fn test_establish_retries_until_command_mode() {
        let addr = vehicle(2).await;
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let link = UdpLink::establish(local, addr, &quick(4)).await.unwrap();
        assert_eq!(link.vehicle(), addr);
    }

    #[tokio::test]
    async fn test_establish_gives_up_after_last_attempt() {
        let addr = vehicle(usize::MAX).await;
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let result = UdpLink::establish(local, addr, &quick(2)).await;
        assert!(matches!(result, Err(LinkError::Malformed(_))));
    }
}
