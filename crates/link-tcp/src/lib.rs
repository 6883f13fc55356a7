use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use rail_link_core::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, warn};

pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr).await.with_context(|| format!("bind {}", addr))
}

pub async fn connect(addr: &str, timeout: Duration) -> Result<FrameStream, LinkError> {
    let stream = match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(source)) => return Err(LinkError::Connect { addr: addr.to_string(), source }),
        Err(_) => return Err(LinkError::Timeout { op: "connect", after: timeout }),
    };
    Ok(FrameStream::new(stream)?)
}

/// A framed, bidirectional connection.
pub struct FrameStream {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
    out: BytesMut,
    peer: SocketAddr,
}

impl FrameStream {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self { reader, writer, decoder: FrameDecoder::new(), out: BytesMut::with_capacity(128), peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one frame, giving up after `budget`. A timed-out write may have
    /// left a partial frame on the wire, so the stream should be dropped.
    pub async fn send(&mut self, frame: &Frame, budget: Duration) -> Result<(), LinkError> {
        self.out.clear();
        encode(frame, &mut self.out);
        match time::timeout(budget, self.writer.write_all(&self.out)).await {
            Ok(res) => res.map_err(LinkError::from),
            Err(_) => Err(LinkError::Timeout { op: "send", after: budget }),
        }
    }

    /// Next decoded frame or protocol error; `Ok(None)` once the peer has closed.
    /// Cancel safe: partial input stays buffered in the decoder.
    pub async fn recv(&mut self) -> Result<Option<Result<Frame, ProtocolError>>, LinkError> {
        loop {
            if let Some(res) = self.decoder.decode_next() {
                return Ok(Some(res));
            }
            let n = self.reader.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                if self.decoder.pending() > 0 {
                    debug!(peer = %self.peer, bytes = self.decoder.pending(), "discarding partial frame at close");
                }
                return Ok(None);
            }
        }
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    Frame(Frame),
    Dropped(ProtocolError),
    Down(String),
}

/// Simulation side of the link. Fails open: every error moves the link to
/// `Down` and later calls become no-ops, so the control loop keeps running.
pub struct SimLink {
    stream: Option<FrameStream>,
    io_timeout: Duration,
}

impl SimLink {
    pub fn offline() -> Self {
        Self { stream: None, io_timeout: Duration::ZERO }
    }

    pub async fn connect(addr: &str, connect_timeout: Duration, io_timeout: Duration) -> Result<Self, LinkError> {
        let stream = connect(addr, connect_timeout).await?;
        info!(peer = %stream.peer(), "connected to evaluator");
        Ok(Self { stream: Some(stream), io_timeout })
    }

    pub fn status(&self) -> LinkStatus {
        if self.stream.is_some() {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        }
    }

    pub fn is_up(&self) -> bool {
        self.stream.is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.stream.as_ref().map(|s| s.peer())
    }

    /// `Err` only on the call that takes the link down; sending while down is a no-op.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), LinkError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        match stream.send(frame, self.io_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "link send failed, continuing locally");
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Waits for the next inbound event. Never resolves while the link is down.
    pub async fn recv(&mut self) -> LinkEvent {
        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };
        match stream.recv().await {
            Ok(Some(Ok(frame))) => LinkEvent::Frame(frame),
            Ok(Some(Err(e))) => {
                warn!(error = %e, "dropping malformed record from evaluator");
                LinkEvent::Dropped(e)
            }
            Ok(None) => {
                warn!("evaluator closed the link, continuing locally");
                self.stream = None;
                LinkEvent::Down(LinkError::Closed.to_string())
            }
            Err(e) => {
                warn!(error = %e, "link read failed, continuing locally");
                self.stream = None;
                LinkEvent::Down(e.to_string())
            }
        }
    }

    /// Half-closes the link and collects replies still in flight, for at most
    /// `linger`. The link is down afterwards.
    pub async fn close(&mut self, linger: Duration) -> Vec<Frame> {
        let Some(mut stream) = self.stream.take() else {
            return Vec::new();
        };
        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "link shutdown failed");
            return Vec::new();
        }
        let mut frames = Vec::new();
        let drain = async {
            while let Ok(Some(res)) = stream.recv().await {
                if let Ok(frame) = res {
                    frames.push(frame);
                }
            }
        };
        if time::timeout(linger, drain).await.is_err() {
            debug!(?linger, "stopped waiting for trailing replies");
        }
        frames
    }
}
