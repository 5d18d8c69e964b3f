//! Link transport: service handshake on fresh sockets, then one read loop and one writer per link.

use std::net::SocketAddr;
use std::time::Duration;

use natter_core::wire::{decode_frame, encode_frame};
use natter_core::{ChatFrame, FrameDecoder, Hello, LinkError, LinkId, MessageId, PeerAddress};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const LEN_SIZE: usize = 4;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HELLO_LEN: u32 = 1024;
const READ_CHUNK: usize = 4096;

/// Open a TCP link to `addr` and check it is `expected`'s natter service.
pub async fn connect(
    addr: SocketAddr,
    own: &PeerAddress,
    expected: &PeerAddress,
) -> Result<TcpStream, LinkError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| LinkError::from_connect_io(&e))?;
    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        write_hello(&mut stream, own).await?;
        read_hello(&mut stream).await
    })
    .await
    .map_err(|_| LinkError::ConnectTimeout)??;
    if &hello.address != expected {
        return Err(LinkError::ConnectRejected(format!(
            "{} answered as {}",
            addr, hello.address
        )));
    }
    Ok(stream)
}

/// Server side of the handshake: read the caller's hello, answer with ours.
pub async fn handshake_accept(
    stream: &mut TcpStream,
    own: &PeerAddress,
) -> Result<PeerAddress, LinkError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let hello = read_hello(stream).await?;
        write_hello(stream, own).await?;
        Ok(hello.address)
    })
    .await
    .map_err(|_| LinkError::ConnectTimeout)?
}

async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W, own: &PeerAddress) -> Result<(), LinkError> {
    let frame = encode_frame(&Hello::new(own.clone()))
        .map_err(|e| LinkError::Framing(e.to_string()))?;
    w.write_all(&frame).await.map_err(|e| LinkError::from_io(&e))?;
    w.flush().await.map_err(|e| LinkError::from_io(&e))
}

async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<Hello, LinkError> {
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|e| LinkError::ConnectRejected(format!("no handshake: {}", e)))?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_HELLO_LEN {
        return Err(LinkError::ConnectRejected("oversized handshake".into()));
    }
    let mut buf = vec![0u8; LEN_SIZE + len as usize];
    buf[..LEN_SIZE].copy_from_slice(&len_buf);
    r.read_exact(&mut buf[LEN_SIZE..])
        .await
        .map_err(|e| LinkError::ConnectRejected(format!("truncated handshake: {}", e)))?;
    let (hello, _) = decode_frame::<Hello>(&buf, MAX_HELLO_LEN)
        .map_err(|e| LinkError::ConnectRejected(format!("bad handshake: {}", e)))?;
    if !hello.is_compatible() {
        return Err(LinkError::ConnectRejected(format!(
            "{} does not speak this service (v{})",
            hello.address, hello.protocol_version
        )));
    }
    Ok(hello)
}

/// What a link task reports back to the service loop.
#[derive(Debug)]
pub enum LinkReport {
    Frame {
        peer: PeerAddress,
        link: LinkId,
        frame: ChatFrame,
    },
    Written {
        peer: PeerAddress,
        id: MessageId,
        result: Result<(), LinkError>,
    },
    Down {
        peer: PeerAddress,
        link: LinkId,
        reason: LinkError,
    },
}

/// One frame queued for the writer.
#[derive(Debug)]
pub struct OutboundFrame {
    pub id: MessageId,
    pub bytes: Vec<u8>,
}

/// Read until error or end-of-stream, reporting frames in stream order. Always ends with `Down`.
pub async fn read_loop<R, F>(
    peer: PeerAddress,
    link: LinkId,
    mut reader: R,
    max_frame_len: u32,
    report: F,
) where
    R: AsyncRead + Unpin,
    F: Fn(LinkReport) -> bool,
{
    let mut decoder = FrameDecoder::with_max_len(max_frame_len);
    let mut buf = vec![0u8; READ_CHUNK];
    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break LinkError::SocketIo("peer closed the link".into()),
            Ok(n) => n,
            Err(e) => break LinkError::from_io(&e),
        };
        match decoder.feed(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    log::debug!("Frame from {} ({} bytes of body)", peer, frame.body.len());
                    if !report(LinkReport::Frame {
                        peer: peer.clone(),
                        link,
                        frame,
                    }) {
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("Dropping link to {}: {}", peer, e);
                break LinkError::Framing(e.to_string());
            }
        }
    };
    report(LinkReport::Down { peer, link, reason });
}

/// Write queued frames one at a time so frames never interleave. Each write is bounded by
/// `write_timeout`; the first failure reports `Down` and stops the writer.
pub async fn write_loop<W, F>(
    peer: PeerAddress,
    link: LinkId,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<OutboundFrame>,
    write_timeout: Duration,
    report: F,
) where
    W: AsyncWrite + Unpin,
    F: Fn(LinkReport) -> bool,
{
    while let Some(out) = queue.recv().await {
        let result = match tokio::time::timeout(write_timeout, async {
            writer.write_all(&out.bytes).await?;
            writer.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::from_io(&e)),
            Err(_) => Err(LinkError::SocketIo("write timed out".into())),
        };
        let failed = result.clone().err();
        report(LinkReport::Written {
            peer: peer.clone(),
            id: out.id,
            result,
        });
        if let Some(reason) = failed {
            log::warn!("Write to {} failed: {}", peer, reason);
            report(LinkReport::Down { peer, link, reason });
            return;
        }
    }
    let _ = writer.shutdown().await;
}
