//! One-shot probes against an alt-server: connect, `SELECT_IMAGE`,
//! `GET_BLOCK`, measure elapsed time. Used by the background loop's normal
//! and panic-mode probing rounds.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dnbd3_proto::{Command, Host, ReplyHeader, RequestHeader, SelectImageReply, SelectImageRequest};
use dnbd3_transport::SocketPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;

/// What payload a probe's `GET_BLOCK` should carry: either a throwaway
/// single-block read, or the actual range of a starving pending request so
/// a successful probe can satisfy the caller directly.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbePayload {
    pub offset: u64,
    pub length: u32,
    pub handle: u64,
}

impl ProbePayload {
    pub fn dummy(handle: u64) -> Self {
        ProbePayload {
            offset: 0,
            length: dnbd3_proto::BLOCK_SIZE as u32,
            handle,
        }
    }
}

/// Result of a successful probe.
pub(crate) struct ProbeSuccess {
    pub elapsed: Duration,
    pub stream: TcpStream,
    pub data: Bytes,
}

/// Connects to `host`, performs the handshake, and issues one `GET_BLOCK`
/// using `payload`. On success, the connection is left open (and returned)
/// so the background loop can promote the winning probe straight to the
/// live socket without reconnecting.
pub(crate) async fn probe(
    host: Host,
    image_name: &str,
    expected_rid: u16,
    expected_size: u64,
    connect_timeout: Duration,
    payload: ProbePayload,
) -> Result<ProbeSuccess, Error> {
    let pool = SocketPool::new();
    let (mut stream, _) = pool.connect_any(&[host], connect_timeout, connect_timeout).await?;

    let start = Instant::now();

    let request = SelectImageRequest::new(image_name, expected_rid, 0)?;
    {
        use binrw::BinWrite;
        let mut buf = std::io::Cursor::new(Vec::new());
        request.write(&mut buf)?;
        stream.write_all(&buf.into_inner()).await?;
    }

    let reply_header = read_reply_header(&mut stream).await?;
    if reply_header.cmd == Command::Error {
        return Err(Error::ImageUnavailable(format!("{host} rejected SELECT_IMAGE")));
    }
    let mut payload_buf = vec![0u8; reply_header.size as usize];
    stream.read_exact(&mut payload_buf).await?;
    let reply = {
        use binrw::BinRead;
        SelectImageReply::read(&mut std::io::Cursor::new(&payload_buf))?
    };
    if reply.name() != image_name
        || (expected_rid != 0 && reply.rid != expected_rid)
        || reply.size != expected_size
    {
        return Err(Error::ImageUnavailable(format!(
            "{host} geometry mismatch: name={} rid={} size={}",
            reply.name(),
            reply.rid,
            reply.size
        )));
    }

    let get_block = RequestHeader::new(Command::GetBlock, payload.offset, payload.length, 0, payload.handle);
    {
        use binrw::BinWrite;
        let mut buf = std::io::Cursor::new(Vec::new());
        get_block.write(&mut buf)?;
        stream.write_all(&buf.into_inner()).await?;
    }

    let block_header = read_reply_header(&mut stream).await?;
    if block_header.cmd != Command::GetBlock || block_header.handle != payload.handle {
        return Err(Error::HandshakeFailed(format!("{host} probe GET_BLOCK reply mismatch")));
    }
    let mut data = BytesMut::zeroed(block_header.size as usize);
    stream.read_exact(&mut data).await?;

    Ok(ProbeSuccess {
        elapsed: start.elapsed(),
        stream,
        data: data.freeze(),
    })
}

async fn read_reply_header(stream: &mut TcpStream) -> Result<ReplyHeader, Error> {
    let mut buf = [0u8; ReplyHeader::STRUCT_SIZE];
    stream.read_exact(&mut buf).await?;
    use binrw::BinRead;
    let header = ReplyHeader::read(&mut std::io::Cursor::new(&buf))?;
    header.check_magic()?;
    Ok(header)
}
