//! Devlink wire protocol - provisioning messages, framing and broker payloads

pub mod ble;
pub mod provision;
pub mod rpc;
pub mod topics;

pub use provision::{ProvisionRequest, ProvisionResponse, ServerData, TokenData};
pub use rpc::{RpcReply, TelemetryMessage};
pub use topics::Topics;

use std::io::{self, Read, Write};

// Frame types on the pairing link
pub const MSG_COMMAND: u16 = 0x0001;
pub const MSG_RESPONSE: u16 = 0x0002;

/// Largest payload accepted on the pairing link.
///
/// A BLE characteristic write is bounded by the negotiated MTU, so anything
/// bigger than a few kilobytes is a broken peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

/// Frame: wraps a provisioning message with type and length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u16, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn command(payload: Vec<u8>) -> Self {
        Self::new(MSG_COMMAND, payload)
    }

    pub fn response(response: &ProvisionResponse) -> Self {
        Self::new(MSG_RESPONSE, response.to_bytes())
    }

    /// Write frame to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let len = self.payload.len() as u32;
        writer.write_all(&self.msg_type.to_be_bytes())?;
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    /// Read frame from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut header = [0u8; 6];
        reader.read_exact(&mut header)?;

        let (msg_type, len) = parse_header(&header)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        Ok(Self { msg_type, payload })
    }
}

fn parse_header(header: &[u8; 6]) -> io::Result<(u16, usize)> {
    let msg_type = u16::from_be_bytes([header[0], header[1]]);
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }

    Ok((msg_type, len))
}

/// Async frame operations for tokio
#[cfg(feature = "async")]
pub mod async_io {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
        let len = frame.payload.len() as u32;
        writer.write_all(&frame.msg_type.to_be_bytes()).await?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&frame.payload).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
        let mut header = [0u8; 6];
        reader.read_exact(&mut header).await?;

        let (msg_type, len) = parse_header(&header)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(Frame { msg_type, payload })
    }
}
