//! Companion-app side of the pairing link

use anyhow::{Context, bail};
use devlink_proto::async_io::{read_frame, write_frame};
use devlink_proto::{Frame, MSG_RESPONSE, ProvisionResponse};
use log::*;
use tokio::net::TcpStream;

/// One pairing session with a device listening on `addr`
pub struct Companion {
    stream: TcpStream,
}

impl Companion {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {}", addr))?;
        info!("Connected to device at {}", addr);
        Ok(Self { stream })
    }

    /// Send one message and wait for its response
    pub async fn request(&mut self, message: Vec<u8>) -> anyhow::Result<ProvisionResponse> {
        debug!("-> {}", String::from_utf8_lossy(&message));
        write_frame(&mut self.stream, &Frame::command(message)).await?;

        let frame = read_frame(&mut self.stream).await.context("waiting for response")?;
        if frame.msg_type != MSG_RESPONSE {
            bail!("unexpected frame type {:#06x}", frame.msg_type);
        }
        let response = ProvisionResponse::from_bytes(&frame.payload)?;
        debug!("<- {}", String::from_utf8_lossy(&frame.payload));
        Ok(response)
    }
}
