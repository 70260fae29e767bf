//! Framed-TCP client side of the transport.

use crate::error::{Error, NetworkError, Result};
use crate::network::msg::{decode_message, frame_message, ControlMsg, MAX_FRAME_SIZE};
use crate::network::transport::Transport;
use crate::types::Snode;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// One-shot connection-per-call TCP transport.
///
/// Control-plane exchanges are small and infrequent enough that a connection
/// pool buys little; keepalive across calls rides on the OS socket layer.
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    async fn exchange(addr: String, msg: &ControlMsg) -> Result<ControlMsg> {
        let mut stream = TcpStream::connect(&addr).await.map_err(|e| {
            Error::Network(NetworkError::ConnectionFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            })
        })?;
        stream.set_nodelay(true).ok();

        let framed = frame_message(msg)?;
        stream.write_all(&framed).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|_| Error::Network(NetworkError::ConnectionClosed))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(NetworkError::BadFrame(format!("frame of {len} bytes")).into());
        }
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|_| Error::Network(NetworkError::ConnectionClosed))?;
        decode_message(&body)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, dst: &Snode, msg: ControlMsg, timeout: Duration) -> Result<ControlMsg> {
        let addr = dst.control_net.to_addr_string();
        match tokio::time::timeout(timeout, Self::exchange(addr, &msg)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        }
    }
}
