//! Framed-TCP server for intra-cluster control traffic.

use crate::error::{NetworkError, Result};
use crate::network::msg::{decode_message, frame_message, ControlMsg, MAX_FRAME_SIZE};
use crate::network::transport::MsgHandler;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// TCP listener serving [`ControlMsg`] request/reply exchanges.
///
/// One task per connection; a connection may carry any number of sequential
/// exchanges. Shutdown is cooperative through the [`CancellationToken`].
pub struct ControlServer {
    bind_addr: SocketAddr,
    handler: Arc<dyn MsgHandler>,
    cancel: CancellationToken,
    active_connections: Arc<AtomicUsize>,
}

impl ControlServer {
    /// Create a server; `run()` starts accepting.
    pub fn new(bind_addr: SocketAddr, handler: Arc<dyn MsgHandler>) -> Self {
        Self {
            bind_addr,
            handler,
            cancel: CancellationToken::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Token that stops the accept loop and all connection handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of currently open connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Bind and serve until cancelled. The bound address is reported through
    /// `on_bound` (useful with port 0).
    pub async fn run(self, on_bound: impl FnOnce(SocketAddr)) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local = listener.local_addr()?;
        on_bound(local);
        info!(addr = %local, "control server listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(addr = %local, "control server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(peer = %peer_addr, "accepted connection");
                    let handler = self.handler.clone();
                    let cancel = self.cancel.clone();
                    let active = self.active_connections.clone();
                    active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let res = handle_connection(stream, handler, cancel).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        if let Err(e) = res {
                            debug!(peer = %peer_addr, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn MsgHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = read_frame(&mut stream) => match msg? {
                Some(m) => m,
                None => return Ok(()), // clean EOF
            },
        };
        let reply = handler.handle(msg).await;
        write_frame(&mut stream, &reply).await?;
    }
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF before a frame.
pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<Option<ControlMsg>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::BadFrame(format!("frame of {len} bytes")).into());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(decode_message(&body)?))
}

pub(crate) async fn write_frame(stream: &mut TcpStream, msg: &ControlMsg) -> Result<()> {
    let framed = frame_message(msg)?;
    stream.write_all(&framed).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::Transport;
    use crate::network::TcpTransport;
    use crate::types::{NetAddr, NodeRole, Snode};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Pong;

    #[async_trait]
    impl MsgHandler for Pong {
        async fn handle(&self, _msg: ControlMsg) -> ControlMsg {
            ControlMsg::Ok
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let server = ControlServer::new("127.0.0.1:0".parse().unwrap(), Arc::new(Pong));
        let cancel = server.cancellation_token();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            server
                .run(|addr| {
                    let _ = tx.send(addr);
                })
                .await
                .unwrap();
        });
        let addr = rx.await.unwrap();

        let dst = Snode::new(
            "t1",
            NodeRole::Target,
            NetAddr::new(addr.ip().to_string(), addr.port()),
        );
        let tp = TcpTransport::new();
        let reply = tp
            .call(
                &dst,
                ControlMsg::Health { reb_status: false },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(reply, ControlMsg::Ok));
        cancel.cancel();
    }
}
