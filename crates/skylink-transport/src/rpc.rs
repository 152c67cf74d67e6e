//! Alternate transport: request/response RPC records over a framed stream.
//!
//! Each envelope is wrapped in a call record keyed by a monotonically
//! increasing id:
//!
//! ```text
//! → {"id": 7, "method": "auth", "params": {"type": "auth", ...}}
//! ← {"id": 7, "result": {"type": "auth_response", ...}}
//! ← {"id": 7, "error": {"code": 16, "message": "token revoked"}}
//! ```

use crate::datagram::resolve;
use crate::envelope::Envelope;
use crate::framing::{read_frame, write_frame};
use crate::link::{Link, LinkSlot};
use crate::transport::{
    StatsCounter, TransportClient, TransportError, TransportKind, TransportResult, TransportStats,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

/// Outgoing call record
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Call id
    pub id: u64,
    /// Envelope type of `params`
    pub method: String,
    /// Request envelope
    pub params: Envelope,
}

/// Error half of a reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Status code
    pub code: i32,
    /// Relay message
    pub message: String,
}

/// Reply record
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Call id being answered
    pub id: u64,
    /// Response envelope on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Envelope>,
    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// RPC transport to the relay's API port
pub struct RpcTransport {
    relay: String,
    connect_timeout: Duration,
    next_id: AtomicU64,
    link: LinkSlot<TcpStream>,
    stats: StatsCounter,
}

impl RpcTransport {
    /// Transport targeting `relay` (`host:port`)
    pub fn new(relay: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            relay: relay.into(),
            connect_timeout,
            next_id: AtomicU64::new(1),
            link: LinkSlot::default(),
            stats: StatsCounter::default(),
        }
    }

    async fn call(&self, stream: &mut TcpStream, request: Envelope) -> TransportResult<Envelope> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = RpcRequest {
            id,
            method: request.message_type().to_string(),
            params: request,
        };
        let payload =
            serde_json::to_vec(&record).map_err(|e| TransportError::Codec(e.to_string().into()))?;
        write_frame(stream, &payload).await?;
        self.stats.record_send(payload.len());

        let frame = read_frame(stream).await?;
        self.stats.record_recv(frame.len());
        let reply: RpcResponse = serde_json::from_slice(&frame)
            .map_err(|e| TransportError::Codec(e.to_string().into()))?;

        if reply.id != id {
            return Err(TransportError::UnexpectedResponse {
                expected: "matching call id",
                actual: format!("id {}", reply.id),
            });
        }
        match (reply.result, reply.error) {
            (_, Some(err)) => Err(TransportError::Relay(err.message)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(TransportError::Codec("reply has neither result nor error".into())),
        }
    }
}

#[async_trait]
impl TransportClient for RpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rpc
    }

    async fn connect(&self) -> TransportResult<()> {
        self.link.ensure_disconnected()?;

        let peer = resolve(&self.relay, self.connect_timeout).await?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                deadline: self.connect_timeout,
            })?
            .map_err(|e| TransportError::ConnectionFailed(format!("dial {peer}: {e}").into()))?;
        stream.set_nodelay(true)?;

        self.link.install(Link::new(stream, peer)).await?;
        tracing::debug!(relay = %peer, "rpc transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if let Some(link) = self.link.take().await {
            tracing::debug!(relay = %link.peer, "rpc transport disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    async fn exchange(&self, request: Envelope, deadline: Duration) -> TransportResult<Envelope> {
        let link = self.link.current().await?;
        let operation = request.message_type();
        let on_wire = AtomicBool::new(false);
        let result = link
            .bounded(operation, deadline, async {
                let mut stream = link.io.lock().await;
                on_wire.store(true, Ordering::Relaxed);
                self.call(&mut stream, request).await
            })
            .await;

        if let Err(e) = &result {
            self.stats.record_error();
            // a reply for another call id means an earlier reply is still queued
            let stale = e.desyncs_stream() || matches!(e, TransportError::UnexpectedResponse { .. });
            if on_wire.load(Ordering::Relaxed) && stale && self.link.retire(&link).await {
                tracing::debug!(relay = %link.peer, error = %e, "rpc stream out of step, dropped");
            }
        }
        result
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serves calls with `answer`, echoing ids unless `wrong_id` is set
    async fn rpc_relay(
        answer: fn(&Envelope) -> RpcResponse,
        wrong_id: bool,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(frame) = read_frame(&mut stream).await {
                let call: RpcRequest = serde_json::from_slice(&frame).unwrap();
                assert_eq!(call.method, call.params.message_type());
                let mut reply = answer(&call.params);
                reply.id = if wrong_id { call.id + 100 } else { call.id };
                write_frame(&mut stream, &serde_json::to_vec(&reply).unwrap())
                    .await
                    .unwrap();
            }
        });
        addr
    }

    fn ok_answers(req: &Envelope) -> RpcResponse {
        let result = match req {
            Envelope::Hello { .. } => Envelope::HelloResponse {
                status: Some("ok".into()),
                server_version: Some("1.0".into()),
                features: vec![],
                session_id: Some("s-1".into()),
                error: None,
            },
            Envelope::TunnelInfo { tunnel_id, .. } => Envelope::TunnelResponse {
                status: Some("ok".into()),
                tunnel_id: Some(tunnel_id.clone()),
                endpoint: Some("relay:7000".into()),
                error: None,
            },
            _ => {
                return RpcResponse {
                    id: 0,
                    result: None,
                    error: Some(RpcError {
                        code: 16,
                        message: "token revoked".into(),
                    }),
                };
            }
        };
        RpcResponse {
            id: 0,
            result: Some(result),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_calls_round_trip() {
        let addr = rpc_relay(ok_answers, false).await;
        let transport = RpcTransport::new(addr, Duration::from_secs(1));
        transport.connect().await.unwrap();

        let hello = transport.hello("1.0", &[]).await.unwrap();
        assert_eq!(hello.session_id.as_deref(), Some("s-1"));

        let tunnel = transport
            .create_tunnel("t1", "acme", 8080, "example.org", 80)
            .await
            .unwrap();
        assert!(tunnel.is_ok());
        assert_eq!(tunnel.tunnel_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_error_reply_carries_message() {
        let addr = rpc_relay(ok_answers, false).await;
        let transport = RpcTransport::new(addr, Duration::from_secs(1));
        transport.connect().await.unwrap();

        let err = transport.authenticate("tok", "svc").await.unwrap_err();
        assert!(matches!(err, TransportError::Relay(m) if m == "token revoked"));
    }

    #[tokio::test]
    async fn test_mismatched_call_id() {
        let addr = rpc_relay(ok_answers, true).await;
        let transport = RpcTransport::new(addr, Duration::from_secs(1));
        transport.connect().await.unwrap();

        assert!(matches!(
            transport.hello("1.0", &[]).await,
            Err(TransportError::UnexpectedResponse { .. })
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_late_reply_never_answers_next_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut late = true;
            while let Ok((mut stream, _)) = listener.accept().await {
                let delay = std::mem::take(&mut late);
                while let Ok(frame) = read_frame(&mut stream).await {
                    if delay {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    let call: RpcRequest = serde_json::from_slice(&frame).unwrap();
                    let mut reply = ok_answers(&call.params);
                    reply.id = call.id;
                    if write_frame(&mut stream, &serde_json::to_vec(&reply).unwrap())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        let transport = RpcTransport::new(addr, Duration::from_secs(1));
        transport.connect().await.unwrap();
        let err = transport.probe(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }), "{err}");
        assert!(!transport.is_connected());

        tokio::time::sleep(Duration::from_millis(300)).await;
        transport.connect().await.unwrap();
        let tunnel = transport
            .create_tunnel("t1", "acme", 8080, "example.org", 80)
            .await
            .unwrap();
        assert_eq!(tunnel.tunnel_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_refused_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = RpcTransport::new(addr, Duration::from_secs(1));
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!transport.is_connected());
    }
}
