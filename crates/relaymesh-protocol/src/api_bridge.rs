//! Encrypted operator sessions over TCP.
//!
//! Each connection starts with an X25519 exchange in which the Gateway is
//! the client: it sends its ephemeral public key, reads the operator's, and
//! derives the session keys. Every later frame is u32 big-endian length
//! prefixed and encrypted with those keys. The first frame the Gateway sends
//! announces its interface capability.

use std::net::SocketAddr;
use std::sync::Arc;

use relaymesh_transport::{read_framed, write_framed, DEFAULT_MAX_FRAME_SIZE};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::crypto::{
    client_session_keys, decrypt_session, encrypt_session, generate_exchange_keys,
    ExchangePublicKey, SessionKeys,
};
use crate::gate::GateRelay;
use crate::ProtocolError;

type SharedWriter<S> = Arc<Mutex<WriteHalf<S>>>;

#[derive(Debug)]
pub struct ApiBridge {
    listener: TcpListener,
}

impl ApiBridge {
    /// Bind the operator listener. Failing here is fatal for the daemon.
    pub async fn bind(address: &str) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(address).await?;
        tracing::info!(address = %listener.local_addr()?, "api bridge listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept operator connections until `cancel` fires, then wait for
    /// every open session to wind down.
    pub async fn serve(self, gate: Arc<GateRelay>, cancel: CancellationToken) {
        let sessions = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(peer = %peer, "operator connected");
                        let gate = gate.clone();
                        let cancel = cancel.child_token();
                        sessions.spawn(async move {
                            match run_session(stream, gate, cancel).await {
                                Ok(()) => tracing::info!(peer = %peer, "operator disconnected"),
                                Err(e) => e.report("operator session failed", None),
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to accept operator connection"),
                },
            }
        }
        sessions.close();
        sessions.wait().await;
    }
}

/// Drive one operator session on an already connected stream.
pub async fn run_session<S>(
    stream: S,
    gate: Arc<GateRelay>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer: SharedWriter<S> = Arc::new(Mutex::new(writer));

    let (private, public) = generate_exchange_keys();
    write_framed(&mut *writer.lock().await, public.as_bytes()).await?;
    let peer = read_framed(&mut reader, ExchangePublicKey::SIZE)
        .await?
        .ok_or_else(|| ProtocolError::routing("operator left during key exchange"))?;
    let peer = ExchangePublicKey::from_slice(&peer)?;
    let keys = Arc::new(client_session_keys(&private, &public, &peer)?);

    let capability = json!({
        "MessageType": "GetCapability",
        "MessageData": gate.core().registry().capability(),
    });
    send_json(&writer, &keys, &capability).await?;

    let mut handlers = JoinSet::new();
    let result = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = read_framed(&mut reader, DEFAULT_MAX_FRAME_SIZE) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(ProtocolError::from(e)),
        };
        while handlers.try_join_next().is_some() {}

        let gate = gate.clone();
        let writer = writer.clone();
        let keys = keys.clone();
        handlers.spawn(async move {
            if let Err(e) = handle_frame(&gate, &writer, &keys, &frame).await {
                e.report("operator frame dropped", None);
            }
        });
    };
    while handlers.join_next().await.is_some() {}
    result
}

async fn handle_frame<S>(
    gate: &GateRelay,
    writer: &SharedWriter<S>,
    keys: &SessionKeys,
    frame: &[u8],
) -> Result<(), ProtocolError>
where
    S: AsyncWrite,
{
    let plaintext = decrypt_session(frame, &keys.rx)?;
    let message: Value = serde_json::from_slice(&plaintext)
        .map_err(|e| ProtocolError::Parse(format!("operator frame is not JSON: {e}")))?;
    if let Some(response) = gate.handle_operator_message(message).await {
        send_json(writer, keys, &response).await?;
    }
    Ok(())
}

async fn send_json<S>(
    writer: &SharedWriter<S>,
    keys: &SessionKeys,
    message: &Value,
) -> Result<(), ProtocolError>
where
    S: AsyncWrite,
{
    let frame = encrypt_session(&serde_json::to_vec(message)?, &keys.tx)?;
    write_framed(&mut *writer.lock().await, &frame).await?;
    Ok(())
}
