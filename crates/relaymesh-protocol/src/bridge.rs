//! Per-device runtime.
//!
//! A [`DeviceBridge`] owns one attached [`Device`], polls it on a jittered
//! interval from its own task, reassembles channel chunks through
//! [`QualityOfService`] and hands complete packets to its [`BridgeOwner`].
//! Sends may come from any task; a write lock keeps the chunks of one packet
//! contiguous on the wire.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use relaymesh_transport::{ByteWriter, Device, QualityOfService, TypeHash};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::identifiers::DeviceId;
use crate::procedures::command::{self, Command, JitterArgs, MIN_JITTER_SECONDS};
use crate::ProtocolError;

// ── Jitter ──────────────────────────────────────────────────────────

/// Poll interval bounds. Each wait is sampled uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min: Duration,
    max: Duration,
}

impl Default for Jitter {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Jitter {
    pub const MIN: Duration = Duration::from_millis(30);
    pub const DEFAULT: Jitter = Jitter {
        min: Duration::from_millis(30),
        max: Duration::from_millis(100),
    };

    pub fn new(min: Duration, max: Duration) -> Result<Self, ProtocolError> {
        if min < Self::MIN || min > max {
            return Err(ProtocolError::Config(format!(
                "jitter [{min:?}, {max:?}] must satisfy {:?} <= min <= max",
                Self::MIN
            )));
        }
        Ok(Self { min, max })
    }

    /// Bounds as sent by `UpdateJitter`, in seconds. Kept to the millisecond.
    pub fn from_seconds(min: f32, max: f32) -> Result<Self, ProtocolError> {
        if !(min >= MIN_JITTER_SECONDS && min <= max && max.is_finite()) {
            return Err(ProtocolError::Parse(format!("invalid jitter [{min}, {max}]")));
        }
        let millis = |s: f32| Duration::from_millis((f64::from(s) * 1000.0).round() as u64);
        Ok(Self {
            min: millis(min),
            max: millis(max),
        })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }
}

// ── Negotiation metadata ────────────────────────────────────────────

/// Part a negotiation-capable channel plays in the identifier exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Plain channel.
    None,
    /// Starts the exchange (a joining relay).
    Client,
    /// Answers Step1 (a relay accepting joiners).
    Server,
}

/// Input/output identifiers of a channel plus its remaining parameters.
///
/// Construction arguments of such a channel are
/// `{input, output} ++ parameters`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelIds {
    pub input: String,
    pub output: String,
    pub parameters: Vec<u8>,
}

impl ChannelIds {
    pub fn to_args(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_str(&self.input)
            .write_str(&self.output)
            .write_raw(&self.parameters);
        w.into_vec()
    }
}

// ── Owner seam ──────────────────────────────────────────────────────

/// What a bridge reports to. Implemented by the concrete relays.
#[async_trait]
pub trait BridgeOwner: Send + Sync {
    /// A complete packet arrived on `bridge`. Still envelope-encrypted.
    async fn on_packet(&self, packet: Vec<u8>, bridge: Arc<DeviceBridge>);

    /// A peripheral produced output for its connector.
    async fn on_peripheral_output(&self, data: Vec<u8>, bridge: Arc<DeviceBridge>);

    async fn detach_device(&self, did: DeviceId) -> Result<(), ProtocolError>;
}

// ── DeviceBridge ────────────────────────────────────────────────────

/// Everything a relay decided about a device before attaching it.
pub(crate) struct BridgeParts {
    pub did: DeviceId,
    pub type_hash: TypeHash,
    pub device: Device,
    pub args: Vec<u8>,
    pub role: NegotiationRole,
    pub ids: Option<ChannelIds>,
    pub jitter: Jitter,
    pub chunk_limit: Option<usize>,
}

pub struct DeviceBridge {
    did: DeviceId,
    type_hash: TypeHash,
    device: Device,
    args: Vec<u8>,
    role: NegotiationRole,
    ids: Option<ChannelIds>,
    chunk_limit: Option<usize>,
    jitter: Mutex<Jitter>,
    qos: Mutex<QualityOfService>,
    write_lock: Mutex<()>,
    error_status: Mutex<String>,
    cancel: CancellationToken,
    owner: Weak<dyn BridgeOwner>,
}

impl std::fmt::Debug for DeviceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBridge")
            .field("did", &self.did)
            .field("type_hash", &format_args!("{:08x}", self.type_hash))
            .field("device", &self.device)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DeviceBridge {
    pub(crate) fn new(parts: BridgeParts, cancel: CancellationToken, owner: Weak<dyn BridgeOwner>) -> Self {
        Self {
            did: parts.did,
            type_hash: parts.type_hash,
            device: parts.device,
            args: parts.args,
            role: parts.role,
            ids: parts.ids,
            chunk_limit: parts.chunk_limit,
            jitter: Mutex::new(parts.jitter),
            qos: Mutex::new(QualityOfService::new()),
            write_lock: Mutex::new(()),
            error_status: Mutex::new(String::new()),
            cancel,
            owner,
        }
    }

    pub fn did(&self) -> DeviceId {
        self.did
    }

    pub fn type_hash(&self) -> TypeHash {
        self.type_hash
    }

    pub fn is_channel(&self) -> bool {
        self.device.is_channel()
    }

    pub fn is_negotiation(&self) -> bool {
        self.role != NegotiationRole::None
    }

    pub fn negotiation_role(&self) -> NegotiationRole {
        self.role
    }

    /// Identifiers of a negotiation or negotiated channel.
    pub fn channel_ids(&self) -> Option<&ChannelIds> {
        self.ids.as_ref()
    }

    /// Arguments the device was constructed with.
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    pub async fn jitter(&self) -> Jitter {
        *self.jitter.lock().await
    }

    pub async fn set_jitter(&self, jitter: Jitter) {
        *self.jitter.lock().await = jitter;
    }

    /// Last poll failure, empty while healthy.
    pub async fn error_status(&self) -> String {
        self.error_status.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the poll loop at its next boundary. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn closed_error(&self) -> ProtocolError {
        ProtocolError::routing(format!("device {} is detached", self.did))
    }

    /// Send one packet, fragmenting it to whatever the channel accepts.
    pub async fn send(&self, packet: Vec<u8>) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let Device::Channel(channel) = &self.device else {
            return Err(ProtocolError::routing(format!(
                "device {} is not a channel",
                self.did
            )));
        };

        let _write = self.write_lock.lock().await;
        let mut splitter = self.qos.lock().await.splitter(packet);
        while splitter.has_more() {
            let chunk = splitter.next_chunk(self.chunk_limit);
            let sent = channel.send(&chunk).await?;
            splitter.update(sent)?;
        }
        Ok(())
    }

    /// One poll iteration: drain the channel or the peripheral.
    pub async fn poll_once(self: &Arc<Self>) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let Some(owner) = self.owner.upgrade() else {
            self.close();
            return Err(ProtocolError::routing("relay is gone"));
        };

        match &self.device {
            Device::Channel(channel) => {
                for chunk in channel.receive().await? {
                    let pushed = self.qos.lock().await.push_received(&chunk);
                    match pushed {
                        Ok(Some(packet)) => owner.on_packet(packet, Arc::clone(self)).await,
                        Ok(None) => {}
                        Err(e) => ProtocolError::from(e).report("dropped chunk", Some(self.did)),
                    }
                }
            }
            Device::Peripheral(peripheral) => {
                let output = peripheral.on_receive_from_peripheral().await?;
                if !output.is_empty() {
                    owner.on_peripheral_output(output, Arc::clone(self)).await;
                }
            }
        }
        Ok(())
    }

    /// Poll until closed.
    pub(crate) async fn run(self: Arc<Self>) {
        tracing::debug!(device = %self.did, "device loop started");
        loop {
            let delay = self.jitter.lock().await.sample();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.poll_once().await {
                Ok(()) => {}
                Err(_) if self.is_closed() => break,
                Err(e) => {
                    *self.error_status.lock().await = e.to_string();
                    e.report("device poll failed", Some(self.did));
                }
            }
        }
        tracing::debug!(device = %self.did, "device loop stopped");
    }

    /// `Close` and `UpdateJitter` are handled here, anything else goes to
    /// the device itself.
    pub async fn run_command(&self, command: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let (id, args) = command::split(command)?;
        match Command::try_from(id) {
            Ok(Command::Close) => {
                let owner = self
                    .owner
                    .upgrade()
                    .ok_or_else(|| ProtocolError::routing("relay is gone"))?;
                owner.detach_device(self.did).await?;
                Ok(Vec::new())
            }
            Ok(Command::UpdateJitter) => {
                let JitterArgs { min, max } = JitterArgs::parse(args)?;
                self.set_jitter(Jitter::from_seconds(min, max)?).await;
                tracing::debug!(device = %self.did, min, max, "jitter updated");
                Ok(Vec::new())
            }
            _ => Ok(self.device.run_command(command).await?),
        }
    }

    /// Connector input for a peripheral.
    pub async fn on_command_from_connector(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        match &self.device {
            Device::Peripheral(peripheral) => Ok(peripheral.on_command_from_connector(data).await?),
            Device::Channel(_) => Err(ProtocolError::violation(format!(
                "device {} is a channel, not a peripheral",
                self.did
            ))),
        }
    }
}
