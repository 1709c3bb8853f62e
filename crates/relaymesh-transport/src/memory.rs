//! In-process mailbox channel.
//!
//! A [`MemoryHub`] holds one FIFO mailbox per direction name. A
//! [`MemoryChannel`] reads from its inbound mailbox and writes to its
//! outbound one, so two channels with swapped names form a link. Used by
//! tests and by single-host deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::codec::ByteReader;
use crate::device::Channel;
use crate::{TransportError, TypeHash};

/// Registered name of the mailbox channel.
pub const MEMORY_CHANNEL: &str = "MemoryChannel";

/// Shared set of named mailboxes.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    mailboxes: Arc<Mutex<HashMap<String, VecDeque<Vec<u8>>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one message to `direction`.
    pub fn post(&self, direction: &str, data: Vec<u8>) {
        let mut boxes = self.mailboxes.lock().unwrap_or_else(|e| e.into_inner());
        boxes.entry(direction.to_string()).or_default().push_back(data);
    }

    /// Remove and return everything queued on `direction`.
    pub fn take(&self, direction: &str) -> Vec<Vec<u8>> {
        let mut boxes = self.mailboxes.lock().unwrap_or_else(|e| e.into_inner());
        boxes
            .get_mut(direction)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting on `direction`.
    pub fn pending(&self, direction: &str) -> usize {
        let boxes = self.mailboxes.lock().unwrap_or_else(|e| e.into_inner());
        boxes.get(direction).map_or(0, VecDeque::len)
    }

    /// Register [`MemoryChannel`] in `registry`, bound to this hub.
    pub fn register(&self, registry: &mut crate::InterfaceRegistry) -> TypeHash {
        let hub = self.clone();
        registry.register_channel(
            MEMORY_CHANNEL,
            json!({
                "create": {
                    "arguments": [
                        { "type": "string", "name": "Inbound direction" },
                        { "type": "string", "name": "Outbound direction" },
                        { "type": "uint32", "name": "Max message size", "optional": true }
                    ]
                }
            }),
            move |args| Ok(Box::new(MemoryChannel::from_args(hub.clone(), args)?) as Box<dyn Channel>),
        )
    }
}

/// Channel over two [`MemoryHub`] mailboxes.
#[derive(Debug)]
pub struct MemoryChannel {
    hub: MemoryHub,
    inbound: String,
    outbound: String,
    max_message_size: Option<usize>,
}

impl MemoryChannel {
    pub fn new(hub: MemoryHub, inbound: &str, outbound: &str) -> Self {
        Self {
            hub,
            inbound: inbound.to_string(),
            outbound: outbound.to_string(),
            max_message_size: None,
        }
    }

    /// Accept at most `bytes` per send, like a carrier with a hard size limit.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// Build from construction arguments `{inbound, outbound, [max size]}`.
    pub fn from_args(hub: MemoryHub, args: &[u8]) -> Result<Self, TransportError> {
        let mut reader = ByteReader::new(args);
        let parse = |e: TransportError| TransportError::Construction(format!("bad arguments: {e}"));
        let inbound = reader.read_string().map_err(parse)?;
        let outbound = reader.read_string().map_err(parse)?;
        if inbound.is_empty() || outbound.is_empty() {
            return Err(TransportError::Construction(
                "direction names must not be empty".into(),
            ));
        }
        let mut channel = Self::new(hub, &inbound, &outbound);
        if !reader.is_empty() {
            let max = reader.read_u32().map_err(parse)? as usize;
            if max > 0 {
                channel = channel.max_message_size(max);
            }
        }
        Ok(channel)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let len = self.max_message_size.map_or(data.len(), |m| m.min(data.len()));
        self.hub.post(&self.outbound, data[..len].to_vec());
        Ok(len)
    }

    async fn receive(&self) -> Result<Vec<Vec<u8>>, TransportError> {
        Ok(self.hub.take(&self.inbound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ByteWriter;

    #[tokio::test]
    async fn swapped_names_form_a_link() {
        let hub = MemoryHub::new();
        let a = MemoryChannel::new(hub.clone(), "a", "b");
        let b = MemoryChannel::new(hub.clone(), "b", "a");
        assert_eq!(a.send(b"ping").await.unwrap(), 4);
        assert_eq!(b.receive().await.unwrap(), vec![b"ping".to_vec()]);
        assert!(b.receive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn size_limit_truncates_and_reports() {
        let hub = MemoryHub::new();
        let a = MemoryChannel::new(hub.clone(), "a", "b").max_message_size(3);
        assert_eq!(a.send(b"abcdef").await.unwrap(), 3);
        assert_eq!(hub.take("b"), vec![b"abc".to_vec()]);
    }

    #[test]
    fn from_args_reads_optional_limit() {
        let mut w = ByteWriter::new();
        w.write_str("in").write_str("out").write_u32(64);
        let ch = MemoryChannel::from_args(MemoryHub::new(), &w.into_vec()).unwrap();
        assert_eq!(ch.max_message_size, Some(64));
        assert_eq!(ch.inbound, "in");
    }

    #[test]
    fn from_args_rejects_garbage() {
        let err = MemoryChannel::from_args(MemoryHub::new(), &[1, 2]).unwrap_err();
        assert!(matches!(err, TransportError::Construction(_)));
    }
}
