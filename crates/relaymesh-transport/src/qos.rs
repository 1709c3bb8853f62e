//! Chunk fragmentation and reassembly for size-limited transports.
//!
//! Every chunk on the wire is `[packet_id:u32][chunk_id:u32][expected_size:u32]`
//! followed by payload bytes. The receiving side accumulates chunks per
//! `packet_id` until the payload bytes add up to `expected_size`.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::codec::{ByteReader, ByteWriter};
use crate::TransportError;

/// Size of the chunk header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Incomplete packets older than this are dropped on the next push.
pub const DEFAULT_MAX_PACKET_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkHeader {
    packet_id: u32,
    chunk_id: u32,
    expected_size: u32,
}

impl ChunkHeader {
    fn parse(reader: &mut ByteReader<'_>) -> Result<Self, TransportError> {
        Ok(Self {
            packet_id: reader.read_u32()?,
            chunk_id: reader.read_u32()?,
            expected_size: reader.read_u32()?,
        })
    }

    fn write(&self, writer: &mut ByteWriter) {
        writer
            .write_u32(self.packet_id)
            .write_u32(self.chunk_id)
            .write_u32(self.expected_size);
    }
}

/// Reassembly unit: the chunks received so far for one packet id.
#[derive(Debug)]
pub struct Packet {
    expected_size: u32,
    size: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    created: Instant,
}

impl Packet {
    fn new(expected_size: u32) -> Self {
        Self {
            expected_size,
            size: 0,
            chunks: BTreeMap::new(),
            created: Instant::now(),
        }
    }

    fn push(&mut self, chunk_id: u32, payload: &[u8]) -> Result<(), TransportError> {
        if self.chunks.contains_key(&chunk_id) {
            return Err(TransportError::Qos(format!("duplicate chunk {chunk_id}")));
        }
        let new_size = self.size as u64 + payload.len() as u64;
        if new_size > self.expected_size as u64 {
            return Err(TransportError::Qos(format!(
                "chunk {chunk_id} overflows packet: {new_size} > {}",
                self.expected_size
            )));
        }
        self.size = new_size as u32;
        self.chunks.insert(chunk_id, payload.to_vec());
        Ok(())
    }

    pub fn expected_size(&self) -> u32 {
        self.expected_size
    }

    pub fn is_ready(&self) -> bool {
        self.size == self.expected_size
    }

    fn assemble(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.expected_size as usize);
        for chunk in self.chunks.into_values() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

/// Per-device fragmentation state.
///
/// Owns the outgoing packet counter and the table of partially received
/// packets. Not thread-safe by itself; the device bridge guards it.
#[derive(Debug)]
pub struct QualityOfService {
    next_packet_id: u32,
    receive_queue: HashMap<u32, Packet>,
    max_packet_age: Duration,
}

impl Default for QualityOfService {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityOfService {
    pub fn new() -> Self {
        Self {
            next_packet_id: 0,
            receive_queue: HashMap::new(),
            max_packet_age: DEFAULT_MAX_PACKET_AGE,
        }
    }

    /// Set how long an incomplete packet may wait for its missing chunks.
    pub fn max_packet_age(mut self, age: Duration) -> Self {
        self.max_packet_age = age;
        self
    }

    /// Number of packets currently being reassembled.
    pub fn pending(&self) -> usize {
        self.receive_queue.len()
    }

    /// Feed one received chunk.
    ///
    /// Returns the reassembled packet when this chunk completed it. Chunks too
    /// short to carry a header are ignored. A chunk contradicting what is
    /// already known about its packet drops that packet and returns an error.
    pub fn push_received(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if chunk.len() < HEADER_SIZE {
            tracing::debug!(len = chunk.len(), "discarding chunk shorter than header");
            return Ok(None);
        }
        self.evict_older_than(self.max_packet_age);

        let mut reader = ByteReader::new(chunk);
        let header = ChunkHeader::parse(&mut reader)?;
        let payload = reader.rest();

        if payload.is_empty() && header.expected_size != 0 {
            tracing::debug!(packet = header.packet_id, "discarding header-only chunk");
            return Ok(None);
        }

        let packet = self
            .receive_queue
            .entry(header.packet_id)
            .or_insert_with(|| Packet::new(header.expected_size));

        if packet.expected_size != header.expected_size {
            let known = packet.expected_size;
            self.receive_queue.remove(&header.packet_id);
            return Err(TransportError::Qos(format!(
                "packet {} size mismatch: {} != {known}",
                header.packet_id, header.expected_size
            )));
        }

        if let Err(e) = packet.push(header.chunk_id, payload) {
            self.receive_queue.remove(&header.packet_id);
            return Err(e);
        }

        if packet.is_ready() {
            return Ok(self
                .receive_queue
                .remove(&header.packet_id)
                .map(Packet::assemble));
        }
        Ok(None)
    }

    /// Drop incomplete packets that have waited longer than `age`.
    pub fn evict_older_than(&mut self, age: Duration) -> usize {
        let before = self.receive_queue.len();
        self.receive_queue
            .retain(|_, packet| packet.created.elapsed() < age);
        let evicted = before - self.receive_queue.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted stale incomplete packets");
        }
        evicted
    }

    /// Start sending `data` as a new packet.
    pub fn splitter(&mut self, data: Vec<u8>) -> PacketSplitter {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        PacketSplitter::new(packet_id, data)
    }
}

/// Cursor over one outgoing packet.
///
/// The caller asks for the next chunk, hands it to the transport and then
/// reports how many bytes the transport actually accepted.
#[derive(Debug)]
pub struct PacketSplitter {
    packet_id: u32,
    chunk_id: u32,
    data: Vec<u8>,
    offset: usize,
    started: bool,
}

impl PacketSplitter {
    fn new(packet_id: u32, data: Vec<u8>) -> Self {
        Self {
            packet_id,
            chunk_id: 0,
            data,
            offset: 0,
            started: false,
        }
    }

    /// `true` while some payload (or the single chunk of an empty packet) is unsent.
    pub fn has_more(&self) -> bool {
        !self.started || self.offset < self.data.len()
    }

    /// Header plus up to `limit` payload bytes.
    pub fn next_chunk(&self, limit: Option<usize>) -> Vec<u8> {
        let remaining = self.data.len() - self.offset;
        let take = limit.map_or(remaining, |l| l.min(remaining));
        let mut writer = ByteWriter::with_capacity(HEADER_SIZE + take);
        ChunkHeader {
            packet_id: self.packet_id,
            chunk_id: self.chunk_id,
            expected_size: self.data.len() as u32,
        }
        .write(&mut writer);
        writer.write_raw(&self.data[self.offset..self.offset + take]);
        writer.into_vec()
    }

    /// Record that the transport accepted `sent` bytes of the last chunk.
    ///
    /// A send that did not get any payload through is an error; callers must
    /// not loop on a transport that makes no progress.
    pub fn update(&mut self, sent: usize) -> Result<(), TransportError> {
        let remaining = self.data.len() - self.offset;
        let payload = sent.saturating_sub(HEADER_SIZE).min(remaining);
        if sent < HEADER_SIZE || (payload == 0 && remaining > 0) {
            return Err(TransportError::Send(format!(
                "transport accepted {sent} bytes, no payload progress"
            )));
        }
        self.offset += payload;
        self.chunk_id += 1;
        self.started = true;
        Ok(())
    }
}

/// Split `data` into wire chunks of at most `limit` payload bytes each.
pub fn fragment(packet_id: u32, data: &[u8], limit: usize) -> Vec<Vec<u8>> {
    let mut splitter = PacketSplitter::new(packet_id, data.to_vec());
    let mut chunks = Vec::new();
    while splitter.has_more() {
        let chunk = splitter.next_chunk(Some(limit.max(1)));
        let len = chunk.len();
        chunks.push(chunk);
        if splitter.update(len).is_err() {
            break;
        }
    }
    chunks
}
