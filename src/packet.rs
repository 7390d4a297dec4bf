//! Reusable RTP packet buffers
//!
//! Fan-out copies every inbound packet once per recipient so no two
//! consumers ever share a mutable buffer. The pool keeps the payload
//! storage of released packets around for reuse; a [`PooledPacket`] returns
//! its buffer on `Drop`, so the release obligation holds on every control
//! path, including panics inside a consumer.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use webrtc::rtp::header::Header;

static GLOBAL_POOL: OnceLock<Arc<PacketPool>> = OnceLock::new();

const DEFAULT_MAX_IDLE: usize = 512;

/// Arena of reusable RTP packet buffers
///
/// `acquire` may return any previously released buffer or a fresh one; no
/// ordering is guaranteed. Idle buffers beyond `max_idle` are discarded on
/// release, bounding growth.
pub struct PacketPool {
    free: Mutex<Vec<BytesMut>>,
    max_idle: usize,
}

impl PacketPool {
    #[must_use]
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    /// Process-wide default pool
    pub fn global() -> &'static Arc<Self> {
        GLOBAL_POOL.get_or_init(|| Self::new(DEFAULT_MAX_IDLE))
    }

    /// Take a buffer out of the pool. Header and payload contents are
    /// unspecified until [`PooledPacket::copy_from`] is called.
    pub fn acquire(self: &Arc<Self>) -> PooledPacket {
        let payload = self.free.lock().pop().unwrap_or_default();
        PooledPacket {
            header: Header::default(),
            payload,
            pool: Arc::clone(self),
        }
    }

    /// Wrap externally owned header and payload bytes into a pool-backed
    /// packet for the duration of a scope
    pub fn new_from(self: &Arc<Self>, header: &Header, payload: &[u8]) -> PooledPacket {
        let mut packet = self.acquire();
        packet.copy_from(header, payload);
        packet
    }

    fn release(&self, mut payload: BytesMut) {
        payload.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(payload);
        }
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.free.lock().len()
    }
}

/// One RTP packet whose payload storage is owned by a [`PacketPool`]
///
/// Dropping the packet returns the storage to the pool; consumers take it
/// by value and must not retain it past their push call.
pub struct PooledPacket {
    header: Header,
    payload: BytesMut,
    pool: Arc<PacketPool>,
}

impl PooledPacket {
    pub fn copy_from(&mut self, header: &Header, payload: &[u8]) {
        self.header = header.clone();
        self.payload.clear();
        self.payload.extend_from_slice(payload);
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Copy out into a standalone RTP packet, e.g. for an outbound queue
    #[must_use]
    pub fn to_rtp(&self) -> webrtc::rtp::packet::Packet {
        webrtc::rtp::packet::Packet {
            header: self.header.clone(),
            payload: Bytes::copy_from_slice(&self.payload),
        }
    }
}

impl Drop for PooledPacket {
    fn drop(&mut self) {
        let payload = std::mem::take(&mut self.payload);
        self.pool.release(payload);
    }
}
