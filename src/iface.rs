//! Interfaces of the external collaborators this core is wired to
//!
//! The core never talks to a socket or a peer connection directly. The
//! transport layer hands it a [`RemoteStreamReader`] per inbound encoding,
//! a [`Transport`] per client for RTCP/RTP writes, and optionally a
//! [`StatsGetter`]. All of them are trait objects so tests can substitute
//! channel-backed mocks.

use crate::context::TrackContext;
use crate::packet::PooledPacket;
use crate::stats::{NetworkCondition, RemoteTrackStats};
use crate::types::{ClientId, QualityLevel};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

/// One inbound RTP encoding as delivered by the transport layer
#[async_trait]
pub trait RemoteStreamReader: Send + Sync {
    fn id(&self) -> String;
    fn msid(&self) -> String;
    fn stream_id(&self) -> String;
    /// RTP stream id labelling simulcast encodings; empty for
    /// single-encoding streams
    fn rid(&self) -> String;
    fn ssrc(&self) -> u32;
    fn payload_type(&self) -> u8;
    fn kind(&self) -> RTPCodecType;
    fn codec(&self) -> RTCRtpCodecParameters;
    /// Whether this stream was forwarded here by another SFU
    fn is_relay(&self) -> bool {
        false
    }
    /// Pull the next packet; an error terminates the read loop
    async fn read(&self) -> anyhow::Result<webrtc::rtp::packet::Packet>;
}

/// Outbound side of a client's peer connection
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write_rtcp(
        &self,
        packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>],
    ) -> anyhow::Result<()>;

    async fn write_rtp(&self, packet: &webrtc::rtp::packet::Packet) -> anyhow::Result<()>;
}

/// Receiver-side statistics source, keyed by SSRC
pub trait StatsGetter: Send + Sync {
    fn get(&self, ssrc: u32) -> Option<RemoteTrackStats>;
}

/// Non-owning view of a client held by tracks and client tracks
///
/// Tracks derive their contexts from the owning client's context, so a
/// disconnecting client tears down everything below it; nothing in the
/// core keeps a client alive.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    pub transport: Arc<dyn Transport>,
    pub context: TrackContext,
    /// Subscriber wants RED audio kept encapsulated
    pub receive_red: bool,
}

impl ClientHandle {
    pub fn new(id: impl Into<ClientId>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            transport,
            context: TrackContext::new(),
            receive_red: false,
        }
    }
}

/// Emits one PLI for the given media SSRC
pub type OnPliHdlrFn = Box<
    dyn (Fn(u32) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>) + Send + Sync,
>;

/// Invoked inline on the read task for every ordered inbound packet
pub type OnPacketHdlrFn = Box<dyn Fn(&webrtc::rtp::packet::Packet) + Send + Sync>;

pub type OnStatsUpdatedHdlrFn = Arc<dyn Fn(&RemoteTrackStats) + Send + Sync>;

pub type OnNetworkConditionChangedHdlrFn = Arc<dyn Fn(NetworkCondition) + Send + Sync>;

/// Per-source-track read callback; receives the pool-owned copy
pub type OnReadHdlrFn = Box<dyn Fn(&PooledPacket, QualityLevel) + Send + Sync>;

/// Relay hook forwarding (SSRC, packet) onward, e.g. to another SFU
pub type RelayHdlrFn = Box<dyn Fn(u32, &PooledPacket) + Send + Sync>;
