//! Hand-written mock collaborators for tests

use crate::iface::{RemoteStreamReader, StatsGetter, Transport};
use crate::stats::RemoteTrackStats;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

pub const MIME_TYPE_RED: &str = "audio/red";
pub const RED_PAYLOAD_TYPE: u8 = 63;

pub fn vp8_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        payload_type: 96,
        ..Default::default()
    }
}

pub fn vp9_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP9.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        payload_type: 98,
        ..Default::default()
    }
}

pub fn opus_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        payload_type: 111,
        ..Default::default()
    }
}

pub fn red_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_RED.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        payload_type: RED_PAYLOAD_TYPE,
        ..Default::default()
    }
}

pub fn rtp_packet(sequence_number: u16, timestamp: u32, ssrc: u32) -> Packet {
    rtp_packet_with(sequence_number, timestamp, ssrc, false, vec![0u8; 10])
}

pub fn rtp_packet_with(
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    marker: bool,
    payload: Vec<u8>,
) -> Packet {
    Packet {
        header: webrtc::rtp::header::Header {
            version: 2,
            marker,
            sequence_number,
            timestamp,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from(payload),
    }
}

/// VP8 payload starting a keyframe: descriptor with S=1, then a frame
/// header whose P bit is 0
pub fn vp8_keyframe_payload() -> Vec<u8> {
    vec![0x10, 0x00, 0x9d, 0x01, 0x2a]
}

/// VP8 payload starting an interframe
pub fn vp8_interframe_payload() -> Vec<u8> {
    vec![0x10, 0x01, 0x9d, 0x01, 0x2a]
}

/// VP9 payload with I/L set and explicit layer/frame bits.
/// 15-bit picture id, non-flexible mode (tl0picidx byte present).
pub fn vp9_payload(
    picture_id: u16,
    inter_predicted: bool,
    begin: bool,
    end: bool,
    sid: u8,
    tid: u8,
) -> Vec<u8> {
    let mut first = 0x80 | 0x20; // I | L
    if inter_predicted {
        first |= 0x40; // P
    }
    if begin {
        first |= 0x08; // B
    }
    if end {
        first |= 0x04; // E
    }
    let layer = (tid << 5) | (sid << 1);
    vec![
        first,
        0x80 | ((picture_id >> 8) as u8 & 0x7f),
        (picture_id & 0xff) as u8,
        layer,
        0, // TL0PICIDX
        0xde,
        0xad,
    ]
}

pub struct MockFeed {
    tx: Mutex<Option<mpsc::Sender<Packet>>>,
}

impl MockFeed {
    pub async fn send(&self, packet: Packet) {
        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            tx.send(packet).await.expect("mock reader gone");
        }
    }

    /// Close the feed; the reader's next read fails like a transport EOF
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

pub struct MockReader {
    pub id: String,
    pub msid: String,
    pub stream_id: String,
    pub rid: String,
    pub ssrc: u32,
    pub kind: RTPCodecType,
    pub codec: RTCRtpCodecParameters,
    pub relay: bool,
    rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
}

impl MockReader {
    pub fn new(
        id: &str,
        ssrc: u32,
        rid: &str,
        kind: RTPCodecType,
        codec: RTCRtpCodecParameters,
    ) -> (Arc<Self>, Arc<MockFeed>) {
        let (tx, rx) = mpsc::channel(256);
        let reader = Arc::new(Self {
            id: id.to_string(),
            msid: format!("stream-{id} {id}"),
            stream_id: format!("stream-{id}"),
            rid: rid.to_string(),
            ssrc,
            kind,
            codec,
            relay: false,
            rx: tokio::sync::Mutex::new(rx),
        });
        let feed = Arc::new(MockFeed {
            tx: Mutex::new(Some(tx)),
        });
        (reader, feed)
    }

    pub fn video_vp8(id: &str, ssrc: u32) -> (Arc<Self>, Arc<MockFeed>) {
        Self::new(id, ssrc, "", RTPCodecType::Video, vp8_codec())
    }

    pub fn video_vp8_rid(id: &str, ssrc: u32, rid: &str) -> (Arc<Self>, Arc<MockFeed>) {
        Self::new(id, ssrc, rid, RTPCodecType::Video, vp8_codec())
    }

    pub fn video_vp9(id: &str, ssrc: u32) -> (Arc<Self>, Arc<MockFeed>) {
        Self::new(id, ssrc, "", RTPCodecType::Video, vp9_codec())
    }

    pub fn audio_opus(id: &str, ssrc: u32) -> (Arc<Self>, Arc<MockFeed>) {
        Self::new(id, ssrc, "", RTPCodecType::Audio, opus_codec())
    }

    pub fn audio_red(id: &str, ssrc: u32) -> (Arc<Self>, Arc<MockFeed>) {
        Self::new(id, ssrc, "", RTPCodecType::Audio, red_codec())
    }
}

#[async_trait]
impl RemoteStreamReader for MockReader {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn msid(&self) -> String {
        self.msid.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn rid(&self) -> String {
        self.rid.clone()
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn payload_type(&self) -> u8 {
        self.codec.payload_type
    }

    fn kind(&self) -> RTPCodecType {
        self.kind
    }

    fn codec(&self) -> RTCRtpCodecParameters {
        self.codec.clone()
    }

    fn is_relay(&self) -> bool {
        self.relay
    }

    async fn read(&self) -> anyhow::Result<Packet> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("remote stream closed"))
    }
}

#[derive(Default)]
pub struct MockTransport {
    rtp: Mutex<Vec<Packet>>,
    rtcp_ssrcs: Mutex<Vec<u32>>,
}

impl MockTransport {
    pub fn rtp_packets(&self) -> Vec<Packet> {
        self.rtp.lock().clone()
    }

    pub fn rtp_seqs(&self) -> Vec<u16> {
        self.rtp
            .lock()
            .iter()
            .map(|p| p.header.sequence_number)
            .collect()
    }

    pub fn pli_count(&self) -> usize {
        self.rtcp_ssrcs.lock().len()
    }

    pub fn pli_ssrcs(&self) -> Vec<u32> {
        self.rtcp_ssrcs.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_rtcp(
        &self,
        packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>],
    ) -> anyhow::Result<()> {
        let mut ssrcs = self.rtcp_ssrcs.lock();
        for packet in packets {
            ssrcs.extend(packet.destination_ssrc());
        }
        Ok(())
    }

    async fn write_rtp(&self, packet: &Packet) -> anyhow::Result<()> {
        self.rtp.lock().push(packet.clone());
        Ok(())
    }
}

/// Transport whose RTP writes park until permits are released, for
/// exercising forward-queue back-pressure
pub struct GatedTransport {
    gate: tokio::sync::Semaphore,
    rtp: Mutex<Vec<Packet>>,
}

impl GatedTransport {
    pub fn new() -> Self {
        Self {
            gate: tokio::sync::Semaphore::new(0),
            rtp: Mutex::new(Vec::new()),
        }
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn written(&self) -> usize {
        self.rtp.lock().len()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn write_rtcp(
        &self,
        _packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write_rtp(&self, packet: &Packet) -> anyhow::Result<()> {
        let permit = self.gate.acquire().await?;
        permit.forget();
        self.rtp.lock().push(packet.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockStats {
    stats: Mutex<HashMap<u32, RemoteTrackStats>>,
}

impl MockStats {
    pub fn set(&self, ssrc: u32, stats: RemoteTrackStats) {
        self.stats.lock().insert(ssrc, stats);
    }
}

impl StatsGetter for MockStats {
    fn get(&self, ssrc: u32) -> Option<RemoteTrackStats> {
        self.stats.lock().get(&ssrc).cloned()
    }
}

/// Wait until `predicate` holds or the timeout elapses
pub async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}
