//! Subscriber-side client tracks
//!
//! Every subscription materializes as a client track: the fan-out path
//! pushes pooled packet copies into it, and the client track owns whatever
//! rewriting its variant needs before handing an outbound packet to the
//! subscriber's transport. A push never blocks: each client track drains
//! its own bounded queue on a spawned writer task and drops packets when
//! the queue is full.

use crate::context::TrackContext;
use crate::iface::ClientHandle;
use crate::packet::PooledPacket;
use crate::remote_track::RemoteTrack;
use crate::track::SimulcastTrack;
use crate::types::{ClientId, QualityLevel, TrackId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

const QUALITY_NONE: u8 = u8::MAX;

/// Capability set shared by all client-track variants
pub trait ClientTrack: Send + Sync {
    fn id(&self) -> TrackId;
    fn client_id(&self) -> ClientId;
    fn kind(&self) -> RTPCodecType;
    fn mime_type(&self) -> String;
    fn is_screen(&self) -> bool;
    fn is_scalable(&self) -> bool {
        false
    }

    /// Non-blocking delivery of one fan-out packet tagged with its arrival
    /// quality. The pooled buffer is consumed; implementations copy what
    /// they keep.
    fn push(&self, packet: PooledPacket, quality: QualityLevel);

    /// Quality wanted by the bitrate controller; honored at the next
    /// keyframe of that quality. Meaningful for simulcast tracks only.
    fn set_target_quality(&self, _quality: QualityLevel) {}

    /// Layer targets for SVC tracks; no-ops elsewhere.
    fn set_max_spatial_layer(&self, _sid: u8) {}
    fn set_max_temporal_layer(&self, _tid: u8) {}

    fn on_ended(&self, f: Box<dyn Fn() + Send + Sync>);
    fn mark_ended(&self);
    fn context(&self) -> &TrackContext;
}

/// Ordered registry of the client tracks subscribed to one source track
///
/// Dispatch iterates over a snapshot so the lock is never held while a
/// downstream push runs.
#[derive(Default)]
pub struct ClientTrackList {
    tracks: Mutex<Vec<Arc<dyn ClientTrack>>>,
}

impl ClientTrackList {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, track: Arc<dyn ClientTrack>) {
        self.tracks.lock().push(track);
    }

    pub fn remove(&self, client_id: &ClientId) {
        self.tracks.lock().retain(|t| t.client_id() != *client_id);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn ClientTrack>> {
        self.tracks.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }
}

/// Outbound leg shared by all variants: a bounded queue drained by a
/// writer task. `try_send` keeps the fan-out path non-blocking; a full
/// queue sheds the packet.
struct Forwarder {
    tx: mpsc::Sender<Packet>,
}

impl Forwarder {
    fn spawn(client: &ClientHandle, context: &TrackContext, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Packet>(capacity);
        let transport = Arc::clone(&client.transport);
        let client_id = client.id.clone();
        let context = context.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = context.cancelled() => break,
                    packet = rx.recv() => match packet {
                        Some(packet) => {
                            if let Err(e) = transport.write_rtp(&packet).await {
                                warn!(client_id = %client_id, error = %e, "failed to write RTP");
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        Self { tx }
    }

    fn forward(&self, packet: Packet) {
        if self.tx.try_send(packet).is_err() {
            debug!("forward queue full, dropping packet");
        }
    }
}

/// State common to every client-track variant
struct ClientTrackInner {
    id: TrackId,
    client_id: ClientId,
    kind: RTPCodecType,
    mime_type: String,
    is_screen: bool,
    context: TrackContext,
    forwarder: Forwarder,
    ended: AtomicBool,
    on_ended_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl ClientTrackInner {
    fn new(
        client: &ClientHandle,
        id: TrackId,
        kind: RTPCodecType,
        mime_type: String,
        is_screen: bool,
        queue_size: usize,
    ) -> Self {
        let context = client.context.child();
        let forwarder = Forwarder::spawn(client, &context, queue_size);
        Self {
            id,
            client_id: client.id.clone(),
            kind,
            mime_type,
            is_screen,
            context,
            forwarder,
            ended: AtomicBool::new(false),
            on_ended_callbacks: Mutex::new(Vec::new()),
        }
    }

    fn on_ended(&self, f: Box<dyn Fn() + Send + Sync>) {
        if self.ended.load(Ordering::Acquire) {
            f();
            return;
        }
        self.on_ended_callbacks.lock().push(f);
    }

    fn mark_ended(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.context.cancel();
        let callbacks = std::mem::take(&mut *self.on_ended_callbacks.lock());
        for f in &callbacks {
            f();
        }
    }
}

/// End the client track when its lifecycle context is cancelled, e.g. on
/// subscriber disconnect
fn spawn_ended_watcher<T: ClientTrack + 'static>(track: &Arc<T>) {
    let weak = Arc::downgrade(track);
    let context = track.context().clone();
    tokio::spawn(async move {
        context.cancelled().await;
        if let Some(track) = weak.upgrade() {
            track.mark_ended();
        }
    });
}

macro_rules! delegate_client_track_common {
    () => {
        fn id(&self) -> TrackId {
            self.inner.id.clone()
        }

        fn client_id(&self) -> ClientId {
            self.inner.client_id.clone()
        }

        fn kind(&self) -> RTPCodecType {
            self.inner.kind
        }

        fn mime_type(&self) -> String {
            self.inner.mime_type.clone()
        }

        fn is_screen(&self) -> bool {
            self.inner.is_screen
        }

        fn on_ended(&self, f: Box<dyn Fn() + Send + Sync>) {
            self.inner.on_ended(f);
        }

        fn mark_ended(&self) {
            self.inner.mark_ended();
        }

        fn context(&self) -> &TrackContext {
            &self.inner.context
        }
    };
}

/// Forwards every packet unchanged
pub struct PlainClientTrack {
    inner: ClientTrackInner,
}

impl PlainClientTrack {
    pub(crate) fn new(
        client: &ClientHandle,
        id: TrackId,
        kind: RTPCodecType,
        mime_type: String,
        is_screen: bool,
        queue_size: usize,
    ) -> Arc<Self> {
        let track = Arc::new(Self {
            inner: ClientTrackInner::new(client, id, kind, mime_type, is_screen, queue_size),
        });
        spawn_ended_watcher(&track);
        track
    }
}

impl ClientTrack for PlainClientTrack {
    delegate_client_track_common!();

    fn push(&self, packet: PooledPacket, _quality: QualityLevel) {
        self.inner.forwarder.forward(packet.to_rtp());
    }
}

/// Client track over a simulcast bundle
///
/// Keeps a current quality and a controller-set target; a switch takes
/// effect on the first keyframe of the (liveness-checked) target quality.
/// Outbound sequence numbers come from a private counter and timestamps
/// are re-based onto the bundle's base timeline so the stream stays
/// monotonic and gapless across switches.
pub struct SimulcastClientTrack {
    inner: ClientTrackInner,
    source: Weak<SimulcastTrack>,
    last_quality: AtomicU8,
    target_quality: AtomicU8,
    sequence_number: AtomicU16,
    timestamp_offset: AtomicU32,
    last_timestamp: AtomicU32,
}

impl SimulcastClientTrack {
    pub(crate) fn new(
        client: &ClientHandle,
        source: &Arc<SimulcastTrack>,
        id: TrackId,
        kind: RTPCodecType,
        mime_type: String,
        is_screen: bool,
        queue_size: usize,
    ) -> Arc<Self> {
        let track = Arc::new(Self {
            inner: ClientTrackInner::new(client, id, kind, mime_type, is_screen, queue_size),
            source: Arc::downgrade(source),
            last_quality: AtomicU8::new(QUALITY_NONE),
            target_quality: AtomicU8::new(QualityLevel::High.as_u8()),
            sequence_number: AtomicU16::new(0),
            timestamp_offset: AtomicU32::new(0),
            last_timestamp: AtomicU32::new(0),
        });
        spawn_ended_watcher(&track);
        track
    }

    /// Highest active quality not above the controller target; falls back
    /// to the target itself when nothing is live yet
    fn effective_target(&self, source: &SimulcastTrack) -> QualityLevel {
        let target = QualityLevel::from_u8(self.target_quality.load(Ordering::Acquire))
            .unwrap_or(QualityLevel::High);
        target
            .downwards()
            .find(|q| source.is_active_quiet(*q))
            .unwrap_or(target)
    }

    fn switch_to(&self, source: &SimulcastTrack, quality: QualityLevel, packet: &PooledPacket) {
        let bundle_base = source.base_timestamp();
        let mut quality_base = source.quality_base_timestamp(quality);
        if quality_base == 0 {
            quality_base = packet.header().timestamp;
        }
        self.timestamp_offset
            .store(quality_base.wrapping_sub(bundle_base), Ordering::Release);
        self.last_quality.store(quality.as_u8(), Ordering::Release);

        debug!(
            client_id = %self.inner.client_id,
            track_id = %self.inner.id,
            quality = %quality,
            "switched forwarded quality on keyframe"
        );
    }

    fn emit(&self, packet: &PooledPacket) {
        let sequence = self
            .sequence_number
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        let offset = self.timestamp_offset.load(Ordering::Acquire);

        let mut rtp = packet.to_rtp();
        rtp.header.sequence_number = sequence;
        rtp.header.timestamp = rtp.header.timestamp.wrapping_sub(offset);
        self.last_timestamp.store(rtp.header.timestamp, Ordering::Release);
        self.inner.forwarder.forward(rtp);
    }
}

impl ClientTrack for SimulcastClientTrack {
    delegate_client_track_common!();

    fn push(&self, packet: PooledPacket, quality: QualityLevel) {
        let Some(source) = self.source.upgrade() else {
            return;
        };

        let desired = self.effective_target(&source);
        let current = self.last_quality.load(Ordering::Acquire);

        if current == desired.as_u8() {
            if quality == desired {
                self.emit(&packet);
            }
            return;
        }

        if quality.as_u8() == current {
            // Keep the old quality flowing until the target delivers a
            // keyframe.
            self.emit(&packet);
            return;
        }

        if quality == desired {
            if is_keyframe(&self.inner.mime_type, packet.payload()) {
                self.switch_to(&source, desired, &packet);
                self.emit(&packet);
            } else {
                let spawn_source = Arc::clone(&source);
                tokio::spawn(async move {
                    spawn_source.send_pli_for(desired).await;
                });
            }
        }
    }

    fn set_target_quality(&self, quality: QualityLevel) {
        self.target_quality.store(quality.as_u8(), Ordering::Release);

        if let Some(source) = self.source.upgrade() {
            if !source.is_active(quality) {
                warn!(
                    client_id = %self.inner.client_id,
                    track_id = %self.inner.id,
                    quality = %quality,
                    "target quality is not active, will fall back"
                );
            }
            tokio::spawn(async move {
                source.send_pli_for(quality).await;
            });
        }
    }
}

/// Client track over a VP9 SVC encoding
///
/// A single remote track carries every spatial/temporal layer; this
/// forwards only the selected subset, keeping picture ids and sequence
/// numbers continuous so the outbound stream stays decodable.
pub struct ScalableClientTrack {
    inner: ClientTrackInner,
    remote: Arc<RemoteTrack>,
    max_spatial: AtomicU8,
    max_temporal: AtomicU8,
    sequence_number: AtomicU16,
    picture_id: AtomicU16,
}

impl ScalableClientTrack {
    pub(crate) fn new(
        client: &ClientHandle,
        remote: Arc<RemoteTrack>,
        id: TrackId,
        kind: RTPCodecType,
        mime_type: String,
        is_screen: bool,
        queue_size: usize,
    ) -> Arc<Self> {
        let track = Arc::new(Self {
            inner: ClientTrackInner::new(client, id, kind, mime_type, is_screen, queue_size),
            remote,
            max_spatial: AtomicU8::new(2),
            max_temporal: AtomicU8::new(2),
            sequence_number: AtomicU16::new(0),
            picture_id: AtomicU16::new(0),
        });
        spawn_ended_watcher(&track);
        track
    }

    fn request_keyframe(&self) {
        let remote = Arc::clone(&self.remote);
        tokio::spawn(async move {
            remote.send_pli().await;
        });
    }
}

impl ClientTrack for ScalableClientTrack {
    delegate_client_track_common!();

    fn is_scalable(&self) -> bool {
        true
    }

    fn push(&self, packet: PooledPacket, _quality: QualityLevel) {
        let payload = Bytes::copy_from_slice(packet.payload());
        let mut vp9 = Vp9Packet::default();
        if vp9.depacketize(&payload).is_err() {
            warn!(
                client_id = %self.inner.client_id,
                track_id = %self.inner.id,
                "dropping unparsable VP9 payload"
            );
            return;
        }

        let max_spatial = self.max_spatial.load(Ordering::Acquire);
        let max_temporal = self.max_temporal.load(Ordering::Acquire);
        if vp9.sid > max_spatial || vp9.tid > max_temporal {
            return;
        }

        // One picture id per picture, counted at the base layer's first
        // packet.
        if vp9.b && vp9.sid == 0 {
            self.picture_id.fetch_add(1, Ordering::AcqRel);
        }

        let mut rtp = packet.to_rtp();
        let mut payload = packet.payload().to_vec();
        patch_vp9_picture_id(&mut payload, self.picture_id.load(Ordering::Acquire));
        rtp.payload = Bytes::from(payload);

        // The end-of-picture marker sits on the top spatial layer, which
        // may be filtered out; re-plant it on the top forwarded layer.
        if vp9.e && vp9.sid == max_spatial {
            rtp.header.marker = true;
        }

        rtp.header.sequence_number = self
            .sequence_number
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        self.inner.forwarder.forward(rtp);
    }

    fn set_max_spatial_layer(&self, sid: u8) {
        let previous = self.max_spatial.swap(sid, Ordering::AcqRel);
        if sid > previous {
            // Upswitches need a fresh keyframe carrying the new layer.
            self.request_keyframe();
        }
    }

    fn set_max_temporal_layer(&self, tid: u8) {
        self.max_temporal.store(tid, Ordering::Release);
    }
}

/// Client track for RED-encapsulated audio (payload type 63)
pub struct RedClientTrack {
    inner: ClientTrackInner,
    receive_red: bool,
}

impl RedClientTrack {
    pub(crate) fn new(
        client: &ClientHandle,
        id: TrackId,
        kind: RTPCodecType,
        mime_type: String,
        is_screen: bool,
        queue_size: usize,
    ) -> Arc<Self> {
        let track = Arc::new(Self {
            inner: ClientTrackInner::new(client, id, kind, mime_type, is_screen, queue_size),
            receive_red: client.receive_red,
        });
        spawn_ended_watcher(&track);
        track
    }
}

impl ClientTrack for RedClientTrack {
    delegate_client_track_common!();

    fn push(&self, packet: PooledPacket, _quality: QualityLevel) {
        let mut rtp = packet.to_rtp();

        if !self.receive_red {
            let Some((payload_type, range)) = red_primary_block(&rtp.payload) else {
                warn!(
                    client_id = %self.inner.client_id,
                    track_id = %self.inner.id,
                    "dropping malformed RED payload"
                );
                return;
            };
            rtp.header.payload_type = payload_type;
            rtp.payload = rtp.payload.slice(range);
        }

        self.inner.forwarder.forward(rtp);
    }
}

/// Locate the primary block inside a RED payload (RFC 2198). Returns its
/// payload type and byte range.
fn red_primary_block(payload: &[u8]) -> Option<(u8, std::ops::Range<usize>)> {
    let mut idx = 0;
    let mut redundant_len = 0usize;

    loop {
        let first = *payload.get(idx)?;
        if first & 0x80 == 0 {
            // Final (primary) header: one byte.
            let payload_type = first & 0x7f;
            let start = idx + 1 + redundant_len;
            if start > payload.len() {
                return None;
            }
            return Some((payload_type, start..payload.len()));
        }

        // Redundant header: F | PT(7), ts-offset(14), length(10).
        let len_high = *payload.get(idx + 2)?;
        let len_low = *payload.get(idx + 3)?;
        redundant_len += usize::from(len_high & 0x03) << 8 | usize::from(len_low);
        idx += 4;
    }
}

/// Whether this payload begins a keyframe for the given codec
pub(crate) fn is_keyframe(mime_type: &str, payload: &[u8]) -> bool {
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
        vp8_begins_keyframe(payload)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9) {
        vp9_begins_keyframe(payload)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        h264_contains_idr(payload)
    } else {
        false
    }
}

fn vp8_begins_keyframe(payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return false;
    }
    let descriptor = payload[0];
    let starts_partition = descriptor & 0x10 != 0;
    let partition_index = descriptor & 0x07;
    if !starts_partition || partition_index != 0 {
        return false;
    }

    // Skip the (optionally extended) payload descriptor.
    let mut idx = 1;
    if descriptor & 0x80 != 0 {
        let Some(&extension) = payload.get(idx) else {
            return false;
        };
        idx += 1;
        if extension & 0x80 != 0 {
            // PictureID, one or two bytes.
            match payload.get(idx) {
                Some(b) if b & 0x80 != 0 => idx += 2,
                Some(_) => idx += 1,
                None => return false,
            }
        }
        if extension & 0x40 != 0 {
            idx += 1; // TL0PICIDX
        }
        if extension & 0x30 != 0 {
            idx += 1; // TID/KEYIDX
        }
    }

    match payload.get(idx) {
        Some(frame_header) => frame_header & 0x01 == 0,
        None => false,
    }
}

fn vp9_begins_keyframe(payload: &[u8]) -> bool {
    let mut vp9 = Vp9Packet::default();
    if vp9
        .depacketize(&Bytes::copy_from_slice(payload))
        .is_err()
    {
        return false;
    }
    !vp9.p && vp9.b && vp9.sid == 0
}

fn h264_contains_idr(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };
    match first & 0x1f {
        5 | 7 => true,
        // STAP-A: walk the aggregated NAL units.
        24 => {
            let mut idx = 1;
            while idx + 2 < payload.len() {
                let size = usize::from(payload[idx]) << 8 | usize::from(payload[idx + 1]);
                match payload.get(idx + 2) {
                    Some(nalu) if matches!(nalu & 0x1f, 5 | 7) => return true,
                    Some(_) => idx += 2 + size,
                    None => return false,
                }
            }
            false
        }
        // FU-A: only the fragment that starts the NAL unit counts.
        28 => payload
            .get(1)
            .is_some_and(|b| b & 0x80 != 0 && b & 0x1f == 5),
        _ => false,
    }
}

/// Overwrite the picture id in a VP9 payload descriptor in place
fn patch_vp9_picture_id(payload: &mut [u8], picture_id: u16) {
    if payload.is_empty() || payload[0] & 0x80 == 0 {
        return; // no picture id present
    }
    if payload.len() >= 3 && payload[1] & 0x80 != 0 {
        // 15-bit picture id, keep the M bit.
        payload[1] = 0x80 | ((picture_id >> 8) as u8 & 0x7f);
        payload[2] = (picture_id & 0xff) as u8;
    } else if payload.len() >= 2 {
        payload[1] = (picture_id & 0x7f) as u8;
    }
}
