//! Source tracks and the per-client track registry
//!
//! A source track is the publisher-side handle over an inbound stream:
//! either a [`SingleTrack`] wrapping one encoding, or a [`SimulcastTrack`]
//! bundling up to three encodings that share an identity. Both fan every
//! ordered packet out to the client tracks subscribed to them and to any
//! registered read callbacks, one pooled copy per recipient.

use crate::client_track::{
    is_keyframe, ClientTrack, ClientTrackList, PlainClientTrack, RedClientTrack,
    ScalableClientTrack, SimulcastClientTrack,
};
use crate::config::SfuConfig;
use crate::context::TrackContext;
use crate::error::{Error, Result};
use crate::iface::{
    ClientHandle, OnNetworkConditionChangedHdlrFn, OnReadHdlrFn, OnStatsUpdatedHdlrFn,
    RelayHdlrFn, RemoteStreamReader, StatsGetter,
};
use crate::packet::PacketPool;
use crate::remote_track::{pli_writer, RemoteTrack, RemoteTrackParams};
use crate::reorder::{ReorderBuffer, SeqReorderBuffer};
use crate::types::{ClientId, QualityLevel, SourceType, StreamId, TrackId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use webrtc::api::media_engine::MIME_TYPE_VP9;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

/// An encoding with no packet read for this long is considered stalled
const ACTIVE_THRESHOLD: Duration = Duration::from_millis(500);

/// Payload type conventionally carrying RED-encapsulated audio
const RED_PAYLOAD_TYPE: u8 = 63;

/// Monotonic nanoseconds since process start; never returns 0, so 0 can
/// mean "never"
pub(crate) fn monotonic_ns() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    Instant::now().duration_since(*start).as_nanos() as i64 + 1
}

/// Construction-time wiring shared by both track kinds
#[derive(Clone)]
pub struct TrackOptions {
    pub pool: Arc<PacketPool>,
    pub config: SfuConfig,
    pub stats_getter: Option<Arc<dyn StatsGetter>>,
    pub on_stats_updated: Option<OnStatsUpdatedHdlrFn>,
    pub on_network_condition_changed: Option<OnNetworkConditionChangedHdlrFn>,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            pool: Arc::clone(PacketPool::global()),
            config: SfuConfig::default(),
            stats_getter: None,
            on_stats_updated: None,
            on_network_condition_changed: None,
        }
    }
}

impl TrackOptions {
    fn reorder(&self) -> Option<Box<dyn ReorderBuffer>> {
        self.config.enable_reorder.then(|| {
            Box::new(SeqReorderBuffer::new(
                self.config.reorder_min_wait(),
                self.config.reorder_max_wait(),
            )) as Box<dyn ReorderBuffer>
        })
    }
}

/// Abstract source-track handle stored by the registry
pub trait Track: Send + Sync {
    fn id(&self) -> TrackId;
    fn msid(&self) -> String;
    fn stream_id(&self) -> StreamId;
    fn client_id(&self) -> ClientId;
    fn kind(&self) -> RTPCodecType;
    fn codec(&self) -> RTCRtpCodecParameters;

    fn mime_type(&self) -> String {
        self.codec().capability.mime_type
    }

    fn payload_type(&self) -> u8 {
        self.codec().payload_type
    }

    fn is_simulcast(&self) -> bool;
    fn is_scalable(&self) -> bool;
    fn is_relay(&self) -> bool;
    fn is_processed(&self) -> bool;
    fn set_as_processed(&self);
    fn source_type(&self) -> SourceType;
    fn set_source_type(&self, source_type: SourceType);

    fn is_screen(&self) -> bool {
        self.source_type() == SourceType::Screen
    }

    /// Number of live encodings behind this handle
    fn total_tracks(&self) -> usize;

    fn context(&self) -> &TrackContext;

    /// Attach a subscriber; the concrete client-track variant depends on
    /// the codec and, for simulcast, on the bundle
    fn subscribe(&self, client: &ClientHandle) -> Result<Arc<dyn ClientTrack>>;

    /// Register a callback invoked with a pooled copy of every packet
    fn on_read(&self, f: OnReadHdlrFn);

    /// Register a read callback that forwards (SSRC, packet) onward
    fn relay(&self, f: RelayHdlrFn) {
        self.on_read(Box::new(move |packet, _quality| {
            f(packet.header().ssrc, packet);
        }));
    }
}

/// Identity and fan-out state shared by both track kinds
struct BaseTrack {
    id: TrackId,
    msid: String,
    stream_id: StreamId,
    client_id: ClientId,
    kind: RTPCodecType,
    codec: RTCRtpCodecParameters,
    is_screen: AtomicBool,
    processed: AtomicBool,
    context: TrackContext,
    client_tracks: Arc<ClientTrackList>,
    read_callbacks: Arc<Mutex<Vec<OnReadHdlrFn>>>,
    pool: Arc<PacketPool>,
    queue_size: usize,
}

impl BaseTrack {
    fn new(client: &ClientHandle, reader: &dyn RemoteStreamReader, options: &TrackOptions) -> Self {
        Self {
            id: TrackId::from(reader.id()),
            msid: reader.msid(),
            stream_id: StreamId::from(reader.stream_id()),
            client_id: client.id.clone(),
            kind: reader.kind(),
            codec: reader.codec(),
            is_screen: AtomicBool::new(false),
            processed: AtomicBool::new(false),
            context: client.context.child(),
            client_tracks: ClientTrackList::new(),
            read_callbacks: Arc::new(Mutex::new(Vec::new())),
            pool: Arc::clone(&options.pool),
            queue_size: options.config.forward_queue_size,
        }
    }
}

/// Copy the packet once per recipient and deliver. A panicking recipient
/// is isolated: its pooled copy unwinds back to the pool and the loop
/// moves on.
fn fan_out(
    pool: &Arc<PacketPool>,
    client_tracks: &ClientTrackList,
    read_callbacks: &Mutex<Vec<OnReadHdlrFn>>,
    packet: &Packet,
    quality: QualityLevel,
) {
    for client_track in client_tracks.snapshot() {
        let client_id = client_track.client_id();
        let copy = pool.new_from(&packet.header, &packet.payload);
        let pushed = catch_unwind(AssertUnwindSafe(move || client_track.push(copy, quality)));
        if pushed.is_err() {
            error!(client_id = %client_id, "client track push panicked");
        }
    }

    let callbacks = read_callbacks.lock();
    for f in callbacks.iter() {
        let copy = pool.new_from(&packet.header, &packet.payload);
        if catch_unwind(AssertUnwindSafe(|| f(&copy, quality))).is_err() {
            error!("read callback panicked");
        }
    }
}

/// Source track over one encoding
pub struct SingleTrack {
    base: BaseTrack,
    remote: Arc<RemoteTrack>,
}

impl SingleTrack {
    pub fn new(
        client: &ClientHandle,
        reader: Arc<dyn RemoteStreamReader>,
        options: TrackOptions,
    ) -> Arc<Self> {
        let base = BaseTrack::new(client, reader.as_ref(), &options);

        let on_packet = {
            let pool = Arc::clone(&base.pool);
            let client_tracks = Arc::clone(&base.client_tracks);
            let read_callbacks = Arc::clone(&base.read_callbacks);
            Box::new(move |packet: &Packet| {
                fan_out(
                    &pool,
                    &client_tracks,
                    &read_callbacks,
                    packet,
                    QualityLevel::High,
                );
            })
        };

        let remote = RemoteTrack::new(RemoteTrackParams {
            parent: base.context.clone(),
            reader,
            reorder: options.reorder(),
            pli_interval: options.config.pli_interval(),
            on_pli: pli_writer(Arc::clone(&client.transport)),
            stats_getter: options.stats_getter.clone(),
            stats_interval: options.config.stats_interval(),
            on_packet,
            on_stats_updated: options.on_stats_updated.clone(),
            on_network_condition_changed: options.on_network_condition_changed.clone(),
        });

        // The only encoding ending ends the track.
        let track_context = base.context.clone();
        let remote_context = remote.context().clone();
        tokio::spawn(async move {
            remote_context.cancelled().await;
            track_context.cancel();
        });

        Arc::new(Self { base, remote })
    }

    #[must_use]
    pub fn remote_track(&self) -> &Arc<RemoteTrack> {
        &self.remote
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.remote.ssrc()
    }

    /// Request a keyframe from the publisher
    pub async fn send_pli(&self) {
        self.remote.send_pli().await;
    }
}

impl Track for SingleTrack {
    fn id(&self) -> TrackId {
        self.base.id.clone()
    }

    fn msid(&self) -> String {
        self.base.msid.clone()
    }

    fn stream_id(&self) -> StreamId {
        self.base.stream_id.clone()
    }

    fn client_id(&self) -> ClientId {
        self.base.client_id.clone()
    }

    fn kind(&self) -> RTPCodecType {
        self.base.kind
    }

    fn codec(&self) -> RTCRtpCodecParameters {
        self.base.codec.clone()
    }

    fn is_simulcast(&self) -> bool {
        false
    }

    fn is_scalable(&self) -> bool {
        self.base
            .codec
            .capability
            .mime_type
            .eq_ignore_ascii_case(MIME_TYPE_VP9)
    }

    fn is_relay(&self) -> bool {
        self.remote.is_relay()
    }

    fn is_processed(&self) -> bool {
        self.base.processed.load(Ordering::Acquire)
    }

    fn set_as_processed(&self) {
        self.base.processed.store(true, Ordering::Release);
    }

    fn source_type(&self) -> SourceType {
        if self.base.is_screen.load(Ordering::Acquire) {
            SourceType::Screen
        } else {
            SourceType::Media
        }
    }

    fn set_source_type(&self, source_type: SourceType) {
        self.base
            .is_screen
            .store(source_type == SourceType::Screen, Ordering::Release);
    }

    fn total_tracks(&self) -> usize {
        1
    }

    fn context(&self) -> &TrackContext {
        &self.base.context
    }

    fn subscribe(&self, client: &ClientHandle) -> Result<Arc<dyn ClientTrack>> {
        let mime_type = self.base.codec.capability.mime_type.clone();
        let is_screen = self.is_screen();

        let client_track: Arc<dyn ClientTrack> = if self.is_scalable() {
            ScalableClientTrack::new(
                client,
                Arc::clone(&self.remote),
                self.base.id.clone(),
                self.base.kind,
                mime_type,
                is_screen,
                self.base.queue_size,
            )
        } else if self.base.kind == RTPCodecType::Audio
            && self.base.codec.payload_type == RED_PAYLOAD_TYPE
        {
            RedClientTrack::new(
                client,
                self.base.id.clone(),
                self.base.kind,
                mime_type,
                is_screen,
                self.base.queue_size,
            )
        } else {
            PlainClientTrack::new(
                client,
                self.base.id.clone(),
                self.base.kind,
                mime_type,
                is_screen,
                self.base.queue_size,
            )
        };

        // Listed before the teardown wiring: a source that is already
        // gone then ends the client track, which removes it again.
        self.base.client_tracks.add(Arc::clone(&client_track));
        wire_client_track_teardown(&self.base.client_tracks, &client_track, &self.remote);

        if self.base.kind == RTPCodecType::Video {
            // Give the new subscriber a keyframe to start from.
            let remote = Arc::clone(&self.remote);
            tokio::spawn(async move {
                remote.send_pli().await;
            });
        }

        Ok(client_track)
    }

    fn on_read(&self, f: OnReadHdlrFn) {
        self.base.read_callbacks.lock().push(f);
    }
}

/// End the client track when its source encoding ends, and drop it from
/// the fan-out list once ended. All cross-references are weak; lifetimes
/// end bottom-up through context cancellation.
fn wire_client_track_teardown(
    list: &Arc<ClientTrackList>,
    client_track: &Arc<dyn ClientTrack>,
    remote: &RemoteTrack,
) {
    let weak_track = Arc::downgrade(client_track);
    remote.on_ended(Box::new(move || {
        if let Some(track) = weak_track.upgrade() {
            track.mark_ended();
        }
    }));

    let weak_list = Arc::downgrade(list);
    let client_id = client_track.client_id();
    client_track.on_ended(Box::new(move || {
        if let Some(list) = weak_list.upgrade() {
            list.remove(&client_id);
        }
    }));
}

/// Hot-path counters for one simulcast encoding
#[derive(Default)]
struct QualityState {
    base_timestamp: AtomicU32,
    last_read_ns: AtomicI64,
    sequence: AtomicU16,
    last_sequence: AtomicU16,
    last_keyframe_ns: AtomicI64,
}

/// Source track over a simulcast bundle of up to three encodings
///
/// Slots are keyed by quality. The bundle is complete the first moment all
/// three are present; the completion signal fires exactly once. Any
/// encoding dying clears its slot and cancels the whole bundle's context.
pub struct SimulcastTrack {
    base: BaseTrack,
    self_ref: Weak<SimulcastTrack>,
    publisher_transport: Arc<dyn crate::iface::Transport>,
    options: TrackOptions,
    base_timestamp: AtomicU32,
    remote_tracks: RwLock<[Option<Arc<RemoteTrack>>; 3]>,
    qualities: [QualityState; 3],
    completed: AtomicBool,
    on_complete_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    on_added_callbacks: Mutex<Vec<Box<dyn Fn(&Arc<RemoteTrack>) + Send + Sync>>>,
}

impl SimulcastTrack {
    pub fn new(
        client: &ClientHandle,
        reader: Arc<dyn RemoteStreamReader>,
        options: TrackOptions,
    ) -> Arc<Self> {
        let base = BaseTrack::new(client, reader.as_ref(), &options);

        let track = Arc::new_cyclic(|self_ref: &Weak<Self>| Self {
            base,
            self_ref: self_ref.clone(),
            publisher_transport: Arc::clone(&client.transport),
            options,
            base_timestamp: AtomicU32::new(0),
            remote_tracks: RwLock::new([None, None, None]),
            qualities: Default::default(),
            completed: AtomicBool::new(false),
            on_complete_callbacks: Mutex::new(Vec::new()),
            on_added_callbacks: Mutex::new(Vec::new()),
        });

        let _ = track.add_remote_track(reader);
        track
    }

    /// Install one more encoding into its quality slot. Returns `None`
    /// when the slot mapped by the RID is already taken.
    pub fn add_remote_track(
        self: &Arc<Self>,
        reader: Arc<dyn RemoteStreamReader>,
    ) -> Option<Arc<RemoteTrack>> {
        let quality = QualityLevel::from_rid(&reader.rid());
        let rid = reader.rid();

        let on_packet = {
            let weak = Arc::downgrade(self);
            Box::new(move |packet: &Packet| {
                if let Some(track) = weak.upgrade() {
                    track.handle_packet(quality, packet);
                }
            })
        };

        let remote = {
            let mut slots = self.remote_tracks.write();
            if slots[quality.as_u8() as usize].is_some() {
                warn!(
                    client_id = %self.base.client_id,
                    track_id = %self.base.id,
                    rid = %rid,
                    quality = %quality,
                    "quality slot already occupied, rejecting remote track"
                );
                return None;
            }

            let remote = RemoteTrack::new(RemoteTrackParams {
                parent: self.base.context.child(),
                reader,
                reorder: self.options.reorder(),
                pli_interval: self.options.config.pli_interval(),
                on_pli: pli_writer(Arc::clone(&self.publisher_transport)),
                stats_getter: self.options.stats_getter.clone(),
                stats_interval: self.options.config.stats_interval(),
                on_packet,
                on_stats_updated: self.options.on_stats_updated.clone(),
                on_network_condition_changed: self.options.on_network_condition_changed.clone(),
            });
            slots[quality.as_u8() as usize] = Some(Arc::clone(&remote));
            remote
        };

        // Watcher: one encoding dying takes the whole bundle down.
        {
            let weak = Arc::downgrade(self);
            let remote_context = remote.context().clone();
            tokio::spawn(async move {
                remote_context.cancelled().await;
                if let Some(track) = weak.upgrade() {
                    track.on_remote_track_ended(quality);
                }
            });
        }

        if self.is_track_complete() && !self.completed.swap(true, Ordering::AcqRel) {
            info!(
                client_id = %self.base.client_id,
                track_id = %self.base.id,
                "simulcast bundle complete"
            );
            let callbacks = std::mem::take(&mut *self.on_complete_callbacks.lock());
            for f in &callbacks {
                f();
            }
        }

        let added = self.on_added_callbacks.lock();
        for f in added.iter() {
            f(&remote);
        }
        drop(added);

        Some(remote)
    }

    fn on_remote_track_ended(&self, quality: QualityLevel) {
        if self.base.context.is_cancelled() {
            // The bundle is already tearing down; leave the remaining
            // slots as they were.
            return;
        }

        {
            let mut slots = self.remote_tracks.write();
            slots[quality.as_u8() as usize] = None;
        }

        warn!(
            client_id = %self.base.client_id,
            track_id = %self.base.id,
            quality = %quality,
            "simulcast encoding ended, cancelling bundle"
        );
        self.base.context.cancel();
    }

    fn handle_packet(&self, quality: QualityLevel, packet: &Packet) {
        let state = &self.qualities[quality.as_u8() as usize];
        let timestamp = packet.header.timestamp;

        let _ = self
            .base_timestamp
            .compare_exchange(0, timestamp, Ordering::AcqRel, Ordering::Acquire);
        let _ = state
            .base_timestamp
            .compare_exchange(0, timestamp, Ordering::AcqRel, Ordering::Acquire);

        let now = monotonic_ns();
        state.last_read_ns.store(now, Ordering::Release);
        state
            .last_sequence
            .store(state.sequence.load(Ordering::Acquire), Ordering::Release);
        state
            .sequence
            .store(packet.header.sequence_number, Ordering::Release);

        if self.base.kind == RTPCodecType::Video
            && is_keyframe(&self.base.codec.capability.mime_type, &packet.payload)
        {
            state.last_keyframe_ns.store(now, Ordering::Release);
        }

        fan_out(
            &self.base.pool,
            &self.base.client_tracks,
            &self.base.read_callbacks,
            packet,
            quality,
        );
    }

    /// One-shot signal fired the first moment all three encodings are
    /// present. Callbacks registered after that moment never fire.
    pub fn on_track_complete(&self, f: Box<dyn Fn() + Send + Sync>) {
        self.on_complete_callbacks.lock().push(f);
    }

    pub fn on_added_remote_track(&self, f: Box<dyn Fn(&Arc<RemoteTrack>) + Send + Sync>) {
        self.on_added_callbacks.lock().push(f);
    }

    #[must_use]
    pub fn is_track_complete(&self) -> bool {
        self.remote_tracks.read().iter().all(Option::is_some)
    }

    /// Bundle-wide base RTP timestamp captured from the first packet
    #[must_use]
    pub fn base_timestamp(&self) -> u32 {
        self.base_timestamp.load(Ordering::Acquire)
    }

    /// Base RTP timestamp of one encoding; 0 until its first packet
    #[must_use]
    pub fn quality_base_timestamp(&self, quality: QualityLevel) -> u32 {
        self.qualities[quality.as_u8() as usize]
            .base_timestamp
            .load(Ordering::Acquire)
    }

    pub(crate) fn is_active_quiet(&self, quality: QualityLevel) -> bool {
        if self.remote_tracks.read()[quality.as_u8() as usize].is_none() {
            return false;
        }
        let last_read = self.qualities[quality.as_u8() as usize]
            .last_read_ns
            .load(Ordering::Acquire);
        if last_read == 0 {
            return false;
        }
        monotonic_ns() - last_read <= ACTIVE_THRESHOLD.as_nanos() as i64
    }

    /// Liveness predicate: the slot is occupied and a packet was read
    /// within the last 500 ms
    #[must_use]
    pub fn is_active(&self, quality: QualityLevel) -> bool {
        if self.remote_tracks.read()[quality.as_u8() as usize].is_none() {
            warn!(
                client_id = %self.base.client_id,
                quality = %quality,
                "remote track is nil"
            );
            return false;
        }

        let last_read = self.qualities[quality.as_u8() as usize]
            .last_read_ns
            .load(Ordering::Acquire);
        let elapsed_ms = if last_read == 0 {
            i64::MAX
        } else {
            (monotonic_ns() - last_read) / 1_000_000
        };

        if last_read == 0 || elapsed_ms > ACTIVE_THRESHOLD.as_millis() as i64 {
            warn!(
                client_id = %self.base.client_id,
                quality = %quality,
                elapsed_ms,
                "remote track is not active"
            );
            return false;
        }

        true
    }

    /// Broadcast a PLI to every present encoding
    pub async fn send_pli(&self) {
        let remotes: Vec<_> = self.remote_tracks.read().iter().flatten().cloned().collect();
        for remote in remotes {
            remote.send_pli().await;
        }
    }

    /// Request a keyframe from one encoding
    pub async fn send_pli_for(&self, quality: QualityLevel) {
        let remote = self.remote_tracks.read()[quality.as_u8() as usize].clone();
        if let Some(remote) = remote {
            remote.send_pli().await;
        }
    }
}

impl Track for SimulcastTrack {
    fn id(&self) -> TrackId {
        self.base.id.clone()
    }

    fn msid(&self) -> String {
        self.base.msid.clone()
    }

    fn stream_id(&self) -> StreamId {
        self.base.stream_id.clone()
    }

    fn client_id(&self) -> ClientId {
        self.base.client_id.clone()
    }

    fn kind(&self) -> RTPCodecType {
        self.base.kind
    }

    fn codec(&self) -> RTCRtpCodecParameters {
        self.base.codec.clone()
    }

    fn is_simulcast(&self) -> bool {
        true
    }

    fn is_scalable(&self) -> bool {
        false
    }

    fn is_relay(&self) -> bool {
        self.remote_tracks
            .read()
            .iter()
            .flatten()
            .any(|remote| remote.is_relay())
    }

    fn is_processed(&self) -> bool {
        self.base.processed.load(Ordering::Acquire)
    }

    fn set_as_processed(&self) {
        self.base.processed.store(true, Ordering::Release);
    }

    fn source_type(&self) -> SourceType {
        if self.base.is_screen.load(Ordering::Acquire) {
            SourceType::Screen
        } else {
            SourceType::Media
        }
    }

    fn set_source_type(&self, source_type: SourceType) {
        self.base
            .is_screen
            .store(source_type == SourceType::Screen, Ordering::Release);
    }

    fn total_tracks(&self) -> usize {
        self.remote_tracks.read().iter().flatten().count()
    }

    fn context(&self) -> &TrackContext {
        &self.base.context
    }

    fn subscribe(&self, client: &ClientHandle) -> Result<Arc<dyn ClientTrack>> {
        let Some(this) = self.self_ref.upgrade() else {
            return Err(Error::LocalTrackSetup("simulcast track is gone".to_string()));
        };

        let client_track: Arc<dyn ClientTrack> = SimulcastClientTrack::new(
            client,
            &this,
            self.base.id.clone(),
            self.base.kind,
            self.base.codec.capability.mime_type.clone(),
            self.is_screen(),
            self.base.queue_size,
        );

        self.base.client_tracks.add(Arc::clone(&client_track));

        let remotes: Vec<_> = self.remote_tracks.read().iter().flatten().cloned().collect();
        for remote in remotes {
            let weak_track = Arc::downgrade(&client_track);
            remote.on_ended(Box::new(move || {
                if let Some(track) = weak_track.upgrade() {
                    track.mark_ended();
                }
            }));
        }

        let weak_list = Arc::downgrade(&self.base.client_tracks);
        let client_id = client.id.clone();
        client_track.on_ended(Box::new(move || {
            if let Some(list) = weak_list.upgrade() {
                list.remove(&client_id);
            }
        }));

        Ok(client_track)
    }

    fn on_read(&self, f: OnReadHdlrFn) {
        self.base.read_callbacks.lock().push(f);
    }
}

/// Per-client registry of source tracks keyed by track id
#[derive(Default)]
pub struct TrackList {
    tracks: RwLock<HashMap<TrackId, Arc<dyn Track>>>,
}

impl TrackList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, track: Arc<dyn Track>) -> Result<()> {
        let mut tracks = self.tracks.write();
        let id = track.id();
        if tracks.contains_key(&id) {
            warn!(track_id = %id, "track already added");
            return Err(Error::TrackExists(id.to_string()));
        }
        tracks.insert(id, track);
        Ok(())
    }

    pub fn get(&self, id: &TrackId) -> Result<Arc<dyn Track>> {
        self.tracks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TrackIsNotExists(id.to_string()))
    }

    pub fn remove(&self, ids: &[TrackId]) {
        let mut tracks = self.tracks.write();
        for id in ids {
            tracks.remove(id);
        }
    }

    pub fn reset(&self) {
        self.tracks.write().clear();
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Track>> {
        self.tracks.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        rtp_packet, rtp_packet_with, vp8_interframe_payload, vp8_keyframe_payload, vp9_payload,
        wait_for, MockFeed, MockReader, MockTransport,
    };
    use std::sync::atomic::AtomicUsize;

    fn test_options() -> TrackOptions {
        TrackOptions {
            pool: PacketPool::new(256),
            config: SfuConfig {
                pli_interval_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn publisher() -> (ClientHandle, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        (
            ClientHandle::new("publisher", Arc::clone(&transport) as _),
            transport,
        )
    }

    fn subscriber(id: &str) -> (ClientHandle, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        (
            ClientHandle::new(id, Arc::clone(&transport) as _),
            transport,
        )
    }

    fn simulcast_with(
        rids: &[&str],
    ) -> (Arc<SimulcastTrack>, Vec<Arc<MockFeed>>, Arc<MockTransport>) {
        let (client, transport) = publisher();
        let ssrc_for = |rid: &str| 1 + u32::from(QualityLevel::from_rid(rid).as_u8());

        let (first, first_feed) = MockReader::video_vp8_rid("cam", ssrc_for(rids[0]), rids[0]);
        let track = SimulcastTrack::new(&client, first, test_options());
        let mut feeds = vec![first_feed];

        for rid in &rids[1..] {
            let (reader, feed) = MockReader::video_vp8_rid("cam", ssrc_for(rid), rid);
            track.add_remote_track(reader).unwrap();
            feeds.push(feed);
        }
        (track, feeds, transport)
    }

    #[tokio::test]
    async fn test_single_stream_fan_out() {
        let (client, _) = publisher();
        let (reader, feed) = MockReader::audio_opus("mic", 7);
        let track = SingleTrack::new(&client, reader, test_options());

        let (sub1, sub1_transport) = subscriber("sub-1");
        let (sub2, sub2_transport) = subscriber("sub-2");
        track.subscribe(&sub1).unwrap();
        track.subscribe(&sub2).unwrap();

        let qualities = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&qualities);
        track.on_read(Box::new(move |packet, quality| {
            seen.lock().push((packet.header().sequence_number, quality));
        }));

        for seq in 1000..1100u16 {
            feed.send(rtp_packet(seq, 0, 7)).await;
        }

        wait_for(|| {
            sub1_transport.rtp_packets().len() == 100 && sub2_transport.rtp_packets().len() == 100
        })
        .await;

        let expected: Vec<u16> = (1000..1100).collect();
        assert_eq!(sub1_transport.rtp_seqs(), expected);
        assert_eq!(sub2_transport.rtp_seqs(), expected);

        let seen = qualities.lock();
        assert_eq!(seen.len(), 100);
        assert!(seen.iter().all(|(_, q)| *q == QualityLevel::High));
    }

    #[tokio::test]
    async fn test_relay_callback_receives_ssrc() {
        let (client, _) = publisher();
        let (reader, feed) = MockReader::audio_opus("mic", 42);
        let track = SingleTrack::new(&client, reader, test_options());

        let ssrcs = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ssrcs);
        track.relay(Box::new(move |ssrc, _packet| {
            seen.lock().push(ssrc);
        }));

        feed.send(rtp_packet(1, 0, 42)).await;
        wait_for(|| !ssrcs.lock().is_empty()).await;
        assert_eq!(ssrcs.lock()[0], 42);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_break_fan_out() {
        let (client, _) = publisher();
        let (reader, feed) = MockReader::audio_opus("mic", 7);
        let track = SingleTrack::new(&client, reader, test_options());

        let (sub, sub_transport) = subscriber("sub-1");
        track.on_read(Box::new(|_, _| panic!("faulty callback")));
        track.subscribe(&sub).unwrap();

        for seq in 0..5u16 {
            feed.send(rtp_packet(seq, 0, 7)).await;
        }

        wait_for(|| sub_transport.rtp_packets().len() == 5).await;
    }

    #[tokio::test]
    async fn test_subscribe_dispatch_by_codec() {
        let (client, _) = publisher();

        let (vp9_reader, _feed) = MockReader::video_vp9("cam", 1);
        let vp9_track = SingleTrack::new(&client, vp9_reader, test_options());
        let (sub, _) = subscriber("sub-1");
        let client_track = vp9_track.subscribe(&sub).unwrap();
        assert!(vp9_track.is_scalable());
        assert!(client_track.is_scalable());

        let (opus_reader, _feed) = MockReader::audio_opus("mic", 2);
        let opus_track = SingleTrack::new(&client, opus_reader, test_options());
        let client_track = opus_track.subscribe(&sub).unwrap();
        assert!(!opus_track.is_scalable());
        assert!(!client_track.is_scalable());
    }

    #[tokio::test]
    async fn test_video_subscribe_triggers_pli() {
        let (client, publisher_transport) = publisher();
        let (reader, _feed) = MockReader::video_vp8("cam", 9);
        let track = SingleTrack::new(&client, reader, test_options());

        let (sub, _) = subscriber("sub-1");
        track.subscribe(&sub).unwrap();

        wait_for(|| publisher_transport.pli_count() == 1).await;
        assert_eq!(publisher_transport.pli_ssrcs(), vec![9]);
    }

    #[tokio::test]
    async fn test_red_subscription_unpacks_primary() {
        let (client, _) = publisher();
        let (reader, feed) = MockReader::audio_red("mic", 5);
        let track = SingleTrack::new(&client, reader, test_options());

        let (sub, sub_transport) = subscriber("sub-1");
        track.subscribe(&sub).unwrap();

        let red_payload = vec![0xef, 0x00, 0x00, 0x03, 0x6f, 1, 2, 3, 9, 9];
        feed.send(rtp_packet_with(10, 100, 5, false, red_payload)).await;

        wait_for(|| !sub_transport.rtp_packets().is_empty()).await;
        let out = sub_transport.rtp_packets().remove(0);
        assert_eq!(out.header.payload_type, 111);
        assert_eq!(&out.payload[..], &[9, 9]);
    }

    #[tokio::test]
    async fn test_scalable_layer_filtering() {
        let (client, _) = publisher();
        let (reader, feed) = MockReader::video_vp9("cam", 9);
        let track = SingleTrack::new(&client, reader, test_options());

        let (sub, sub_transport) = subscriber("sub-1");
        let client_track = track.subscribe(&sub).unwrap();
        client_track.set_max_spatial_layer(0);

        // Two pictures, three spatial layers each; only the base layer
        // may come through.
        let mut seq = 0u16;
        for picture in 0..2u16 {
            for sid in 0..3u8 {
                seq += 1;
                feed.send(rtp_packet_with(
                    seq,
                    1000 * u32::from(picture),
                    9,
                    sid == 2,
                    vp9_payload(100 + picture, picture > 0, true, true, sid, 0),
                ))
                .await;
            }
        }

        wait_for(|| sub_transport.rtp_packets().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let packets = sub_transport.rtp_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(
            packets
                .iter()
                .map(|p| p.header.sequence_number)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_single_track_ends_with_remote() {
        let (client, _) = publisher();
        let (reader, feed) = MockReader::audio_opus("mic", 7);
        let track = SingleTrack::new(&client, reader, test_options());

        let (sub, _) = subscriber("sub-1");
        let client_track = track.subscribe(&sub).unwrap();

        let ended = Arc::new(AtomicUsize::new(0));
        let ended_count = Arc::clone(&ended);
        client_track.on_ended(Box::new(move || {
            ended_count.fetch_add(1, Ordering::SeqCst);
        }));

        feed.close();
        track.context().cancelled().await;
        wait_for(|| ended.load(Ordering::SeqCst) == 1).await;
        assert_eq!(track.base.client_tracks.len(), 0);
    }

    #[tokio::test]
    async fn test_simulcast_bundle_completion() {
        let (track, _feeds, _publisher_transport) = simulcast_with(&["low"]);
        assert_eq!(track.total_tracks(), 1);
        assert!(!track.is_track_complete());

        let completed = Arc::new(AtomicUsize::new(0));
        let completed_count = Arc::clone(&completed);
        track.on_track_complete(Box::new(move || {
            completed_count.fetch_add(1, Ordering::SeqCst);
        }));

        let (mid, _mid_feed) = MockReader::video_vp8_rid("cam", 2, "mid");
        track.add_remote_track(mid).unwrap();
        assert_eq!(track.total_tracks(), 2);
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        let (high, _high_feed) = MockReader::video_vp8_rid("cam", 3, "high");
        track.add_remote_track(high).unwrap();
        assert_eq!(track.total_tracks(), 3);
        assert!(track.is_track_complete());
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        // A duplicate quality is rejected and the signal never refires.
        let (dup, _dup_feed) = MockReader::video_vp8_rid("cam", 4, "high");
        assert!(track.add_remote_track(dup).is_none());
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_added_remote_track_callback() {
        let (track, _feeds, _publisher_transport) = simulcast_with(&["low"]);

        let added = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&added);
        track.on_added_remote_track(Box::new(move |remote| {
            seen.lock().push(remote.rid());
        }));

        let (mid, _mid_feed) = MockReader::video_vp8_rid("cam", 2, "mid");
        track.add_remote_track(mid).unwrap();
        assert_eq!(*added.lock(), vec!["mid".to_string()]);
    }

    #[tokio::test]
    async fn test_quality_switch_on_keyframe() {
        let (track, feeds, _publisher_transport) = simulcast_with(&["low", "high"]);
        let low_feed = &feeds[0];
        let high_feed = &feeds[1];

        let (sub, sub_transport) = subscriber("sub-1");
        track.subscribe(&sub).unwrap();

        // Low delivers a keyframe first; the subscriber starts on low.
        low_feed
            .send(rtp_packet_with(10, 1000, 1, false, vp8_keyframe_payload()))
            .await;
        wait_for(|| sub_transport.rtp_packets().len() == 1).await;

        // High becomes live with an interframe: not switchable yet, low
        // keeps flowing.
        high_feed
            .send(rtp_packet_with(50, 5000, 3, false, vp8_interframe_payload()))
            .await;
        low_feed
            .send(rtp_packet_with(11, 1100, 1, false, vp8_interframe_payload()))
            .await;
        wait_for(|| sub_transport.rtp_packets().len() == 2).await;

        // The first high keyframe flips the switch.
        high_feed
            .send(rtp_packet_with(51, 5100, 3, false, vp8_keyframe_payload()))
            .await;
        wait_for(|| sub_transport.rtp_packets().len() == 3).await;

        high_feed
            .send(rtp_packet_with(52, 5200, 3, false, vp8_interframe_payload()))
            .await;
        wait_for(|| sub_transport.rtp_packets().len() == 4).await;

        // Low packets after the switch are dropped.
        low_feed
            .send(rtp_packet_with(12, 1200, 1, false, vp8_interframe_payload()))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let packets = sub_transport.rtp_packets();
        assert_eq!(packets.len(), 4);
        assert_eq!(
            packets
                .iter()
                .map(|p| p.header.sequence_number)
                .collect::<Vec<_>>(),
            vec![1, 2, 3, 4],
            "outbound sequence numbers must be continuous across the switch"
        );
        assert_eq!(
            packets.iter().map(|p| p.header.ssrc).collect::<Vec<_>>(),
            vec![1, 1, 3, 3]
        );
        assert_eq!(
            packets
                .iter()
                .map(|p| p.header.timestamp)
                .collect::<Vec<_>>(),
            vec![1000, 1100, 1100, 1200],
            "high timestamps must be re-based onto the bundle timeline"
        );
    }

    #[tokio::test]
    async fn test_encoding_stall_marks_inactive() {
        let (track, feeds, _publisher_transport) = simulcast_with(&["high"]);

        feeds[0]
            .send(rtp_packet_with(1, 0, 3, false, vp8_interframe_payload()))
            .await;
        wait_for(|| track.is_active_quiet(QualityLevel::High)).await;
        assert!(track.is_active(QualityLevel::High));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!track.is_active(QualityLevel::High));

        // A quality that never had a slot is inactive too.
        assert!(!track.is_active(QualityLevel::Mid));
    }

    #[tokio::test]
    async fn test_simulcast_pli_broadcast() {
        let (track, _feeds, publisher_transport) = simulcast_with(&["low", "mid", "high"]);

        track.send_pli().await;

        // One PLI per present encoding, through the publisher's transport.
        let mut ssrcs = publisher_transport.pli_ssrcs();
        ssrcs.sort_unstable();
        assert_eq!(ssrcs, vec![1, 2, 3]);

        // Repeating within the PLI interval is coalesced per encoding.
        track.send_pli().await;
        assert_eq!(publisher_transport.pli_count(), 3);
    }

    #[tokio::test]
    async fn test_partial_bundle_death_cancels_bundle() {
        let (track, feeds, _publisher_transport) = simulcast_with(&["low", "mid", "high"]);
        assert!(track.is_track_complete());
        assert_eq!(track.total_tracks(), 3);

        // Mid's transport hits EOF.
        feeds[1].close();
        track.context().cancelled().await;

        assert_eq!(track.total_tracks(), 2);
        assert!(!track.is_track_complete());
    }

    #[tokio::test]
    async fn test_source_type_round_trip() {
        let (client, _) = publisher();
        let (reader, _feed) = MockReader::video_vp8("cam", 1);
        let track = SingleTrack::new(&client, reader, test_options());

        assert_eq!(track.source_type(), SourceType::Media);
        assert!(!track.is_screen());

        track.set_source_type(SourceType::Screen);
        assert_eq!(track.source_type(), SourceType::Screen);
        assert!(track.is_screen());
    }

    #[tokio::test]
    async fn test_track_list_round_trip() {
        let (client, _) = publisher();
        let (reader, _feed) = MockReader::audio_opus("abc", 1);
        let track: Arc<dyn Track> = SingleTrack::new(&client, reader, test_options());

        let list = TrackList::new();
        list.add(Arc::clone(&track)).unwrap();

        let found = list.get(&TrackId::from("abc")).unwrap();
        assert_eq!(found.id(), TrackId::from("abc"));

        list.remove(&[TrackId::from("abc")]);
        assert!(matches!(
            list.get(&TrackId::from("abc")),
            Err(Error::TrackIsNotExists(_))
        ));
    }

    #[tokio::test]
    async fn test_track_list_duplicate_add_rejected() {
        let (client, _) = publisher();
        let (reader, _feed) = MockReader::audio_opus("abc", 1);
        let first: Arc<dyn Track> = SingleTrack::new(&client, reader, test_options());
        let (reader, _feed) = MockReader::audio_opus("abc", 2);
        let second: Arc<dyn Track> = SingleTrack::new(&client, reader, test_options());

        let list = TrackList::new();
        list.add(first).unwrap();
        assert!(matches!(list.add(second), Err(Error::TrackExists(_))));

        // The first handle stays retrievable.
        let found = list.get(&TrackId::from("abc")).unwrap();
        assert_eq!(found.id(), TrackId::from("abc"));
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn test_track_list_reset_and_snapshot() {
        let (client, _) = publisher();
        let list = TrackList::new();

        for id in ["a", "b", "c"] {
            let (reader, _feed) = MockReader::audio_opus(id, 1);
            list.add(SingleTrack::new(&client, reader, test_options()))
                .unwrap();
        }
        assert_eq!(list.snapshot().len(), 3);

        list.reset();
        assert!(list.is_empty());
    }
}
