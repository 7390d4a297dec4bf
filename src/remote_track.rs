//! Remote track: one inbound RTP encoding
//!
//! Wraps a [`RemoteStreamReader`] with an owned read loop, an optional
//! reorder stage, a throttled PLI scheduler and a periodic stats query.
//! Ordered packets are handed to the `on_packet` sink inline on the read
//! task so per-encoding ordering is preserved through fan-out.

use crate::context::TrackContext;
use crate::iface::{
    OnNetworkConditionChangedHdlrFn, OnPacketHdlrFn, OnPliHdlrFn, OnStatsUpdatedHdlrFn,
    RemoteStreamReader, StatsGetter, Transport,
};
use crate::reorder::ReorderBuffer;
use crate::stats::condition_for;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

/// Build a PLI hook that writes RTCP through the publisher's transport
pub(crate) fn pli_writer(transport: Arc<dyn Transport>) -> OnPliHdlrFn {
    Box::new(move |media_ssrc| {
        let transport = Arc::clone(&transport);
        Box::pin(async move {
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            transport.write_rtcp(&[Box::new(pli)]).await
        })
    })
}

pub struct RemoteTrackParams {
    pub parent: TrackContext,
    pub reader: Arc<dyn RemoteStreamReader>,
    pub reorder: Option<Box<dyn ReorderBuffer>>,
    pub pli_interval: Duration,
    pub on_pli: OnPliHdlrFn,
    pub stats_getter: Option<Arc<dyn StatsGetter>>,
    pub stats_interval: Duration,
    pub on_packet: OnPacketHdlrFn,
    pub on_stats_updated: Option<OnStatsUpdatedHdlrFn>,
    pub on_network_condition_changed: Option<OnNetworkConditionChangedHdlrFn>,
}

pub struct RemoteTrack {
    reader: Arc<dyn RemoteStreamReader>,
    context: TrackContext,
    pli_interval: Duration,
    on_pli: OnPliHdlrFn,
    last_pli: Mutex<Option<Instant>>,
    ended: AtomicBool,
    on_ended_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl RemoteTrack {
    /// Construct the track and start its read loop (and stats loop when a
    /// getter is supplied). The loops run until the context is cancelled
    /// or the reader fails.
    pub fn new(params: RemoteTrackParams) -> Arc<Self> {
        let RemoteTrackParams {
            parent,
            reader,
            reorder,
            pli_interval,
            on_pli,
            stats_getter,
            stats_interval,
            on_packet,
            on_stats_updated,
            on_network_condition_changed,
        } = params;

        let track = Arc::new(Self {
            reader,
            context: parent.child(),
            pli_interval,
            on_pli,
            last_pli: Mutex::new(None),
            ended: AtomicBool::new(false),
            on_ended_callbacks: Mutex::new(Vec::new()),
        });

        let read_track = Arc::clone(&track);
        tokio::spawn(async move {
            read_track.read_loop(reorder, on_packet).await;
        });

        if let Some(getter) = stats_getter {
            let stats_track = Arc::clone(&track);
            tokio::spawn(async move {
                stats_track
                    .stats_loop(
                        getter,
                        stats_interval,
                        on_stats_updated,
                        on_network_condition_changed,
                    )
                    .await;
            });
        }

        track
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reorder: Option<Box<dyn ReorderBuffer>>,
        on_packet: OnPacketHdlrFn,
    ) {
        loop {
            let deadline = reorder.as_ref().and_then(|buf| buf.next_deadline());

            tokio::select! {
                _ = self.context.cancelled() => {
                    debug!(track_id = %self.reader.id(), "read loop cancelled");
                    break;
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    if let Some(buf) = reorder.as_mut() {
                        let now = Instant::now();
                        while let Some(packet) = buf.pop_ready(now) {
                            on_packet(&packet);
                        }
                    }
                }
                result = self.reader.read() => match result {
                    Ok(packet) => match reorder.as_mut() {
                        Some(buf) => {
                            let now = Instant::now();
                            buf.push(packet, now);
                            while let Some(packet) = buf.pop_ready(now) {
                                on_packet(&packet);
                            }
                        }
                        None => on_packet(&packet),
                    },
                    Err(e) => {
                        error!(
                            track_id = %self.reader.id(),
                            ssrc = self.reader.ssrc(),
                            error = %e,
                            "failed to read RTP packet, stopping"
                        );
                        break;
                    }
                }
            }
        }

        // Flush whatever the reorder stage still holds before going down.
        if let Some(buf) = reorder.as_mut() {
            let now = Instant::now();
            while let Some(packet) = buf.pop_ready(now) {
                on_packet(&packet);
            }
        }

        self.context.cancel();
        self.fire_on_ended();
    }

    async fn stats_loop(
        self: Arc<Self>,
        getter: Arc<dyn StatsGetter>,
        interval: Duration,
        on_stats_updated: Option<OnStatsUpdatedHdlrFn>,
        on_network_condition_changed: Option<OnNetworkConditionChangedHdlrFn>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_condition = None;

        loop {
            tokio::select! {
                _ = self.context.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(stats) = getter.get(self.reader.ssrc()) else {
                        debug!(
                            track_id = %self.reader.id(),
                            ssrc = self.reader.ssrc(),
                            "no stats for track, skipping tick"
                        );
                        continue;
                    };

                    if let Some(cb) = &on_stats_updated {
                        cb(&stats);
                    }

                    let condition = condition_for(&stats);
                    if last_condition != Some(condition) {
                        last_condition = Some(condition);
                        if let Some(cb) = &on_network_condition_changed {
                            cb(condition);
                        }
                    }
                }
            }
        }
    }

    /// Request a keyframe for this encoding's SSRC. Requests arriving
    /// within `pli_interval` of the previous transmission are coalesced
    /// into it.
    pub async fn send_pli(&self) {
        {
            let mut last = self.last_pli.lock();
            let now = Instant::now();
            if let Some(sent) = *last {
                if now.duration_since(sent) < self.pli_interval {
                    return;
                }
            }
            *last = Some(now);
        }

        if let Err(e) = (self.on_pli)(self.reader.ssrc()).await {
            warn!(
                track_id = %self.reader.id(),
                ssrc = self.reader.ssrc(),
                error = %e,
                "failed to send PLI"
            );
        }
    }

    /// Register a callback fired once when the read loop terminates
    pub fn on_ended(&self, f: Box<dyn Fn() + Send + Sync>) {
        if self.ended.load(Ordering::Acquire) {
            f();
            return;
        }
        self.on_ended_callbacks.lock().push(f);
    }

    fn fire_on_ended(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.on_ended_callbacks.lock());
        for f in &callbacks {
            f();
        }
    }

    #[must_use]
    pub fn context(&self) -> &TrackContext {
        &self.context
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.reader.id()
    }

    #[must_use]
    pub fn rid(&self) -> String {
        self.reader.rid()
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.reader.ssrc()
    }

    #[must_use]
    pub fn kind(&self) -> RTPCodecType {
        self.reader.kind()
    }

    #[must_use]
    pub fn codec(&self) -> RTCRtpCodecParameters {
        self.reader.codec()
    }

    #[must_use]
    pub fn is_relay(&self) -> bool {
        self.reader.is_relay()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
