//! Track-routing core of a Selective Forwarding Unit (SFU)
//!
//! An SFU receives RTP streams from a publishing peer and selectively
//! forwards their packets to many subscribing peers without transcoding.
//! This crate implements the routing core: the track abstraction over
//! single-encoding and simulcast sources, the per-packet fan-out pipeline,
//! per-subscriber quality selection, liveness and keyframe-request
//! machinery, and the client-scoped track registry. Signalling, ICE/DTLS/
//! SRTP transport and bitrate estimation live outside and plug in through
//! the traits in [`iface`].
//!
//! ## Architecture
//!
//! - **[`RemoteTrack`]**: one inbound RTP encoding with its read loop,
//!   optional reorder stage, PLI scheduler and stats cadence
//! - **[`SingleTrack`] / [`SimulcastTrack`]**: publisher-side source
//!   tracks fanning packets out to subscribers
//! - **Client tracks**: per-subscriber forwarders (plain, simulcast
//!   quality-switching, VP9 SVC layer selection, RED audio)
//! - **[`TrackList`]**: per-client registry of source tracks
//! - **[`PacketPool`]**: reusable packet buffers backing the fan-out
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_core::{ClientHandle, SingleTrack, TrackList, TrackOptions};
//!
//! let publisher = ClientHandle::new("alice", transport);
//! let track = SingleTrack::new(&publisher, reader, TrackOptions::default());
//!
//! let tracks = TrackList::new();
//! tracks.add(track.clone())?;
//!
//! let client_track = track.subscribe(&subscriber)?;
//! ```

mod client_track;
mod config;
mod context;
mod error;
mod iface;
mod packet;
mod remote_track;
mod reorder;
mod stats;
mod track;
mod types;

#[cfg(test)]
mod test_util;

pub use client_track::{
    ClientTrack, ClientTrackList, PlainClientTrack, RedClientTrack, ScalableClientTrack,
    SimulcastClientTrack,
};
pub use config::SfuConfig;
pub use context::TrackContext;
pub use error::{Error, Result};
pub use iface::{
    ClientHandle, OnNetworkConditionChangedHdlrFn, OnPacketHdlrFn, OnPliHdlrFn, OnReadHdlrFn,
    OnStatsUpdatedHdlrFn, RelayHdlrFn, RemoteStreamReader, StatsGetter, Transport,
};
pub use packet::{PacketPool, PooledPacket};
pub use remote_track::{RemoteTrack, RemoteTrackParams};
pub use reorder::{ReorderBuffer, SeqReorderBuffer};
pub use stats::{condition_for, NetworkCondition, RemoteTrackStats};
pub use track::{SimulcastTrack, SingleTrack, Track, TrackList, TrackOptions};
pub use types::{
    ClientId, QualityLevel, SourceType, StreamId, SubscribeTrackRequest, TrackId,
};
