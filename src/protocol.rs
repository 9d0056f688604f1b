//! Event-bus protocol shared by the host adapter, the UI layer, and the
//! sync controller.
//!
//! Inbound traffic is a [`Message`] on the controller's mpsc inbox; outbound
//! state changes are [`EngineEvent`]s on a broadcast bus.

use tokio::sync::oneshot;

use crate::{order::TransformKind, persistence::RecordSummary};

/// Top-level envelope for all inbound traffic.
#[derive(Debug)]
pub enum Message<N> {
    Host(HostEvent<N>),
    Command(EngineCommand),
    /// Tears the engine down and ends the event loop.
    Shutdown,
}

/// Change notifications delivered by the host tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent<N> {
    /// A batch of subtree mutations; `added` lists inserted element roots.
    TreeChanged { added: Vec<N> },
    /// The host location changed, possibly without a full page load.
    LocationChanged(String),
    /// The current item finished playing and the host is about to advance.
    PlaybackEnded,
}

/// Requests from the presentation layer.
#[derive(Debug)]
pub enum EngineCommand {
    Invoke(TransformKind),
    Reset,
    CurrentTransform(oneshot::Sender<TransformKind>),
    SavedRecords(oneshot::Sender<Vec<RecordSummary>>),
}

/// Engine state changes published on the broadcast bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Activated {
        playlist_id: Option<String>,
        item_count: usize,
    },
    Deactivated,
    TransformApplied {
        kind: TransformKind,
        /// `true` for replays and continuity re-applications.
        silent: bool,
    },
    ResetApplied,
    DiscoveryRetry {
        attempt: u32,
    },
    DiscoveryGaveUp,
}
