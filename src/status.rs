//! The single status line shown to the user.
//!
//! Every outcome (connect, send, acknowledgement, failure) ends up here as a
//! [`Status`]. Front ends render [`Status::message`] and colour it by
//! [`Status::is_error`].

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;

/// Latest outcome reported by the rig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "data")]
pub enum Status {
    /// Nothing connected yet.
    Idle,
    /// Discovery / connection in progress.
    Connecting,
    /// Link established.
    Connected { device: String },
    /// Discovery ended without a device (user cancelled or nothing found).
    DiscoveryCancelled,
    /// Connecting failed.
    ConnectFailed { reason: String },
    /// Link closed by request.
    Disconnected,
    /// Link dropped while frames were pending.
    LinkLost,
    /// A send was attempted without a link.
    NotConnected,
    /// The panel contents could not be encoded; nothing was sent.
    Rejected { reason: String },
    /// Chunks of a frame are being written; `queued` frames wait behind it.
    Sending {
        command: String,
        chunk: usize,
        total: usize,
        queued: usize,
    },
    /// All chunks written, waiting for the acknowledgement.
    AwaitingAck { command: String, queued: usize },
    /// The firmware confirmed the frame.
    Confirmed { command: String },
    /// Written, but no acknowledgement was requested.
    Sent { command: String },
    /// Written, but the acknowledgement never came.
    Unconfirmed { command: String },
    /// A write failed.
    SendFailed { reason: String },
    /// Queue drained, ready for the next command.
    Ready,
    /// The panel fields were cleared.
    Cleared,
}

impl Status {
    /// Human-readable text for the status line.
    pub fn message(&self) -> String {
        match self {
            Status::Idle => "Ready to connect.".into(),
            Status::Connecting => "Searching for device...".into(),
            Status::Connected { device } => format!("Connected to {device}."),
            Status::DiscoveryCancelled => "Device search cancelled.".into(),
            Status::ConnectFailed { reason } => format!("Connection failed: {reason}"),
            Status::Disconnected => "Disconnected.".into(),
            Status::LinkLost => "Connection lost.".into(),
            Status::NotConnected => "Not connected.".into(),
            Status::Rejected { reason } => format!("Invalid input: {reason}"),
            Status::Sending {
                command,
                chunk,
                total,
                queued,
            } => format!("Sending '{command}' ({chunk}/{total}){}", queued_suffix(*queued)),
            Status::AwaitingAck { command, queued } => format!(
                "Waiting for confirmation of '{command}'{}",
                queued_suffix(*queued)
            ),
            Status::Confirmed { command } => format!("Sent '{command}', confirmed."),
            Status::Sent { command } => format!("Sent '{command}'."),
            Status::Unconfirmed { command } => {
                format!("Sent '{command}', no confirmation received.")
            }
            Status::SendFailed { reason } => format!("Send failed: {reason}"),
            Status::Ready => "Ready for the next command.".into(),
            Status::Cleared => "Panel cleared.".into(),
        }
    }

    /// Whether the status line should be shown as an error.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Status::ConnectFailed { .. }
                | Status::LinkLost
                | Status::NotConnected
                | Status::Rejected { .. }
                | Status::SendFailed { .. }
        )
    }

    /// Whether send and connect controls must be disabled.
    pub fn controls_locked(&self) -> bool {
        matches!(
            self,
            Status::Connecting | Status::Sending { .. } | Status::AwaitingAck { .. }
        )
    }
}

fn queued_suffix(queued: usize) -> String {
    match queued {
        0 => String::new(),
        n => format!(", {n} queued"),
    }
}

/// Shared publisher of the status line.
#[derive(Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<Status>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Status::Idle);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the status line.
    pub fn set(&self, status: Status) {
        if status.is_error() {
            warn!("{}", status.message());
        } else {
            info!("{}", status.message());
        }
        self.tx.send_replace(status);
    }

    /// Update the queue depth shown by an active `Sending` / `AwaitingAck`
    /// line. Other statuses are left alone.
    pub fn set_queued(&self, depth: usize) {
        self.tx.send_if_modified(|status| match status {
            Status::Sending { queued, .. } | Status::AwaitingAck { queued, .. }
                if *queued != depth =>
            {
                *queued = depth;
                true
            }
            _ => false,
        });
    }

    pub fn current(&self) -> Status {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }
}
