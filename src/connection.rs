//! Connection lifecycle of the rig link.
//!
//! A [`Connector`] knows how to find and open one peripheral (BLE GATT,
//! serial port, or a scripted link in tests) and hands back a [`LinkSession`]:
//! the write handle plus a stream of [`LinkEvent`]s. The
//! [`ConnectionManager`] owns that handle and drives the state machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected --closed--> Disconnected
//!                             Connecting --err--> Disconnected
//! ```
//!
//! Whatever closes the link (a local `disconnect()`, the peripheral going
//! away, a failed write) goes through the same path: the session's event
//! stream reports `Closed` or ends, and the manager drops the handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};

use crate::errors::{LinkError, Result, RigError};
use crate::status::{Status, StatusBoard};

/// Capacity of the inbound notification fan-out.
const NOTIFICATION_BUFFER: usize = 64;

/// Write half of an open link.
#[async_trait]
pub trait Link: Send + Sync {
    /// Write one chunk. Returns once the local stack accepted it.
    async fn write(&self, bytes: &[u8]) -> std::result::Result<(), LinkError>;

    /// Ask the link to shut down. Completion is signalled through the
    /// session's event stream, not through this call.
    async fn close(&self) -> std::result::Result<(), LinkError>;
}

/// Something the peripheral side reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Text received on the notify characteristic / serial RX line.
    Notification(String),
    /// The link is gone.
    Closed,
}

/// Identity of the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub address: String,
}

impl DeviceInfo {
    /// Name if the device advertised one, address otherwise.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// Result of a successful [`Connector::open`].
pub struct LinkSession {
    pub device: DeviceInfo,
    pub link: Arc<dyn Link>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Discovers and opens a link to one peripheral.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fails with [`RigError::Discovery`] when no device was selected and
    /// with [`RigError::Link`] when the device could not be opened.
    async fn open(&self) -> Result<LinkSession>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Box<C> {
    async fn open(&self) -> Result<LinkSession> {
        (**self).open().await
    }
}

/// Public view of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Internal state. The link handle only exists in `Connected`.
#[derive(Clone)]
enum Slot {
    Disconnected,
    Connecting,
    Connected {
        device: DeviceInfo,
        link: Arc<dyn Link>,
        epoch: u64,
    },
}

impl Slot {
    fn state(&self) -> ConnectionState {
        match self {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connecting => ConnectionState::Connecting,
            Slot::Connected { .. } => ConnectionState::Connected,
        }
    }

    fn epoch(&self) -> Option<u64> {
        match self {
            Slot::Connected { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }
}

struct Inner {
    connector: Box<dyn Connector>,
    slot: watch::Sender<Slot>,
    notifications: broadcast::Sender<String>,
    epochs: AtomicU64,
    status: StatusBoard,
}

impl Inner {
    /// Drop the link of connection `epoch`, if it is still the current one.
    fn mark_disconnected(&self, epoch: u64) {
        let changed = self.slot.send_if_modified(|slot| {
            if slot.epoch() == Some(epoch) {
                *slot = Slot::Disconnected;
                true
            } else {
                false
            }
        });
        if changed {
            info!("link closed: epoch={}", epoch);
            self.status.set(Status::Disconnected);
        }
    }
}

/// Resets `Connecting` back to `Disconnected` if `connect()` is abandoned.
struct ConnectingGuard<'a> {
    slot: &'a watch::Sender<Slot>,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.send_if_modified(|slot| {
                if matches!(slot, Slot::Connecting) {
                    *slot = Slot::Disconnected;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Owner of the one link to the rig. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: impl Connector + 'static, status: StatusBoard) -> Self {
        let (slot, _) = watch::channel(Slot::Disconnected);
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            inner: Arc::new(Inner {
                connector: Box::new(connector),
                slot,
                notifications,
                epochs: AtomicU64::new(0),
                status,
            }),
        }
    }

    /// Discover, open, and start listening to the peripheral.
    ///
    /// Rejected with [`RigError::Busy`] unless currently disconnected. Must be
    /// called from within a tokio runtime: the event listener is spawned.
    pub async fn connect(&self) -> Result<DeviceInfo> {
        let mut current = ConnectionState::Disconnected;
        let claimed = self.inner.slot.send_if_modified(|slot| {
            current = slot.state();
            if matches!(slot, Slot::Disconnected) {
                *slot = Slot::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            let reason = match current {
                ConnectionState::Connecting => "connect already in progress",
                _ => "already connected",
            };
            return Err(RigError::Busy(reason.into()));
        }

        let mut guard = ConnectingGuard {
            slot: &self.inner.slot,
            armed: true,
        };
        self.inner.status.set(Status::Connecting);

        let session = match self.inner.connector.open().await {
            Ok(session) => session,
            Err(e) => {
                warn!("connect failed: {}", e);
                self.inner.status.set(if e.is_cancellation() {
                    Status::DiscoveryCancelled
                } else {
                    Status::ConnectFailed {
                        reason: e.to_string(),
                    }
                });
                return Err(e);
            }
        };

        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let device = session.device.clone();
        self.inner.slot.send_replace(Slot::Connected {
            device: device.clone(),
            link: session.link,
            epoch,
        });
        guard.armed = false;

        tokio::spawn(listen(self.inner.clone(), epoch, session.events));

        info!(
            "connected: device={}, address={}, epoch={}",
            device.label(),
            device.address,
            epoch
        );
        self.inner.status.set(Status::Connected {
            device: device.label().to_string(),
        });
        Ok(device)
    }

    /// Request link teardown. The state changes once the link reports closed.
    pub async fn disconnect(&self) -> Result<()> {
        let (link, epoch) = self.current_link().ok_or(RigError::NotConnected)?;
        if let Err(e) = link.close().await {
            warn!("link close failed, dropping it: {}", e);
            self.inner.mark_disconnected(epoch);
        }
        Ok(())
    }

    /// Write one chunk on the current link.
    ///
    /// A failed write is treated as a lost link: the handle is dropped.
    pub async fn write(&self, bytes: &[u8]) -> std::result::Result<(), LinkError> {
        let (link, epoch) = self.current_link().ok_or(LinkError::NotConnected)?;
        debug!("write: {} bytes, epoch={}", bytes.len(), epoch);
        if let Err(e) = link.write(bytes).await {
            warn!("write failed, closing link: {}", e);
            let _ = link.close().await;
            self.inner.mark_disconnected(epoch);
            return Err(e);
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.slot.borrow().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The connected device, if any.
    pub fn device(&self) -> Option<DeviceInfo> {
        match &*self.inner.slot.borrow() {
            Slot::Connected { device, .. } => Some(device.clone()),
            _ => None,
        }
    }

    /// Receive every notification that arrives from now on.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<String> {
        self.inner.notifications.subscribe()
    }

    /// Identifier of the current connection; changes on every reconnect.
    pub(crate) fn epoch(&self) -> Option<u64> {
        self.inner.slot.borrow().epoch()
    }

    /// Resolves once connection `epoch` is no longer the current one.
    pub(crate) async fn lost(&self, epoch: u64) {
        let mut rx = self.inner.slot.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|slot| slot.epoch() != Some(epoch)).await;
    }

    pub(crate) fn status(&self) -> &StatusBoard {
        &self.inner.status
    }

    fn current_link(&self) -> Option<(Arc<dyn Link>, u64)> {
        match &*self.inner.slot.borrow() {
            Slot::Connected { link, epoch, .. } => Some((link.clone(), *epoch)),
            _ => None,
        }
    }
}

/// Forward notifications until the session closes, then drop the link.
async fn listen(inner: Arc<Inner>, epoch: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Notification(text) => {
                debug!("notification: {:?}", text);
                // No subscriber simply means nobody is waiting for an ack.
                let _ = inner.notifications.send(text);
            }
            LinkEvent::Closed => break,
        }
    }
    inner.mark_disconnected(epoch);
}
