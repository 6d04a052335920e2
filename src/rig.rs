//! The rig as seen by a front end: connect, push motor programs, start,
//! pause, and watch one status line.

use log::{info, warn};
use tokio::sync::watch;

use crate::config::TransportConfig;
use crate::connection::{ConnectionManager, ConnectionState, Connector, DeviceInfo};
use crate::errors::{Result, RigError};
use crate::frame::{encode, Frame, MotorFields, MotorPanel, MOTOR_COUNT};
use crate::queue::{CommandQueue, Delivery};
use crate::status::{Status, StatusBoard};

/// StringArt rig driver.
///
/// # Example
/// ```ignore
/// let rig = Rig::new(SerialConnector::new("/dev/ttyUSB0"), TransportConfig::default());
/// rig.connect().await?;
///
/// let mut panel = MotorPanel::default();
/// panel.set(1, MotorFields::new("100/40", "20/25", "1/0"))?;
/// rig.send_panel(&panel).await?;
/// rig.start().await?;
/// ```
pub struct Rig {
    conn: ConnectionManager,
    queue: CommandQueue,
    status: StatusBoard,
    config: TransportConfig,
}

impl Rig {
    /// Must be called from within a tokio runtime (the queue worker is spawned).
    pub fn new(connector: impl Connector + 'static, config: TransportConfig) -> Self {
        let status = StatusBoard::new();
        let conn = ConnectionManager::new(connector, status.clone());
        let queue = CommandQueue::new(conn.clone(), config.clone());
        Self {
            conn,
            queue,
            status,
            config,
        }
    }

    pub async fn connect(&self) -> Result<DeviceInfo> {
        self.conn.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.conn.disconnect().await
    }

    /// Encode the four motor slots and send them as one data frame.
    ///
    /// A validation failure is reported before anything is queued.
    pub async fn send_motors(&self, motors: &[MotorFields; MOTOR_COUNT]) -> Result<Delivery> {
        let frame = match encode(motors, self.config.mismatch_policy) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("not sending: {}", e);
                self.status.set(Status::Rejected {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        self.send(frame).await
    }

    pub async fn send_panel(&self, panel: &MotorPanel) -> Result<Delivery> {
        self.send_motors(panel.motors()).await
    }

    pub async fn start(&self) -> Result<Delivery> {
        self.send(Frame::start()).await
    }

    pub async fn pause(&self) -> Result<Delivery> {
        self.send(Frame::pause()).await
    }

    /// Queue any frame. Waits until it was written (and acknowledged, when
    /// the protocol asks for it).
    pub async fn send(&self, frame: Frame) -> Result<Delivery> {
        info!("send {}: {}", frame.kind().label(), frame.summary());
        self.queue.send(frame).await
    }

    /// The Clear action: blank the panel and say so.
    pub fn clear(&self, panel: &mut MotorPanel) {
        panel.clear();
        self.status.set(Status::Cleared);
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn device(&self) -> Option<DeviceInfo> {
        self.conn.device()
    }

    pub fn status(&self) -> Status {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Frames queued or in flight.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Whether send/connect controls should be disabled right now.
    pub fn controls_locked(&self) -> bool {
        self.state() == ConnectionState::Connecting || self.queue.is_busy()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl From<RigError> for Status {
    fn from(e: RigError) -> Self {
        match e {
            RigError::NotConnected => Status::NotConnected,
            RigError::LinkLost => Status::LinkLost,
            RigError::Validation { .. } => Status::Rejected {
                reason: e.to_string(),
            },
            RigError::Discovery(_) => Status::DiscoveryCancelled,
            other => Status::SendFailed {
                reason: other.to_string(),
            },
        }
    }
}
