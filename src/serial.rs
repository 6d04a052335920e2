//! Serial port link (USB-UART adapter or a bound `/dev/rfcomm*` device).
//!
//! `serialport` is blocking, so writes run on tokio's blocking pool and a
//! dedicated reader thread turns received bytes into notifications.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serialport::SerialPort;
use tokio::sync::mpsc;

use crate::config::SERIAL_BAUD_RATE;
use crate::connection::{Connector, DeviceInfo, Link, LinkEvent, LinkSession};
use crate::errors::{LinkError, Result, RigError};

/// Read timeout of the reader thread; bounds how late a close is noticed.
const READ_POLL: Duration = Duration::from_millis(100);

/// Opens a serial port to the rig.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub path: String,
    pub baud_rate: u32,
    pub read_poll: Duration,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: SERIAL_BAUD_RATE,
            read_poll: READ_POLL,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self) -> Result<LinkSession> {
        let path = self.path.clone();
        let baud_rate = self.baud_rate;
        let read_poll = self.read_poll;
        debug!("opening serial port: path={}, baud={}", path, baud_rate);

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud_rate).timeout(read_poll).open()
        })
        .await
        .map_err(|e| LinkError::Connection(format!("open task failed: {e}")))?
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => RigError::Discovery(e.to_string()),
            _ => RigError::Serial(e),
        })?;

        let reader = port.try_clone()?;
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, events) = mpsc::unbounded_channel();
        spawn_reader(reader, closed.clone(), tx)?;

        info!("serial port open: path={}", self.path);
        Ok(LinkSession {
            device: DeviceInfo {
                name: Some(self.path.clone()),
                address: self.path.clone(),
            },
            link: Arc::new(SerialLink {
                port: Arc::new(Mutex::new(port)),
                closed,
            }),
            events,
        })
    }
}

struct SerialLink {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Link for SerialLink {
    async fn write(&self, bytes: &[u8]) -> std::result::Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let port = self.port.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| LinkError::Write("serial port lock poisoned".into()))?;
            port.write_all(&bytes)
                .and_then(|_| port.flush())
                .map_err(|e| LinkError::Write(e.to_string()))
        })
        .await
        .map_err(|e| LinkError::Write(format!("write task failed: {e}")))?
    }

    async fn close(&self) -> std::result::Result<(), LinkError> {
        // The reader thread notices within one poll and reports `Closed`.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn spawn_reader(
    mut port: Box<dyn SerialPort>,
    closed: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<LinkEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name("stringart-serial-rx".into())
        .spawn(move || {
            let mut buf = [0u8; 256];
            while !closed.load(Ordering::SeqCst) {
                match port.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(LinkEvent::Notification(text)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => {
                        warn!("serial read failed: {}", e);
                        closed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
            let _ = tx.send(LinkEvent::Closed);
        })?;
    Ok(())
}

/// Serial ports currently present on the system.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
