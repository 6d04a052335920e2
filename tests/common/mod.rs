//! Scripted in-memory link for driving the rig without hardware.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use stringart_link::{
    Connector, DeviceInfo, Link, LinkError, LinkEvent, LinkSession, Result, Rig, RigError,
    TransportConfig,
};

/// One chunk as the peripheral saw it.
#[derive(Debug, Clone)]
pub struct Write {
    pub at: Instant,
    pub bytes: Vec<u8>,
}

/// Shared state between the test and the scripted link.
#[derive(Default)]
pub struct Peripheral {
    writes: Mutex<Vec<Write>>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    /// Sent back whenever a write ends a frame.
    auto_ack: Mutex<Option<String>>,
    /// Time each write takes.
    write_delay: Mutex<Duration>,
    fail_writes: AtomicBool,
    next_open_error: Mutex<Option<RigError>>,
    pub opens: AtomicUsize,
}

impl Peripheral {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_auto_ack(&self, reply: Option<&str>) {
        *self.auto_ack.lock().unwrap() = reply.map(str::to_string);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_open(&self, error: RigError) {
        *self.next_open_error.lock().unwrap() = Some(error);
    }

    /// Push text as if it arrived on the notify characteristic.
    pub fn notify(&self, text: &str) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(LinkEvent::Notification(text.to_string()));
        }
    }

    /// Simulate the peripheral going away.
    pub fn drop_link(&self) {
        if let Some(tx) = self.events.lock().unwrap().take() {
            let _ = tx.send(LinkEvent::Closed);
        }
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().unwrap().clone()
    }

    /// Everything written so far, concatenated.
    pub fn received(&self) -> String {
        let bytes: Vec<u8> = self
            .writes()
            .into_iter()
            .flat_map(|w| w.bytes)
            .collect();
        String::from_utf8(bytes).unwrap()
    }
}

pub struct ScriptedConnector {
    pub peripheral: Arc<Peripheral>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self) -> Result<LinkSession> {
        self.peripheral.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(e) = self.peripheral.next_open_error.lock().unwrap().take() {
            return Err(e);
        }

        let (tx, events) = mpsc::unbounded_channel();
        *self.peripheral.events.lock().unwrap() = Some(tx);
        Ok(LinkSession {
            device: DeviceInfo {
                name: Some("StringArt".into()),
                address: "00:11:22:33:44:55".into(),
            },
            link: Arc::new(ScriptedLink {
                peripheral: self.peripheral.clone(),
            }),
            events,
        })
    }
}

struct ScriptedLink {
    peripheral: Arc<Peripheral>,
}

#[async_trait]
impl Link for ScriptedLink {
    async fn write(&self, bytes: &[u8]) -> std::result::Result<(), LinkError> {
        let delay = *self.peripheral.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.peripheral.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::Write("GATT operation failed".into()));
        }
        self.peripheral.writes.lock().unwrap().push(Write {
            at: Instant::now(),
            bytes: bytes.to_vec(),
        });
        if bytes.ends_with(b"\n") {
            let reply = self.peripheral.auto_ack.lock().unwrap().clone();
            if let Some(reply) = reply {
                self.peripheral.notify(&reply);
            }
        }
        Ok(())
    }

    async fn close(&self) -> std::result::Result<(), LinkError> {
        self.peripheral.drop_link();
        Ok(())
    }
}

/// Rig wired to a fresh scripted peripheral.
pub fn scripted_rig(config: TransportConfig) -> (Rig, Arc<Peripheral>) {
    let peripheral = Peripheral::new();
    let rig = Rig::new(
        ScriptedConnector {
            peripheral: peripheral.clone(),
        },
        config,
    );
    (rig, peripheral)
}

/// Rig that is already connected.
pub async fn connected_rig(config: TransportConfig) -> (Rig, Arc<Peripheral>) {
    let (rig, peripheral) = scripted_rig(config);
    rig.connect().await.expect("scripted connect");
    (rig, peripheral)
}

/// Let spawned tasks (listener, queue worker) catch up.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
