//! Single-flight command queue.
//!
//! Frames are handed to one worker task through an unbounded FIFO channel.
//! The worker takes one frame at a time, cuts it into `chunk_size` pieces,
//! writes them with `chunk_delay` between pieces, and optionally waits for the
//! frame's acknowledgement token before touching the next frame. Because only
//! the worker ever writes, chunks of two frames cannot interleave.
//!
//! Every job carries the connection epoch it was submitted under. Losing the
//! link cancels the active frame at its next await point, and each queued job
//! of that epoch then fails with [`RigError::LinkLost`] without a write. Jobs
//! submitted after a reconnect are unaffected.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::TransportConfig;
use crate::connection::ConnectionManager;
use crate::errors::{Result, RigError};
use crate::frame::Frame;
use crate::status::Status;

/// How a frame reached the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Delivery {
    /// Written and acknowledged by the firmware.
    Confirmed,
    /// Written; the protocol does not acknowledge this kind of frame.
    Sent,
    /// Written, but no acknowledgement arrived within the ack timeout.
    Unconfirmed,
}

/// Split `bytes` into link-sized chunks. Only the last one may be shorter.
pub fn chunk_frame(bytes: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    bytes.chunks(chunk_size.max(1)).collect()
}

struct Job {
    frame: Frame,
    epoch: u64,
    reply: oneshot::Sender<Result<Delivery>>,
}

/// Handle for submitting frames. Cheap to clone; all clones feed one worker.
#[derive(Clone)]
pub struct CommandQueue {
    jobs: mpsc::UnboundedSender<Job>,
    conn: ConnectionManager,
    pending: Arc<AtomicUsize>,
}

impl CommandQueue {
    /// Start the worker. Must be called from within a tokio runtime.
    pub fn new(conn: ConnectionManager, config: TransportConfig) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            conn: conn.clone(),
            config,
            jobs: rx,
            pending: pending.clone(),
        };
        tokio::spawn(worker.run());
        Self {
            jobs,
            conn,
            pending,
        }
    }

    /// Queue `frame` and wait until it has been delivered.
    ///
    /// Fails immediately with [`RigError::NotConnected`] (queue untouched) when
    /// there is no link; with [`RigError::LinkLost`] when the link drops before
    /// the frame went out.
    pub async fn send(&self, frame: Frame) -> Result<Delivery> {
        let Some(epoch) = self.conn.epoch() else {
            self.conn.status().set(Status::NotConnected);
            return Err(RigError::NotConnected);
        };

        let (reply, rx) = oneshot::channel();
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.conn.status().set_queued(pending - 1);
        debug!("queued {} frame ({} pending)", frame.kind().label(), pending);

        if self.jobs.send(Job { frame, epoch, reply }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(RigError::LinkLost);
        }
        rx.await.unwrap_or(Err(RigError::LinkLost))
    }

    /// Frames queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// True while any frame is queued or in flight.
    pub fn is_busy(&self) -> bool {
        self.pending() > 0
    }
}

struct Worker {
    conn: ConnectionManager,
    config: TransportConfig,
    jobs: mpsc::UnboundedReceiver<Job>,
    pending: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            let outcome = self.process(&job).await;
            let delivered = outcome.is_ok();
            self.finish(job, outcome);
            if delivered && self.pending.load(Ordering::SeqCst) == 0 {
                self.conn.status().set(Status::Ready);
            }
        }
        debug!("command queue closed");
    }

    async fn process(&self, job: &Job) -> Result<Delivery> {
        if self.conn.epoch() != Some(job.epoch) {
            debug!(
                "discarding {} frame of closed link (epoch {})",
                job.frame.kind().label(),
                job.epoch
            );
            return Err(RigError::LinkLost);
        }

        // Subscribe before the first write so an early ack is not missed.
        let mut notifications = self.conn.subscribe_notifications();
        let bytes = self.config.protocol.wire_bytes(&job.frame);

        tokio::select! {
            biased;
            _ = self.conn.lost(job.epoch) => {
                warn!("link lost while sending {} frame", job.frame.kind().label());
                self.conn.status().set(Status::LinkLost);
                Err(RigError::LinkLost)
            }
            delivery = self.deliver(&job.frame, &bytes, &mut notifications) => delivery,
        }
    }

    async fn deliver(
        &self,
        frame: &Frame,
        bytes: &[u8],
        notifications: &mut broadcast::Receiver<String>,
    ) -> Result<Delivery> {
        let command = frame.summary();
        let chunks = chunk_frame(bytes, self.config.chunk_size);
        let total = chunks.len();

        for (i, chunk) in chunks.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            self.conn.status().set(Status::Sending {
                command: command.clone(),
                chunk: i + 1,
                total,
                queued: self.queued(),
            });
            if let Err(e) = self.conn.write(chunk).await {
                self.conn.status().set(Status::SendFailed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        }

        let Some(token) = self.config.protocol.ack_token(frame.kind()) else {
            self.conn.status().set(Status::Sent { command });
            return Ok(Delivery::Sent);
        };

        self.conn.status().set(Status::AwaitingAck {
            command: command.clone(),
            queued: self.queued(),
        });
        if await_ack(notifications, token, self.config.ack_timeout).await {
            info!("{} frame confirmed", frame.kind().label());
            self.conn.status().set(Status::Confirmed { command });
            Ok(Delivery::Confirmed)
        } else {
            warn!("no {} within {:?}, continuing", token, self.config.ack_timeout);
            self.conn.status().set(Status::Unconfirmed { command });
            Ok(Delivery::Unconfirmed)
        }
    }

    /// Frames waiting behind the active one.
    fn queued(&self) -> usize {
        self.pending.load(Ordering::SeqCst).saturating_sub(1)
    }

    fn finish(&self, job: Job, outcome: Result<Delivery>) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        // The caller may have stopped waiting; the frame is done either way.
        let _ = job.reply.send(outcome);
    }
}

/// Wait for `token` to show up in the notification text.
///
/// Notifications may split the token, so text is accumulated. Returns false
/// on timeout or when the notification source goes away.
async fn await_ack(
    notifications: &mut broadcast::Receiver<String>,
    token: &str,
    timeout: Duration,
) -> bool {
    let wait = async {
        let mut seen = String::new();
        loop {
            match notifications.recv().await {
                Ok(text) => {
                    seen.push_str(&text);
                    if seen.contains(token) {
                        return true;
                    }
                    trim_front(&mut seen, token.len());
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("ack wait skipped {} notifications", skipped);
                }
                Err(RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}

/// Keep only the tail that could still start a token of `token_len` bytes.
fn trim_front(seen: &mut String, token_len: usize) {
    let keep = token_len.saturating_sub(1);
    if seen.len() <= keep {
        return;
    }
    let mut cut = seen.len() - keep;
    while !seen.is_char_boundary(cut) {
        cut += 1;
    }
    seen.drain(..cut);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::Protocol;
    use crate::connection::{Connector, DeviceInfo, Link, LinkEvent, LinkSession};
    use crate::errors::LinkError;
    use crate::status::StatusBoard;

    type Events = Arc<Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>>;

    /// Records writes; `close` reports the link closed.
    #[derive(Default)]
    struct Loopback {
        writes: Arc<Mutex<Vec<u8>>>,
        events: Events,
    }

    struct LoopbackLink {
        writes: Arc<Mutex<Vec<u8>>>,
        events: Events,
    }

    #[async_trait]
    impl Connector for Loopback {
        async fn open(&self) -> Result<LinkSession> {
            let (tx, events) = mpsc::unbounded_channel();
            *self.events.lock().unwrap() = Some(tx);
            Ok(LinkSession {
                device: DeviceInfo {
                    name: None,
                    address: "loopback".into(),
                },
                link: Arc::new(LoopbackLink {
                    writes: self.writes.clone(),
                    events: self.events.clone(),
                }),
                events,
            })
        }
    }

    #[async_trait]
    impl Link for LoopbackLink {
        async fn write(&self, bytes: &[u8]) -> std::result::Result<(), LinkError> {
            self.writes.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        async fn close(&self) -> std::result::Result<(), LinkError> {
            if let Some(tx) = self.events.lock().unwrap().take() {
                let _ = tx.send(LinkEvent::Closed);
            }
            Ok(())
        }
    }

    #[test]
    fn chunks_cover_the_payload_in_order() {
        let payload = b"100,20,1|40,25,1|30,40,0;0,0,0;0,0,0;0,0,0\n";
        for size in [1, 7, 20, payload.len(), payload.len() + 5] {
            let chunks = chunk_frame(payload, size);
            assert_eq!(chunks.len(), payload.len().div_ceil(size));
            assert!(chunks.iter().all(|c| c.len() <= size));
            assert_eq!(chunks.concat(), payload.to_vec());
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(*chunk, &payload[i * size..(i * size + chunk.len())]);
            }
        }
    }

    #[test]
    fn trim_front_keeps_a_possible_token_prefix() {
        let mut seen = String::from("noise noise ACK:DA");
        trim_front(&mut seen, "ACK:DATA".len());
        assert_eq!(seen, " ACK:DA");
        seen.push_str("TA");
        assert!(seen.contains("ACK:DATA"));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_split_across_notifications_is_found() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send("..AC".to_string()).unwrap();
        tx.send("K:DA".to_string()).unwrap();
        tx.send("TA\r\n".to_string()).unwrap();
        assert!(await_ack(&mut rx, "ACK:DATA", Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_wait_times_out() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send("ACK:START".to_string()).unwrap();
        assert!(!await_ack(&mut rx, "ACK:DATA", Duration::from_secs(3)).await);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn job_of_a_closed_link_fails_alone() {
        let loopback = Loopback::default();
        let writes = loopback.writes.clone();
        let conn = ConnectionManager::new(loopback, StatusBoard::new());

        conn.connect().await.unwrap();
        let old_epoch = conn.epoch().unwrap();
        conn.disconnect().await.unwrap();
        conn.lost(old_epoch).await;
        conn.connect().await.unwrap();

        let config = TransportConfig::default().with_protocol(Protocol::unacknowledged());
        let queue = CommandQueue::new(conn.clone(), config);

        // Submitted under the old link, reaches the worker after the reconnect.
        let (reply, stale) = oneshot::channel();
        queue.pending.fetch_add(1, Ordering::SeqCst);
        queue
            .jobs
            .send(Job {
                frame: Frame::pause(),
                epoch: old_epoch,
                reply,
            })
            .unwrap_or_else(|_| panic!("worker gone"));

        let (stale, fresh) = tokio::join!(stale, queue.send(Frame::start()));
        assert!(matches!(stale.unwrap(), Err(RigError::LinkLost)));
        assert_eq!(fresh.unwrap(), Delivery::Sent);
        assert_eq!(writes.lock().unwrap().as_slice(), b"START\n");
        assert_eq!(queue.pending(), 0);
        assert_eq!(conn.status().current(), Status::Ready);
    }
}
