use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameKind, MismatchPolicy};

/// Largest single write accepted by HM-10 class UART bridges.
pub const CHUNK_SIZE: usize = 20;

/// Pause between two chunk writes so the bridge can drain its buffer.
pub const CHUNK_DELAY: Duration = Duration::from_millis(30);

/// How long to wait for the firmware to confirm a frame.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// UART-like service exposed by the BLE bridge.
pub const UART_SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";

/// The single read/write/notify characteristic of that service.
pub const UART_CHARACTERISTIC_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

/// Baud rate the firmware and the BLE bridge talk at.
pub const SERIAL_BAUD_RATE: u32 = 9600;

/// Frame prefixes of the tagged protocol variant.
const DATA_PREFIX: &str = "DATA:";
const COMMAND_PREFIX: &str = "CMD:";

/// Wire protocol variant spoken by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    /// Prefix data frames with `DATA:` and control frames with `CMD:`.
    pub tagged: bool,
    /// Wait for `ACK:DATA` after data frames.
    pub ack_data: bool,
    /// Wait for `ACK:START` / `ACK:PAUSE` after control frames.
    pub ack_control: bool,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            tagged: false,
            ack_data: true,
            ack_control: false,
        }
    }
}

impl Protocol {
    /// Firmware that prefixes frames and acknowledges every command.
    pub fn tagged() -> Self {
        Self {
            tagged: true,
            ack_data: true,
            ack_control: true,
        }
    }

    /// Fire-and-forget: no prefixes, no acknowledgements.
    pub fn unacknowledged() -> Self {
        Self {
            tagged: false,
            ack_data: false,
            ack_control: false,
        }
    }

    /// Bytes that go on the wire for `frame`.
    pub fn wire_bytes(&self, frame: &Frame) -> Vec<u8> {
        if !self.tagged {
            return frame.as_bytes().to_vec();
        }
        let prefix = match frame.kind() {
            FrameKind::Data => DATA_PREFIX,
            FrameKind::Start | FrameKind::Pause => COMMAND_PREFIX,
        };
        let mut bytes = Vec::with_capacity(prefix.len() + frame.as_bytes().len());
        bytes.extend_from_slice(prefix.as_bytes());
        bytes.extend_from_slice(frame.as_bytes());
        bytes
    }

    /// Token to wait for after sending a frame of `kind`, if any.
    pub fn ack_token(&self, kind: FrameKind) -> Option<&'static str> {
        let wanted = match kind {
            FrameKind::Data => self.ack_data,
            FrameKind::Start | FrameKind::Pause => self.ack_control,
        };
        wanted.then(|| kind.ack_token())
    }
}

/// Chunking, pacing and acknowledgement settings of the command queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub ack_timeout: Duration,
    pub protocol: Protocol,
    pub mismatch_policy: MismatchPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            chunk_delay: CHUNK_DELAY,
            ack_timeout: ACK_TIMEOUT,
            protocol: Protocol::default(),
            mismatch_policy: MismatchPolicy::default(),
        }
    }
}

impl TransportConfig {
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.mismatch_policy = policy;
        self
    }
}
