//! Host-side driver for the StringArt 4-motor stepper rig.
//!
//! The rig listens on a BLE UART bridge (or a serial line) for newline
//! terminated ASCII commands. This crate turns the four motor slots of the
//! control panel into such a command, cuts it into link-sized chunks, paces
//! the writes, and optionally waits for the firmware's acknowledgement.
//!
//! # Delivery guarantees
//!
//! 1. Chunks of one frame are written strictly in order, `CHUNK_DELAY` apart
//! 2. Frames go out in submission order, one at a time; chunks of two frames
//!    never interleave
//! 3. A missing acknowledgement degrades to [`Delivery::Unconfirmed`] and the
//!    queue moves on
//! 4. A lost link fails the active and every queued frame with
//!    [`RigError::LinkLost`]; nothing is retried

#[cfg(feature = "bluez")]
mod ble;
mod config;
mod connection;
mod errors;
mod frame;
pub mod logging;
#[cfg(feature = "python")]
mod python;
mod queue;
mod rig;
mod serial;
mod status;

#[cfg(feature = "bluez")]
pub use ble::BleConnector;
pub use config::{
    Protocol, TransportConfig, ACK_TIMEOUT, CHUNK_DELAY, CHUNK_SIZE, SERIAL_BAUD_RATE,
    UART_CHARACTERISTIC_UUID, UART_SERVICE_UUID,
};
pub use connection::{
    ConnectionManager, ConnectionState, Connector, DeviceInfo, Link, LinkEvent, LinkSession,
};
pub use errors::*;
pub use frame::{
    decode_payload, encode, encode_motors, Frame, FrameKind, MismatchPolicy, MotorFields,
    MotorPanel, MotorSpec, Step, MOTOR_COUNT,
};
pub use queue::{chunk_frame, CommandQueue, Delivery};
pub use rig::Rig;
pub use serial::{list_ports, SerialConnector};
pub use status::{Status, StatusBoard};
