//! Python bindings (`python` feature).
//!
//! The rig is async inside; every Python call blocks on a private tokio
//! runtime owned by the `Rig` object.

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tokio::runtime::Runtime;

#[cfg(feature = "bluez")]
use crate::ble::BleConnector;
use crate::config::{Protocol, TransportConfig};
use crate::connection::Connector;
use crate::errors::RigError;
use crate::frame::{self, MismatchPolicy, MotorFields, MotorPanel, MOTOR_COUNT};
use crate::logging;
use crate::queue::Delivery;
use crate::rig::Rig;
use crate::serial::SerialConnector;

fn to_py_err(e: RigError) -> PyErr {
    match e {
        RigError::Validation { .. } => PyValueError::new_err(e.to_string()),
        RigError::Discovery(_)
        | RigError::Link(_)
        | RigError::LinkLost
        | RigError::NotConnected => PyConnectionError::new_err(e.to_string()),
        RigError::Io(_) | RigError::Serial(_) => PyIOError::new_err(e.to_string()),
        RigError::Busy(_) => PyRuntimeError::new_err(e.to_string()),
    }
}

fn delivery_str(delivery: Delivery) -> &'static str {
    match delivery {
        Delivery::Confirmed => "confirmed",
        Delivery::Sent => "sent",
        Delivery::Unconfirmed => "unconfirmed",
    }
}

fn motors_from(motors: Vec<(String, String, String)>) -> PyResult<[MotorFields; MOTOR_COUNT]> {
    let fields: Vec<MotorFields> = motors
        .into_iter()
        .map(|(m, r, d)| MotorFields::new(m, r, d))
        .collect();
    fields.try_into().map_err(|v: Vec<MotorFields>| {
        PyValueError::new_err(format!("expected {MOTOR_COUNT} motors, got {}", v.len()))
    })
}

fn config_from(tagged: bool, ack: bool, pad: bool) -> TransportConfig {
    let mut protocol = if tagged {
        Protocol::tagged()
    } else {
        Protocol::default()
    };
    if !ack {
        protocol.ack_data = false;
        protocol.ack_control = false;
    }
    let policy = if pad {
        MismatchPolicy::PadWithFirst
    } else {
        MismatchPolicy::Reject
    };
    TransportConfig::default()
        .with_protocol(protocol)
        .with_mismatch_policy(policy)
}

/// StringArt rig connection.
///
/// Example:
///     >>> rig = Rig.serial("/dev/ttyUSB0")
///     >>> rig.connect()
///     >>> rig.set_motor(1, "100/40", "20/25", "1/0")
///     >>> rig.send()
///     'confirmed'
///     >>> rig.start()
#[pyclass(name = "Rig", unsendable)]
struct PyRig {
    runtime: Runtime,
    rig: Rig,
    panel: MotorPanel,
}

impl PyRig {
    fn build(connector: impl Connector + 'static, config: TransportConfig) -> PyResult<Self> {
        let runtime = Runtime::new()
            .map_err(|e| PyRuntimeError::new_err(format!("tokio runtime init failed: {e}")))?;
        let rig = {
            let _guard = runtime.enter();
            Rig::new(connector, config)
        };
        Ok(Self {
            runtime,
            rig,
            panel: MotorPanel::default(),
        })
    }
}

#[pymethods]
impl PyRig {
    /// Rig reachable through a serial port (USB-UART or bound rfcomm device).
    #[staticmethod]
    #[pyo3(signature = (path, tagged=false, ack=true, pad=false))]
    fn serial(path: &str, tagged: bool, ack: bool, pad: bool) -> PyResult<Self> {
        Self::build(SerialConnector::new(path), config_from(tagged, ack, pad))
    }

    /// Rig reachable through a BLE UART bridge (`bluez` builds only).
    #[cfg(feature = "bluez")]
    #[staticmethod]
    #[pyo3(signature = (name=None, tagged=false, ack=true, pad=false))]
    fn ble(name: Option<String>, tagged: bool, ack: bool, pad: bool) -> PyResult<Self> {
        let mut connector = BleConnector::default();
        connector.name = name;
        Self::build(connector, config_from(tagged, ack, pad))
    }

    /// Connect and return the device label.
    fn connect(&self, py: Python<'_>) -> PyResult<String> {
        let device = py
            .detach(|| self.runtime.block_on(self.rig.connect()))
            .map_err(to_py_err)?;
        Ok(device.label().to_string())
    }

    fn disconnect(&self, py: Python<'_>) -> PyResult<()> {
        py.detach(|| self.runtime.block_on(self.rig.disconnect()))
            .map_err(to_py_err)
    }

    /// Set the three fields of motor 1-4.
    fn set_motor(
        &mut self,
        motor: usize,
        magnitude: &str,
        rate: &str,
        direction: &str,
    ) -> PyResult<()> {
        self.panel
            .set(motor, MotorFields::new(magnitude, rate, direction))
            .map_err(|e| PyValueError::new_err(e.to_string()))
    }

    /// Blank all motor fields.
    fn clear(&mut self) {
        self.rig.clear(&mut self.panel);
    }

    /// Send the panel (or `motors`, four `(magnitude, rate, direction)` tuples).
    ///
    /// Returns "confirmed", "sent" or "unconfirmed".
    #[pyo3(signature = (motors=None))]
    fn send(
        &mut self,
        py: Python<'_>,
        motors: Option<Vec<(String, String, String)>>,
    ) -> PyResult<&'static str> {
        if let Some(motors) = motors {
            self.panel = MotorPanel::new(motors_from(motors)?);
        }
        let panel = self.panel.clone();
        py.detach(|| self.runtime.block_on(self.rig.send_panel(&panel)))
            .map(delivery_str)
            .map_err(to_py_err)
    }

    fn start(&self, py: Python<'_>) -> PyResult<&'static str> {
        py.detach(|| self.runtime.block_on(self.rig.start()))
            .map(delivery_str)
            .map_err(to_py_err)
    }

    fn pause(&self, py: Python<'_>) -> PyResult<&'static str> {
        py.detach(|| self.runtime.block_on(self.rig.pause()))
            .map(delivery_str)
            .map_err(to_py_err)
    }

    /// Latest status line as a dict with `message` and `error` keys.
    #[getter]
    fn status<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let status = self.rig.status();
        let dict = PyDict::new(py);
        dict.set_item("message", status.message())?;
        dict.set_item("error", status.is_error())?;
        dict.set_item("locked", self.rig.controls_locked())?;
        Ok(dict)
    }

    #[getter]
    fn connected(&self) -> bool {
        self.rig.device().is_some()
    }

    fn __repr__(&self) -> String {
        match self.rig.device() {
            Some(device) => format!("Rig(connected={})", device.label()),
            None => "Rig(disconnected)".to_string(),
        }
    }
}

/// Encode four `(magnitude, rate, direction)` tuples into a data payload.
#[pyfunction]
#[pyo3(signature = (motors, pad=false))]
fn encode(motors: Vec<(String, String, String)>, pad: bool) -> PyResult<String> {
    let policy = if pad {
        MismatchPolicy::PadWithFirst
    } else {
        MismatchPolicy::Reject
    };
    frame::encode(&motors_from(motors)?, policy)
        .map(|f| f.payload().to_string())
        .map_err(to_py_err)
}

/// Set the level of logs forwarded to Python's `logging` (None: from env).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(level: Option<&str>) {
    logging::set_python_log_level(level);
}

/// The Python module definition
#[pymodule]
#[pyo3(name = "_core")]
fn stringart_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;
    m.add_class::<PyRig>()?;
    m.add_function(wrap_pyfunction!(encode, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("MOTOR_COUNT", MOTOR_COUNT)?;
    m.add("CHUNK_SIZE", crate::config::CHUNK_SIZE)?;
    Ok(())
}
