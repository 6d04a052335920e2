use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `STRINGART_LOG`, then `RUST_LOG`, defaulting to `info`.
pub fn env_level() -> LevelFilter {
    std::env::var("STRINGART_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize logging for the CLI (stderr formatter). Safe to call twice.
pub fn init_rust_logging() {
    init_rust_logging_at(env_level());
}

/// Same as [`init_rust_logging`] with an explicit level (e.g. from `-v`).
pub fn init_rust_logging_at(level: LevelFilter) {
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str().to_lowercase());
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .init();
    });
}

#[cfg(feature = "python")]
pub use bridge::{init_python_logging, set_python_log_level};

/// Forwards `log` records into Python's `logging` module.
#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;

    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    struct PyLogger {
        level: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>, // target -> logging.Logger
    }

    impl PyLogger {
        fn python_level(level: log::Level) -> u32 {
            match level {
                log::Level::Error => 40,
                log::Level::Warn => 30,
                log::Level::Info => 20,
                log::Level::Debug => 10,
                log::Level::Trace => 5,
            }
        }

        fn logger(&self, py: Python<'_>, target: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = self
                .loggers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.clone_ref(py));
            }
            let logger = self
                .logging
                .bind(py)
                .call_method1("getLogger", (target,))?
                .unbind();
            loggers.insert(target.to_string(), logger.clone_ref(py));
            Ok(logger)
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            let level = *self
                .level
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            metadata.level().to_level_filter() <= level
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let target = record.target().replace("::", ".");
            let message = record.args().to_string();
            let level = Self::python_level(record.level());
            Python::attach(|py| {
                let result = self
                    .logger(py, &target)
                    .and_then(|logger| logger.bind(py).call_method1("log", (level, message)));
                if let Err(e) = result {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Only the first call installs
    /// the bridge.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        if PY_LOGGER.get().is_some() {
            return Ok(());
        }
        let level = super::env_level();
        let logger = PyLogger {
            level: Mutex::new(level),
            logging: py.import("logging")?.unbind(),
            loggers: Mutex::new(HashMap::new()),
        };
        let leaked: &'static PyLogger = Box::leak(Box::new(logger));
        if PY_LOGGER.set(leaked).is_ok() && log::set_logger(leaked).is_ok() {
            log::set_max_level(level);
        }
        Ok(())
    }

    /// Change the minimum level forwarded to Python; `None` re-reads the env.
    pub fn set_python_log_level(level: Option<&str>) {
        let level = level
            .and_then(super::parse_level)
            .unwrap_or_else(super::env_level);
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut current) = logger.level.lock() {
                *current = level;
            }
        }
        log::set_max_level(level);
    }
}
