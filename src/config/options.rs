//! Session options supplied by the host application

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::UpdateMode;

/// Resolved tuning-server address
#[derive(Debug, Clone)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Application description carried opaquely in the handshake
///
/// The description format is owned by the server side; this library only
/// transports the bytes, either given inline or loaded from a file at
/// startup time.
#[derive(Debug, Clone, Default)]
pub enum ApplicationDescription {
    #[default]
    Empty,
    Inline(Vec<u8>),
    File(PathBuf),
}

impl ApplicationDescription {
    pub(crate) fn resolve(&self) -> io::Result<Vec<u8>> {
        match self {
            ApplicationDescription::Empty => Ok(Vec::new()),
            ApplicationDescription::Inline(bytes) => Ok(bytes.clone()),
            ApplicationDescription::File(path) => std::fs::read(path),
        }
    }
}

/// Options for opening one tuning session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub address: ServerAddress,
    pub mode: UpdateMode,
    pub description: ApplicationDescription,
    pub connect_timeout: Duration,
    /// Read timeout for request/response waits. None blocks indefinitely;
    /// the server paces all variable handshakes, so that is the default.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            address: ServerAddress {
                host: host.into(),
                port,
            },
            mode: UpdateMode::Poll,
            description: ApplicationDescription::default(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn update_mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn description(mut self, description: ApplicationDescription) -> Self {
        self.description = description;
        self
    }

    pub fn description_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.description = ApplicationDescription::Inline(bytes.into());
        self
    }

    pub fn description_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.description = ApplicationDescription::File(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}
