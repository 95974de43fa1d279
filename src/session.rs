//! Device session contract consumed by the orchestrator

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::output::OutputLog;

/// Failures reported by a device session
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to open transport: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Device error: {0}")]
    Device(String),
    #[error("Session closed")]
    Closed,
}

/// Transport parameters passed to [`SessionOpener::open`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub baud_rate: u32,
}

/// Six byte hardware address, displayed as `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| hex::encode_upper([*b])).collect();
        f.write_str(&parts.join(":"))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(b: [u8; 6]) -> Self {
        Self(b)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub chip_name: String,
    pub mac: MacAddress,
}

/// Raising side of a session's disconnect signal, held by transport watchers
#[derive(Clone)]
pub struct DisconnectTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl DisconnectTrigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

/// Observing side of a session's disconnect signal
#[derive(Clone)]
pub struct DisconnectSignal {
    rx: watch::Receiver<bool>,
}

impl DisconnectSignal {
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the transport reports loss of connection.
    ///
    /// Returns false if every trigger was dropped without firing.
    pub async fn wait(mut self) -> bool {
        loop {
            if *self.rx.borrow_and_update() {
                return true;
            }
            if self.rx.changed().await.is_err() {
                return *self.rx.borrow();
            }
        }
    }
}

pub fn disconnect_signal() -> (DisconnectTrigger, DisconnectSignal) {
    let (tx, rx) = watch::channel(false);
    (DisconnectTrigger { tx: Arc::new(tx) }, DisconnectSignal { rx })
}

/// Progress callback receiving `(written, total)` byte counts
pub type Progress<'a> = &'a mut (dyn FnMut(usize, usize) + Send);

/// A live connection to a device bootloader.
///
/// Identity accessors are meaningful once `initialize` has succeeded.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Handshake with the device and detect the attached chip
    async fn initialize(&self) -> Result<(), SessionError>;

    fn chip_name(&self) -> String;

    fn mac_address(&self) -> MacAddress;

    /// Erase the entire flash array
    async fn erase_flash(&self) -> Result<(), SessionError>;

    /// Write `data` at `offset`, invoking `progress` as chunks complete.
    ///
    /// `total` may be a running estimate rather than the final size.
    async fn flash_data(
        &self,
        data: Vec<u8>,
        offset: u32,
        progress: Progress<'_>,
    ) -> Result<(), SessionError>;

    /// Close the transport. Closing an already closed session is not an error.
    async fn close(&self) -> Result<(), SessionError>;

    /// Release remaining resources (watchers, worker state)
    async fn release(&self);

    /// Signal fired at most once when the transport is lost
    fn disconnected(&self) -> DisconnectSignal;

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            chip_name: self.chip_name(),
            mac: self.mac_address(),
        }
    }
}

/// Opens device sessions over a transport
#[async_trait]
pub trait SessionOpener: Send + Sync {
    /// Open a transport and bind a session to it. Informational lines from
    /// the session are appended to `log`.
    async fn open(
        &self,
        config: &SessionConfig,
        log: OutputLog,
    ) -> Result<Arc<dyn DeviceSession>, SessionError>;
}
