use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::bootloader::BootloaderSession;
use crate::output::OutputLog;
use crate::session::{DeviceSession, DisconnectTrigger, SessionConfig, SessionError, SessionOpener};
use crate::{Options, Programmer, SerialPort};

/// Read timeout applied to the port, the programmer polls on top of this
const PORT_TIMEOUT: Duration = Duration::from_millis(1);

/// Interval between checks for the device node
pub const WATCH_INTERVAL: Duration = Duration::from_millis(250);

fn io_kind(e: SerialError) -> IoErrorKind {
    IoError::from(e).kind()
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, AN3155 requires 8E1
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(PORT_TIMEOUT)?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}

/// Opens bootloader sessions on a local serial device
#[derive(Debug, Clone)]
pub struct LinuxOpener {
    port: PathBuf,
    options: Options,
}

impl LinuxOpener {
    pub fn new(port: impl Into<PathBuf>, options: Options) -> Self {
        Self {
            port: port.into(),
            options,
        }
    }
}

#[async_trait]
impl SessionOpener for LinuxOpener {
    async fn open(
        &self,
        config: &SessionConfig,
        log: OutputLog,
    ) -> Result<Arc<dyn DeviceSession>, SessionError> {
        let path = self.port.clone();
        let options = self.options.clone();
        let baud = config.baud_rate as usize;

        debug!("Opening {} at {} baud", path.display(), baud);

        let programmer = tokio::task::spawn_blocking(move || Programmer::linux(&path, baud, options))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?
            .map_err(|e| SessionError::Transport(format!("{}: {}", self.port.display(), e)))?;

        log.append(format!("Opened {} at {} baud", self.port.display(), baud));

        let session = BootloaderSession::new(programmer, log);
        let watcher = tokio::spawn(watch_device_node(self.port.clone(), session.trigger()));
        session.attach_watcher(watcher);

        Ok(Arc::new(session))
    }
}

/// Fire `trigger` once the device node disappears (adapter unplugged)
async fn watch_device_node(path: PathBuf, trigger: DisconnectTrigger) {
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);

    loop {
        ticker.tick().await;

        if tokio::fs::metadata(&path).await.is_err() {
            info!("{} removed", path.display());
            trigger.fire();
            return;
        }
    }
}
