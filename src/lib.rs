//! STM32 Serial Bootloader flasher.
//!
//! The [`Programmer`] speaks the AN3155 USART bootloader protocol over any
//! embedded-hal serial port. On top of it, the [`orchestrator`] drives the
//! connect / erase / program lifecycle of a [`session::DeviceSession`],
//! reporting through the [`output`] log and the [`notify`] channel.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod bootloader;
pub mod manifest;
pub mod notify;
pub mod orchestrator;
pub mod output;
pub mod protocol;
pub mod session;
pub mod settings;

pub use manifest::{ByteSource, FirmwareImage, Manifest, ManifestEntry};
pub use orchestrator::{ConnectionState, Error as OrchestratorError, Orchestrator, ProgramReport};
pub use output::{OutputLog, OutputRecord};
pub use notify::{Notification, NotificationKind, Notifier};
pub use session::{DeviceIdentity, DeviceSession, MacAddress, SessionConfig, SessionError, SessionOpener};
pub use settings::Settings;

use protocol::{Command, MAX_CHUNK, UART_ACK, UART_DISC, UART_NACK};

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Synced,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),
    #[error("bootloader NACK")]
    Nack,
    #[error("timeout waiting for bootloader response")]
    ResponseTimeout,
    #[error("unexpected bootloader response 0x{0:02x}")]
    InvalidResponse(u8),
    #[error("command {0:?} not supported by this bootloader")]
    Unsupported(Command),
    #[error("invalid transfer length {0}")]
    InvalidLength(usize),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for a full chip erase to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "60000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 500,
            erase_timeout_ms: 60_000,
            poll_delay_ms: 1,
            init_delay_ms: 10,
        }
    }
}

/// Bootloader version and command set, as reported by `Get`
#[derive(Clone, PartialEq, Debug)]
pub struct BootloaderInfo {
    pub version: u8,
    pub commands: Vec<u8>,
}

impl BootloaderInfo {
    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&(command as u8))
    }

    /// Version as `major.minor`
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version >> 4, self.version & 0x0F)
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    info: Option<BootloaderInfo>,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Init,
            options,
            port,
            delay,
            info: None,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Bootloader info, available once `init` has completed
    pub fn info(&self) -> Option<&BootloaderInfo> {
        self.info.as_ref()
    }

    /// Reset the device (unless disabled), sync with the bootloader and
    /// fetch its command set
    pub fn init(&mut self) -> Result<&BootloaderInfo, Error<E>> {
        // First, reset device
        if !self.options.no_reset {
            debug!("Resetting device");

            self.port.set_dtr(true)?;
            self.port.set_rts(true)?;

            self.delay.delay_ms(100u32);

            self.port.set_dtr(false)?;
            self.port.set_rts(false)?;

            self.delay.delay_ms(self.options.init_delay_ms);
        }

        debug!("Sending discovery character");
        self.write_bytes(&[UART_DISC])?;

        debug!("Awaiting bootloader response");
        self.await_ack(self.options.response_timeout_ms)?;
        self.state = State::Synced;

        let info = self.get()?;
        debug!(
            "Bootloader v{} commands: {:02x?}",
            info.version_string(),
            info.commands
        );

        Ok(self.info.insert(info))
    }

    /// Fetch bootloader version and supported commands
    pub fn get(&mut self) -> Result<BootloaderInfo, Error<E>> {
        self.send_command(Command::Get)?;

        let n = self.read_byte(self.options.response_timeout_ms)? as usize;
        let mut data = vec![0u8; n + 1];
        self.read_bytes(&mut data)?;
        self.await_ack(self.options.response_timeout_ms)?;

        Ok(BootloaderInfo {
            version: data[0],
            commands: data[1..].to_vec(),
        })
    }

    /// Read the product ID of the attached part
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        self.send_command(Command::GetId)?;

        let n = self.read_byte(self.options.response_timeout_ms)? as usize;
        let mut data = vec![0u8; n + 1];
        self.read_bytes(&mut data)?;
        self.await_ack(self.options.response_timeout_ms)?;

        let id = data
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32);

        Ok(id as u16)
    }

    /// Read up to `MAX_CHUNK` bytes of memory starting at `addr`
    pub fn read_mem(&mut self, addr: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        if data.is_empty() || data.len() > MAX_CHUNK {
            return Err(Error::InvalidLength(data.len()));
        }

        self.require(Command::ReadMemory)?;
        self.send_command(Command::ReadMemory)?;
        self.send_address(addr)?;

        let n = (data.len() - 1) as u8;
        self.write_bytes(&[n, n ^ 0xFF])?;
        self.await_ack(self.options.response_timeout_ms)?;

        self.read_bytes(data)
    }

    /// Write up to `MAX_CHUNK` bytes of memory starting at `addr`
    ///
    /// Blocks that are not a multiple of four bytes are padded with 0xFF.
    pub fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.is_empty() || data.len() > MAX_CHUNK {
            return Err(Error::InvalidLength(data.len()));
        }

        self.require(Command::WriteMemory)?;
        self.send_command(Command::WriteMemory)?;
        self.send_address(addr)?;

        let mut block = data.to_vec();
        while block.len() % 4 != 0 {
            block.push(0xFF);
        }

        let n = (block.len() - 1) as u8;
        let check = n ^ protocol::checksum(&block);

        self.write_bytes(&[n])?;
        self.write_bytes(&block)?;
        self.write_bytes(&[check])?;
        self.await_ack(self.options.response_timeout_ms)
    }

    /// Mass erase the flash, using extended erase where available
    pub fn erase_all(&mut self) -> Result<(), Error<E>> {
        let extended = match &self.info {
            Some(i) if i.supports(Command::ExtendedErase) => true,
            Some(i) if i.supports(Command::Erase) => false,
            Some(_) => return Err(Error::Unsupported(Command::Erase)),
            None => false,
        };

        if extended {
            debug!("Issuing extended mass erase");
            self.send_command(Command::ExtendedErase)?;
            self.write_bytes(&[0xFF, 0xFF, 0x00])?;
        } else {
            debug!("Issuing global erase");
            self.send_command(Command::Erase)?;
            self.write_bytes(&[0xFF, 0x00])?;
        }

        self.await_ack(self.options.erase_timeout_ms)
    }

    fn require(&self, command: Command) -> Result<(), Error<E>> {
        match &self.info {
            Some(i) if !i.supports(command) => Err(Error::Unsupported(command)),
            _ => Ok(()),
        }
    }

    fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        self.write_bytes(&command.frame())?;
        self.await_ack(self.options.response_timeout_ms)
    }

    fn send_address(&mut self, addr: u32) -> Result<(), Error<E>> {
        self.write_bytes(&protocol::address_frame(addr))?;
        self.await_ack(self.options.response_timeout_ms)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    fn read_bytes(&mut self, data: &mut [u8]) -> Result<(), Error<E>> {
        for d in data.iter_mut() {
            *d = self.read_byte(self.options.response_timeout_ms)?;
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, Error<E>> {
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);

            if t > timeout_ms {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }

    fn await_ack(&mut self, timeout_ms: u32) -> Result<(), Error<E>> {
        match self.read_byte(timeout_ms)? {
            UART_ACK => {
                trace!("Received bootloader ack");
                Ok(())
            }
            UART_NACK => {
                debug!("Received bootloader nack");
                Err(Error::Nack)
            }
            v => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::InvalidResponse(v))
            }
        }
    }
}
