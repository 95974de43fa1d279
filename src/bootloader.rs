//! [`DeviceSession`] backed by the blocking AN3155 [`Programmer`]
//!
//! Every bootloader exchange runs on the blocking thread pool. Flash writes
//! are issued one chunk at a time so that `close` can interrupt a transfer
//! between chunks.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use embedded_hal::blocking::delay::DelayMs;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::output::OutputLog;
use crate::protocol::{self, MAX_CHUNK};
use crate::session::{
    disconnect_signal, DeviceSession, DisconnectSignal, DisconnectTrigger, MacAddress, Progress,
    SessionError,
};
use crate::{Error, Programmer, SerialPort};

#[derive(Debug, Clone)]
struct Detected {
    chip_name: String,
    mac: MacAddress,
    flash_base: u32,
}

pub struct BootloaderSession<P, D, E> {
    programmer: Arc<Mutex<Option<Programmer<P, D, E>>>>,
    closed: Arc<AtomicBool>,
    detected: Mutex<Option<Detected>>,
    log: OutputLog,
    trigger: DisconnectTrigger,
    signal: DisconnectSignal,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

fn protocol_error<E: Debug>(e: Error<E>) -> SessionError {
    SessionError::Protocol(e.to_string())
}

fn device_error<E: Debug>(e: Error<E>) -> SessionError {
    SessionError::Device(e.to_string())
}

fn join_error(e: tokio::task::JoinError) -> SessionError {
    SessionError::Device(format!("bootloader worker failed: {}", e))
}

impl<P, D, E> BootloaderSession<P, D, E>
where
    P: SerialPort<E> + Send + 'static,
    D: DelayMs<u32> + Send + 'static,
    E: Debug + Send + 'static,
{
    pub fn new(programmer: Programmer<P, D, E>, log: OutputLog) -> Self {
        let (trigger, signal) = disconnect_signal();

        Self {
            programmer: Arc::new(Mutex::new(Some(programmer))),
            closed: Arc::new(AtomicBool::new(false)),
            detected: Mutex::new(None),
            log,
            trigger,
            signal,
            watcher: Mutex::new(None),
        }
    }

    /// Trigger for transport watchers to report loss of the device
    pub fn trigger(&self) -> DisconnectTrigger {
        self.trigger.clone()
    }

    /// Attach a transport watcher task, stopped on release
    pub fn attach_watcher(&self, watcher: JoinHandle<()>) {
        if let Some(old) = self.watcher.lock().replace(watcher) {
            old.abort();
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut Programmer<P, D, E>) -> Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }

        let programmer = self.programmer.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = programmer.lock();
            let p = guard.as_mut().ok_or(SessionError::Closed)?;
            f(p)
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl<P, D, E> DeviceSession for BootloaderSession<P, D, E>
where
    P: SerialPort<E> + Send + 'static,
    D: DelayMs<u32> + Send + 'static,
    E: Debug + Send + 'static,
{
    async fn initialize(&self) -> Result<(), SessionError> {
        let log = self.log.clone();

        let detected = self
            .run(move |p| {
                log.append("Connecting to bootloader...");
                let version = p.init().map_err(protocol_error)?.version_string();
                log.append(format!("Bootloader v{}", version));

                let pid = p.chip_id().map_err(protocol_error)?;
                log.append(format!("Chip ID: 0x{:03x}", pid));

                let chip = match protocol::chip_by_pid(pid) {
                    Some(c) => c,
                    None => {
                        warn!("Unknown product id 0x{:03x}", pid);
                        return Ok(Detected {
                            chip_name: format!("Unknown (0x{:03x})", pid),
                            mac: MacAddress::default(),
                            flash_base: protocol::FLASH_BASE,
                        });
                    }
                };

                let mut uid = [0u8; 12];
                let mac = match p.read_mem(chip.uid_addr, &mut uid) {
                    Ok(()) => protocol::uid_to_mac(&uid).into(),
                    Err(e) => {
                        warn!("Could not read unique id ({}), reporting zero MAC", e);
                        MacAddress::default()
                    }
                };

                Ok(Detected {
                    chip_name: chip.name.to_string(),
                    mac,
                    flash_base: chip.flash_base,
                })
            })
            .await?;

        debug!("Detected {:?}", detected);
        *self.detected.lock() = Some(detected);

        Ok(())
    }

    fn chip_name(&self) -> String {
        self.detected
            .lock()
            .as_ref()
            .map(|d| d.chip_name.clone())
            .unwrap_or_default()
    }

    fn mac_address(&self) -> MacAddress {
        self.detected.lock().as_ref().map(|d| d.mac).unwrap_or_default()
    }

    async fn erase_flash(&self) -> Result<(), SessionError> {
        self.run(|p| p.erase_all().map_err(device_error)).await
    }

    async fn flash_data(
        &self,
        data: Vec<u8>,
        offset: u32,
        progress: Progress<'_>,
    ) -> Result<(), SessionError> {
        let base = self
            .detected
            .lock()
            .as_ref()
            .map(|d| d.flash_base)
            .unwrap_or(protocol::FLASH_BASE);

        let addr = base
            .checked_add(offset)
            .filter(|a| a.checked_add(data.len() as u32).is_some())
            .ok_or_else(|| SessionError::Device(format!("offset 0x{:x} out of range", offset)))?;

        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let programmer = self.programmer.clone();
        let closed = self.closed.clone();

        let worker = tokio::task::spawn_blocking(move || {
            let total = data.len();
            let mut written = 0;

            for chunk in data.chunks(MAX_CHUNK) {
                if closed.load(Ordering::Acquire) {
                    return Err(SessionError::Closed);
                }

                let mut guard = programmer.lock();
                let p = guard.as_mut().ok_or(SessionError::Closed)?;
                p.write_mem(addr + written as u32, chunk)
                    .map_err(device_error)?;
                drop(guard);

                written += chunk.len();
                let _ = tx.send((written, total));
            }

            Ok(())
        });

        while let Some((written, total)) = rx.recv().await {
            progress(written, total);
        }

        worker.await.map_err(join_error)?
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let programmer = self.programmer.clone();
        tokio::task::spawn_blocking(move || {
            // Dropping the programmer closes the port
            programmer.lock().take();
        })
        .await
        .map_err(join_error)?;

        debug!("Bootloader session closed");
        Ok(())
    }

    async fn release(&self) {
        if let Some(w) = self.watcher.lock().take() {
            w.abort();
        }
        *self.detected.lock() = None;
    }

    fn disconnected(&self) -> DisconnectSignal {
        self.signal.clone()
    }
}
