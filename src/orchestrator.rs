//! Device session orchestrator
//!
//! Owns the connection state and the single live [`DeviceSession`], and runs
//! the connect, erase and program workflows. Every workflow reports through
//! the [`OutputLog`] and the [`Notifier`] and leaves the state consistent on
//! every exit path; failures are surfaced there before being returned.
//!
//! Only one workflow runs at a time: erase and program require `Connected`
//! and hold the flashing flag for their whole duration.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::manifest::{ChipDefaults, FirmwareImage, Manifest, ManifestDefaults, ManifestEntry, OffsetError};
use crate::notify::{NotificationKind, Notifier};
use crate::output::OutputLog;
use crate::session::{DeviceIdentity, DeviceSession, DisconnectSignal, SessionConfig, SessionError, SessionOpener};

/// How long result notifications stay visible
pub const NOTIFY_TIMEOUT: Duration = Duration::from_millis(3000);

/// Interval of the "please wait" line while an erase is outstanding
pub const ERASE_TICK: Duration = Duration::from_millis(3000);

/// Pause between consecutive image writes
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Maximum file name length shown in upload notifications
const NAME_LIMIT: usize = 28;

/// Notification slots used by the orchestrator
pub mod ids {
    pub const CONNECTING: &str = "connecting";
    pub const DISCONNECTED: &str = "disconnected";
    pub const ERASE: &str = "erase";
    pub const UPLOAD: &str = "upload";
    pub const UPLOADED: &str = "uploaded";
    pub const REJECTED: &str = "rejected";
}

pub const SEPARATOR: &str = "------------------------------------------------------------";

const DONE_TEXT: &str = "Done! Please reboot the device.";
const NO_FILES_TEXT: &str = "Please add a .bin file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Connect(SessionError),
    #[error("{0}")]
    Erase(SessionError),
    #[error("Device not connected")]
    NotConnected,
    #[error("Another operation is in progress")]
    Busy,
    #[error("Device already connected")]
    AlreadyConnected,
}

/// Failure to program a single manifest entry
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("{0}")]
    Offset(#[from] OffsetError),
    #[error("Failed to read file: {0}")]
    Read(#[from] std::io::Error),
    #[error("{0}")]
    Write(#[from] SessionError),
}

#[derive(Debug)]
pub struct FileFailure {
    /// Position of the entry in the manifest
    pub index: usize,
    pub name: String,
    pub error: FileError,
}

/// Outcome of a program pass
#[derive(Debug, Default)]
pub struct ProgramReport {
    /// Complete entries for which an upload was attempted
    pub attempted: usize,
    pub flashed: usize,
    /// Incomplete entries passed over
    pub skipped: usize,
    pub failed: Vec<FileFailure>,
}

impl ProgramReport {
    pub fn all_flashed(&self) -> bool {
        self.attempted > 0 && self.failed.is_empty()
    }
}

/// Strip the generic `Error: ` prefix for display in notifications
pub fn clean_message(msg: &str) -> &str {
    msg.strip_prefix("Error: ").unwrap_or(msg)
}

/// Completion fraction of a write, clamped to `[0, 1]`
pub fn progress_fraction(written: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (written as f64 / total as f64).clamp(0.0, 1.0)
}

fn display_name(name: &str) -> String {
    name.chars().take(NAME_LIMIT).collect()
}

struct State {
    connection: ConnectionState,
    identity: Option<DeviceIdentity>,
    session: Option<Arc<dyn DeviceSession>>,
    flashing: bool,
    /// Bumped per connection attempt and on explicit disconnect
    epoch: u64,
    listener: Option<JoinHandle<()>>,
    defaults: Manifest,
}

struct Shared {
    state: Mutex<State>,
    log: OutputLog,
    notifier: Notifier,
}

impl Shared {
    /// Handle loss of the transport for the session started at `epoch`
    fn device_lost(&self, epoch: u64) {
        let session = {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.connection != ConnectionState::Connected {
                return;
            }
            st.connection = ConnectionState::Disconnected;
            st.identity = None;
            st.listener = None;
            st.session.take()
        };

        warn!("Device disconnected");
        self.notifier.show_timed(
            ids::DISCONNECTED,
            NotificationKind::Warning,
            "Device disconnected...",
            NOTIFY_TIMEOUT,
        );
        self.log.append(SEPARATOR);

        // Any in-flight workflow holds its own handle and fails on its own
        drop(session);
    }
}

async fn listen_for_disconnect(shared: Weak<Shared>, epoch: u64, signal: DisconnectSignal) {
    if !signal.wait().await {
        return;
    }
    if let Some(shared) = shared.upgrade() {
        shared.device_lost(epoch);
    }
}

/// Resets `Connecting` if a connect attempt exits without connecting
struct ConnectingGuard<'a>(&'a Shared);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.0.state.lock();
        if st.connection == ConnectionState::Connecting {
            st.connection = ConnectionState::Disconnected;
        }
    }
}

/// Clears the flashing flag when a workflow exits
struct FlashingGuard<'a>(&'a Shared);

impl Drop for FlashingGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().flashing = false;
    }
}

pub struct Orchestrator<O> {
    opener: O,
    config: SessionConfig,
    defaults: Box<dyn ManifestDefaults>,
    shared: Arc<Shared>,
}

impl<O: SessionOpener> Orchestrator<O> {
    pub fn new(opener: O, config: SessionConfig, log: OutputLog, notifier: Notifier) -> Self {
        Self {
            opener,
            config,
            defaults: Box::new(ChipDefaults),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    connection: ConnectionState::Disconnected,
                    identity: None,
                    session: None,
                    flashing: false,
                    epoch: 0,
                    listener: None,
                    defaults: Manifest::new(),
                }),
                log,
                notifier,
            }),
        }
    }

    /// Replace the source of per-chip default manifests
    pub fn with_defaults(mut self, defaults: impl ManifestDefaults + 'static) -> Self {
        self.defaults = Box::new(defaults);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.shared.state.lock().identity.clone()
    }

    pub fn is_flashing(&self) -> bool {
        self.shared.state.lock().flashing
    }

    /// Default manifest loaded for the chip detected on the last connect
    pub fn default_manifest(&self) -> Manifest {
        self.shared.state.lock().defaults.clone()
    }

    pub fn log(&self) -> &OutputLog {
        &self.shared.log
    }

    pub fn notifier(&self) -> &Notifier {
        &self.shared.notifier
    }

    /// Open a session, handshake with the device and record its identity
    pub async fn connect(&self) -> Result<DeviceIdentity, Error> {
        {
            let mut st = self.shared.state.lock();
            if st.flashing {
                drop(st);
                return Err(self.reject(Error::Busy));
            }
            if st.connection != ConnectionState::Disconnected || st.session.is_some() {
                drop(st);
                return Err(self.reject(Error::AlreadyConnected));
            }
            st.connection = ConnectionState::Connecting;
            st.epoch += 1;
        }
        let _connecting = ConnectingGuard(&self.shared);

        let notifier = &self.shared.notifier;
        let log = &self.shared.log;

        notifier.show(ids::CONNECTING, NotificationKind::Info, "Connecting...");
        info!("Connecting at {} baud", self.config.baud_rate);

        let session = match self.opener.open(&self.config, log.clone()).await {
            Ok(s) => s,
            Err(e) => return Err(self.connect_failed(None, e).await),
        };

        if let Err(e) = session.initialize().await {
            return Err(self.connect_failed(Some(session), e).await);
        }

        let identity = session.identity();
        log.append(format!("Connected to {}", identity.chip_name));
        log.append(format!("MAC Address: {}", identity.mac));

        let defaults = self.defaults.default_manifest(&identity.chip_name);
        let signal = session.disconnected();

        {
            let mut st = self.shared.state.lock();
            st.connection = ConnectionState::Connected;
            st.identity = Some(identity.clone());
            st.session = Some(session);
            st.defaults = defaults;
            let epoch = st.epoch;
            st.listener = Some(tokio::spawn(listen_for_disconnect(
                Arc::downgrade(&self.shared),
                epoch,
                signal,
            )));
        }

        notifier.update(
            ids::CONNECTING,
            NotificationKind::Success,
            "Connected",
            Some(NOTIFY_TIMEOUT),
        );
        info!("Connected to {} ({})", identity.chip_name, identity.mac);

        Ok(identity)
    }

    async fn connect_failed(&self, session: Option<Arc<dyn DeviceSession>>, err: SessionError) -> Error {
        let raw = format!("Error: {}", err);
        error!("Connection failed: {}", err);

        self.shared.notifier.update(
            ids::CONNECTING,
            NotificationKind::Error,
            clean_message(&raw),
            Some(NOTIFY_TIMEOUT),
        );
        self.shared.log.append(raw.as_str());

        if let Some(s) = session {
            if let Err(e) = s.close().await {
                warn!("Failed to close transport: {}", e);
            }
            s.release().await;
        }

        Error::Connect(err)
    }

    /// Close the live session, if any
    pub async fn disconnect(&self) {
        let (session, listener) = {
            let mut st = self.shared.state.lock();
            let session = match st.session.take() {
                Some(s) => s,
                None => return,
            };
            st.connection = ConnectionState::Disconnected;
            st.identity = None;
            st.epoch += 1;
            (session, st.listener.take())
        };

        if let Some(l) = listener {
            l.abort();
        }

        if let Err(e) = session.close().await {
            warn!("Failed to close transport: {}", e);
        }
        session.release().await;

        info!("Disconnected");
    }

    /// Erase the whole flash of the connected device
    pub async fn erase(&self) -> Result<Duration, Error> {
        let (session, _flashing) = self.begin_workflow()?;
        let notifier = &self.shared.notifier;
        let log = &self.shared.log;

        notifier.show(ids::ERASE, NotificationKind::Default, "Erasing, please wait...");
        let started = Instant::now();
        log.append("Start erasing");

        let result = {
            let erase = session.erase_flash();
            tokio::pin!(erase);

            let mut ticker = time::interval_at(started + ERASE_TICK, ERASE_TICK);

            loop {
                tokio::select! {
                    biased;
                    r = &mut erase => break r,
                    _ = ticker.tick() => log.append("Erasing flash memory. Please wait..."),
                }
            }
        };

        match result {
            Ok(()) => {
                let took = started.elapsed();
                log.append(format!("Finished. Took {}ms to erase.", took.as_millis()));
                notifier.update(
                    ids::ERASE,
                    NotificationKind::Info,
                    "Erase complete",
                    Some(NOTIFY_TIMEOUT),
                );
                Ok(took)
            }
            Err(e) => {
                error!("Erase failed: {}", e);
                let msg = format!("ERROR!\n{}", e);
                log.append(msg.as_str());
                notifier.update(ids::ERASE, NotificationKind::Error, msg, Some(NOTIFY_TIMEOUT));
                Err(Error::Erase(e))
            }
        }
    }

    /// Program every complete manifest entry in order.
    ///
    /// A failing entry is logged and recorded in the report; the remaining
    /// entries are still attempted.
    pub async fn program(&self, manifest: &Manifest) -> Result<ProgramReport, Error> {
        let (session, _flashing) = self.begin_workflow()?;
        let notifier = &self.shared.notifier;
        let log = &self.shared.log;

        let mut report = ProgramReport::default();

        for (index, entry) in manifest.iter().enumerate() {
            let image = match entry {
                ManifestEntry::Ready(image) => image,
                ManifestEntry::Incomplete { .. } => {
                    report.skipped += 1;
                    continue;
                }
            };
            report.attempted += 1;

            notifier.show_progress(
                ids::UPLOAD,
                format!("Uploading {}...", display_name(&image.name)),
                0.0,
            );

            match self.flash_image(session.as_ref(), image).await {
                Ok(()) => {
                    report.flashed += 1;
                    time::sleep(SETTLE_DELAY).await;
                }
                Err(error) => {
                    error!("Failed to program {}: {}", image.name, error);
                    log.append(format!("ERROR!\n{}", error));
                    report.failed.push(FileFailure {
                        index,
                        name: image.name.clone(),
                        error,
                    });
                }
            }

            notifier.dismiss(ids::UPLOAD);
        }

        if report.attempted > 0 {
            log.append("Done!");
            log.append("Please reboot the device.");
            notifier.show_timed(ids::UPLOADED, NotificationKind::Success, DONE_TEXT, NOTIFY_TIMEOUT);
        } else {
            log.append(NO_FILES_TEXT);
            notifier.show_timed(ids::UPLOADED, NotificationKind::Info, NO_FILES_TEXT, NOTIFY_TIMEOUT);
        }

        Ok(report)
    }

    async fn flash_image(&self, session: &dyn DeviceSession, image: &FirmwareImage) -> Result<(), FileError> {
        let data = image.source.read().await?;
        let offset = image.offset()?;

        debug!(
            "Writing {} ({} bytes) at offset 0x{:x}",
            image.name,
            data.len(),
            offset
        );

        let notifier = &self.shared.notifier;
        let log = &self.shared.log;

        let mut on_progress = |written: usize, total: usize| {
            let fraction = progress_fraction(written, total);
            notifier.set_progress(ids::UPLOAD, fraction);
            log.append(format!("Flashing... {}%", (fraction * 100.0).floor() as u32));
        };

        session.flash_data(data, offset, &mut on_progress).await?;

        Ok(())
    }

    /// Claim the flashing flag and a handle to the live session
    fn begin_workflow(&self) -> Result<(Arc<dyn DeviceSession>, FlashingGuard<'_>), Error> {
        let claimed = {
            let mut st = self.shared.state.lock();
            match (st.connection, st.session.clone()) {
                (ConnectionState::Connected, Some(_)) if st.flashing => Err(Error::Busy),
                (ConnectionState::Connected, Some(session)) => {
                    st.flashing = true;
                    Ok(session)
                }
                _ => Err(Error::NotConnected),
            }
        };

        match claimed {
            Ok(session) => Ok((session, FlashingGuard(&self.shared))),
            Err(e) => Err(self.reject(e)),
        }
    }

    fn reject(&self, e: Error) -> Error {
        warn!("Rejected: {}", e);
        let msg = e.to_string();
        self.shared.log.append(msg.as_str());
        self.shared
            .notifier
            .show_timed(ids::REJECTED, NotificationKind::Error, msg, NOTIFY_TIMEOUT);
        e
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::manifest::ByteSource;
    use crate::output::drain;
    use crate::session::{disconnect_signal, DisconnectTrigger, MacAddress, Progress};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Initialize,
        Erase,
        Flash { len: usize, offset: u32 },
        Close,
        Release,
    }

    struct FakeSession {
        mac: [u8; 6],
        init_error: Option<SessionError>,
        erase_time: Duration,
        erase_error: Option<SessionError>,
        /// Offsets whose writes fail
        failing_offsets: Vec<u32>,
        /// Writes block until the device disconnects
        hang_writes: bool,
        /// Time each write takes before completing
        write_time: Duration,
        /// `(written, total)` progress calls per write, halfway and done if empty
        progress_steps: Vec<(usize, usize)>,
        calls: Mutex<Vec<Call>>,
        trigger: DisconnectTrigger,
        signal: DisconnectSignal,
        writes_started: AtomicUsize,
    }

    impl Default for FakeSession {
        fn default() -> Self {
            let (trigger, signal) = disconnect_signal();
            Self {
                mac: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
                init_error: None,
                erase_time: Duration::from_millis(10),
                erase_error: None,
                failing_offsets: vec![],
                hang_writes: false,
                write_time: Duration::ZERO,
                progress_steps: vec![],
                calls: Mutex::new(vec![]),
                trigger,
                signal,
                writes_started: AtomicUsize::new(0),
            }
        }
    }

    impl FakeSession {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn flash_calls(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Flash { .. }))
                .collect()
        }
    }

    #[async_trait]
    impl DeviceSession for FakeSession {
        async fn initialize(&self) -> Result<(), SessionError> {
            self.calls.lock().push(Call::Initialize);
            match &self.init_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn chip_name(&self) -> String {
            "ESP32".to_string()
        }

        fn mac_address(&self) -> MacAddress {
            MacAddress(self.mac)
        }

        async fn erase_flash(&self) -> Result<(), SessionError> {
            self.calls.lock().push(Call::Erase);
            time::sleep(self.erase_time).await;
            match &self.erase_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn flash_data(&self, data: Vec<u8>, offset: u32, progress: Progress<'_>) -> Result<(), SessionError> {
            self.calls.lock().push(Call::Flash { len: data.len(), offset });
            self.writes_started.fetch_add(1, Ordering::SeqCst);

            if self.hang_writes {
                self.signal.clone().wait().await;
                return Err(SessionError::Closed);
            }
            time::sleep(self.write_time).await;
            if self.signal.is_fired() {
                return Err(SessionError::Closed);
            }
            if self.failing_offsets.contains(&offset) {
                return Err(SessionError::Device(format!("write failed at 0x{:x}", offset)));
            }

            if !self.progress_steps.is_empty() {
                for (written, total) in &self.progress_steps {
                    progress(*written, *total);
                }
                return Ok(());
            }

            let total = data.len();
            progress(total / 2, total);
            progress(total, total);
            Ok(())
        }

        async fn close(&self) -> Result<(), SessionError> {
            self.calls.lock().push(Call::Close);
            Ok(())
        }

        async fn release(&self) {
            self.calls.lock().push(Call::Release);
        }

        fn disconnected(&self) -> DisconnectSignal {
            self.signal.clone()
        }
    }

    struct FakeOpener {
        session: Arc<FakeSession>,
        open_error: Option<SessionError>,
        opens: AtomicUsize,
    }

    impl FakeOpener {
        fn new(session: FakeSession) -> Self {
            Self {
                session: Arc::new(session),
                open_error: None,
                opens: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionOpener for FakeOpener {
        async fn open(&self, config: &SessionConfig, log: OutputLog) -> Result<Arc<dyn DeviceSession>, SessionError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.open_error {
                return Err(e.clone());
            }
            log.append(format!("Opened port at {} baud", config.baud_rate));
            Ok(self.session.clone())
        }
    }

    fn orchestrator(session: FakeSession) -> (Orchestrator<FakeOpener>, Arc<FakeSession>) {
        let opener = FakeOpener::new(session);
        let session = opener.session.clone();
        let o = Orchestrator::new(
            opener,
            SessionConfig { baud_rate: 115200 },
            OutputLog::default(),
            Notifier::new(),
        );
        (o, session)
    }

    async fn connected(session: FakeSession) -> (Orchestrator<FakeOpener>, Arc<FakeSession>) {
        let (o, s) = orchestrator(session);
        o.connect().await.unwrap();
        (o, s)
    }

    fn image(name: &str, offset: &str, len: usize) -> ManifestEntry {
        ManifestEntry::new(Some(name.into()), Some(ByteSource::from(vec![0u8; len])), offset)
    }

    #[tokio::test]
    async fn connect_records_identity() {
        let (o, s) = orchestrator(FakeSession::default());
        let mut lines = o.log().subscribe();

        let identity = o.connect().await.unwrap();

        assert_eq!(identity.chip_name, "ESP32");
        assert_eq!(o.state(), ConnectionState::Connected);
        assert_eq!(o.identity(), Some(identity));
        assert_eq!(o.log().latest().text, "MAC Address: AA:BB:CC:DD:EE:FF");
        assert_eq!(
            drain(&mut lines),
            vec![
                "Opened port at 115200 baud",
                "Connected to ESP32",
                "MAC Address: AA:BB:CC:DD:EE:FF"
            ]
        );

        let n = o.notifier().get(ids::CONNECTING).unwrap();
        assert_eq!(n.kind, NotificationKind::Success);
        assert_eq!(n.auto_close, Some(NOTIFY_TIMEOUT));

        assert_eq!(o.default_manifest().len(), 3);
        assert_eq!(s.calls(), vec![Call::Initialize]);
    }

    #[tokio::test]
    async fn connect_notification_goes_from_connecting_to_success() {
        let (o, _s) = orchestrator(FakeSession::default());
        let mut events = o.notifier().subscribe();

        o.connect().await.unwrap();

        let mut kinds = vec![];
        while let Ok(crate::notify::NotificationEvent::Shown(n)) = events.try_recv() {
            kinds.push((n.id, n.kind, n.auto_close));
        }
        assert_eq!(
            kinds,
            vec![
                (ids::CONNECTING.to_string(), NotificationKind::Info, None),
                (ids::CONNECTING.to_string(), NotificationKind::Success, Some(NOTIFY_TIMEOUT)),
            ]
        );
    }

    #[tokio::test]
    async fn open_failure_returns_to_disconnected() {
        let mut opener = FakeOpener::new(FakeSession::default());
        opener.open_error = Some(SessionError::Transport("/dev/ttyUSB0: no such device".into()));
        let o = Orchestrator::new(opener, SessionConfig { baud_rate: 115200 }, OutputLog::default(), Notifier::new());

        let err = o.connect().await.unwrap_err();

        assert!(matches!(err, Error::Connect(SessionError::Transport(_))));
        assert_eq!(o.state(), ConnectionState::Disconnected);
        assert!(!o.is_flashing());
        assert!(o.identity().is_none());
        assert_eq!(
            o.log().latest().text,
            "Error: Failed to open transport: /dev/ttyUSB0: no such device"
        );

        let n = o.notifier().get(ids::CONNECTING).unwrap();
        assert_eq!(n.kind, NotificationKind::Error);
        assert_eq!(n.text, "Failed to open transport: /dev/ttyUSB0: no such device");
        assert_eq!(n.auto_close, Some(NOTIFY_TIMEOUT));

        // A later attempt is allowed
        assert!(o.connect().await.is_err());
        assert_eq!(o.opener.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn initialize_failure_closes_and_releases() {
        let (o, s) = orchestrator(FakeSession {
            init_error: Some(SessionError::Protocol("timeout waiting for bootloader response".into())),
            ..FakeSession::default()
        });

        assert!(matches!(o.connect().await, Err(Error::Connect(SessionError::Protocol(_)))));

        assert_eq!(o.state(), ConnectionState::Disconnected);
        assert!(!o.is_flashing());
        assert_eq!(s.calls(), vec![Call::Initialize, Call::Close, Call::Release]);

        // No handle is left behind: workflows are rejected
        assert!(matches!(o.erase().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let (o, _s) = connected(FakeSession::default()).await;

        assert!(matches!(o.connect().await, Err(Error::AlreadyConnected)));
        assert_eq!(o.state(), ConnectionState::Connected);
        assert_eq!(o.opener.opens.load(Ordering::SeqCst), 1);

        let n = o.notifier().get(ids::REJECTED).unwrap();
        assert_eq!(n.kind, NotificationKind::Error);
        assert_eq!(n.text, "Device already connected");
        assert_eq!(n.auto_close, Some(NOTIFY_TIMEOUT));
    }

    #[tokio::test]
    async fn disconnect_releases_session_and_is_idempotent() {
        let (o, s) = connected(FakeSession::default()).await;

        o.disconnect().await;
        assert_eq!(o.state(), ConnectionState::Disconnected);
        assert!(o.identity().is_none());
        assert_eq!(s.calls(), vec![Call::Initialize, Call::Close, Call::Release]);

        o.disconnect().await;
        assert_eq!(s.calls().len(), 3);

        // A disconnect event from the old session is ignored
        s.trigger.fire();
        tokio::task::yield_now().await;
        assert!(o.notifier().get(ids::DISCONNECTED).is_none());
    }

    #[tokio::test]
    async fn workflows_require_connection() {
        let (o, s) = orchestrator(FakeSession::default());

        assert!(matches!(o.erase().await, Err(Error::NotConnected)));
        assert!(matches!(
            o.program(&vec![image("app.bin", "0", 4)].into_iter().collect()).await,
            Err(Error::NotConnected)
        ));
        assert!(s.calls().is_empty());
        assert!(!o.is_flashing());

        let n = o.notifier().get(ids::REJECTED).unwrap();
        assert_eq!(n.kind, NotificationKind::Error);
        assert_eq!(n.text, "Device not connected");
        assert_eq!(n.auto_close, Some(NOTIFY_TIMEOUT));
        assert_eq!(o.log().latest().text, "Device not connected");
    }

    #[tokio::test(start_paused = true)]
    async fn erase_logs_wait_lines_until_complete() {
        let (o, s) = connected(FakeSession {
            erase_time: Duration::from_millis(10_000),
            ..FakeSession::default()
        })
        .await;
        let mut lines = o.log().subscribe();

        let took = o.erase().await.unwrap();

        assert!(took >= Duration::from_millis(10_000));
        assert!(!o.is_flashing());

        let mut emitted = drain(&mut lines);
        let finished = emitted.pop().unwrap();
        assert_eq!(finished, format!("Finished. Took {}ms to erase.", took.as_millis()));
        assert_eq!(
            emitted,
            vec![
                "Start erasing",
                "Erasing flash memory. Please wait...",
                "Erasing flash memory. Please wait...",
                "Erasing flash memory. Please wait...",
            ]
        );
        assert_eq!(o.notifier().get(ids::ERASE).unwrap().kind, NotificationKind::Info);
        assert!(s.calls().contains(&Call::Erase));

        // Nothing is emitted by the ticker after the workflow returns
        time::sleep(Duration::from_millis(10_000)).await;
        assert!(drain(&mut lines).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn erase_failure_stops_ticker_and_reports() {
        let (o, _s) = connected(FakeSession {
            erase_time: Duration::from_millis(4000),
            erase_error: Some(SessionError::Device("flash locked".into())),
            ..FakeSession::default()
        })
        .await;
        let mut lines = o.log().subscribe();

        let err = o.erase().await.unwrap_err();
        assert!(matches!(err, Error::Erase(SessionError::Device(_))));
        assert!(!o.is_flashing());
        assert_eq!(o.state(), ConnectionState::Connected);

        assert_eq!(
            drain(&mut lines),
            vec![
                "Start erasing",
                "Erasing flash memory. Please wait...",
                "ERROR!\nDevice error: flash locked",
            ]
        );
        let n = o.notifier().get(ids::ERASE).unwrap();
        assert_eq!(n.kind, NotificationKind::Error);
        assert_eq!(n.auto_close, Some(NOTIFY_TIMEOUT));

        time::sleep(Duration::from_millis(10_000)).await;
        assert!(drain(&mut lines).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn erase_and_program_are_exclusive() {
        let (o, s) = connected(FakeSession {
            erase_time: Duration::from_millis(5000),
            ..FakeSession::default()
        })
        .await;
        let manifest: Manifest = vec![image("app.bin", "0", 16)].into_iter().collect();

        let (erased, programmed) = tokio::join!(o.erase(), async {
            time::sleep(Duration::from_millis(1000)).await;
            assert!(o.is_flashing());
            o.program(&manifest).await
        });

        assert!(erased.is_ok());
        assert!(matches!(programmed, Err(Error::Busy)));
        assert!(s.flash_calls().is_empty());
        assert!(!o.is_flashing());
    }

    #[tokio::test(start_paused = true)]
    async fn program_single_file_reports_progress() {
        let (o, s) = connected(FakeSession::default()).await;
        let mut lines = o.log().subscribe();
        let mut events = o.notifier().subscribe();

        let manifest: Manifest = vec![image("app.bin", "1000", 1024)].into_iter().collect();
        let report = o.program(&manifest).await.unwrap();

        assert_eq!(report.attempted, 1);
        assert_eq!(report.flashed, 1);
        assert!(report.all_flashed());
        assert!(!o.is_flashing());
        assert_eq!(s.flash_calls(), vec![Call::Flash { len: 1024, offset: 0x1000 }]);

        assert_eq!(
            drain(&mut lines),
            vec!["Flashing... 50%", "Flashing... 100%", "Done!", "Please reboot the device."]
        );

        let mut progress = vec![];
        while let Ok(e) = events.try_recv() {
            if let crate::notify::NotificationEvent::Shown(n) = e {
                if n.id == ids::UPLOAD {
                    progress.push(n.progress.unwrap());
                }
            }
        }
        assert_eq!(progress, vec![0.0, 0.5, 1.0]);

        let done = o.notifier().get(ids::UPLOADED).unwrap();
        assert_eq!(done.kind, NotificationKind::Success);
        assert_eq!(done.text, "Done! Please reboot the device.");
        assert!(o.notifier().get(ids::UPLOAD).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn program_without_files_makes_no_device_calls() {
        let (o, s) = connected(FakeSession::default()).await;
        let mut lines = o.log().subscribe();

        let manifest: Manifest = vec![ManifestEntry::new(Some("".into()), None, "0")]
            .into_iter()
            .collect();
        let report = o.program(&manifest).await.unwrap();

        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped, 1);
        assert!(s.flash_calls().is_empty());
        assert_eq!(drain(&mut lines), vec!["Please add a .bin file"]);

        let n = o.notifier().get(ids::UPLOADED).unwrap();
        assert_eq!(n.kind, NotificationKind::Info);
        assert_eq!(n.text, "Please add a .bin file");
        assert!(!o.is_flashing());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_entry_does_not_stop_the_pass() {
        let (o, s) = connected(FakeSession {
            failing_offsets: vec![0x8000],
            ..FakeSession::default()
        })
        .await;
        let mut lines = o.log().subscribe();

        let manifest: Manifest = vec![
            image("boot.bin", "1000", 8),
            image("parts.bin", "8000", 8),
            ManifestEntry::empty("9000"),
            image("bad-offset.bin", "xyz", 8),
            image("app.bin", "10000", 8),
        ]
        .into_iter()
        .collect();

        let report = o.program(&manifest).await.unwrap();

        assert_eq!(report.attempted, 4);
        assert_eq!(report.flashed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].index, 1);
        assert!(matches!(report.failed[0].error, FileError::Write(_)));
        assert_eq!(report.failed[1].name, "bad-offset.bin");
        assert!(matches!(report.failed[1].error, FileError::Offset(_)));

        assert_eq!(
            s.flash_calls(),
            vec![
                Call::Flash { len: 8, offset: 0x1000 },
                Call::Flash { len: 8, offset: 0x8000 },
                Call::Flash { len: 8, offset: 0x10000 },
            ]
        );

        let errors: Vec<_> = drain(&mut lines)
            .into_iter()
            .filter(|l| l.starts_with("ERROR!"))
            .collect();
        assert_eq!(
            errors,
            vec![
                "ERROR!\nDevice error: write failed at 0x8000".to_string(),
                "ERROR!\ninvalid flash offset 'xyz': invalid digit found in string".to_string(),
            ]
        );
        assert!(!o.is_flashing());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_file_is_a_per_file_error() {
        let (o, s) = connected(FakeSession::default()).await;
        let dir = tempfile::tempdir().unwrap();

        let manifest: Manifest = vec![
            ManifestEntry::file(dir.path().join("missing.bin"), "0"),
            image("app.bin", "0", 4),
        ]
        .into_iter()
        .collect();

        let report = o.program(&manifest).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].error, FileError::Read(_)));
        assert_eq!(s.flash_calls(), vec![Call::Flash { len: 4, offset: 0 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn unplug_during_write_is_caught() {
        let (o, s) = connected(FakeSession {
            hang_writes: true,
            ..FakeSession::default()
        })
        .await;
        let manifest: Manifest = vec![image("app.bin", "0", 64)].into_iter().collect();

        let (report, ()) = tokio::join!(o.program(&manifest), async {
            while s.writes_started.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            s.trigger.fire();
        });

        let report = report.unwrap();
        while o.state() != ConnectionState::Disconnected {
            tokio::task::yield_now().await;
        }
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].error, FileError::Write(SessionError::Closed)));

        assert_eq!(o.state(), ConnectionState::Disconnected);
        assert!(o.identity().is_none());
        assert!(!o.is_flashing());

        let warning = o.notifier().get(ids::DISCONNECTED).unwrap();
        assert_eq!(warning.kind, NotificationKind::Warning);

        // Further workflows need a new connection
        assert!(matches!(o.erase().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn unplug_while_idle_resets_state() {
        let (o, s) = connected(FakeSession::default()).await;
        let mut lines = o.log().subscribe();

        s.trigger.fire();
        while o.state() != ConnectionState::Disconnected {
            tokio::task::yield_now().await;
        }

        assert_eq!(drain(&mut lines), vec![SEPARATOR]);
        assert!(o.notifier().get(ids::DISCONNECTED).is_some());

        // Explicit disconnect afterwards has nothing to do
        o.disconnect().await;
        assert!(!s.calls().contains(&Call::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn percentages_are_truncated() {
        let (o, _s) = connected(FakeSession {
            progress_steps: vec![(2, 3), (199, 200), (4, 4)],
            ..FakeSession::default()
        })
        .await;
        let mut lines = o.log().subscribe();

        let manifest: Manifest = vec![image("app.bin", "0", 4)].into_iter().collect();
        o.program(&manifest).await.unwrap();

        assert_eq!(
            drain(&mut lines),
            vec![
                "Flashing... 66%",
                "Flashing... 99%",
                "Flashing... 100%",
                "Done!",
                "Please reboot the device."
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn growing_total_keeps_progress_in_range() {
        let (o, _s) = connected(FakeSession {
            progress_steps: vec![(100, 200), (300, 400), (600, 700), (700, 700)],
            ..FakeSession::default()
        })
        .await;
        let mut events = o.notifier().subscribe();

        let manifest: Manifest = vec![image("app.bin", "0", 700)].into_iter().collect();
        let report = o.program(&manifest).await.unwrap();
        assert!(report.all_flashed());

        let mut progress = vec![];
        while let Ok(e) = events.try_recv() {
            if let crate::notify::NotificationEvent::Shown(n) = e {
                if n.id == ids::UPLOAD {
                    progress.push(n.progress.unwrap());
                }
            }
        }

        assert_eq!(progress.len(), 5);
        assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_for_running_workflow() {
        let (o, s) = connected(FakeSession {
            write_time: Duration::from_millis(5000),
            ..FakeSession::default()
        })
        .await;
        let manifest: Manifest = vec![image("app.bin", "0", 64)].into_iter().collect();

        let (report, reconnect) = tokio::join!(o.program(&manifest), async {
            while s.writes_started.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            s.trigger.fire();
            while o.state() != ConnectionState::Disconnected {
                tokio::task::yield_now().await;
            }
            assert!(o.is_flashing());
            let res = o.connect().await;
            assert_eq!(
                o.notifier().get(ids::REJECTED).unwrap().text,
                "Another operation is in progress"
            );
            res
        });

        assert!(matches!(reconnect, Err(Error::Busy)));
        assert_eq!(o.opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(report.unwrap().failed.len(), 1);
        assert_eq!(o.state(), ConnectionState::Disconnected);
        assert!(!o.is_flashing());
    }

    struct SingleImage;

    impl ManifestDefaults for SingleImage {
        fn default_manifest(&self, chip_name: &str) -> Manifest {
            vec![ManifestEntry::empty(if chip_name == "ESP32" { "2000" } else { "0" })]
                .into_iter()
                .collect()
        }
    }

    #[tokio::test]
    async fn custom_defaults_follow_detected_chip() {
        let (o, _s) = orchestrator(FakeSession::default());
        let o = o.with_defaults(SingleImage);

        assert!(o.default_manifest().is_empty());
        o.connect().await.unwrap();

        let defaults = o.default_manifest();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults.get(0).map(|e| e.offset()), Some("2000"));
        assert!(!defaults.get(0).unwrap().is_ready());
    }

    #[test]
    fn progress_fraction_is_bounded() {
        assert_eq!(progress_fraction(0, 0), 0.0);
        assert_eq!(progress_fraction(512, 1024), 0.5);
        assert_eq!(progress_fraction(2048, 1024), 1.0);
        assert_eq!(progress_fraction(1024, 1024), 1.0);
    }

    #[test]
    fn error_prefix_is_stripped() {
        assert_eq!(clean_message("Error: port busy"), "port busy");
        assert_eq!(clean_message("port busy"), "port busy");
        assert_eq!(display_name(&"x".repeat(40)).len(), 28);
    }
}
