use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use connect_transport::{AcquireInput, Descriptor, Transport};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::commands::DeviceCommands;
use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};
use crate::events::{DeviceSummary, EventBus, Notification};
use crate::features::Features;
use crate::prompts::DevicePrompter;
use crate::queue::{AbortSignal, RequestQueue};
use crate::session::{SessionKey, SessionStore};

pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(25);

/// BIP-44 testnet path used to derive a passphrase state on firmware without
/// `GetPassphraseState`.
const PASSPHRASE_PROBE_PATH: [u32; 5] = [0x8000_002c, 0x8000_0001, 0x8000_0000, 0, 0];

/// Collaborators shared by every device of one orchestrator.
pub struct DeviceContext {
    pub transport: Arc<dyn Transport>,
    pub prompter: Arc<dyn DevicePrompter>,
    pub sessions: Arc<dyn SessionStore>,
    pub queue: Arc<RequestQueue>,
    pub events: EventBus,
    pub initialize_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// `Some(true)` keeps the transport session after the run,
    /// `Some(false)` forces a release, `None` keeps the current setting.
    pub keep_session: Option<bool>,
    /// Start a fresh protocol session instead of resuming the cached one.
    pub init_session: bool,
    pub passphrase_state: Option<String>,
    pub use_empty_passphrase: bool,
    pub signal: Option<AbortSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphraseProbe {
    pub passphrase_state: Option<String>,
    pub session_id: Option<String>,
    pub unlocked_attach_pin: bool,
}

struct DeviceState {
    descriptor: Descriptor,
    main_id: Option<String>,
    features: Option<Features>,
    passphrase_state: Option<String>,
    keep_session: bool,
    updating_firmware: bool,
    /// Cancellation token of the current run; bound to every command layer
    /// built while it lasts.
    signal: AbortSignal,
}

struct RunSlot {
    id: u64,
    interrupt: Option<oneshot::Sender<ConnectError>>,
    settled: oneshot::Receiver<()>,
}

struct RunTicket {
    id: u64,
    interrupt: oneshot::Receiver<ConnectError>,
    // Dropping the sender settles the run for whoever waits on it.
    _settled: oneshot::Sender<()>,
}

/// One physical device and its transport session.
pub struct Device {
    ctx: Arc<DeviceContext>,
    state: Mutex<DeviceState>,
    commands: Mutex<Option<Arc<DeviceCommands>>>,
    run_slot: Mutex<Option<RunSlot>>,
    next_run: AtomicU64,
}

impl Device {
    pub fn new(ctx: Arc<DeviceContext>, descriptor: Descriptor) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(DeviceState {
                descriptor,
                main_id: None,
                features: None,
                passphrase_state: None,
                keep_session: false,
                updating_firmware: false,
                signal: AbortSignal::never(),
            }),
            commands: Mutex::new(None),
            run_slot: Mutex::new(None),
            next_run: AtomicU64::new(0),
        })
    }

    pub fn connect_id(&self) -> String {
        self.state.lock().descriptor.connect_id().to_string()
    }

    pub fn path(&self) -> String {
        self.state.lock().descriptor.path.clone()
    }

    pub fn descriptor(&self) -> Descriptor {
        self.state.lock().descriptor.clone()
    }

    /// Adopts a fresh descriptor from enumeration for the same device.
    pub fn set_descriptor(&self, descriptor: Descriptor) {
        self.state.lock().descriptor = descriptor;
    }

    pub fn is_ble(&self) -> bool {
        self.state.lock().descriptor.kind.is_ble()
    }

    pub fn features(&self) -> Option<Features> {
        self.state.lock().features.clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.state
            .lock()
            .features
            .as_ref()
            .and_then(|f| f.device_id.clone())
    }

    pub fn passphrase_state(&self) -> Option<String> {
        self.state.lock().passphrase_state.clone()
    }

    pub fn keep_session(&self) -> bool {
        self.state.lock().keep_session
    }

    pub fn is_updating_firmware(&self) -> bool {
        self.state.lock().updating_firmware
    }

    pub fn set_updating_firmware(&self, updating: bool) {
        self.state.lock().updating_firmware = updating;
    }

    pub fn is_running(&self) -> bool {
        self.run_slot.lock().is_some()
    }

    /// The transport's live session for this path is the one we hold.
    pub fn is_used_here(&self) -> bool {
        let state = self.state.lock();
        state.main_id.is_some() && state.descriptor.session == state.main_id
    }

    pub fn summary(&self) -> DeviceSummary {
        let state = self.state.lock();
        DeviceSummary {
            connect_id: state.descriptor.connect_id().to_string(),
            device_id: state.features.as_ref().and_then(|f| f.device_id.clone()),
            path: state.descriptor.path.clone(),
            name: state.descriptor.name.clone(),
            transport: state.descriptor.kind,
            features: state.features.clone(),
        }
    }

    fn current_commands(&self) -> Option<Arc<DeviceCommands>> {
        self.commands.lock().clone()
    }

    pub fn commands(&self) -> ConnectResult<Arc<DeviceCommands>> {
        match self.current_commands() {
            Some(commands) if !commands.is_disposed() => Ok(commands),
            _ => Err(ConnectError::with_message(
                HardwareErrorCode::DeviceNotFound,
                "device is not acquired",
            )),
        }
    }

    pub async fn typed_call(
        &self,
        request: &str,
        accept: &[&str],
        payload: Value,
    ) -> ConnectResult<connect_transport::Message> {
        self.commands()?.typed_call(request, accept, payload).await
    }

    pub async fn connect(&self) -> ConnectResult<()> {
        if !self.is_used_here() {
            self.acquire().await?;
        }
        Ok(())
    }

    /// Claims the transport session and rebuilds the command layer.
    pub async fn acquire(&self) -> ConnectResult<()> {
        let descriptor = self.descriptor();
        let session = self
            .ctx
            .transport
            .acquire(AcquireInput {
                path: descriptor.path.clone(),
                previous_session: descriptor.session.clone(),
                id: descriptor.id.clone(),
            })
            .await?;
        debug!(connect_id = %descriptor.connect_id(), session = %session, "device acquired");

        {
            let mut state = self.state.lock();
            state.main_id = Some(session.clone());
            state.descriptor.session = Some(session.clone());
        }
        let commands = Arc::new(DeviceCommands::new(
            self.ctx.transport.clone(),
            session,
            self.ctx.prompter.clone(),
            self.summary(),
        ));
        commands.set_abort_signal(self.state.lock().signal.clone());
        if let Some(previous) = self.commands.lock().replace(commands) {
            previous.dispose();
        }
        Ok(())
    }

    /// Frees the transport session unless the device is kept or not ours.
    /// Failures are logged; release never fails the caller.
    pub async fn release(&self) {
        if !self.is_used_here() || self.keep_session() {
            return;
        }
        let connect_id = self.connect_id();
        self.ctx
            .queue
            .wait_for_pending_callback_tasks(&connect_id)
            .await;

        if let Some(commands) = self.commands.lock().take() {
            commands.dispose();
        }
        let session = {
            let mut state = self.state.lock();
            state.descriptor.session = None;
            state.main_id.take()
        };
        if let Some(session) = session {
            match self.ctx.transport.release(&session, false).await {
                Ok(()) => debug!(connect_id = %connect_id, session = %session, "device released"),
                Err(error) => warn!(connect_id = %connect_id, "release failed: {error}"),
            }
        }
    }

    /// Handshake. Resumes the cached protocol session for the requested
    /// passphrase state unless a fresh session was asked for.
    pub async fn initialize(&self, options: &RunOptions) -> ConnectResult<()> {
        let commands = self.commands()?;
        let device_id = self.device_id();
        let passphrase_state = options
            .passphrase_state
            .clone()
            .or_else(|| self.passphrase_state());

        let mut session_id = None;
        if let Some(device_id) = &device_id {
            let key = SessionKey::new(device_id.clone(), passphrase_state.as_deref());
            if options.init_session {
                self.ctx.sessions.remove(&key).await;
            } else {
                session_id = self.ctx.sessions.get(&key).await;
            }
        }

        commands.set_preset_passphrase(options.use_empty_passphrase.then(String::new));

        let mut payload = json!({});
        if let Some(session_id) = &session_id {
            payload["session_id"] = json!(session_id);
        }
        if let Some(state) = &passphrase_state {
            payload["passphrase_state"] = json!(state);
        }
        let response = timeout(
            self.ctx.initialize_timeout,
            commands.typed_call("Initialize", &["Features"], payload),
        )
        .await
        .map_err(|_| {
            ConnectError::with_message(
                HardwareErrorCode::DeviceInitializeFailed,
                "Initialize timeout",
            )
        })??;

        let features = Features::from_value(&response.body)
            .ok_or_else(|| ConnectError::new(HardwareErrorCode::DeviceInitializeFailed))?;
        if let (Some(device_id), Some(session_id)) = (&features.device_id, &features.session_id) {
            self.ctx
                .sessions
                .put(
                    SessionKey::new(device_id.clone(), passphrase_state.as_deref()),
                    session_id.clone(),
                )
                .await;
        }
        self.update_features(features);
        Ok(())
    }

    pub async fn get_features(&self) -> ConnectResult<Features> {
        let response = self
            .typed_call("GetFeatures", &["Features"], json!({}))
            .await?;
        let features = Features::from_value(&response.body)
            .ok_or_else(|| ConnectError::runtime("device returned malformed features"))?;
        self.update_features(features.clone());
        Ok(features)
    }

    pub fn update_features(&self, features: Features) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.features.as_ref() != Some(&features);
            state.features = Some(features.clone());
            changed
        };
        if let Some(version) = features.firmware_version()
            && let Err(error) = self.ctx.transport.reconfigure(&version)
        {
            warn!(connect_id = %self.connect_id(), "transport reconfigure failed: {error}");
        }
        let summary = self.summary();
        if let Some(commands) = self.current_commands() {
            commands.set_summary(summary.clone());
        }
        if changed {
            self.ctx
                .events
                .emit(Notification::DeviceFeatures { device: summary });
        }
    }

    fn begin_run(&self) -> (RunTicket, Option<RunSlot>) {
        let id = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        let (settled_tx, settled_rx) = oneshot::channel();
        let previous = self.run_slot.lock().replace(RunSlot {
            id,
            interrupt: Some(interrupt_tx),
            settled: settled_rx,
        });
        (
            RunTicket {
                id,
                interrupt: interrupt_rx,
                _settled: settled_tx,
            },
            previous,
        )
    }

    fn finish_run(&self, id: u64) {
        let finished = {
            let mut slot = self.run_slot.lock();
            let current = slot.as_ref().is_some_and(|slot| slot.id == id);
            if current {
                *slot = None;
            }
            current
        };
        if finished {
            self.state.lock().signal = AbortSignal::never();
        }
    }

    /// Runs `body` with exclusive use of the device.
    ///
    /// A run already in progress is interrupted and fully settled before
    /// this one touches the device. Without a body the run only acquires
    /// (and releases, unless the session is kept).
    pub async fn run<T, F>(&self, options: RunOptions, body: Option<F>) -> ConnectResult<Option<T>>
    where
        F: Future<Output = ConnectResult<T>>,
    {
        let (mut ticket, previous) = self.begin_run();
        if let Some(mut previous) = previous {
            debug!(connect_id = %self.connect_id(), "interrupting previous run");
            if let Some(interrupt) = previous.interrupt.take() {
                let _ = interrupt.send(ConnectError::new(
                    HardwareErrorCode::DeviceInterruptedFromOutside,
                ));
            }
            if let Some(commands) = self.current_commands() {
                commands
                    .cancel(HardwareErrorCode::DeviceInterruptedFromOutside)
                    .await;
            }
            let _ = previous.settled.await;
        }

        let outcome = tokio::select! {
            biased;
            Ok(reason) = &mut ticket.interrupt => Err(reason),
            result = self.run_inner(&options, body) => result,
        };

        if let Err(error) = &outcome {
            debug!(connect_id = %self.connect_id(), code = error.code.as_u32(), "run failed: {error}");
            if error.is_fatal_session() {
                self.state.lock().keep_session = false;
            }
            self.release().await;
        }
        self.finish_run(ticket.id);
        outcome
    }

    async fn run_inner<T, F>(&self, options: &RunOptions, body: Option<F>) -> ConnectResult<Option<T>>
    where
        F: Future<Output = ConnectResult<T>>,
    {
        let signal = options.signal.clone().unwrap_or_else(AbortSignal::never);
        {
            let mut state = self.state.lock();
            state.signal = signal.clone();
            if options.keep_session == Some(true) {
                state.keep_session = true;
            }
        }
        let needs_acquire = !self.is_used_here()
            || self
                .current_commands()
                .is_none_or(|commands| commands.is_disposed());
        if needs_acquire {
            self.acquire().await?;
        }
        let commands = self.commands()?;
        commands.set_abort_signal(signal);

        let result = match body {
            Some(body) => {
                self.initialize(options).await?;
                Some(body.await?)
            }
            None => None,
        };

        let release = match options.keep_session {
            Some(keep) => !keep,
            None => !self.keep_session(),
        };
        if release {
            self.state.lock().keep_session = false;
            self.release().await;
        }
        Ok(result)
    }

    /// Aborts the current run from another caller (disconnect, newer run).
    pub fn interrupt_from_outside(&self) {
        let interrupt = self
            .run_slot
            .lock()
            .as_mut()
            .and_then(|slot| slot.interrupt.take());
        if let Some(interrupt) = interrupt {
            info!(connect_id = %self.connect_id(), "run interrupted from outside");
            let _ = interrupt.send(ConnectError::new(
                HardwareErrorCode::DeviceInterruptedFromOutside,
            ));
        }
    }

    /// User cancel. A run parked on a PIN or passphrase prompt unwinds
    /// through its request signal, which cancels on the device; any other
    /// run is aborted with `DeviceInterruptedFromUser`.
    pub async fn interrupt_from_user(&self) {
        info!(connect_id = %self.connect_id(), "run interrupted by user");
        if let Some(commands) = self.current_commands() {
            let prompting = commands.is_prompting();
            commands
                .cancel(HardwareErrorCode::DeviceInterruptedFromUser)
                .await;
            if prompting {
                return;
            }
        }
        let interrupt = self
            .run_slot
            .lock()
            .as_mut()
            .and_then(|slot| slot.interrupt.take());
        if let Some(interrupt) = interrupt {
            let _ = interrupt.send(ConnectError::new(
                HardwareErrorCode::DeviceInterruptedFromUser,
            ));
        }
    }

    /// Locks the device; failures are logged only.
    pub async fn lock(&self) {
        if let Err(error) = self.typed_call("LockDevice", &["Success"], json!({})).await {
            warn!(connect_id = %self.connect_id(), "lock device failed: {error}");
        }
    }

    /// Reads the passphrase state of the unlocked wallet.
    ///
    /// Older firmware lacks `GetPassphraseState`; there a testnet address
    /// stands in for the state.
    pub async fn passphrase_state_probe(&self) -> ConnectResult<PassphraseProbe> {
        match self
            .typed_call("GetPassphraseState", &["PassphraseState"], json!({}))
            .await
        {
            Ok(response) => Ok(PassphraseProbe {
                passphrase_state: response.field_str("passphrase_state").map(str::to_string),
                session_id: response.field_str("session_id").map(str::to_string),
                unlocked_attach_pin: response.field_bool("unlocked_attach_pin").unwrap_or(false),
            }),
            Err(error) if is_unsupported_message(&error) => {
                debug!(connect_id = %self.connect_id(), "falling back to address probe");
                let response = self
                    .typed_call(
                        "GetAddress",
                        &["Address"],
                        json!({
                            "address_n": PASSPHRASE_PROBE_PATH,
                            "coin_name": "Testnet",
                            "show_display": false,
                        }),
                    )
                    .await?;
                Ok(PassphraseProbe {
                    passphrase_state: response.field_str("address").map(str::to_string),
                    session_id: None,
                    unlocked_attach_pin: false,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Refuses to operate on a wallet other than the one the caller means.
    ///
    /// On mismatch the device is locked, the cached session for the expected
    /// state dropped, and the call fails.
    pub async fn check_passphrase_state_safety(&self, expected: Option<&str>) -> ConnectResult<()> {
        let features = self.features().unwrap_or_default();
        if !features.passphrase_enabled() {
            return Ok(());
        }
        let probe = self.passphrase_state_probe().await?;
        let mismatch = match expected {
            Some(expected) => probe.passphrase_state.as_deref() != Some(expected),
            None => probe.unlocked_attach_pin,
        };

        if mismatch {
            warn!(connect_id = %self.connect_id(), "passphrase state mismatch, locking device");
            self.lock().await;
            if let Some(device_id) = &features.device_id {
                self.ctx
                    .sessions
                    .remove(&SessionKey::new(device_id.clone(), expected))
                    .await;
            }
            self.state.lock().passphrase_state = None;
            return Err(ConnectError::new(
                HardwareErrorCode::DeviceCheckPassphraseStateError,
            ));
        }

        self.state.lock().passphrase_state = probe.passphrase_state.clone();
        if let (Some(device_id), Some(session_id)) = (&features.device_id, probe.session_id) {
            self.ctx
                .sessions
                .put(
                    SessionKey::new(device_id.clone(), probe.passphrase_state.as_deref()),
                    session_id,
                )
                .await;
        }
        Ok(())
    }
}

fn is_unsupported_message(error: &ConnectError) -> bool {
    let failure_code = error
        .params
        .as_ref()
        .and_then(|p| p.get("failureCode"))
        .and_then(Value::as_str);
    failure_code == Some("Failure_UnexpectedMessage")
        || error.message.to_ascii_lowercase().contains("unknown message")
}
