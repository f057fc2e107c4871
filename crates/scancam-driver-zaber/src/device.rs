//! Per-axis protocol engine.
//!
//! A [`ZaberDevice`] owns one stage on the chain. It keeps a FIFO of queued
//! commands, counts the replies it still expects, and decides when the next
//! queued command may leave:
//!
//! ```text
//! Idle ──send──▶ ActionPending ──last reply──▶ Idle
//!                     │
//!                     └─(stepped, reply arrives, no step yet)──▶ AwaitingStep
//! ```
//!
//! Replies are delivered by the transport's reader task through
//! [`PacketHandler`]. The device never blocks that task: all waiting happens
//! on the caller's side, against a `watch` channel that is bumped for every
//! processed reply.
//!
//! # Busy Replies
//!
//! A busy reply means the controller was still executing the previous
//! command. The last frame is resent after the policy's backoff delay, on a
//! spawned task, and the request fails with a device command error once the
//! policy is exhausted.

use async_trait::async_trait;
use parking_lot::Mutex;
use scancam_core::config::{ProtocolConfig, RunMode, StageConfig};
use scancam_core::error_recovery::{retry_with_backoff, RetryPolicy};
use scancam_core::limits::secs;
use scancam_core::{Result, ScanCamError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::instrument;

use crate::packet::Packet;
use crate::protocol::{BaseCommand, CommandKind, DeviceFault, MoveCommand, Setting};
use crate::transport::{PacketHandler, Transport};
use crate::units::{self, UnitScale};

/// Replies kept for blocking requests to scan.
const RECENT_REPLIES: usize = 32;

/// Error replies kept per device; older faults are dropped.
const FAULT_HISTORY: usize = 64;

// =============================================================================
// Public Types
// =============================================================================

/// Construction options for a [`ZaberDevice`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOptions {
    /// Unit scaling
    pub scale: UnitScale,
    /// Queue dispatch mode
    pub run_mode: RunMode,
    /// Retry and deadline settings
    pub protocol: ProtocolConfig,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            scale: UnitScale::microsteps(),
            run_mode: RunMode::Continuous,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl DeviceOptions {
    /// Options for a configured stage.
    pub fn for_stage(stage: &StageConfig, protocol: &ProtocolConfig) -> Self {
        Self {
            scale: UnitScale::new(stage.units, stage.controller),
            run_mode: stage.run_mode,
            protocol: protocol.clone(),
        }
    }
}

/// An error reply recorded against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Receive sequence number of the error reply
    pub seq: u64,
    /// Command the fault applies to
    pub command: u8,
    /// Decoded fault
    pub fault: DeviceFault,
}

impl FaultRecord {
    fn to_error(self, device: &str) -> ScanCamError {
        ScanCamError::DeviceCommand {
            device: device.to_string(),
            code: self.command,
            subcode: self.fault.subcode(),
            description: self.fault.description(),
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedCommand {
    code: u8,
    data: i32,
    pause_after: bool,
}

#[derive(Debug)]
struct DeviceState {
    pending: u32,
    queue: VecDeque<QueuedCommand>,
    /// Pause flag of the last command sent
    pause_after: bool,
    awaiting_step: bool,
    settings: HashMap<Setting, i32>,
    microsteps_per_unit: f64,
    initialised: bool,
    last_sent: Option<Packet>,
    rx_seq: u64,
    recent: VecDeque<(u64, Packet)>,
    busy_retries: u32,
    faults: VecDeque<FaultRecord>,
    closed: bool,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            pending: 0,
            queue: VecDeque::new(),
            pause_after: true,
            awaiting_step: false,
            settings: HashMap::new(),
            microsteps_per_unit: 1.0,
            initialised: false,
            last_sent: None,
            rx_seq: 0,
            recent: VecDeque::with_capacity(RECENT_REPLIES),
            busy_retries: 0,
            faults: VecDeque::with_capacity(FAULT_HISTORY),
            closed: false,
        }
    }

    fn in_action(&self) -> bool {
        self.pending > 0
    }

    fn record_fault(&mut self, record: FaultRecord) {
        if self.faults.len() == FAULT_HISTORY {
            self.faults.pop_front();
        }
        self.faults.push_back(record);
    }
}

/// Work left over after a reply has been applied to the state.
#[derive(Debug, Default)]
struct Followup {
    /// Frame to resend after a delay
    resend: Option<(Packet, Duration)>,
    /// Next queued command to dispatch
    dispatch: Option<QueuedCommand>,
}

/// Outcome of checking the replies received since a blocking send.
enum ReplyCheck {
    Matched(i32),
    Failed(ScanCamError),
    Waiting,
}

// =============================================================================
// ZaberDevice
// =============================================================================

/// One stage on the serial chain.
///
/// Cloning is cheap; clones share the same protocol state.
#[derive(Clone)]
pub struct ZaberDevice {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    id: String,
    address: u8,
    transport: Arc<dyn Transport>,
    options: DeviceOptions,
    state: Mutex<DeviceState>,
    events: watch::Sender<u64>,
    self_ref: Weak<DeviceInner>,
}

impl std::fmt::Debug for ZaberDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZaberDevice")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("pending", &self.pending_responses())
            .finish()
    }
}

impl ZaberDevice {
    /// Create a device and register it with the transport.
    ///
    /// No frames are sent; call [`initialise`](Self::initialise) to run the
    /// settings handshake.
    pub fn new(
        id: impl Into<String>,
        address: u8,
        transport: Arc<dyn Transport>,
        options: DeviceOptions,
    ) -> Self {
        let (events, _) = watch::channel(0u64);
        let inner = Arc::new_cyclic(|self_ref| DeviceInner {
            id: id.into(),
            address,
            transport,
            options,
            state: Mutex::new(DeviceState::new()),
            events,
            self_ref: self_ref.clone(),
        });
        let handler: Arc<dyn PacketHandler> = inner.clone();
        inner.transport.register(address, Arc::downgrade(&handler));
        Self { inner }
    }

    /// Create a device and complete its settings handshake.
    pub async fn attach(
        id: impl Into<String>,
        address: u8,
        transport: Arc<dyn Transport>,
        options: DeviceOptions,
    ) -> Result<Self> {
        let device = Self::new(id, address, transport, options);
        device.initialise().await?;
        Ok(device)
    }

    /// Attach the device described by a stage configuration entry.
    pub async fn attach_from_config(
        stage: &StageConfig,
        protocol: &ProtocolConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let options = DeviceOptions::for_stage(stage, protocol);
        Self::attach(stage.axis.clone(), stage.address, transport, options).await
    }

    /// Device identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Address on the chain.
    pub fn address(&self) -> u8 {
        self.inner.address
    }

    /// Queue dispatch mode.
    pub fn run_mode(&self) -> RunMode {
        self.inner.options.run_mode
    }

    // -------------------------------------------------------------------------
    // State queries
    // -------------------------------------------------------------------------

    /// Whether any reply is still outstanding.
    pub fn in_action(&self) -> bool {
        self.inner.state.lock().in_action()
    }

    /// Number of outstanding replies.
    pub fn pending_responses(&self) -> u32 {
        self.inner.state.lock().pending
    }

    /// Number of queued, unsent commands.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether a `step()` is armed and waiting for the current action to finish.
    pub fn awaiting_step(&self) -> bool {
        self.inner.state.lock().awaiting_step
    }

    /// Last value reported for `setting`.
    pub fn setting(&self, setting: Setting) -> Option<i32> {
        self.inner.state.lock().settings.get(&setting).copied()
    }

    /// Whether every setting has been reported.
    pub fn is_initialised(&self) -> bool {
        self.inner.state.lock().initialised
    }

    /// Microsteps per physical unit; 1 until the resolution is known.
    pub fn microsteps_per_unit(&self) -> f64 {
        self.inner.state.lock().microsteps_per_unit
    }

    /// The most recent error replies, oldest first.
    pub fn faults(&self) -> Vec<FaultRecord> {
        self.inner.state.lock().faults.iter().copied().collect()
    }

    /// Last frame sent to the device.
    pub fn last_sent(&self) -> Option<Packet> {
        self.inner.state.lock().last_sent
    }

    // -------------------------------------------------------------------------
    // Queue
    // -------------------------------------------------------------------------

    /// Queue a command, dispatching it at once when the device is idle with
    /// an empty queue in continuous mode.
    pub async fn enqueue(&self, kind: CommandKind, data: i32) -> Result<()> {
        self.enqueue_with(kind, data, true).await
    }

    /// Queue a command with an explicit pause flag.
    ///
    /// In stepped mode a command queued with `pause_after == false` lets the
    /// following command leave as soon as it completes, without a `step()`.
    pub async fn enqueue_with(&self, kind: CommandKind, data: i32, pause_after: bool) -> Result<()> {
        let command = QueuedCommand {
            code: kind.code(),
            data,
            pause_after,
        };
        let dispatch_now = {
            let mut state = self.inner.state.lock();
            let idle = !state.in_action() && state.queue.is_empty();
            if idle && self.inner.options.run_mode == RunMode::Continuous {
                true
            } else {
                state.queue.push_back(command);
                false
            }
        };
        tracing::debug!(device = %self.inner.id, command = %kind, data, dispatch_now, "enqueue");
        if dispatch_now {
            self.send_now(command.code, command.data, command.pause_after, false, 0)
                .await?;
        }
        Ok(())
    }

    /// Advance the queue by one command.
    ///
    /// Sends the next queued command when the device is idle. While an action
    /// is running in stepped mode the step is remembered and the command
    /// leaves when the action completes. Does nothing when the queue is empty.
    pub async fn step(&self) -> Result<()> {
        let next = {
            let mut state = self.inner.state.lock();
            state.awaiting_step = false;
            if state.queue.is_empty() {
                tracing::debug!(device = %self.inner.id, "Command queue empty on step");
                None
            } else if state.in_action() {
                if self.inner.options.run_mode == RunMode::Stepped {
                    state.awaiting_step = true;
                }
                None
            } else {
                state.queue.pop_front()
            }
        };
        if let Some(command) = next {
            self.send_now(command.code, command.data, command.pause_after, false, 0)
                .await?;
        }
        Ok(())
    }

    /// Drop every queued command without sending it.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.awaiting_step = false;
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    // -------------------------------------------------------------------------
    // Immediate send
    // -------------------------------------------------------------------------

    /// Send a frame now, bypassing the queue.
    ///
    /// Known command, move and setting codes raise the pending count, except a
    /// move sent while the device is acting, which replaces the running move.
    ///
    /// `reset` is never answered by the controller and is not counted.
    ///
    /// With `blocking`, waits until a reply with command `release` arrives and
    /// returns its data. Fails with a device command error when an error
    /// reply for `code` or `release` arrives or no replies remain pending
    /// without a match, and with a device timeout after the response deadline.
    pub async fn send_now(
        &self,
        code: u8,
        data: i32,
        pause_after: bool,
        blocking: bool,
        release: u8,
    ) -> Result<Option<i32>> {
        self.inner
            .send_now(code, data, pause_after, blocking, release)
            .await
    }

    /// Process one reply frame.
    pub async fn handle_incoming(&self, packet: Packet) {
        self.inner.handle_packet(packet).await;
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Wait until no replies are outstanding.
    ///
    /// Fails only when the link goes down first.
    pub async fn wait_idle(&self) -> Result<()> {
        let mut events = self.inner.events.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                if !state.in_action() {
                    return Ok(());
                }
                if state.closed {
                    return Err(ScanCamError::Transport(format!(
                        "link closed while '{}' was acting",
                        self.inner.id
                    )));
                }
            }
            if events.changed().await.is_err() {
                return Err(ScanCamError::Transport("device dropped".into()));
            }
        }
    }

    /// Wait for the current action to finish within `timeout_secs`.
    pub async fn wait_for_action_to_complete(&self, timeout_secs: u64) -> Result<()> {
        match timeout(secs(timeout_secs), self.wait_idle()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(device = %self.inner.id, timeout_secs, "Action did not complete in time");
                Err(ScanCamError::DeviceTimeout(self.inner.id.clone()))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Settings
    // -------------------------------------------------------------------------

    /// Read a setting, retrying up to the configured number of attempts.
    pub async fn get(&self, setting: Setting) -> Result<i32> {
        let attempts = self.inner.options.protocol.blocking_retries.max(1);
        let policy = RetryPolicy::immediate(attempts - 1);
        let inner = &self.inner;
        retry_with_backoff(&policy, move |_| {
            inner.send_now(
                BaseCommand::ReturnSetting.code(),
                i32::from(setting.code()),
                true,
                true,
                setting.code(),
            )
        })
        .await?
        .ok_or_else(|| ScanCamError::DeviceCommand {
            device: self.inner.id.clone(),
            code: setting.code(),
            subcode: 0,
            description: "no value returned".into(),
        })
    }

    /// Write a setting without waiting for the reply.
    pub async fn set(&self, setting: Setting, value: i32) -> Result<()> {
        self.send_now(setting.code(), value, true, false, 0).await?;
        Ok(())
    }

    /// Write a setting and wait for the device to echo it.
    pub async fn set_blocking(&self, setting: Setting, value: i32) -> Result<i32> {
        self.send_now(setting.code(), value, true, true, setting.code())
            .await?
            .ok_or_else(|| ScanCamError::DeviceCommand {
                device: self.inner.id.clone(),
                code: setting.code(),
                subcode: 0,
                description: "no value returned".into(),
            })
    }

    /// Read every setting. Fails with an initialization error if any is
    /// still missing afterwards.
    #[instrument(skip(self), fields(device = %self.inner.id))]
    pub async fn initialise(&self) -> Result<()> {
        for setting in Setting::all() {
            self.get(setting)
                .await
                .map_err(|e| ScanCamError::Initialization {
                    device: self.inner.id.clone(),
                    reason: format!("reading {}: {}", setting.name(), e),
                })?;
        }
        if !self.is_initialised() {
            return Err(ScanCamError::Initialization {
                device: self.inner.id.clone(),
                reason: "settings handshake incomplete".into(),
            });
        }
        tracing::info!(
            device = %self.inner.id,
            microsteps_per_unit = self.microsteps_per_unit(),
            units = self.inner.options.scale.units().label(),
            "Device initialised"
        );
        Ok(())
    }

    /// Set the target speed in physical units per second and wait for the echo.
    pub async fn set_target_speed(&self, units_per_sec: f64) -> Result<()> {
        let data = self
            .inner
            .options
            .scale
            .speed_data(units_per_sec, self.microsteps_per_unit());
        tracing::debug!(device = %self.inner.id, units_per_sec, data, "set target speed");
        self.set_blocking(Setting::TargetSpeed, data).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Motion
    // -------------------------------------------------------------------------

    /// Queue a move in physical units.
    ///
    /// `StoredPosition` takes a slot index, which is sent unscaled.
    pub async fn enqueue_move(&self, kind: MoveCommand, value: f64) -> Result<()> {
        let data = self.move_data(kind, value);
        self.enqueue(CommandKind::Move(kind), data).await
    }

    /// Queue a return to the home position.
    pub async fn home(&self) -> Result<()> {
        self.enqueue(CommandKind::Base(BaseCommand::Home), 0).await
    }

    /// Clear the queue and send `stop` immediately.
    pub async fn stop_now(&self) -> Result<()> {
        let dropped = self.clear_queue();
        if dropped > 0 {
            tracing::debug!(device = %self.inner.id, dropped, "Dropped queued commands on stop");
        }
        self.send_now(MoveCommand::Stop.code(), 0, true, false, 0)
            .await?;
        Ok(())
    }

    /// Position data for a move command.
    pub fn move_data(&self, kind: MoveCommand, value: f64) -> i32 {
        match kind {
            MoveCommand::StoredPosition => value as i32,
            _ => units::to_microsteps(value, self.microsteps_per_unit()),
        }
    }

    /// Queue a scripted sequence of commands.
    pub async fn run_meta(&self, meta: &crate::meta::MetaCommand) -> Result<()> {
        for step in meta.expand() {
            let data = match step.kind {
                CommandKind::Move(kind) => self.move_data(kind, step.arg),
                _ => step.arg as i32,
            };
            self.enqueue_with(step.kind, data, step.pause_after).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Protocol Engine
// =============================================================================

impl DeviceInner {
    #[instrument(skip(self), fields(device = %self.id))]
    async fn send_now(
        &self,
        code: u8,
        data: i32,
        pause_after: bool,
        blocking: bool,
        release: u8,
    ) -> Result<Option<i32>> {
        let packet = Packet::new(self.address, code, data);
        let events = self.events.subscribe();

        let (seq0, counted) = {
            let mut state = self.state.lock();
            let counted = self.begin_send(&mut state, packet, pause_after);
            (state.rx_seq, counted)
        };

        if let Err(e) = self.transport.send(packet).await {
            if counted {
                let mut state = self.state.lock();
                state.pending = state.pending.saturating_sub(1);
            }
            self.events.send_modify(|n| *n += 1);
            return Err(e);
        }

        if !blocking {
            return Ok(None);
        }
        self.await_reply(events, seq0, code, release).await.map(Some)
    }

    /// Bookkeeping for a frame about to be written. Returns whether it
    /// raised the pending count.
    fn begin_send(&self, state: &mut DeviceState, packet: Packet, pause_after: bool) -> bool {
        let kind = CommandKind::from_code(packet.command);
        // Setting traffic leaves the running action's pause flag alone
        let is_query = matches!(
            kind,
            Some(CommandKind::Setting(_)) | Some(CommandKind::Base(BaseCommand::ReturnSetting))
        );
        if !is_query {
            state.pause_after = pause_after;
        }
        state.last_sent = Some(packet);
        state.busy_retries = 0;

        match kind {
            Some(k) if k.is_move() && state.in_action() => {
                tracing::debug!(device = %self.id, %packet, "Move preempts running action");
                false
            }
            Some(CommandKind::Base(BaseCommand::Reset)) => false,
            Some(_) => {
                state.pending += 1;
                true
            }
            None => false,
        }
    }

    async fn await_reply(
        &self,
        mut events: watch::Receiver<u64>,
        seq0: u64,
        code: u8,
        release: u8,
    ) -> Result<i32> {
        let deadline = Instant::now() + secs(self.options.protocol.response_timeout_secs);
        loop {
            match self.check_reply(seq0, code, release) {
                ReplyCheck::Matched(value) => return Ok(value),
                ReplyCheck::Failed(e) => return Err(e),
                ReplyCheck::Waiting => {}
            }
            match timeout_at(deadline, events.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(ScanCamError::Transport("device dropped".into())),
                Err(_) => {
                    tracing::warn!(device = %self.id, release, "No reply before deadline");
                    return Err(ScanCamError::DeviceTimeout(self.id.clone()));
                }
            }
        }
    }

    fn check_reply(&self, seq0: u64, code: u8, release: u8) -> ReplyCheck {
        let mut state = self.state.lock();

        let matched = state
            .recent
            .iter()
            .find(|(seq, p)| *seq > seq0 && p.command == release && !p.is_error())
            .map(|(_, p)| p.data);
        if let Some(value) = matched {
            return ReplyCheck::Matched(value);
        }

        // Faults for other commands belong to queued traffic
        let fault = state
            .faults
            .iter()
            .find(|f| f.seq > seq0 && (f.command == code || f.command == release));
        if let Some(fault) = fault {
            return ReplyCheck::Failed(fault.to_error(&self.id));
        }

        if state.closed {
            return ReplyCheck::Failed(ScanCamError::Transport(format!(
                "link closed while '{}' awaited a reply",
                self.id
            )));
        }

        if !state.in_action() && state.rx_seq > seq0 {
            let seq = state.rx_seq;
            let record = FaultRecord {
                seq,
                command: release,
                fault: DeviceFault::Unknown(0),
            };
            state.record_fault(record);
            tracing::warn!(device = %self.id, release, "No responses pending and release reply never arrived");
            return ReplyCheck::Failed(ScanCamError::DeviceCommand {
                device: self.id.clone(),
                code: release,
                subcode: 0,
                description: "unacknowledged".into(),
            });
        }

        ReplyCheck::Waiting
    }

    /// Apply a reply to the state. Returns `None` for frames the device
    /// does not understand.
    fn process(&self, packet: Packet) -> Option<Followup> {
        let mut state = self.state.lock();
        let kind = CommandKind::from_code(packet.command);
        if kind.is_none() && !packet.is_error() {
            tracing::debug!(device = %self.id, %packet, "Ignoring reply with unknown command");
            return None;
        }

        state.rx_seq += 1;
        let seq = state.rx_seq;
        if state.recent.len() == RECENT_REPLIES {
            state.recent.pop_front();
        }
        state.recent.push_back((seq, packet));

        let mut resend = None;

        if packet.is_error() {
            state.pending = state.pending.saturating_sub(1);
            let fault = DeviceFault::classify(packet.data);
            let last_sent = state.last_sent;
            let command = fault
                .command_code()
                .or(last_sent.map(|p| p.command))
                .unwrap_or(packet.command);

            match (fault, last_sent) {
                (DeviceFault::Busy, Some(last)) if self.options.protocol.busy_retry.allows(state.busy_retries) => {
                    state.busy_retries += 1;
                    state.pending += 1;
                    let delay = self.options.protocol.busy_retry.delay_for(state.busy_retries);
                    tracing::debug!(
                        device = %self.id,
                        attempt = state.busy_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Device busy, resending"
                    );
                    resend = Some((last, delay));
                }
                _ => {
                    state.record_fault(FaultRecord { seq, command, fault });
                    state.busy_retries = 0;
                    tracing::warn!(
                        device = %self.id,
                        command,
                        subcode = packet.data,
                        error = %fault.description(),
                        "Device rejected command; not retrying"
                    );
                }
            }
        } else if let Some(kind) = kind {
            state.pending = state.pending.saturating_sub(1);
            state.busy_retries = 0;
            match kind {
                CommandKind::Setting(setting) => {
                    state.settings.insert(setting, packet.data);
                    if setting == Setting::MicrostepResolution {
                        state.microsteps_per_unit =
                            self.options.scale.microsteps_per_unit(packet.data);
                    }
                    if state.settings.len() == Setting::count() {
                        state.initialised = true;
                    }
                    tracing::trace!(device = %self.id, setting = %setting, value = packet.data, "setting reply");
                }
                _ => {
                    tracing::debug!(device = %self.id, %packet, pending = state.pending, "action reply");
                }
            }
        }

        let dispatch = self.next_dispatch(&mut state);
        Some(Followup { resend, dispatch })
    }

    /// Pop the next command once nothing is outstanding, whichever reply
    /// brought the count to zero.
    fn next_dispatch(&self, state: &mut DeviceState) -> Option<QueuedCommand> {
        if state.in_action() || state.queue.is_empty() {
            return None;
        }
        if self.options.run_mode == RunMode::Stepped && state.pause_after && !state.awaiting_step {
            return None;
        }
        state.awaiting_step = false;
        state.queue.pop_front()
    }

    fn spawn_resend(&self, packet: Packet, delay: Duration) {
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(e) = inner.transport.send(packet).await {
                tracing::warn!(device = %inner.id, error = %e, "Busy resend failed");
                {
                    let mut state = inner.state.lock();
                    state.pending = state.pending.saturating_sub(1);
                }
                inner.events.send_modify(|n| *n += 1);
            }
        });
    }
}

#[async_trait]
impl PacketHandler for DeviceInner {
    async fn handle_packet(&self, packet: Packet) {
        let Some(followup) = self.process(packet) else {
            return;
        };
        self.events.send_modify(|n| *n += 1);

        if let Some((frame, delay)) = followup.resend {
            self.spawn_resend(frame, delay);
        }
        if let Some(command) = followup.dispatch {
            if let Err(e) = self
                .send_now(command.code, command.data, command.pause_after, false, 0)
                .await
            {
                tracing::error!(device = %self.id, error = %e, "Failed to dispatch queued command");
            }
        }
    }

    fn link_closed(&self) {
        self.state.lock().closed = true;
        self.events.send_modify(|n| *n += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ERROR_REPLY;
    use crate::testing::TestTransport;

    fn echo_device(run_mode: RunMode, reply_after: Duration) -> (ZaberDevice, Arc<TestTransport>) {
        let transport = TestTransport::echo(reply_after);
        let options = DeviceOptions {
            run_mode,
            ..DeviceOptions::default()
        };
        let device = ZaberDevice::new("x", 1, transport.clone(), options);
        (device, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_enqueue_dispatches_immediately() {
        let (device, transport) = echo_device(RunMode::Continuous, Duration::from_millis(100));

        device.enqueue(CommandKind::Base(BaseCommand::Home), 0).await.unwrap();
        assert!(device.in_action());
        assert_eq!(transport.sent().len(), 1);

        device.wait_for_action_to_complete(1).await.unwrap();
        assert!(!device.in_action());
        assert_eq!(device.pending_responses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_queue_drains_in_order() {
        let (device, transport) = echo_device(RunMode::Continuous, Duration::from_millis(100));

        for target in [100, 200, 300] {
            device
                .enqueue(CommandKind::Move(MoveCommand::Absolute), target)
                .await
                .unwrap();
        }
        assert_eq!(device.queue_len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let data: Vec<i32> = transport.sent().iter().map(|p| p.data).collect();
        assert_eq!(data, vec![100, 200, 300]);
        assert!(!device.in_action());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stepped_mode_waits_for_step() {
        let (device, transport) = echo_device(RunMode::Stepped, Duration::from_millis(100));

        for target in [1, 2, 3] {
            device
                .enqueue(CommandKind::Move(MoveCommand::Absolute), target)
                .await
                .unwrap();
        }
        assert!(transport.sent().is_empty());

        device.step().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(device.queue_len(), 2);

        device.step().await.unwrap();
        device.step().await.unwrap();
        // Second step arrives while acting and is deferred to completion
        assert!(device.awaiting_step());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let data: Vec<i32> = transport.sent().iter().map(|p| p.data).collect();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_on_empty_queue_is_noop() {
        let (device, transport) = echo_device(RunMode::Stepped, Duration::from_millis(10));
        device.step().await.unwrap();
        assert!(transport.sent().is_empty());
        assert!(!device.awaiting_step());
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_preempts_without_extra_pending() {
        let (device, _transport) = echo_device(RunMode::Continuous, Duration::from_millis(500));

        device.send_now(20, 1000, true, false, 0).await.unwrap();
        device.send_now(20, 2000, true, false, 0).await.unwrap();
        assert_eq!(device.pending_responses(), 1);

        // Both frames are echoed by this transport; the count never goes negative
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(device.pending_responses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_get_returns_setting() {
        let transport = TestTransport::new(|packet| {
            if packet.command == BaseCommand::ReturnSetting.code() {
                vec![(Duration::from_millis(20), Packet::new(packet.address, packet.data as u8, 64))]
            } else {
                vec![]
            }
        });
        let device = ZaberDevice::new("x", 1, transport, DeviceOptions::default());

        let value = device.get(Setting::MicrostepResolution).await.unwrap();
        assert_eq!(value, 64);
        assert_eq!(device.setting(Setting::MicrostepResolution), Some(64));
        assert!(!device.is_initialised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialise_reads_every_setting() {
        let transport = TestTransport::new(|packet| {
            if packet.command == BaseCommand::ReturnSetting.code() {
                let value = if packet.data == 37 { 64 } else { 1 };
                vec![(Duration::from_millis(5), Packet::new(packet.address, packet.data as u8, value))]
            } else {
                vec![]
            }
        });
        let options = DeviceOptions {
            scale: UnitScale::new(
                scancam_core::StageUnits::Linear { mm_per_step: 0.01 },
                scancam_core::ControllerSeries::TSeries,
            ),
            ..DeviceOptions::default()
        };
        let device = ZaberDevice::attach("z", 3, transport.clone(), options).await.unwrap();

        assert!(device.is_initialised());
        assert_eq!(transport.sent().len(), Setting::count());
        assert!((device.microsteps_per_unit() - 6400.0).abs() < 1e-9);
        assert_eq!(device.move_data(MoveCommand::Absolute, 1.5), 9600);
        assert_eq!(device.move_data(MoveCommand::StoredPosition, 3.0), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let transport = TestTransport::new(|_| vec![]);
        let device = ZaberDevice::new("dead", 4, transport, DeviceOptions::default());

        let err = device
            .send_now(53, 37, true, true, 37)
            .await
            .unwrap_err();
        assert_eq!(err, ScanCamError::DeviceTimeout("dead".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialise_fails_after_retries() {
        let transport = TestTransport::new(|packet| {
            // Reject every settings query as invalid
            vec![(Duration::from_millis(5), Packet::new(packet.address, ERROR_REPLY, 53))]
        });
        let device = ZaberDevice::new("x", 1, transport.clone(), DeviceOptions::default());

        let err = device.initialise().await.unwrap_err();
        assert!(matches!(err, ScanCamError::Initialization { .. }));
        assert_eq!(transport.sent().len(), 3);
        assert_eq!(device.pending_responses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_with_device_id() {
        let (device, _transport) = echo_device(RunMode::Continuous, Duration::from_secs(5));
        device.home().await.unwrap();
        let err = device.wait_for_action_to_complete(2).await.unwrap_err();
        assert_eq!(err, ScanCamError::DeviceTimeout("x".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_reply_is_ignored() {
        let (device, _transport) = echo_device(RunMode::Continuous, Duration::from_millis(10));
        device.handle_incoming(Packet::new(1, 99, 5)).await;
        assert_eq!(device.pending_responses(), 0);
        assert!(device.faults().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setting_reply_releases_queued_move() {
        let (device, transport) = echo_device(RunMode::Continuous, Duration::from_millis(100));

        device.set(Setting::TargetSpeed, 5).await.unwrap();
        device
            .enqueue(CommandKind::Move(MoveCommand::Absolute), 100)
            .await
            .unwrap();
        assert_eq!(device.queue_len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            transport.sent(),
            vec![Packet::new(1, 42, 5), Packet::new(1, 20, 100)]
        );
        assert_eq!(device.queue_len(), 0);
        assert!(!device.in_action());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_armed_behind_setting_is_kept() {
        let (device, transport) = echo_device(RunMode::Stepped, Duration::from_millis(100));

        device
            .enqueue(CommandKind::Move(MoveCommand::Absolute), 7)
            .await
            .unwrap();
        device.set(Setting::Acceleration, 3).await.unwrap();
        device.step().await.unwrap();
        assert!(device.awaiting_step());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            transport.sent(),
            vec![Packet::new(1, 43, 3), Packet::new(1, 20, 7)]
        );
        assert!(!device.awaiting_step());
        assert!(!device.in_action());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_queued_move_does_not_fail_get() {
        let transport = TestTransport::new(|packet| {
            if packet.command == BaseCommand::ReturnSetting.code() {
                vec![(Duration::from_millis(200), Packet::new(packet.address, packet.data as u8, 2922))]
            } else if packet.command == MoveCommand::Absolute.code() {
                vec![(Duration::from_millis(50), Packet::new(packet.address, ERROR_REPLY, 20))]
            } else {
                vec![]
            }
        });
        let device = ZaberDevice::new("x", 1, transport, DeviceOptions::default());

        device
            .enqueue(CommandKind::Move(MoveCommand::Absolute), -5)
            .await
            .unwrap();
        assert_eq!(device.get(Setting::TargetSpeed).await.unwrap(), 2922);

        let faults = device.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].command, MoveCommand::Absolute.code());
        assert_eq!(device.pending_responses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_history_is_bounded() {
        let (device, _transport) = echo_device(RunMode::Continuous, Duration::from_millis(10));
        for _ in 0..100 {
            device.handle_incoming(Packet::new(1, ERROR_REPLY, 20)).await;
        }

        let faults = device.faults();
        assert_eq!(faults.len(), FAULT_HISTORY);
        assert_eq!(faults.first().map(|f| f.seq), Some(100 - FAULT_HISTORY as u64 + 1));
        assert_eq!(faults.last().map(|f| f.seq), Some(100));
        assert_eq!(device.pending_responses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_is_not_counted() {
        let transport = TestTransport::new(|_| vec![]);
        let device = ZaberDevice::new("x", 1, transport.clone(), DeviceOptions::default());

        device.enqueue(CommandKind::Base(BaseCommand::Reset), 0).await.unwrap();
        assert_eq!(transport.sent(), vec![Packet::new(1, 0, 0)]);
        assert!(!device.in_action());
        device.wait_for_action_to_complete(1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_now_clears_queue() {
        let (device, transport) = echo_device(RunMode::Stepped, Duration::from_millis(100));
        device.enqueue(CommandKind::Move(MoveCommand::Absolute), 5).await.unwrap();
        device.enqueue(CommandKind::Move(MoveCommand::Absolute), 6).await.unwrap();

        device.stop_now().await.unwrap();
        assert_eq!(device.queue_len(), 0);
        assert_eq!(transport.sent(), vec![Packet::new(1, 23, 0)]);
    }
}
