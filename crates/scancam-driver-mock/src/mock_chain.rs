//! Emulated controller chain.
//!
//! [`MockChain`] sits on the far end of an in-memory duplex stream and
//! answers frames the way a chain of binary-protocol stepper controllers
//! does: settings are echoed, moves reply when they finish, a new move
//! replaces the one in progress and only the new move replies, and `stop`
//! replies at once with the position reached.

use parking_lot::Mutex;
use scancam_driver_zaber::packet::{Packet, BROADCAST_ADDRESS, FRAME_LEN};
use scancam_driver_zaber::protocol::{BaseCommand, MoveCommand, Setting, ERROR_REPLY};
use scancam_driver_zaber::SerialTransport;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::common::{ErrorConfig, Injected, MockMode};

/// Buffer size of the in-memory link.
const LINK_BUFFER: usize = 4096;

/// Error sub-code for a command number the controller does not know.
const INVALID_COMMAND: i32 = 64;

/// Stored position slots per controller.
const STORED_SLOTS: usize = 16;

// =============================================================================
// Configuration
// =============================================================================

/// One emulated controller.
#[derive(Debug, Clone, PartialEq)]
pub struct MockAxisConfig {
    /// Address on the chain
    pub address: u8,
    /// Reported microstep resolution
    pub microstep_resolution: i32,
    /// Starting position in microsteps
    pub initial_position: i32,
    /// Reported target speed (T-series data units)
    pub target_speed: i32,
    /// Fixed duration for every move on this axis, overriding the mode
    pub move_duration: Option<Duration>,
}

impl MockAxisConfig {
    /// Controller at `address` with typical defaults.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            microstep_resolution: 64,
            initial_position: 0,
            target_speed: 2922,
            move_duration: None,
        }
    }
}

/// Builder for [`MockChain`].
#[derive(Debug, Clone, Default)]
pub struct MockChainBuilder {
    axes: Vec<MockAxisConfig>,
    mode: MockMode,
    move_duration: Option<Duration>,
    errors: ErrorConfig,
}

impl MockChainBuilder {
    /// Add a controller with default settings.
    pub fn axis(self, address: u8) -> Self {
        self.axis_config(MockAxisConfig::new(address))
    }

    /// Add a controller.
    pub fn axis_config(mut self, config: MockAxisConfig) -> Self {
        self.axes.push(config);
        self
    }

    /// Timing mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Every move takes exactly `duration`, unless the axis overrides it.
    pub fn move_duration(mut self, duration: Duration) -> Self {
        self.move_duration = Some(duration);
        self
    }

    /// Error injection.
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Start the chain and return it with the host end of the link.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> (MockChain, DuplexStream) {
        let (host, device) = tokio::io::duplex(LINK_BUFFER);
        let axes = self
            .axes
            .iter()
            .map(|c| (c.address, AxisState::new(c)))
            .collect();
        let shared = Arc::new(ChainShared {
            axes: Mutex::new(axes),
            received: Mutex::new(Vec::new()),
            mode: self.mode,
            move_duration: self.move_duration,
            errors: self.errors,
        });

        let (read_half, mut write_half) = tokio::io::split(device);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Packet>();

        let writer = tokio::spawn(async move {
            while let Some(reply) = reply_rx.recv().await {
                if write_half.write_all(&reply.encode()).await.is_err() {
                    break;
                }
            }
        });
        let reader = tokio::spawn(serve(read_half, shared.clone(), reply_tx));

        let chain = MockChain {
            shared,
            tasks: vec![reader, writer],
        };
        (chain, host)
    }

    /// Start the chain and wrap the host end in a [`SerialTransport`].
    pub fn connect(self) -> (MockChain, Arc<SerialTransport>) {
        let (chain, host) = self.spawn();
        (chain, SerialTransport::new(host))
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct MoveInProgress {
    from: i32,
    to: i32,
    started: Instant,
    duration: Duration,
}

impl MoveInProgress {
    fn position_now(&self) -> i32 {
        if self.duration.is_zero() {
            return self.to;
        }
        let fraction = (self.started.elapsed().as_secs_f64() / self.duration.as_secs_f64()).min(1.0);
        self.from + ((f64::from(self.to) - f64::from(self.from)) * fraction) as i32
    }
}

#[derive(Debug)]
struct AxisState {
    position: i32,
    defaults: HashMap<u8, i32>,
    settings: HashMap<u8, i32>,
    stored: [i32; STORED_SLOTS],
    moving: Option<MoveInProgress>,
    generation: u64,
    move_duration: Option<Duration>,
}

impl AxisState {
    fn new(config: &MockAxisConfig) -> Self {
        let mut defaults = HashMap::new();
        for setting in Setting::all() {
            defaults.insert(setting.code(), 0);
        }
        defaults.insert(Setting::MicrostepResolution.code(), config.microstep_resolution);
        defaults.insert(Setting::RunningCurrent.code(), 10);
        defaults.insert(Setting::HoldCurrent.code(), 20);
        defaults.insert(Setting::TargetSpeed.code(), config.target_speed);
        defaults.insert(Setting::Acceleration.code(), 11);
        defaults.insert(Setting::MaximumRange.code(), 1_000_000);
        defaults.insert(Setting::AliasNumber.code(), 0);

        Self {
            position: config.initial_position,
            settings: defaults.clone(),
            defaults,
            stored: [0; STORED_SLOTS],
            moving: None,
            generation: 0,
            move_duration: config.move_duration,
        }
    }

    fn current_position(&self) -> i32 {
        self.moving
            .as_ref()
            .map_or(self.position, MoveInProgress::position_now)
    }
}

#[derive(Debug)]
struct ChainShared {
    axes: Mutex<BTreeMap<u8, AxisState>>,
    received: Mutex<Vec<Packet>>,
    mode: MockMode,
    move_duration: Option<Duration>,
    errors: ErrorConfig,
}

/// A reply to send now, or a move that replies when it completes.
enum Action {
    Reply(Packet),
    Move {
        address: u8,
        command: u8,
        target: i32,
        duration: Duration,
        generation: u64,
    },
    Nothing,
}

// =============================================================================
// MockChain
// =============================================================================

/// Handle to a running emulated chain.
pub struct MockChain {
    shared: Arc<ChainShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockChain {
    /// Start building a chain.
    pub fn builder() -> MockChainBuilder {
        MockChainBuilder::default()
    }

    /// Every frame received, in arrival order.
    pub fn received(&self) -> Vec<Packet> {
        self.shared.received.lock().clone()
    }

    /// Frames received for one address (broadcasts excluded).
    pub fn received_by(&self, address: u8) -> Vec<Packet> {
        self.shared
            .received
            .lock()
            .iter()
            .filter(|p| p.address == address)
            .copied()
            .collect()
    }

    /// Current position of an axis in microsteps, interpolated during moves.
    pub fn position(&self, address: u8) -> Option<i32> {
        self.shared
            .axes
            .lock()
            .get(&address)
            .map(AxisState::current_position)
    }

    /// Whether an axis is moving.
    pub fn is_moving(&self, address: u8) -> bool {
        self.shared
            .axes
            .lock()
            .get(&address)
            .is_some_and(|a| a.moving.is_some())
    }

    /// Current value of a setting.
    pub fn setting(&self, address: u8, setting: Setting) -> Option<i32> {
        self.shared
            .axes
            .lock()
            .get(&address)
            .and_then(|a| a.settings.get(&setting.code()).copied())
    }

    /// Stop serving; the host side sees the link close.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for MockChain {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    mut reader: tokio::io::ReadHalf<DuplexStream>,
    shared: Arc<ChainShared>,
    replies: mpsc::UnboundedSender<Packet>,
) {
    let mut frame = [0u8; FRAME_LEN];
    while reader.read_exact(&mut frame).await.is_ok() {
        let packet = Packet::decode(&frame);
        shared.received.lock().push(packet);
        tracing::trace!(%packet, "mock chain received");

        let addresses: Vec<u8> = if packet.address == BROADCAST_ADDRESS {
            shared.axes.lock().keys().copied().collect()
        } else {
            vec![packet.address]
        };

        for address in addresses {
            let action = match shared.errors.check(address, packet.command) {
                Injected::Pass => respond(&shared, address, packet.command, packet.data),
                Injected::Busy => Action::Reply(Packet::new(address, ERROR_REPLY, 255)),
                Injected::Reject(subcode) => Action::Reply(Packet::new(address, ERROR_REPLY, subcode)),
                Injected::Drop => Action::Nothing,
            };
            dispatch(&shared, &replies, action);
        }
    }
}

fn dispatch(shared: &Arc<ChainShared>, replies: &mpsc::UnboundedSender<Packet>, action: Action) {
    match action {
        Action::Reply(packet) => {
            let _ = replies.send(packet);
        }
        Action::Move {
            address,
            command,
            target,
            duration,
            generation,
        } => {
            let shared = shared.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                sleep(duration).await;
                {
                    let mut axes = shared.axes.lock();
                    let Some(axis) = axes.get_mut(&address) else {
                        return;
                    };
                    if axis.generation != generation {
                        return;
                    }
                    axis.position = target;
                    axis.moving = None;
                }
                let _ = replies.send(Packet::new(address, command, target));
            });
        }
        Action::Nothing => {}
    }
}

/// Apply one command to an axis.
fn respond(shared: &ChainShared, address: u8, command: u8, data: i32) -> Action {
    let mut axes = shared.axes.lock();
    let Some(axis) = axes.get_mut(&address) else {
        return Action::Nothing;
    };
    let reply = |value: i32| Action::Reply(Packet::new(address, command, value));

    if let Some(base) = BaseCommand::from_code(command) {
        return match base {
            BaseCommand::Reset => {
                axis.generation += 1;
                axis.moving = None;
                axis.position = 0;
                axis.settings = axis.defaults.clone();
                // Controllers restart without replying
                Action::Nothing
            }
            BaseCommand::Home => start_move(shared, axis, address, command, 0),
            BaseCommand::Renumber => reply(i32::from(address)),
            BaseCommand::StoreCurrentPosition => match slot(data) {
                Some(i) => {
                    axis.stored[i] = axis.current_position();
                    reply(data)
                }
                None => Action::Reply(Packet::new(address, ERROR_REPLY, 1600)),
            },
            BaseCommand::ReturnStoredPosition => match slot(data) {
                Some(i) => reply(axis.stored[i]),
                None => Action::Reply(Packet::new(address, ERROR_REPLY, 1700)),
            },
            BaseCommand::ReadOrWriteMemory => reply(0),
            BaseCommand::RestoreSettings => {
                axis.settings = axis.defaults.clone();
                reply(0)
            }
            BaseCommand::ReturnSetting => {
                let code = u8::try_from(data).ok();
                match code {
                    Some(c) if c == Setting::CurrentPosition.code() => {
                        Action::Reply(Packet::new(address, c, axis.current_position()))
                    }
                    Some(c) => match axis.settings.get(&c) {
                        Some(value) => Action::Reply(Packet::new(address, c, *value)),
                        None => Action::Reply(Packet::new(address, ERROR_REPLY, i32::from(command))),
                    },
                    None => Action::Reply(Packet::new(address, ERROR_REPLY, i32::from(command))),
                }
            }
            BaseCommand::EchoData => reply(data),
            BaseCommand::ReturnCurrentPosition => reply(axis.current_position()),
        };
    }

    if let Some(kind) = MoveCommand::from_code(command) {
        return match kind {
            MoveCommand::StoredPosition => match slot(data) {
                Some(i) => {
                    let target = axis.stored[i];
                    start_move(shared, axis, address, command, target)
                }
                None => Action::Reply(Packet::new(address, ERROR_REPLY, 1800)),
            },
            MoveCommand::Absolute => start_move(shared, axis, address, command, data),
            MoveCommand::Relative => {
                let target = axis.current_position().saturating_add(data);
                start_move(shared, axis, address, command, target)
            }
            MoveCommand::ConstantSpeed => reply(data),
            MoveCommand::Stop => {
                axis.position = axis.current_position();
                axis.moving = None;
                axis.generation += 1;
                reply(axis.position)
            }
        };
    }

    if let Some(setting) = Setting::from_code(command) {
        if setting == Setting::CurrentPosition {
            axis.position = data;
        }
        axis.settings.insert(command, data);
        return reply(data);
    }

    Action::Reply(Packet::new(address, ERROR_REPLY, INVALID_COMMAND))
}

fn start_move(shared: &ChainShared, axis: &mut AxisState, address: u8, command: u8, target: i32) -> Action {
    let from = axis.current_position();
    let duration = axis
        .move_duration
        .or(shared.move_duration)
        .unwrap_or_else(|| match shared.mode {
            MockMode::Instant => Duration::ZERO,
            MockMode::Realistic => travel_time(from, target, axis.settings.get(&Setting::TargetSpeed.code()).copied()),
        });
    axis.generation += 1;
    axis.moving = Some(MoveInProgress {
        from,
        to: target,
        started: Instant::now(),
        duration,
    });
    Action::Move {
        address,
        command,
        target,
        duration,
        generation: axis.generation,
    }
}

/// Travel time at a T-series target speed (microsteps/s = data × 9.375).
fn travel_time(from: i32, to: i32, speed_data: Option<i32>) -> Duration {
    let microsteps_per_sec = f64::from(speed_data.unwrap_or(1).max(1)) * 9.375;
    let distance = (f64::from(to) - f64::from(from)).abs();
    Duration::from_secs_f64(distance / microsteps_per_sec)
}

fn slot(data: i32) -> Option<usize> {
    usize::try_from(data).ok().filter(|i| *i < STORED_SLOTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(host: &mut DuplexStream, packet: Packet) -> Packet {
        host.write_all(&packet.encode()).await.unwrap();
        let mut frame = [0u8; FRAME_LEN];
        host.read_exact(&mut frame).await.unwrap();
        Packet::decode(&frame)
    }

    #[tokio::test]
    async fn test_return_setting_replies_with_setting_code() {
        let (_chain, mut host) = MockChain::builder().axis(1).spawn();
        let reply = exchange(&mut host, Packet::new(1, 53, 37)).await;
        assert_eq!(reply, Packet::new(1, 37, 64));
    }

    #[tokio::test]
    async fn test_absolute_move_updates_position() {
        let (chain, mut host) = MockChain::builder().axis(2).spawn();
        let reply = exchange(&mut host, Packet::new(2, 20, 5000)).await;
        assert_eq!(reply, Packet::new(2, 20, 5000));
        assert_eq!(chain.position(2), Some(5000));

        let reply = exchange(&mut host, Packet::new(2, 21, -1000)).await;
        assert_eq!(reply, Packet::new(2, 21, 4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_move_preempts_and_only_new_move_replies() {
        let (chain, mut host) = MockChain::builder()
            .axis(1)
            .move_duration(Duration::from_secs(1))
            .spawn();

        host.write_all(&Packet::new(1, 20, 1000).encode()).await.unwrap();
        sleep(Duration::from_millis(500)).await;
        host.write_all(&Packet::new(1, 20, 3000).encode()).await.unwrap();

        let mut frame = [0u8; FRAME_LEN];
        host.read_exact(&mut frame).await.unwrap();
        assert_eq!(Packet::decode(&frame), Packet::new(1, 20, 3000));
        assert_eq!(chain.received_by(1).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_replies_at_once() {
        let (chain, mut host) = MockChain::builder()
            .axis(1)
            .move_duration(Duration::from_secs(10))
            .spawn();

        host.write_all(&Packet::new(1, 20, 1000).encode()).await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert!(chain.is_moving(1));

        let reply = exchange(&mut host, Packet::new(1, 23, 0)).await;
        assert_eq!(reply.command, 23);
        assert!((400..=600).contains(&reply.data));
        assert!(!chain.is_moving(1));
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let (_chain, mut host) = MockChain::builder().axis(1).spawn();
        let reply = exchange(&mut host, Packet::new(1, 99, 0)).await;
        assert_eq!(reply, Packet::new(1, 255, INVALID_COMMAND));
    }

    #[test]
    fn test_travel_time() {
        // 9375 microsteps at 1000 × 9.375 microsteps/s
        assert_eq!(travel_time(0, 9375, Some(1000)), Duration::from_secs(1));
    }
}
