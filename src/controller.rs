//! Motion controller for the G-code arm
//!
//! Owns the serial link and the modelled arm state (position, feed, effector,
//! modes, recording buffer). Every public operation is synchronous and runs
//! at most one request/response exchange at a time; callers sharing a
//! controller must serialize access (see [`crate::service::ArmService`]).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use crate::{
    config::ArmConfig,
    gcode::{Command, CommandKind, CoordinateMode, GCodeParser, Position},
    trajectory::{validate_name, Trajectory, TrajectoryStore},
    transport::{never_complete, ack_received, Connector, Reply, SerialConnector, SerialTransport, TelemetryFormat},
    workspace::WorkspaceLimits,
    ArmError, Result,
};

/// Which family of operations is currently legal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    /// Jogging, direct G-code and trajectory recording
    Manual,
    /// Trajectory playback
    Automatic,
}

impl WorkMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "manual" => Some(WorkMode::Manual),
            "automatic" | "auto" => Some(WorkMode::Automatic),
            _ => None,
        }
    }
}

/// How silence (no `ok`/`error` before the timeout) is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckPolicy {
    /// Silence fails the operation
    Strict,
    /// Silence is logged and the command assumed accepted
    Lenient,
}

/// Connection and modelled arm state
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub motors_enabled: bool,
    pub effector_active: bool,
    pub current_position: Position,
    pub current_velocity: f64,
}

/// Snapshot returned by [`MotionController::status`]
#[derive(Debug, Clone, Serialize)]
pub struct ArmStatus {
    #[serde(flatten)]
    pub state: ConnectionState,
    pub device: Option<String>,
    pub work_mode: WorkMode,
    pub coordinate_mode: CoordinateMode,
    pub recording: Option<String>,
    pub recorded_steps: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    pub low_link_length: f64,
    pub high_link_length: f64,
    #[serde(flatten)]
    pub limits: WorkspaceLimits,
}

fn not_recording() -> ArmError {
    ArmError::IllegalState("no trajectory recording in progress".to_string())
}

/// Outcome of a completed playback
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub executed: usize,
    pub skipped: usize,
    pub final_position: Position,
}

pub struct MotionController {
    config: ArmConfig,
    limits: WorkspaceLimits,
    parser: GCodeParser,
    store: TrajectoryStore,
    connector: Box<dyn Connector>,
    transport: Option<SerialTransport>,
    state: ConnectionState,
    work_mode: WorkMode,
    coordinate_mode: CoordinateMode,
    recording: Option<Trajectory>,
}

impl MotionController {
    /// Controller talking to the serial devices named in the configuration
    pub fn new(config: ArmConfig) -> Result<Self> {
        let connector = SerialConnector::from_config(&config.serial);
        Self::with_connector(config, Box::new(connector))
    }

    pub fn with_connector(config: ArmConfig, connector: Box<dyn Connector>) -> Result<Self> {
        let limits = WorkspaceLimits::from_geometry(&config.workspace);
        let store = TrajectoryStore::new(&config.storage.trajectory_dir);
        let default_feed = config.motion.default_feed_rate;
        info!(
            "Workspace: r in [{:.2}, {:.2}] mm, z in [{:.2}, {:.2}] mm",
            limits.r_min, limits.r_max, limits.z_min, limits.z_max
        );

        Ok(Self {
            config,
            limits,
            parser: GCodeParser::new()?,
            store,
            connector,
            transport: None,
            state: ConnectionState {
                connected: false,
                motors_enabled: false,
                effector_active: false,
                current_position: Position::origin(),
                current_velocity: default_feed,
            },
            work_mode: WorkMode::Manual,
            coordinate_mode: CoordinateMode::Absolute,
            recording: None,
        })
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timing.command_timeout_ms)
    }

    fn home_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timing.home_timeout_ms)
    }

    fn timeout_for(&self, kind: CommandKind) -> Duration {
        match kind {
            CommandKind::Home => self.home_timeout(),
            _ => self.command_timeout(),
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.state.connected {
            Ok(())
        } else {
            Err(ArmError::NotConnected)
        }
    }

    fn require_mode(&self, mode: WorkMode, operation: &str) -> Result<()> {
        if self.work_mode == mode {
            Ok(())
        } else {
            Err(ArmError::IllegalState(format!(
                "{} requires {:?} mode (current: {:?})",
                operation, mode, self.work_mode
            )))
        }
    }

    fn require_recording(&mut self) -> Result<&mut Trajectory> {
        self.recording.as_mut().ok_or_else(not_recording)
    }

    /// One send/receive round trip, classified under `policy`
    fn exchange(&mut self, code: &str, timeout: Duration, policy: AckPolicy) -> Result<Reply> {
        let transport = self.transport.as_mut().ok_or(ArmError::NotConnected)?;
        let reply = transport.exchange(code, timeout)?;

        match &reply {
            Reply::Ack(text) => debug!("{} acknowledged: {}", code, text),
            Reply::Rejected(text) => {
                error!("Device rejected {}: {}", code, text);
                return Err(ArmError::DeviceRejected {
                    command: code.to_string(),
                    response: text.clone(),
                });
            }
            Reply::Silent(text) => match policy {
                AckPolicy::Strict => {
                    error!("No acknowledgement for {} within {}ms", code, timeout.as_millis());
                    return Err(ArmError::Timeout {
                        command: code.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                AckPolicy::Lenient => {
                    if text.is_empty() {
                        warn!("No reply to {}, assuming accepted", code);
                    } else {
                        warn!("Unacknowledged reply to {}: {}", code, text);
                    }
                }
            },
        }
        Ok(reply)
    }

    /// Open the link, home the arm and select absolute coordinates
    ///
    /// Homing and the mode switch must both be acknowledged; any failure
    /// closes the link again and leaves the controller disconnected.
    pub fn connect(&mut self) -> Result<()> {
        if self.state.connected {
            info!("Already connected");
            return Ok(());
        }

        info!("Connecting to arm");
        let mut transport = self.connector.connect()?;

        let settle = self.config.timing.settle_delay();
        info!("Waiting {}ms for controller reset", settle.as_millis());
        std::thread::sleep(settle);

        let welcome_timeout = Duration::from_millis(self.config.timing.welcome_timeout_ms);
        let welcome = transport.receive_until(welcome_timeout, never_complete)?;
        if !welcome.is_empty() {
            info!("Controller says: {}", String::from_utf8_lossy(&welcome).trim());
        }
        self.transport = Some(transport);

        if let Err(e) = self.initialize_link() {
            error!("Connection aborted: {}", e);
            self.transport = None;
            return Err(e);
        }

        self.state.connected = true;
        self.state.motors_enabled = true;
        self.state.effector_active = false;
        self.state.current_position = Position::origin();
        self.coordinate_mode = CoordinateMode::Absolute;
        info!("Arm connected and homed");
        Ok(())
    }

    fn initialize_link(&mut self) -> Result<()> {
        info!("Homing (G28)");
        self.exchange("G28", self.home_timeout(), AckPolicy::Strict)?;
        info!("Homing complete");

        self.exchange("G90", self.command_timeout(), AckPolicy::Strict)?;

        match self.raw_query("M114") {
            Ok(position) if !position.is_empty() => info!("Reported position: {}", position),
            Ok(_) => info!("No position report, assuming home"),
            Err(e) => warn!("Position query failed: {}", e),
        }
        Ok(())
    }

    /// Effector off, motors off, close the link. No-op when disconnected.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.state.connected {
            self.transport = None;
            return Ok(());
        }

        info!("Disconnecting arm");
        if let Err(e) = self.exchange("M5", self.command_timeout(), AckPolicy::Lenient) {
            warn!("Failed to deactivate effector: {}", e);
        }
        if let Err(e) = self.exchange("M84", self.command_timeout(), AckPolicy::Lenient) {
            warn!("Failed to disable motors: {}", e);
        }

        self.transport = None;
        self.state.connected = false;
        self.state.motors_enabled = false;
        self.state.effector_active = false;
        info!("Arm disconnected");
        Ok(())
    }

    pub fn set_work_mode(&mut self, mode: WorkMode) -> Result<()> {
        self.work_mode = mode;
        info!("Work mode set to {:?}", mode);
        Ok(())
    }

    /// Switch the device between `G90` and `G91`; the local flag only
    /// changes once the device acknowledged.
    pub fn set_coordinate_mode(&mut self, mode: CoordinateMode) -> Result<()> {
        self.require_connected()?;
        let code = match mode {
            CoordinateMode::Absolute => "G90",
            CoordinateMode::Relative => "G91",
        };
        self.exchange(code, self.command_timeout(), AckPolicy::Strict)?;
        self.coordinate_mode = mode;
        info!("Coordinate mode set to {:?}", mode);
        Ok(())
    }

    /// Jog the end effector. Relative targets are offsets from the modelled
    /// position.
    ///
    /// Moves are always sent as absolute `G1` lines. When the controller is in
    /// relative mode it first switches the device to absolute mode, so the
    /// mode stays absolute after the move.
    pub fn move_to(&mut self, x: f64, y: f64, z: f64, feed_rate: f64) -> Result<Position> {
        self.require_mode(WorkMode::Manual, "move")?;
        self.require_connected()?;

        let target = match self.coordinate_mode {
            CoordinateMode::Relative => self.state.current_position.offset_by(x, y, z),
            CoordinateMode::Absolute => Position::new(x, y, z),
        };
        self.move_absolute(target, feed_rate, true)
    }

    /// [`move_to`](Self::move_to) at the last used feed rate
    pub fn move_to_current_feed(&mut self, x: f64, y: f64, z: f64) -> Result<Position> {
        let feed = self.state.current_velocity;
        self.move_to(x, y, z, feed)
    }

    fn move_absolute(&mut self, target: Position, feed_rate: f64, capture: bool) -> Result<Position> {
        self.limits.check(&target)?;

        if self.coordinate_mode != CoordinateMode::Absolute {
            self.set_coordinate_mode(CoordinateMode::Absolute)?;
            // the recording must switch modes where the device did
            if capture {
                self.capture(Command::directive("G90", CommandKind::SetAbsolute));
            }
        }

        let command = Command::linear_move(target, feed_rate);
        self.exchange(&command.code, self.command_timeout(), AckPolicy::Lenient)?;

        self.state.current_position = target;
        if feed_rate > 0.0 {
            self.state.current_velocity = feed_rate;
        }
        debug!("Position now {}", target);
        if capture {
            self.capture(command);
        }
        Ok(target)
    }

    pub fn go_home(&mut self) -> Result<()> {
        self.require_mode(WorkMode::Manual, "home")?;
        self.require_connected()?;

        info!("Returning to home position");
        let command = Command::directive("G28", CommandKind::Home);
        self.exchange(&command.code, self.home_timeout(), AckPolicy::Lenient)?;
        self.state.current_position = Position::origin();
        self.capture(command);
        Ok(())
    }

    pub fn set_effector(&mut self, active: bool) -> Result<()> {
        self.require_connected()?;

        let command = if active {
            Command::directive("M3", CommandKind::ActivateEffector)
        } else {
            Command::directive("M5", CommandKind::DeactivateEffector)
        };
        self.exchange(&command.code, self.command_timeout(), AckPolicy::Lenient)?;
        self.state.effector_active = active;
        info!("Effector {}", if active { "activated" } else { "deactivated" });
        self.capture(command);
        Ok(())
    }

    pub fn set_motors(&mut self, enabled: bool) -> Result<()> {
        self.require_connected()?;

        let code = if enabled { "M17" } else { "M84" };
        self.exchange(code, self.command_timeout(), AckPolicy::Lenient)?;
        self.state.motors_enabled = enabled;
        info!("Motors {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Execute one G-code line directly
    pub fn execute_gcode(&mut self, line: &str) -> Result<Command> {
        self.require_mode(WorkMode::Manual, "direct G-code")?;
        self.require_connected()?;

        let command = self.parse_valid(line)?;
        self.apply(&command)?;
        self.capture(command.clone());
        Ok(command)
    }

    /// Parse and re-parse from the stripped code so recorded commands carry
    /// no comments
    fn parse_valid(&self, line: &str) -> Result<Command> {
        let parsed = self.parser.parse(line);
        if !parsed.valid {
            return Err(ArmError::InvalidCommand(line.trim().to_string()));
        }
        Ok(self.parser.parse(&parsed.code))
    }

    /// Send a parsed command and fold its effect into the modelled state
    fn apply(&mut self, command: &Command) -> Result<()> {
        match command.kind {
            CommandKind::LinearMove => {
                let target = command.resolve_target(self.state.current_position, self.coordinate_mode);
                self.limits.check(&target)?;
                self.exchange(&command.code, self.command_timeout(), AckPolicy::Lenient)?;
                self.state.current_position = target;
                if let Some(feed) = command.feed_rate.filter(|f| *f > 0.0) {
                    self.state.current_velocity = feed;
                }
            }
            CommandKind::Home => {
                self.exchange(&command.code, self.timeout_for(command.kind), AckPolicy::Lenient)?;
                self.state.current_position = Position::origin();
            }
            CommandKind::SetAbsolute | CommandKind::SetRelative => {
                self.exchange(&command.code, self.command_timeout(), AckPolicy::Lenient)?;
                self.coordinate_mode = if command.kind == CommandKind::SetAbsolute {
                    CoordinateMode::Absolute
                } else {
                    CoordinateMode::Relative
                };
            }
            CommandKind::ActivateEffector | CommandKind::DeactivateEffector => {
                self.exchange(&command.code, self.command_timeout(), AckPolicy::Lenient)?;
                self.state.effector_active = command.kind == CommandKind::ActivateEffector;
            }
            CommandKind::Other => {
                self.exchange(&command.code, self.command_timeout(), AckPolicy::Lenient)?;
                match command.code.split_whitespace().next() {
                    Some("M17") => self.state.motors_enabled = true,
                    Some("M84") | Some("M18") => self.state.motors_enabled = false,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn capture(&mut self, command: Command) {
        if let Some(recording) = self.recording.as_mut() {
            debug!("Recorded step {}: {}", recording.len() + 1, command.code);
            recording.push(command);
        }
    }

    /// Start capturing executed commands under `name`, dropping any
    /// unfinished recording
    pub fn begin_recording(&mut self, name: &str) -> Result<()> {
        self.require_mode(WorkMode::Manual, "recording")?;
        let name = validate_name(name.trim())?;
        if let Some(previous) = self.recording.take() {
            warn!("Discarding unfinished recording '{}' ({} steps)", previous.name, previous.len());
        }
        self.recording = Some(Trajectory::new(name));
        info!("Recording trajectory '{}'", name);
        Ok(())
    }

    /// Append a move to the recording and execute it immediately. The step
    /// is removed again if the device refuses it.
    pub fn record_step(&mut self, x: f64, y: f64, z: f64, feed_rate: f64) -> Result<Position> {
        self.require_recording()?;
        self.require_mode(WorkMode::Manual, "record step")?;
        self.require_connected()?;

        let feed = if feed_rate > 0.0 { feed_rate } else { self.state.current_velocity };
        let target = match self.coordinate_mode {
            CoordinateMode::Relative => self.state.current_position.offset_by(x, y, z),
            CoordinateMode::Absolute => Position::new(x, y, z),
        };
        self.limits.check(&target)?;

        let switches_mode = self.coordinate_mode != CoordinateMode::Absolute;
        let recording = self.require_recording()?;
        if switches_mode {
            recording.push(Command::directive("G90", CommandKind::SetAbsolute));
        }
        recording.push(Command::linear_move(target, feed));
        match self.move_absolute(target, feed, false) {
            Ok(position) => Ok(position),
            Err(e) => {
                self.discard_last_step();
                // keep the G90 step only if the device actually switched
                if switches_mode && self.coordinate_mode != CoordinateMode::Absolute {
                    self.discard_last_step();
                }
                Err(e)
            }
        }
    }

    /// Append a raw G-code line to the recording and execute it immediately
    pub fn record_raw_command(&mut self, line: &str) -> Result<Command> {
        self.require_recording()?;
        self.require_mode(WorkMode::Manual, "record command")?;
        self.require_connected()?;

        let command = self.parse_valid(line)?;
        self.require_recording()?.push(command.clone());
        match self.apply(&command) {
            Ok(()) => Ok(command),
            Err(e) => {
                self.discard_last_step();
                Err(e)
            }
        }
    }

    fn discard_last_step(&mut self) {
        if let Some(recording) = self.recording.as_mut() {
            recording.steps.pop();
        }
    }

    /// Persist the recording and leave recording mode
    pub fn end_recording(&mut self) -> Result<PathBuf> {
        let recording = self.recording.as_ref().ok_or_else(not_recording)?;
        if recording.is_empty() {
            return Err(ArmError::IllegalState(format!(
                "trajectory '{}' has no steps",
                recording.name
            )));
        }

        let path = self.store.save(recording)?;
        if let Some(done) = self.recording.take() {
            info!("Trajectory '{}' saved with {} steps", done.name, done.len());
        }
        Ok(path)
    }

    /// Drop the recorded steps but keep recording under the same name.
    /// Use [`cancel_recording`](Self::cancel_recording) to drop the name too.
    pub fn clear_trajectory(&mut self) -> Result<()> {
        let recording = self.require_recording()?;
        recording.steps.clear();
        info!("Cleared recorded steps of '{}'", recording.name);
        Ok(())
    }

    pub fn cancel_recording(&mut self) -> Result<()> {
        if let Some(recording) = self.recording.take() {
            info!("Recording '{}' cancelled ({} steps discarded)", recording.name, recording.len());
        }
        Ok(())
    }

    /// Replay commands in order
    ///
    /// Playback starts in absolute mode. Invalid commands are skipped. A move
    /// outside the workspace or any communication failure aborts the whole run
    /// with the failing step.
    pub fn run_trajectory(&mut self, steps: &[Command]) -> Result<RunReport> {
        self.require_mode(WorkMode::Automatic, "trajectory playback")?;
        self.require_connected()?;

        // recorded moves carry absolute targets
        if self.coordinate_mode != CoordinateMode::Absolute {
            info!("Selecting absolute mode before playback");
            self.set_coordinate_mode(CoordinateMode::Absolute)?;
        }

        info!("Running trajectory with {} commands", steps.len());
        let mut report = RunReport {
            total: steps.len(),
            ..RunReport::default()
        };
        let pause = self.config.timing.step_pause();

        for (index, command) in steps.iter().enumerate() {
            if !command.valid {
                warn!("Skipping invalid step {}: {}", index, command.raw_text.trim());
                report.skipped += 1;
                continue;
            }

            debug!("Step {}/{}: {}", index + 1, steps.len(), command.code);
            if let Err(e) = self.apply(command) {
                error!("Trajectory aborted at step {}: {}", index, e);
                return Err(ArmError::StepFailed {
                    index,
                    command: command.code.clone(),
                    source: Box::new(e),
                });
            }
            report.executed += 1;

            if index + 1 < steps.len() && !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }

        report.final_position = self.state.current_position;
        info!("Trajectory complete: {} executed, {} skipped", report.executed, report.skipped);
        Ok(report)
    }

    /// Load a stored trajectory and play it back, frame included
    pub fn run_stored(&mut self, name: &str) -> Result<RunReport> {
        self.require_mode(WorkMode::Automatic, "trajectory playback")?;
        let trajectory = self.store.load(name, &self.parser)?;
        self.run_trajectory(&trajectory.program())
    }

    fn raw_query(&mut self, code: &str) -> Result<String> {
        let timeout = self.command_timeout();
        let transport = self.transport.as_mut().ok_or(ArmError::NotConnected)?;
        transport.send(code)?;
        let response = transport.receive_until(timeout, ack_received)?;
        Ok(String::from_utf8_lossy(&response).trim().to_string())
    }

    /// Ask the firmware for its position report (`M114`)
    pub fn query_position(&mut self) -> Result<String> {
        self.require_connected()?;
        self.raw_query("M114")
    }

    /// Ask the firmware for its identification (`M115`)
    pub fn query_firmware(&mut self) -> Result<String> {
        self.require_connected()?;
        self.raw_query("M115")
    }

    /// Request one telemetry record in `format`
    pub fn read_telemetry(&mut self, format: TelemetryFormat) -> Result<String> {
        self.require_connected()?;
        let timeout = Duration::from_millis(self.config.timing.telemetry_timeout_ms);
        let transport = self.transport.as_mut().ok_or(ArmError::NotConnected)?;
        transport.send_raw(&[format.request_byte()])?;
        let raw = transport.receive_until(timeout, |buf| format.is_complete(buf))?;
        Ok(format.finish(&raw))
    }

    pub fn status(&self) -> ArmStatus {
        ArmStatus {
            state: self.state.clone(),
            device: self.transport.as_ref().map(|t| t.device().to_string()),
            work_mode: self.work_mode,
            coordinate_mode: self.coordinate_mode,
            recording: self.recording.as_ref().map(|r| r.name.clone()),
            recorded_steps: self.recording.as_ref().map(|r| r.len()).unwrap_or(0),
        }
    }

    pub fn workspace_info(&self) -> WorkspaceInfo {
        WorkspaceInfo {
            low_link_length: self.config.workspace.low_link_length,
            high_link_length: self.config.workspace.high_link_length,
            limits: self.limits,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    pub fn position(&self) -> Position {
        self.state.current_position
    }

    pub fn work_mode(&self) -> WorkMode {
        self.work_mode
    }

    pub fn coordinate_mode(&self) -> CoordinateMode {
        self.coordinate_mode
    }

    pub fn effector_active(&self) -> bool {
        self.state.effector_active
    }

    pub fn motors_enabled(&self) -> bool {
        self.state.motors_enabled
    }

    pub fn current_trajectory(&self) -> Option<&Trajectory> {
        self.recording.as_ref()
    }

    pub fn limits(&self) -> &WorkspaceLimits {
        &self.limits
    }

    pub fn parser(&self) -> &GCodeParser {
        &self.parser
    }

    pub fn store(&self) -> &TrajectoryStore {
        &self.store
    }

    pub fn config(&self) -> &ArmConfig {
        &self.config
    }
}

impl Drop for MotionController {
    fn drop(&mut self) {
        // Best effort: leave the arm with effector and motors off
        if self.state.connected {
            let _ = self.disconnect();
        }
    }
}
