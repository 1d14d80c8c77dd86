//! Recorded trajectories and their on-disk format
//!
//! A trajectory file is plain G-code, one command per line. Lines starting
//! with `;` are comments. Saving wraps the recorded steps in a fixed frame
//! (absolute mode and homing before, effector off and homing after); loading
//! recognizes that frame again so a save/load cycle returns the same steps.

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use serde::Serialize;
use crate::gcode::{Command, CommandKind, CoordinateMode, GCodeParser, Position};
use crate::workspace::WorkspaceLimits;
use crate::{ArmError, Result};

pub const FILE_EXTENSION: &str = "gcode";

/// Named, ordered sequence of commands
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub name: String,
    pub steps: Vec<Command>,
    /// Whether playback wraps the steps in the homing frame
    pub framed: bool,
}

fn frame_header() -> [Command; 2] {
    [
        Command::directive("G90", CommandKind::SetAbsolute),
        Command::directive("G28", CommandKind::Home),
    ]
}

fn frame_footer() -> [Command; 2] {
    [
        Command::directive("M5", CommandKind::DeactivateEffector),
        Command::directive("G28", CommandKind::Home),
    ]
}

fn is_bare(cmd: &Command, kind: CommandKind) -> bool {
    cmd.valid && cmd.kind == kind && cmd.axes.is_empty() && cmd.feed_rate.is_none()
}

impl Trajectory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
            framed: true,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn push(&mut self, command: Command) {
        self.steps.push(command);
    }

    /// Commands in playback order, frame included
    pub fn program(&self) -> Vec<Command> {
        if !self.framed {
            return self.steps.clone();
        }
        let mut program = Vec::with_capacity(self.steps.len() + 4);
        program.extend(frame_header());
        program.extend(self.steps.iter().cloned());
        program.extend(frame_footer());
        program
    }

    /// File contents for this trajectory
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("; Trajectory recorded by armctl\n");
        out.push_str(&format!("; Name: {}\n", self.name));
        out.push_str(&format!("; Saved: {}\n", Local::now().format("%Y-%m-%d %H:%M:%S")));
        for cmd in self.program() {
            out.push_str(&format!("{} ; {}\n", cmd.code, cmd.description));
        }
        out
    }

    /// Read a program back. Comment and blank lines are skipped; lines that
    /// do not parse are skipped with a warning.
    pub fn parse(name: &str, text: &str, parser: &GCodeParser) -> Self {
        let mut steps = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') {
                continue;
            }
            let cmd = parser.parse(trimmed);
            if !cmd.valid {
                warn!("{}:{}: skipping invalid line '{}'", name, line_no + 1, trimmed);
                continue;
            }
            steps.push(parser.parse(&cmd.code));
        }

        let framed = steps.len() >= 4
            && is_bare(&steps[0], CommandKind::SetAbsolute)
            && is_bare(&steps[1], CommandKind::Home)
            && is_bare(&steps[steps.len() - 2], CommandKind::DeactivateEffector)
            && is_bare(&steps[steps.len() - 1], CommandKind::Home);
        if framed {
            steps.truncate(steps.len() - 2);
            steps.drain(..2);
        }

        Self {
            name: name.to_string(),
            steps,
            framed,
        }
    }
}

/// Check that `name` can be stored as a file name; returns it without the
/// `.gcode` suffix
pub(crate) fn validate_name(name: &str) -> Result<&str> {
    let name = name.strip_suffix(".gcode").unwrap_or(name);
    let acceptable = !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !acceptable {
        return Err(ArmError::Trajectory(format!("invalid trajectory name '{}'", name)));
    }
    Ok(name)
}

/// Directory of `<name>.gcode` files
#[derive(Debug, Clone)]
pub struct TrajectoryStore {
    dir: PathBuf,
}

impl TrajectoryStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let name = validate_name(name)?;
        Ok(self.dir.join(format!("{}.{}", name, FILE_EXTENSION)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn save(&self, trajectory: &Trajectory) -> Result<PathBuf> {
        let path = self.path_for(&trajectory.name)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, trajectory.render())?;
        info!("Saved trajectory '{}' ({} steps) to {}", trajectory.name, trajectory.len(), path.display());
        Ok(path)
    }

    pub fn load(&self, name: &str, parser: &GCodeParser) -> Result<Trajectory> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(ArmError::Trajectory(format!("trajectory '{}' not found", name)));
        }
        let text = fs::read_to_string(&path)?;
        let trajectory = Trajectory::parse(name.strip_suffix(".gcode").unwrap_or(name), &text, parser);
        info!("Loaded trajectory '{}' ({} steps)", trajectory.name, trajectory.len());
        Ok(trajectory)
    }

    /// Stored trajectory names, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(ArmError::Trajectory(format!("trajectory '{}' not found", name)));
        }
        fs::remove_file(&path)?;
        info!("Deleted trajectory '{}'", name);
        Ok(())
    }

    /// Copy an external G-code file into the store. Every non-comment line
    /// must parse, otherwise nothing is written.
    pub fn import(&self, source: &Path, name: &str, parser: &GCodeParser) -> Result<Trajectory> {
        let text = fs::read_to_string(source)?;
        for (line_no, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') {
                continue;
            }
            if !parser.validate(trimmed) {
                return Err(ArmError::InvalidCommand(format!(
                    "{}:{}: '{}'", source.display(), line_no + 1, trimmed
                )));
            }
        }

        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, &text)?;
        info!("Imported {} as trajectory '{}'", source.display(), name);
        Ok(Trajectory::parse(name, &text, parser))
    }
}

/// One problem found by [`check_program`]
#[derive(Debug, Clone, Serialize)]
pub struct LineIssue {
    pub line: usize,
    pub text: String,
    pub reason: String,
}

/// Offline validation result for a G-code program
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgramReport {
    pub commands: usize,
    pub moves: usize,
    pub issues: Vec<LineIssue>,
    pub final_position: Position,
}

impl ProgramReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validate every line of a program and dry-run its moves from the home
/// position, tracking `G90`/`G91` and `G28`, against `limits`
pub fn check_program(text: &str, parser: &GCodeParser, limits: &WorkspaceLimits) -> ProgramReport {
    let mut report = ProgramReport::default();
    let mut position = Position::origin();
    let mut mode = CoordinateMode::Absolute;

    for (line_no, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        let cmd = parser.parse(trimmed);
        if !cmd.valid {
            report.issues.push(LineIssue {
                line: line_no + 1,
                text: trimmed.to_string(),
                reason: "not a supported G-code command".to_string(),
            });
            continue;
        }
        report.commands += 1;

        match cmd.kind {
            CommandKind::LinearMove => {
                report.moves += 1;
                let target = cmd.resolve_target(position, mode);
                match limits.check(&target) {
                    Ok(()) => position = target,
                    Err(e) => report.issues.push(LineIssue {
                        line: line_no + 1,
                        text: trimmed.to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
            CommandKind::Home => position = Position::origin(),
            CommandKind::SetAbsolute => mode = CoordinateMode::Absolute,
            CommandKind::SetRelative => mode = CoordinateMode::Relative,
            _ => {}
        }
    }

    report.final_position = position;
    report
}
