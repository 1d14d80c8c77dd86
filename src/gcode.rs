//! G-code parsing and validation
//!
//! Only the small dialect the arm firmware understands is accepted: a leading
//! `G`/`M` command token followed by whitespace-separated `X Y Z F E S` words.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::Result;

/// Assumed end-effector location in millimetres
///
/// This is a model of where the arm should be, updated only after the device
/// accepted a command. It is never read back from a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn origin() -> Self {
        Self::default()
    }

    pub fn offset_by(&self, dx: f64, dy: f64, dz: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X{} Y{} Z{}", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateMode {
    Absolute,
    Relative,
}

impl CoordinateMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "absolute" | "abs" | "g90" => Some(CoordinateMode::Absolute),
            "relative" | "rel" | "g91" => Some(CoordinateMode::Relative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Home,
    LinearMove,
    ActivateEffector,
    DeactivateEffector,
    SetAbsolute,
    SetRelative,
    Other,
}

impl CommandKind {
    pub fn description(self) -> &'static str {
        match self {
            CommandKind::Home => "Home",
            CommandKind::LinearMove => "Linear move",
            CommandKind::ActivateEffector => "Activate effector",
            CommandKind::DeactivateEffector => "Deactivate effector",
            CommandKind::SetAbsolute => "Absolute coordinates",
            CommandKind::SetRelative => "Relative coordinates",
            CommandKind::Other => "G-code command",
        }
    }

    /// Classify from the leading command token only (`G1`, `M3`, `G28` ...)
    fn classify(letter: char, number: u32) -> Self {
        match (letter, number) {
            ('G', 28) => CommandKind::Home,
            ('G', 0) | ('G', 1) => CommandKind::LinearMove,
            ('M', 3) => CommandKind::ActivateEffector,
            ('M', 5) => CommandKind::DeactivateEffector,
            ('G', 90) => CommandKind::SetAbsolute,
            ('G', 91) => CommandKind::SetRelative,
            _ => CommandKind::Other,
        }
    }
}

/// Axis words present on a line; absent axes stay `None`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisWords {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl AxisWords {
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none()
    }
}

/// A parsed line. Immutable once produced by [`GCodeParser::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Line exactly as given
    pub raw_text: String,
    /// Line with comments stripped, as sent to the device
    pub code: String,
    pub kind: CommandKind,
    /// Axis words with missing components defaulted to zero
    pub target: Option<Position>,
    pub axes: AxisWords,
    pub feed_rate: Option<f64>,
    pub description: String,
    pub valid: bool,
}

impl Command {
    fn invalid(raw_text: &str) -> Self {
        Self {
            raw_text: raw_text.to_string(),
            code: String::new(),
            kind: CommandKind::Other,
            target: None,
            axes: AxisWords::default(),
            feed_rate: None,
            description: String::new(),
            valid: false,
        }
    }

    /// Build the `G1` line for an absolute target
    pub fn linear_move(target: Position, feed_rate: f64) -> Self {
        let mut code = format!("G1 {}", target);
        let feed_rate = (feed_rate > 0.0).then_some(feed_rate);
        if let Some(feed) = feed_rate {
            code.push_str(&format!(" F{}", feed));
        }
        Self {
            raw_text: code.clone(),
            code,
            kind: CommandKind::LinearMove,
            target: Some(target),
            axes: AxisWords { x: Some(target.x), y: Some(target.y), z: Some(target.z) },
            feed_rate,
            description: CommandKind::LinearMove.description().to_string(),
            valid: true,
        }
    }

    /// Build a bare command such as `M3` or `G28`
    pub fn directive(code: &str, kind: CommandKind) -> Self {
        Self {
            raw_text: code.to_string(),
            code: code.to_string(),
            kind,
            target: None,
            axes: AxisWords::default(),
            feed_rate: None,
            description: kind.description().to_string(),
            valid: true,
        }
    }

    pub fn is_move(&self) -> bool {
        self.valid && self.kind == CommandKind::LinearMove
    }

    /// Combine this move's axis words with the current position
    pub fn resolve_target(&self, current: Position, mode: CoordinateMode) -> Position {
        match mode {
            CoordinateMode::Absolute => Position::new(
                self.axes.x.unwrap_or(current.x),
                self.axes.y.unwrap_or(current.y),
                self.axes.z.unwrap_or(current.z),
            ),
            CoordinateMode::Relative => current.offset_by(
                self.axes.x.unwrap_or(0.0),
                self.axes.y.unwrap_or(0.0),
                self.axes.z.unwrap_or(0.0),
            ),
        }
    }
}

/// Remove a trailing `;` comment and flat `( ... )` comment regions, then trim
pub fn strip_comments(line: &str) -> String {
    let line = match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    };

    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('(') {
        out.push_str(&rest[..open]);
        match rest[open..].find(')') {
            Some(close) => rest = &rest[open + close + 1..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Stateless parser; holds the compiled grammar
#[derive(Debug, Clone)]
pub struct GCodeParser {
    line_pattern: Regex,
    word_pattern: Regex,
}

impl GCodeParser {
    pub fn new() -> Result<Self> {
        let line_pattern = Regex::new(r"^([GM])(\d+)(?:\s+[XYZFES][-+]?(?:\d+\.?\d*|\.\d+))*$")?;
        let word_pattern = Regex::new(r"([XYZFES])([-+]?(?:\d+\.?\d*|\.\d+))")?;
        Ok(Self { line_pattern, word_pattern })
    }

    pub fn validate(&self, line: &str) -> bool {
        let code = strip_comments(line);
        !code.is_empty() && self.line_pattern.is_match(&code)
    }

    pub fn parse(&self, line: &str) -> Command {
        let code = strip_comments(line);
        let Some(captures) = self.line_pattern.captures(&code) else {
            return Command::invalid(line);
        };

        let letter = captures[1].chars().next().unwrap_or('G');
        let kind = match captures[2].parse::<u32>() {
            Ok(number) => CommandKind::classify(letter, number),
            Err(_) => CommandKind::Other,
        };

        let mut axes = AxisWords::default();
        let mut feed_rate = None;
        // the leading token never contains word letters, so scanning the whole line is safe
        for word in self.word_pattern.captures_iter(&code) {
            let Ok(value) = word[2].parse::<f64>() else {
                continue;
            };
            match &word[1] {
                "X" => axes.x = Some(value),
                "Y" => axes.y = Some(value),
                "Z" => axes.z = Some(value),
                "F" => feed_rate = Some(value),
                _ => {}
            }
        }

        let target = (!axes.is_empty()).then(|| {
            Position::new(axes.x.unwrap_or(0.0), axes.y.unwrap_or(0.0), axes.z.unwrap_or(0.0))
        });

        Command {
            raw_text: line.to_string(),
            code,
            kind,
            target,
            axes,
            feed_rate,
            description: kind.description().to_string(),
            valid: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> GCodeParser {
        GCodeParser::new().unwrap()
    }

    #[test]
    fn test_linear_move_with_comment() {
        let cmd = parser().parse("G1 X10 Y20 Z5 F500 ; move");
        assert!(cmd.valid);
        assert_eq!(cmd.kind, CommandKind::LinearMove);
        assert_eq!(cmd.target, Some(Position::new(10.0, 20.0, 5.0)));
        assert_eq!(cmd.feed_rate, Some(500.0));
        assert_eq!(cmd.code, "G1 X10 Y20 Z5 F500");
    }

    #[test]
    fn test_nonsense_is_invalid() {
        let p = parser();
        let cmd = p.parse("nonsense");
        assert!(!cmd.valid);
        assert_eq!(cmd.target, None);
        assert_eq!(cmd.feed_rate, None);
        assert!(!p.validate("nonsense"));
    }

    #[test]
    fn test_empty_after_stripping_is_invalid() {
        let p = parser();
        assert!(!p.validate(""));
        assert!(!p.validate("   ; only a comment"));
        assert!(!p.validate("(just a note)"));
    }

    #[test]
    fn test_parenthesized_comments_are_removed() {
        let p = parser();
        let cmd = p.parse("G0 (rapid G28 inside) X-12.5 (second) Y.5");
        assert!(cmd.valid);
        assert_eq!(cmd.kind, CommandKind::LinearMove);
        assert_eq!(cmd.axes, AxisWords { x: Some(-12.5), y: Some(0.5), z: None });
        // an unterminated region swallows the rest of the line
        assert_eq!(strip_comments("M3 (spin up"), "M3");
    }

    #[test]
    fn test_classification_uses_leading_token() {
        let p = parser();
        assert_eq!(p.parse("G28").kind, CommandKind::Home);
        assert_eq!(p.parse("G1 X1").kind, CommandKind::LinearMove);
        assert_eq!(p.parse("G01 X1").kind, CommandKind::LinearMove);
        assert_eq!(p.parse("M3").kind, CommandKind::ActivateEffector);
        assert_eq!(p.parse("M5").kind, CommandKind::DeactivateEffector);
        assert_eq!(p.parse("G90").kind, CommandKind::SetAbsolute);
        assert_eq!(p.parse("G91").kind, CommandKind::SetRelative);
        // substring matching would have called these moves or effector commands
        assert_eq!(p.parse("G10 X1").kind, CommandKind::Other);
        assert_eq!(p.parse("M30").kind, CommandKind::Other);
        assert_eq!(p.parse("M84").kind, CommandKind::Other);
    }

    #[test]
    fn test_grammar_rejects_malformed_words() {
        let p = parser();
        assert!(!p.validate("G1 X"));
        assert!(!p.validate("G1 Q5"));
        assert!(!p.validate("G1X5"));
        assert!(!p.validate("g1 x5"));
        assert!(!p.validate("X5 G1"));
        assert!(p.validate("M3 S255"));
        assert!(p.validate("G1 E-0.5 F+1200."));
    }

    #[test]
    fn test_parse_is_pure() {
        let p = parser();
        for line in ["G1 X10 Y20 Z5 F500 ; move", "nonsense", "M5", "G0 (a) Z-3"] {
            assert_eq!(p.parse(line), p.parse(line));
        }
    }

    #[test]
    fn test_resolve_target_combines_with_current() {
        let p = parser();
        let current = Position::new(100.0, 50.0, 10.0);
        let cmd = p.parse("G1 Z-5");
        assert_eq!(cmd.resolve_target(current, CoordinateMode::Absolute), Position::new(100.0, 50.0, -5.0));
        assert_eq!(cmd.resolve_target(current, CoordinateMode::Relative), Position::new(100.0, 50.0, 5.0));
    }

    #[test]
    fn test_synthesized_move_parses_back() {
        let p = parser();
        let cmd = Command::linear_move(Position::new(10.0, -2.5, 0.0), 100.0);
        assert_eq!(cmd.code, "G1 X10 Y-2.5 Z0 F100");
        let parsed = p.parse(&cmd.code);
        assert_eq!(parsed.target, cmd.target);
        assert_eq!(parsed.feed_rate, cmd.feed_rate);

        let without_feed = Command::linear_move(Position::new(1.0, 2.0, 3.0), 0.0);
        assert_eq!(without_feed.code, "G1 X1 Y2 Z3");
        assert_eq!(without_feed.feed_rate, None);
    }
}
