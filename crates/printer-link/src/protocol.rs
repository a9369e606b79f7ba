//! Wire-level vocabulary: command formatting, terminal markers, and parsers
//! for the firmware's status replies.

use std::sync::LazyLock;

use regex::Regex;

/// Fixed command words understood by Marlin-style firmware.
pub mod gcode {
    pub const EMERGENCY_STOP: &str = "M112";
    pub const GET_TEMPERATURE: &str = "M105";
    pub const GET_POSITION: &str = "M114";
    pub const PAUSE_PRINT: &str = "M25";
    pub const RESUME_PRINT: &str = "M24";
    pub const HOME_ALL: &str = "G28";
    pub const SET_HOTEND_TEMP: &str = "M104";
    pub const SET_BED_TEMP: &str = "M140";

    pub fn set_speed(percentage: u32) -> String {
        format!("M220 S{percentage}")
    }

    pub fn set_flow(percentage: u32) -> String {
        format!("M221 S{percentage}")
    }

    pub fn set_fan(duty: u8) -> String {
        format!("M106 S{duty}")
    }

    pub fn move_to(x: f32, y: f32, z: f32, feed: f32) -> String {
        format!("G1 X{x} Y{y} Z{z} F{feed}")
    }

    /// LCD message; spaces are replaced because some firmwares truncate at the first one.
    pub fn show_message(message: &str) -> String {
        format!("M117 {}", message.replace(' ', "_"))
    }
}

/// Terminal classification of a response line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    Success,
    Failure,
}

impl Marker {
    /// Classify a single line. `ok` is matched literally and wins over the
    /// case-insensitive failure markers.
    pub fn classify(line: &str) -> Option<Self> {
        if line.contains("ok") {
            return Some(Marker::Success);
        }
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("unknown command") {
            return Some(Marker::Failure);
        }
        None
    }
}

/// Text accumulated for one command until its terminal line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    text: String,
}

impl Response {
    pub(crate) fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

static TEMPERATURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"T:\s*(-?\d+(?:\.\d*)?)\s*/\s*(-?\d+(?:\.\d*)?).*?B:\s*(-?\d+(?:\.\d*)?)\s*/\s*(-?\d+(?:\.\d*)?)",
    )
    .expect("temperature pattern is valid")
});

static POSITION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"X:\s*(-?\d+(?:\.\d*)?)\s*Y:\s*(-?\d+(?:\.\d*)?)\s*Z:\s*(-?\d+(?:\.\d*)?)")
        .expect("position pattern is valid")
});

/// Heater readings from an `M105` reply. Never cached beyond one decision.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TemperatureSnapshot {
    pub hotend_actual: f32,
    pub hotend_target: f32,
    pub bed_actual: f32,
    pub bed_target: f32,
}

impl TemperatureSnapshot {
    /// Parse `T:<actual> /<target> ... B:<actual> /<target>` anywhere in `text`.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = TEMPERATURE_PATTERN.captures(text)?;
        let field = |idx: usize| caps.get(idx)?.as_str().parse::<f32>().ok();
        Some(Self {
            hotend_actual: field(1)?,
            hotend_target: field(2)?,
            bed_actual: field(3)?,
            bed_target: field(4)?,
        })
    }

    pub fn target(&self, heater: Heater) -> f32 {
        match heater {
            Heater::Hotend => self.hotend_target,
            Heater::Bed => self.bed_target,
        }
    }
}

/// Toolhead position from an `M114` reply.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn parse(text: &str) -> Option<Self> {
        let caps = POSITION_PATTERN.captures(text)?;
        let field = |idx: usize| caps.get(idx)?.as_str().parse::<f32>().ok();
        Some(Self {
            x: field(1)?,
            y: field(2)?,
            z: field(3)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Heater {
    Hotend,
    Bed,
}

impl Heater {
    /// Match the set-temperature command word at the start of a template.
    pub fn from_command(command: &str) -> Option<Self> {
        match command.split_whitespace().next()? {
            gcode::SET_HOTEND_TEMP => Some(Heater::Hotend),
            gcode::SET_BED_TEMP => Some(Heater::Bed),
            _ => None,
        }
    }

    /// Absolute set-temperature command for this heater.
    pub fn set_command(self, target: f32) -> String {
        match self {
            Heater::Hotend => format!("{} S{target}", gcode::SET_HOTEND_TEMP),
            Heater::Bed => format!("{} S{target}", gcode::SET_BED_TEMP),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Heater::Hotend => "hotend",
            Heater::Bed => "bed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_anywhere_in_line_is_success() {
        assert_eq!(Marker::classify("ok"), Some(Marker::Success));
        assert_eq!(
            Marker::classify("ok T:205.1 /210.0 B:60.2 /70.0"),
            Some(Marker::Success)
        );
        assert_eq!(Marker::classify("echo:busy: processing"), None);
    }

    #[test]
    fn failure_markers_are_case_insensitive() {
        assert_eq!(
            Marker::classify("Error: cold extrusion prevented"),
            Some(Marker::Failure)
        );
        assert_eq!(
            Marker::classify("echo:Unknown command: \"M999\""),
            Some(Marker::Failure)
        );
    }

    #[test]
    fn parses_marlin_temperature_report() {
        let snapshot = TemperatureSnapshot::parse("ok T:205.1 /210.0 B:60.2 /70.0 @:0 B@:0")
            .expect("report parses");
        assert_eq!(snapshot.hotend_actual, 205.1);
        assert_eq!(snapshot.hotend_target, 210.0);
        assert_eq!(snapshot.bed_actual, 60.2);
        assert_eq!(snapshot.bed_target, 70.0);
        assert_eq!(snapshot.target(Heater::Bed), 70.0);
    }

    #[test]
    fn temperature_report_tolerates_extra_fields_between_heaters() {
        let snapshot =
            TemperatureSnapshot::parse("T:20.0 /0.0 T0:20.0 /0.0 B:21.5 /0.0\nok\n").unwrap();
        assert_eq!(snapshot.bed_actual, 21.5);
    }

    #[test]
    fn malformed_temperature_report_is_none() {
        assert!(TemperatureSnapshot::parse("ok").is_none());
        assert!(TemperatureSnapshot::parse("T:abc /210 B:60 /70").is_none());
    }

    #[test]
    fn parses_position_report() {
        let position =
            Position::parse("X:10.00 Y:20.50 Z:0.60 E:0.00 Count X:0 Y:0 Z:0\nok").unwrap();
        assert_eq!(position.z, 0.6);
        assert_eq!(position.y, 20.5);
    }

    #[test]
    fn heater_commands_render_absolute_targets() {
        assert_eq!(Heater::from_command("M140 S+5"), Some(Heater::Bed));
        assert_eq!(Heater::from_command("M104 S-5"), Some(Heater::Hotend));
        assert_eq!(Heater::from_command("M220 S90"), None);
        assert_eq!(Heater::Bed.set_command(65.0), "M140 S65");
        assert_eq!(gcode::show_message("AI PAUSED"), "M117 AI_PAUSED");
    }
}
