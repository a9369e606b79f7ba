//! Data-driven correction rules: defect type → ordered candidate commands.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow, bail};
use printer_link::{Heater, Printer};
use serde::Deserialize;

/// One rule as written in configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    pub command: String,
    pub threshold: f32,
    pub description: String,
}

impl RuleEntry {
    fn new(command: &str, threshold: f32, description: &str) -> Self {
        Self {
            command: command.to_string(),
            threshold,
            description: description.to_string(),
        }
    }
}

/// A command template: either sent verbatim or a signed adjustment of a
/// heater's *target* temperature.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandTemplate {
    Static(String),
    RelativeTarget { heater: Heater, delta: f32 },
}

impl CommandTemplate {
    /// Parse `M140 S+5` style templates. A token `S+n`/`S-n` marks a relative
    /// adjustment, which is only meaningful for `M104` and `M140`.
    pub fn parse(template: &str) -> Result<Self> {
        let template = template.trim();
        if template.is_empty() {
            bail!("command template is empty");
        }
        let relative = template
            .split_whitespace()
            .find(|token| token.starts_with("S+") || token.starts_with("S-"));
        let Some(token) = relative else {
            return Ok(CommandTemplate::Static(template.to_string()));
        };

        let heater = Heater::from_command(template).ok_or_else(|| {
            anyhow!("relative adjustment in {template:?} requires M104 (hotend) or M140 (bed)")
        })?;
        let delta = token[1..]
            .parse::<f32>()
            .with_context(|| format!("invalid relative adjustment {token:?} in {template:?}"))?;
        Ok(CommandTemplate::RelativeTarget { heater, delta })
    }

    /// Render the command to send. Relative templates read a fresh target
    /// from the printer; `None` when that read fails.
    pub fn resolve<P: Printer + ?Sized>(&self, printer: &mut P) -> Option<String> {
        match self {
            CommandTemplate::Static(command) => Some(command.clone()),
            CommandTemplate::RelativeTarget { heater, delta } => {
                let snapshot = printer.query_temperature()?;
                Some(heater.set_command(snapshot.target(*heater) + delta))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CorrectionRule {
    pub template: CommandTemplate,
    /// Template text as configured, for logs.
    pub command: String,
    pub threshold: f32,
    pub description: String,
}

impl TryFrom<RuleEntry> for CorrectionRule {
    type Error = anyhow::Error;

    fn try_from(entry: RuleEntry) -> Result<Self> {
        if !(0.0..=1.0).contains(&entry.threshold) {
            bail!(
                "threshold {} for {:?} must lie in [0, 1]",
                entry.threshold,
                entry.command
            );
        }
        Ok(Self {
            template: CommandTemplate::parse(&entry.command)?,
            command: entry.command,
            threshold: entry.threshold,
            description: entry.description,
        })
    }
}

/// Static, read-only rule table. Order within a defect type is priority:
/// the first rule whose threshold is exceeded wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleTable {
    rules: HashMap<String, Vec<CorrectionRule>>,
}

impl RuleTable {
    pub fn from_entries(entries: HashMap<String, Vec<RuleEntry>>) -> Result<Self> {
        let mut rules = HashMap::with_capacity(entries.len());
        for (defect, entries) in entries {
            let parsed = entries
                .into_iter()
                .map(CorrectionRule::try_from)
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("invalid rule for defect {defect:?}"))?;
            rules.insert(defect, parsed);
        }
        Ok(Self { rules })
    }

    pub fn get(&self, defect_type: &str) -> Option<&[CorrectionRule]> {
        self.rules.get(defect_type).map(Vec::as_slice)
    }

    /// Defect types in name order.
    pub fn defect_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

pub fn default_rule_entries() -> HashMap<String, Vec<RuleEntry>> {
    HashMap::from([
        (
            "warping".to_string(),
            vec![
                RuleEntry::new("M140 S+5", 0.80, "Raise bed temp"),
                RuleEntry::new("M220 S90", 0.90, "Slow to 90%"),
            ],
        ),
        (
            "stringing".to_string(),
            vec![
                RuleEntry::new("M104 S-5", 0.75, "Lower hotend temp"),
                RuleEntry::new("M106 S255", 0.85, "Max fan"),
            ],
        ),
        (
            "spaghetti".to_string(),
            vec![RuleEntry::new("M112", 0.85, "Emergency stop")],
        ),
        (
            "layer_skip".to_string(),
            vec![RuleEntry::new("M112", 0.80, "Stop print")],
        ),
        (
            "overhang_stringing".to_string(),
            vec![RuleEntry::new("M220 S80", 0.80, "Slow to 80%")],
        ),
        (
            "anomaly".to_string(),
            vec![RuleEntry::new("M112", 0.90, "Emergency stop")],
        ),
    ])
}
