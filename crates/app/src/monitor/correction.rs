//! Correction decision engine: defect → at most one printer command.
//!
//! The engine and its cooldown are owned by the supervisory loop and only
//! touched from that thread, so neither carries any locking.

use std::time::{Duration, Instant};

use ml_core::Detection;
use printer_link::Printer;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::monitor::{
    events::EventSink,
    rules::{CommandTemplate, RuleTable},
};

/// Global minimum spacing between applied corrections, across all defect
/// types.
#[derive(Clone, Debug)]
pub struct Cooldown {
    duration: Duration,
    last_correction: Option<Instant>,
}

impl Cooldown {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            last_correction: None,
        }
    }

    /// Strictly more than `duration` must have passed since the last
    /// correction. Never-corrected is always elapsed.
    pub fn has_elapsed(&self, now: Instant) -> bool {
        self.last_correction
            .is_none_or(|last| now.saturating_duration_since(last) > self.duration)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.last_correction.map_or(Duration::ZERO, |last| {
            self.duration
                .saturating_sub(now.saturating_duration_since(last))
        })
    }

    #[cfg(test)]
    pub fn last_correction(&self) -> Option<Instant> {
        self.last_correction
    }

    fn reset(&mut self, now: Instant) {
        self.last_correction = Some(now);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppliedCorrection {
    pub defect_type: String,
    pub confidence: f32,
    pub command: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CorrectionOutcome {
    /// The defect type has no rules.
    NoStrategy,
    CoolingDown { remaining: Duration },
    /// No rule's threshold was exceeded.
    BelowThreshold,
    /// A relative template could not read the current target.
    ResolutionFailed { template: String },
    /// The printer rejected the command or the link faulted.
    SendFailed { command: String, reason: String },
    Applied(AppliedCorrection),
}

impl CorrectionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CorrectionOutcome::NoStrategy => "no_strategy",
            CorrectionOutcome::CoolingDown { .. } => "cooling_down",
            CorrectionOutcome::BelowThreshold => "below_threshold",
            CorrectionOutcome::ResolutionFailed { .. } => "resolution_failed",
            CorrectionOutcome::SendFailed { .. } => "send_failed",
            CorrectionOutcome::Applied(_) => "applied",
        }
    }
}

pub struct CorrectionEngine {
    rules: RuleTable,
    cooldown: Cooldown,
}

impl CorrectionEngine {
    pub fn new(rules: RuleTable, cooldown: Duration) -> Self {
        Self {
            rules,
            cooldown: Cooldown::new(cooldown),
        }
    }

    #[cfg(test)]
    pub fn cooldown(&self) -> &Cooldown {
        &self.cooldown
    }

    pub fn apply<P: Printer + ?Sized>(
        &mut self,
        detection: &Detection,
        printer: &mut P,
        events: &dyn EventSink,
    ) -> CorrectionOutcome {
        self.apply_at(detection, printer, events, Instant::now())
    }

    /// Decide and, at most once, send. The first rule in table order whose
    /// threshold the confidence strictly exceeds is the only candidate; a
    /// failure on it never falls through to later rules. The cooldown is reset
    /// only after the printer acknowledged the command.
    pub fn apply_at<P: Printer + ?Sized>(
        &mut self,
        detection: &Detection,
        printer: &mut P,
        events: &dyn EventSink,
        now: Instant,
    ) -> CorrectionOutcome {
        let outcome = self.decide(detection, printer, events, now);
        metrics::counter!(
            "printwatch_corrections_total",
            "defect" => detection.defect_type.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
        outcome
    }

    fn decide<P: Printer + ?Sized>(
        &mut self,
        detection: &Detection,
        printer: &mut P,
        events: &dyn EventSink,
        now: Instant,
    ) -> CorrectionOutcome {
        let Some(rules) = self.rules.get(&detection.defect_type) else {
            debug!("No correction strategy for {}", detection.defect_type);
            return CorrectionOutcome::NoStrategy;
        };

        if !self.cooldown.has_elapsed(now) {
            let remaining = self.cooldown.remaining(now);
            debug!(
                "Skipping {} correction; cooldown has {:.1}s left",
                detection.defect_type,
                remaining.as_secs_f32()
            );
            return CorrectionOutcome::CoolingDown { remaining };
        }

        let Some(rule) = rules
            .iter()
            .find(|rule| detection.confidence > rule.threshold)
        else {
            return CorrectionOutcome::BelowThreshold;
        };

        let Some(command) = rule.template.resolve(printer) else {
            let reading = match rule.template {
                CommandTemplate::RelativeTarget { heater, .. } => heater.label(),
                CommandTemplate::Static(_) => "printer",
            };
            warn!(
                "Could not resolve {:?} for {}; {reading} temperature unavailable",
                rule.command, detection.defect_type
            );
            return CorrectionOutcome::ResolutionFailed {
                template: rule.command.clone(),
            };
        };

        match printer.send(&command) {
            Ok(_) => {
                self.cooldown.reset(now);
                let applied = AppliedCorrection {
                    defect_type: detection.defect_type.clone(),
                    confidence: detection.confidence,
                    command,
                    description: rule.description.clone(),
                };
                info!(
                    "Applied {} for {} ({:.2})",
                    applied.command, applied.defect_type, applied.confidence
                );
                events.correction_applied(&applied);
                CorrectionOutcome::Applied(applied)
            }
            Err(err) => {
                warn!("Correction {command} for {} failed: {err}", detection.defect_type);
                CorrectionOutcome::SendFailed {
                    command,
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{HashMap, VecDeque};

    use printer_link::{LinkError, Position, Response, TemperatureSnapshot};

    use super::*;
    use crate::monitor::{
        events::tests::RecordingSink,
        rules::{RuleEntry, default_rule_entries},
    };

    /// Records sent commands; replies are scripted per call, defaulting to ok.
    #[derive(Default)]
    pub(crate) struct RecordingPrinter {
        pub(crate) sent: Vec<String>,
        pub(crate) replies: VecDeque<Result<Response, LinkError>>,
        pub(crate) temperature: Option<TemperatureSnapshot>,
        pub(crate) position: Option<Position>,
        pub(crate) temperature_queries: usize,
    }

    impl Printer for RecordingPrinter {
        fn send(&mut self, command: &str) -> Result<Response, LinkError> {
            self.sent.push(command.to_string());
            self.replies
                .pop_front()
                .unwrap_or_else(|| Ok(Response::default()))
        }

        fn query_temperature(&mut self) -> Option<TemperatureSnapshot> {
            self.temperature_queries += 1;
            self.temperature
        }

        fn query_position(&mut self) -> Option<Position> {
            self.position
        }
    }

    fn detection(defect: &str, confidence: f32) -> Detection {
        Detection {
            defect_type: defect.to_string(),
            confidence,
            bbox: [0.0, 0.0, 10.0, 10.0],
            frame_sequence: 1,
            timestamp_ms: 0,
        }
    }

    fn engine() -> CorrectionEngine {
        CorrectionEngine::new(
            RuleTable::from_entries(default_rule_entries()).unwrap(),
            Duration::from_secs(30),
        )
    }

    fn bed_at(target: f32) -> TemperatureSnapshot {
        TemperatureSnapshot {
            hotend_actual: 210.0,
            hotend_target: 210.0,
            bed_actual: target,
            bed_target: target,
        }
    }

    #[test]
    fn unknown_defect_is_a_no_op() {
        let mut engine = engine();
        let mut printer = RecordingPrinter::default();
        let events = RecordingSink::default();

        let outcome = engine.apply(&detection("blobs", 0.99), &mut printer, &events);

        assert_eq!(outcome, CorrectionOutcome::NoStrategy);
        assert!(printer.sent.is_empty());
        assert!(engine.cooldown().last_correction().is_none());
        assert!(events.take().is_empty());
    }

    #[test]
    fn cooldown_blocks_any_confidence() {
        let mut engine = engine();
        let mut printer = RecordingPrinter::default();
        let events = RecordingSink::default();
        let start = Instant::now();

        let first = engine.apply_at(&detection("spaghetti", 0.9), &mut printer, &events, start);
        assert!(matches!(first, CorrectionOutcome::Applied(_)));

        let later = start + Duration::from_secs(10);
        let second = engine.apply_at(&detection("warping", 1.0), &mut printer, &events, later);
        assert!(matches!(second, CorrectionOutcome::CoolingDown { .. }));
        assert_eq!(printer.sent, vec!["M112"]);
    }

    #[test]
    fn cooldown_requires_strictly_more_than_duration() {
        let mut cooldown = Cooldown::new(Duration::from_secs(30));
        let start = Instant::now();
        assert!(cooldown.has_elapsed(start));

        cooldown.reset(start);
        assert!(!cooldown.has_elapsed(start + Duration::from_secs(30)));
        assert!(cooldown.has_elapsed(start + Duration::from_millis(30_001)));
    }

    #[test]
    fn first_satisfied_rule_wins_over_later_ones() {
        let entries = HashMap::from([(
            "warping".to_string(),
            vec![
                RuleEntry {
                    command: "M220 S95".to_string(),
                    threshold: 0.80,
                    description: "A".to_string(),
                },
                RuleEntry {
                    command: "M220 S90".to_string(),
                    threshold: 0.90,
                    description: "B".to_string(),
                },
            ],
        )]);
        let mut engine =
            CorrectionEngine::new(RuleTable::from_entries(entries).unwrap(), Duration::from_secs(30));
        let mut printer = RecordingPrinter::default();
        let events = RecordingSink::default();

        engine.apply(&detection("warping", 0.95), &mut printer, &events);

        assert_eq!(printer.sent, vec!["M220 S95"]);
        assert_eq!(events.take(), vec!["correction M220 S95"]);
    }

    #[test]
    fn confidence_must_exceed_threshold() {
        let mut engine = engine();
        let mut printer = RecordingPrinter::default();
        let events = RecordingSink::default();

        let outcome = engine.apply(&detection("spaghetti", 0.85), &mut printer, &events);

        assert_eq!(outcome, CorrectionOutcome::BelowThreshold);
        assert!(printer.sent.is_empty());
    }

    #[test]
    fn relative_bed_adjustment_uses_current_target() {
        let mut engine = engine();
        let mut printer = RecordingPrinter {
            temperature: Some(bed_at(60.0)),
            ..RecordingPrinter::default()
        };
        let events = RecordingSink::default();

        let outcome = engine.apply(&detection("warping", 0.85), &mut printer, &events);

        assert_eq!(printer.sent, vec!["M140 S65"]);
        assert_eq!(printer.temperature_queries, 1);
        match outcome {
            CorrectionOutcome::Applied(applied) => {
                assert_eq!(applied.command, "M140 S65");
                assert_eq!(applied.description, "Raise bed temp");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(engine.cooldown().last_correction().is_some());
    }

    #[test]
    fn failed_temperature_read_does_not_fall_through() {
        let mut engine = engine();
        let mut printer = RecordingPrinter::default();
        let events = RecordingSink::default();

        // Clears both warping rules; the speed rule must not be tried instead.
        let outcome = engine.apply(&detection("warping", 0.95), &mut printer, &events);

        assert_eq!(
            outcome,
            CorrectionOutcome::ResolutionFailed {
                template: "M140 S+5".to_string()
            }
        );
        assert!(printer.sent.is_empty());
        assert!(engine.cooldown().last_correction().is_none());
        assert!(events.take().is_empty());
    }

    #[test]
    fn rejected_command_does_not_start_cooldown_or_fall_through() {
        let mut engine = engine();
        let mut printer = RecordingPrinter::default();
        printer.replies.push_back(Err(LinkError::Rejected {
            command: "M104 S205".to_string(),
            response: "Error: cold extrusion".to_string(),
        }));
        printer.temperature = Some(TemperatureSnapshot {
            hotend_actual: 209.0,
            hotend_target: 210.0,
            bed_actual: 60.0,
            bed_target: 60.0,
        });
        let events = RecordingSink::default();

        let outcome = engine.apply(&detection("stringing", 0.9), &mut printer, &events);

        assert!(matches!(outcome, CorrectionOutcome::SendFailed { .. }));
        assert_eq!(printer.sent, vec!["M104 S205"]);
        assert!(engine.cooldown().last_correction().is_none());
        assert!(events.take().is_empty());
    }
}
