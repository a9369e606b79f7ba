use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use printer_link::{
    Connector, LinkError, LinkPolicy, LinkState, PrinterLink, Response, Transport,
};

enum Step {
    Line(&'static str),
    Silence,
    Fault,
}

#[derive(Default)]
struct Wire {
    open_attempts: usize,
    failing_opens: usize,
    fail_next_write: bool,
    writes: Vec<String>,
    reads: VecDeque<Step>,
}

#[derive(Clone, Default)]
struct FakePrinter {
    wire: Arc<Mutex<Wire>>,
    stop_after_attempts: Option<(usize, Arc<AtomicBool>)>,
}

impl FakePrinter {
    fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.wire.lock().unwrap().reads.extend(steps);
    }

    fn writes(&self) -> Vec<String> {
        self.wire.lock().unwrap().writes.clone()
    }

    fn open_attempts(&self) -> usize {
        self.wire.lock().unwrap().open_attempts
    }
}

struct FakeTransport {
    wire: Arc<Mutex<Wire>>,
}

impl Transport for FakeTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut wire = self.wire.lock().unwrap();
        if wire.fail_next_write {
            wire.fail_next_write = false;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        }
        wire.writes.push(line.to_string());
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.wire.lock().unwrap().reads.pop_front() {
            Some(Step::Line(line)) => Ok(Some(line.to_string())),
            Some(Step::Silence) | None => Ok(None),
            Some(Step::Fault) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
        }
    }
}

impl Connector for FakePrinter {
    type Transport = FakeTransport;

    fn open(&mut self) -> io::Result<FakeTransport> {
        let mut wire = self.wire.lock().unwrap();
        wire.open_attempts += 1;
        if let Some((limit, stop)) = &self.stop_after_attempts {
            if wire.open_attempts >= *limit {
                stop.store(true, Ordering::SeqCst);
            }
        }
        if wire.failing_opens > 0 {
            wire.failing_opens -= 1;
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such port"));
        }
        Ok(FakeTransport {
            wire: self.wire.clone(),
        })
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

fn fast_policy() -> LinkPolicy {
    LinkPolicy {
        settle: Duration::ZERO,
        retry: Duration::ZERO,
        response_timeout: Some(Duration::from_secs(5)),
    }
}

fn connected(printer: &FakePrinter) -> PrinterLink<FakePrinter> {
    let mut link = PrinterLink::new(printer.clone(), fast_policy());
    link.connect_once().expect("fake printer opens");
    link
}

#[test]
fn blank_lines_are_skipped_until_ok() {
    let printer = FakePrinter::default();
    let mut link = connected(&printer);
    printer.script([Step::Line(""), Step::Silence, Step::Line("ok")]);

    let response = link.send("M220 S90").expect("command succeeds");

    assert_eq!(response.as_str(), "ok\n");
    assert_eq!(printer.writes(), vec!["M220 S90".to_string()]);
}

#[test]
fn intermediate_lines_are_accumulated() {
    let printer = FakePrinter::default();
    let mut link = connected(&printer);
    printer.script([Step::Line("echo:busy: processing"), Step::Line("ok")]);

    let response = link.send("G28").unwrap();

    assert_eq!(
        response.lines().collect::<Vec<_>>(),
        vec!["echo:busy: processing", "ok"]
    );
}

#[test]
fn error_marker_fails_without_resending() {
    let printer = FakePrinter::default();
    let mut link = connected(&printer);
    printer.script([Step::Line("Error: cold extrusion prevented")]);

    let err = link.send("G1 E5").unwrap_err();

    assert!(matches!(err, LinkError::Rejected { .. }));
    assert!(!err.is_transport_fault());
    assert_eq!(printer.writes().len(), 1);
    assert_eq!(link.state(), LinkState::Connected);
}

#[test]
fn read_fault_forces_reconnect_before_next_send() {
    let printer = FakePrinter::default();
    let mut link = connected(&printer);
    printer.script([Step::Fault]);

    let err = link.send("M105").unwrap_err();
    assert!(err.is_transport_fault());
    assert_eq!(link.state(), LinkState::Connecting);
    assert_eq!(printer.open_attempts(), 1);

    printer.script([Step::Line("start"), Step::Line("ok")]);
    link.send("M220 S80").expect("reconnected link succeeds");

    assert_eq!(printer.open_attempts(), 2);
    assert_eq!(link.reconnects(), 1);
    assert_eq!(link.greeting(), Some("start"));
    assert_eq!(link.state(), LinkState::Connected);
    // The faulted command is never retried.
    assert_eq!(
        printer.writes(),
        vec!["M105".to_string(), "M220 S80".to_string()]
    );
}

#[test]
fn write_fault_abandons_the_command() {
    let printer = FakePrinter::default();
    let mut link = connected(&printer);
    printer.wire.lock().unwrap().fail_next_write = true;

    assert!(matches!(
        link.send("M112"),
        Err(LinkError::Transport { .. })
    ));
    assert!(printer.writes().is_empty());
    assert_eq!(link.state(), LinkState::Connecting);
}

#[test]
fn connecting_retries_until_the_port_opens() {
    let printer = FakePrinter::default();
    printer.wire.lock().unwrap().failing_opens = 3;
    printer.script([Step::Line("start"), Step::Line("ok")]);
    let mut link = PrinterLink::new(printer.clone(), fast_policy());

    link.send("M105").expect("eventually connects");

    assert_eq!(printer.open_attempts(), 4);
    assert_eq!(link.reconnects(), 0);
}

#[test]
fn startup_connect_is_a_single_attempt() {
    let printer = FakePrinter::default();
    printer.wire.lock().unwrap().failing_opens = 1;
    let mut link = PrinterLink::new(printer.clone(), fast_policy());

    let err = link.connect_once().unwrap_err();

    assert!(matches!(err, LinkError::Open { .. }));
    assert_eq!(printer.open_attempts(), 1);
    assert_eq!(link.state(), LinkState::Disconnected);
}

#[test]
fn silent_printer_times_out_and_marks_link_unhealthy() {
    let printer = FakePrinter::default();
    let mut link = PrinterLink::new(
        printer.clone(),
        LinkPolicy {
            response_timeout: Some(Duration::from_millis(20)),
            ..fast_policy()
        },
    );
    link.connect_once().unwrap();

    let err = link.send("M105").unwrap_err();

    assert!(matches!(err, LinkError::Timeout { .. }));
    assert_eq!(link.state(), LinkState::Connecting);
}

#[test]
fn stop_flag_cancels_connecting() {
    let stop = Arc::new(AtomicBool::new(false));
    let printer = FakePrinter {
        stop_after_attempts: Some((3, stop.clone())),
        ..FakePrinter::default()
    };
    printer.wire.lock().unwrap().failing_opens = usize::MAX;
    let mut link = PrinterLink::new(printer.clone(), fast_policy()).with_stop_flag(stop);

    let err = link.send("M112").unwrap_err();

    assert!(matches!(err, LinkError::Cancelled));
    assert_eq!(printer.open_attempts(), 3);
    assert!(printer.writes().is_empty());
}

#[test]
fn temperature_query_parses_report() {
    let printer = FakePrinter::default();
    let mut link = connected(&printer);
    printer.script([Step::Line("ok T:205.1 /210.0 B:60.2 /70.0 @:0 B@:0")]);

    let snapshot = link.query_temperature().expect("temperatures parsed");

    assert_eq!(snapshot.hotend_target, 210.0);
    assert_eq!(snapshot.bed_target, 70.0);
    assert_eq!(printer.writes(), vec!["M105".to_string()]);
}

#[test]
fn temperature_query_without_fields_is_none() {
    let printer = FakePrinter::default();
    let mut link = connected(&printer);
    printer.script([Step::Line("ok")]);

    assert!(link.query_temperature().is_none());
}

#[test]
fn pause_shows_message_then_pauses() {
    let printer = FakePrinter::default();
    let mut link = connected(&printer);
    printer.script([Step::Line("ok"), Step::Line("ok")]);

    link.pause("AI PAUSED").unwrap();

    assert_eq!(
        printer.writes(),
        vec!["M117 AI_PAUSED".to_string(), "M25".to_string()]
    );
}

type Operation = fn(&mut PrinterLink<FakePrinter>) -> Result<Response, LinkError>;

#[test]
fn convenience_operations_write_expected_gcode() {
    let cases: [(&str, Operation, &[&str]); 9] = [
        ("emergency_stop", |link| link.emergency_stop(), &["M112"]),
        ("set_speed", |link| link.set_speed(90), &["M220 S90"]),
        ("set_flow", |link| link.set_flow(95), &["M221 S95"]),
        ("set_fan", |link| link.set_fan(255), &["M106 S255"]),
        ("home", |link| link.home(), &["G28"]),
        (
            "move_to",
            |link| link.move_to(10.0, 20.5, 0.3, 1500.0),
            &["G1 X10 Y20.5 Z0.3 F1500"],
        ),
        ("resume", |link| link.resume(), &["M117 AI_RESUMED", "M24"]),
        (
            "set_hotend_temp",
            |link| link.set_hotend_temp(205.0),
            &["M104 S205"],
        ),
        ("set_bed_temp", |link| link.set_bed_temp(62.5), &["M140 S62.5"]),
    ];

    for (name, operation, expected) in cases {
        let printer = FakePrinter::default();
        let mut link = connected(&printer);
        printer.script(expected.iter().map(|_| Step::Line("ok")));

        operation(&mut link).unwrap_or_else(|err| panic!("{name} failed: {err}"));

        assert_eq!(printer.writes(), expected, "{name}");
    }
}
