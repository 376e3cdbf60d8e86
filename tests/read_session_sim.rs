use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

use ecu_did_reader::{
    addressing::{AddressingPlan, PlanConfig},
    aggregator::{CollectSettings, ResponseOutcome, send_and_collect},
    annotate::{AnnotateError, TemplateStore},
    bus::CanBus,
    channel::{ChannelError, Packet},
    config::ReaderConfig,
    hardware::simulation::{ScriptedResponse, SimulatedCanDevice, SimulatedEcu, SimulatedFault},
    session::ReadSession,
    uds::{ReadDataByIdentifierMatcher, make_request},
};

const FA13: u16 = 0xFA13;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings(timeout_ms: u64) -> CollectSettings {
    CollectSettings {
        timeout: Duration::from_millis(timeout_ms),
        ..Default::default()
    }
}

fn read(bus: &CanBus, plan: &PlanConfig, timeout_ms: u64) -> ResponseOutcome {
    send_and_collect(
        bus,
        &AddressingPlan::build(plan),
        &make_request(FA13),
        &ReadDataByIdentifierMatcher::new(FA13),
        &settings(timeout_ms),
    )
}

/// ECU on 0x7E0/0x7E8 answering the OBD functional ID too
fn engine_ecu() -> SimulatedEcu {
    SimulatedEcu::normal_11bit("engine", 0x7E0, 0x7E8).listen_functional(0x7DF)
}

#[test]
fn pending_response_does_not_extend_deadline() {
    init_logger();
    let ecu = SimulatedEcu::normal_11bit("slow", 0x7F1, 0x7F9).on_request(|_| {
        vec![
            ScriptedResponse::now(&[0x7F, 0x22, 0x78]),
            ScriptedResponse::after(Duration::from_millis(100), &[0x7F, 0x22, 0x78]),
        ]
    });
    let bus = CanBus::open(Box::new(SimulatedCanDevice::new().with_ecu(ecu)), 500_000, false)
        .unwrap();

    let start = Instant::now();
    let outcome = read(&bus, &PlanConfig::physical_11bit(), 300);
    let elapsed = start.elapsed();

    assert!(matches!(outcome, ResponseOutcome::TimedOut));
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
}

#[test]
fn positive_response_after_pending_is_received() {
    init_logger();
    let ecu = SimulatedEcu::normal_11bit("slow", 0x7F1, 0x7F9).on_request(|_| {
        vec![
            ScriptedResponse::now(&[0x7F, 0x22, 0x78]),
            ScriptedResponse::after(Duration::from_millis(50), &[0x62, 0xFA, 0x13, 0x01, 0x02]),
        ]
    });
    let bus = CanBus::open(Box::new(SimulatedCanDevice::new().with_ecu(ecu)), 500_000, false)
        .unwrap();

    let outcome = read(&bus, &PlanConfig::physical_11bit(), 1000);
    assert_eq!(outcome.payload(), Some(&[0x62, 0xFA, 0x13, 0x01, 0x02][..]));
}

#[test]
fn negative_response_is_not_an_answer() {
    init_logger();
    let ecu = SimulatedEcu::normal_11bit("strict", 0x7F1, 0x7F9)
        .on_request(|_| vec![ScriptedResponse::now(&[0x7F, 0x22, 0x31])]);
    let bus = CanBus::open(Box::new(SimulatedCanDevice::new().with_ecu(ecu)), 500_000, false)
        .unwrap();

    let outcome = read(&bus, &PlanConfig::physical_11bit(), 200);
    assert!(matches!(outcome, ResponseOutcome::TimedOut));
}

#[test]
fn first_positive_response_wins() {
    init_logger();
    let first = engine_ecu().on_request(|_| vec![ScriptedResponse::now(&[0x62, 0xFA, 0x13, 0xAA])]);
    let second = SimulatedEcu::normal_11bit("gearbox", 0x7E1, 0x7E9)
        .listen_functional(0x7DF)
        .on_request(|_| {
            vec![ScriptedResponse::after(
                Duration::from_millis(20),
                &[0x62, 0xFA, 0x13, 0xBB],
            )]
        });
    let dev = SimulatedCanDevice::new().with_ecu(first).with_ecu(second);
    let bus = CanBus::open(Box::new(dev), 500_000, false).unwrap();

    let outcome = read(&bus, &PlanConfig::functional_11bit(), 500);
    assert_eq!(outcome.payload(), Some(&[0x62, 0xFA, 0x13, 0xAA][..]));
    assert_eq!(bus.listener_count(), 0);
}

#[test]
fn functional_read_of_multi_frame_response() {
    init_logger();
    let mut payload = vec![0x62, 0xFA, 0x13];
    payload.extend((0..769u32).map(|i| i as u8));
    let expected = payload.clone();
    let ecu = engine_ecu().on_request(move |_| vec![ScriptedResponse::now(&payload)]);
    let dev = SimulatedCanDevice::new().with_ecu(ecu);
    let log = dev.tx_log();
    let bus = CanBus::open(Box::new(dev), 500_000, false).unwrap();

    let outcome = read(&bus, &PlanConfig::functional_11bit(), 2000);
    assert_eq!(outcome.payload().map(<[u8]>::len), Some(772));
    assert_eq!(outcome.payload(), Some(&expected[..]));

    let log = log.lock().unwrap();
    assert_eq!(log[0].get_address(), 0x7DF);
    assert_eq!(&log[0].get_data()[..4], &[0x03, 0x22, 0xFA, 0x13]);
    // Flow control goes to the physical request ID of the responder
    assert!(log
        .iter()
        .any(|f| f.get_address() == 0x7E0 && f.get_data()[0] == 0x30));
}

#[test]
fn functional_29bit_read() {
    init_logger();
    let ecu = SimulatedEcu::normal_fixed_29bit("gateway", 0x10, 0xF1)
        .on_request(|req| {
            let mut resp = vec![0x62, req[1], req[2]];
            resp.extend_from_slice(&[0x11; 17]);
            vec![ScriptedResponse::now(&resp)]
        });
    let dev = SimulatedCanDevice::new().with_ecu(ecu);
    let log = dev.tx_log();
    let bus = CanBus::open(Box::new(dev), 500_000, true).unwrap();

    let outcome = read(&bus, &PlanConfig::functional_29bit(), 1000);
    let payload = outcome.payload().unwrap();
    assert_eq!(payload.len(), 20);
    assert_eq!(&payload[..3], &[0x62, 0xFA, 0x13]);

    let log = log.lock().unwrap();
    assert_eq!(log[0].get_address(), 0x18DB_FFF1);
    assert!(log
        .iter()
        .any(|f| f.get_address() == 0x18DA_10F1 && f.get_data()[0] == 0x30));
}

#[test]
fn late_answer_is_not_taken_for_next_request() {
    init_logger();
    let mut requests = 0;
    let ecu = SimulatedEcu::normal_11bit("late", 0x7F1, 0x7F9).on_request(move |_| {
        requests += 1;
        if requests == 1 {
            vec![ScriptedResponse::after(
                Duration::from_millis(80),
                &[0x62, 0xFA, 0x13, 0xAA],
            )]
        } else {
            Vec::new()
        }
    });
    let dev = SimulatedCanDevice::new().with_ecu(ecu);
    let log = dev.tx_log();
    let bus = CanBus::open(Box::new(dev), 500_000, false).unwrap();
    let plan = PlanConfig::physical_11bit();

    assert!(matches!(read(&bus, &plan, 50), ResponseOutcome::TimedOut));
    std::thread::sleep(Duration::from_millis(100));
    let second = read(&bus, &plan, 200);
    assert!(matches!(second, ResponseOutcome::TimedOut), "{second:?}");
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn no_respondent_writes_nothing() {
    init_logger();
    let bus = CanBus::open(Box::new(SimulatedCanDevice::new()), 500_000, false).unwrap();
    let outcome = read(&bus, &PlanConfig::functional_11bit(), 150);
    assert!(matches!(outcome, ResponseOutcome::TimedOut));

    let dir = tempfile::tempdir().unwrap();
    let result_dir = dir.path().join("result");
    let store = TemplateStore::new(dir.path().join("format"), &result_dir);
    assert!(matches!(
        store.annotate(&outcome, FA13),
        Err(AnnotateError::NoData)
    ));
    assert!(!result_dir.exists());
}

#[test]
fn transport_failures_are_reported() {
    init_logger();
    for (fault, extended) in [(SimulatedFault::Write, false), (SimulatedFault::Read, true)] {
        let dev = SimulatedCanDevice::new().with_fault(fault);
        let bus = CanBus::open(Box::new(dev), 500_000, extended).unwrap();
        let plan = if extended {
            PlanConfig::functional_29bit()
        } else {
            PlanConfig::physical_11bit()
        };
        let outcome = read(&bus, &plan, 200);
        match (fault, outcome) {
            (SimulatedFault::Write, ResponseOutcome::TransportError(ChannelError::IOError(_))) => {}
            (SimulatedFault::Read, ResponseOutcome::TransportError(ChannelError::APIError { .. })) => {}
            (f, o) => panic!("{f:?} produced {o:?}"),
        }
        assert_eq!(bus.listener_count(), 0);
    }
}

fn write_templates(format_dir: &Path) {
    fs::create_dir_all(format_dir).unwrap();
    fs::write(format_dir.join("did_fa13.csv"), "No,Name\n1,a\n2,b\n3,c\n").unwrap();
    fs::write(format_dir.join("README.md"), "# Data identifiers\n").unwrap();
}

#[test]
fn session_reads_and_annotates() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let format_dir = dir.path().join("format");
    let result_dir = dir.path().join("result");
    write_templates(&format_dir);

    let cfg = ReaderConfig::from_toml(&format!(
        r#"
        dids = [0xFA13, 0xFA14]

        [timing]
        response_timeout_ms = 200

        [templates]
        format_dir = '{}'
        result_dir = '{}'

        [[plans]]
        mode = "physical-11bit"
        "#,
        format_dir.display(),
        result_dir.display()
    ))
    .unwrap();
    cfg.validate().unwrap();

    let ecu = SimulatedEcu::normal_11bit("ecu", 0x7F1, 0x7F9).on_request(|req| match req {
        [0x22, 0xFA, 0x13] => vec![ScriptedResponse::now(&[0x62, 0xFA, 0x13, 0x05, 0x06])],
        _ => Vec::new(),
    });
    let bus = CanBus::open(Box::new(SimulatedCanDevice::new().with_ecu(ecu)), 500_000, false)
        .unwrap();

    let report = ReadSession::new(&bus, &cfg).run(&cfg.plans, &cfg.dids);
    assert_eq!(report.reads.len(), 2);
    assert_eq!(report.received(), 1);

    let fa13 = report.reads[0].annotation.as_ref().unwrap();
    assert_eq!(fa13.key, "fa13");
    assert_eq!((fa13.rows, fa13.annotated_rows), (3, 2));
    assert_eq!(
        fs::read_to_string(result_dir.join("did_fa13.csv")).unwrap(),
        "No,Name,Raw value\r\n1,a,5\r\n2,b,6\r\n3,c,N/A\r\n"
    );
    assert!(matches!(
        report.reads[1].annotation,
        Err(AnnotateError::NoData)
    ));
    assert!(!result_dir.join("did_fa14.csv").exists());

    assert_eq!(report.readme.as_ref().unwrap(), &result_dir.join("README.md"));
    assert_eq!(
        fs::read_to_string(result_dir.join("README.md")).unwrap(),
        "# Data identifiers\n"
    );
    // Template is left untouched
    assert_eq!(
        fs::read_to_string(format_dir.join("did_fa13.csv")).unwrap(),
        "No,Name\n1,a\n2,b\n3,c\n"
    );
    bus.shutdown().unwrap();
}

#[test]
fn header_only_payload_marks_every_row() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let format_dir = dir.path().join("format");
    write_templates(&format_dir);
    let store = TemplateStore::new(&format_dir, dir.path().join("result"));

    let csv = store
        .annotate(&ResponseOutcome::Received(vec![0x62, 0xFA, 0x13]), FA13)
        .unwrap();
    assert_eq!(csv.annotated_rows, 0);
    assert_eq!(
        fs::read_to_string(&csv.path).unwrap(),
        "No,Name,Raw value\r\n1,a,N/A\r\n2,b,N/A\r\n3,c,N/A\r\n"
    );

    assert!(matches!(
        store.annotate(&ResponseOutcome::Received(vec![0x62, 0xF1, 0x90, 0x01]), 0xF190),
        Err(AnnotateError::MissingTemplate(_))
    ));
}
