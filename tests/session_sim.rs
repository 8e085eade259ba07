use std::sync::{Arc, Mutex};

use automotive_diag::uds::UdsSessionType;
use ecu_poller::{
    Standard,
    channel::IsoTPSettings,
    hardware::simulation::{SimulationBus, SimulationEcu},
    poller::{BusTask, PollReply, PollReplyHandler, PollerSettings, RequestOutcome},
    uds::{EcuAddress, SessionHelper, SessionOptions},
};

struct Ignore;

impl PollReplyHandler for Ignore {
    fn on_reply(&mut self, _reply: &PollReply<'_>) {}
}

const VIN: &[u8; 17] = b"WVWZZZ1JZXW000001";

fn setup(bus: &SimulationBus) -> (BusTask, SessionHelper) {
    let task = BusTask::spawn(
        0,
        Box::new(bus.create_channel("poller")),
        PollerSettings {
            tick_period_ms: 20,
            ..Default::default()
        },
        Arc::new(Mutex::new(Ignore)),
    )
    .unwrap();
    let helper = SessionHelper::new(
        vec![task.handle()],
        SessionOptions {
            tick_ms: 10,
            timeout_ticks: 15,
            step_delay_ms: 5,
            ..Default::default()
        },
    );
    (task, helper)
}

fn spawn_ecu(bus: &SimulationBus) -> SimulationEcu {
    SimulationEcu::spawn(
        bus.create_channel("ecu"),
        0x7E0,
        0x7E8,
        IsoTPSettings::default(),
        |req| match req {
            [0x10, mode] => Some(vec![0x50, *mode, 0x00, 0x32, 0x01, 0xF4]),
            [0x22, 0xF1, 0x90] => {
                let mut resp = vec![0x62, 0xF1, 0x90];
                resp.extend_from_slice(VIN);
                Some(resp)
            }
            [0x22, ..] => Some(vec![0x7F, 0x22, 0x31]),
            _ => None,
        },
    )
    .unwrap()
}

/// Frames sent by the poller with the given ISO-TP single frame payload
fn count_requests(bus: &SimulationBus, payload: &[u8]) -> usize {
    bus.frames_with_id(0x7E0)
        .iter()
        .filter(|f| {
            let d = f.frame.get_data();
            d[0] as usize == payload.len() && d[1..].starts_with(payload)
        })
        .count()
}

/// An ECU that never answers the session switch: the request times out,
/// and the ECU is still asked to return to the default session
#[test]
fn scenario_session_switch_timeout() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();
    let (_task, helper) = setup(&bus);
    let ecu = EcuAddress::obd(0, 0x7E0);

    let outcome = helper
        .run_in_session(ecu, &[0x22, 0xF1, 0x90], Standard(UdsSessionType::Extended))
        .unwrap();
    assert_eq!(outcome, RequestOutcome::Timeout);
    assert_eq!(count_requests(&bus, &[0x10, 0x03]), 1);
    assert_eq!(count_requests(&bus, &[0x10, 0x01]), 1);
    // The service itself is never sent
    assert_eq!(count_requests(&bus, &[0x22, 0xF1, 0x90]), 0);
    assert_eq!(helper.tester_present_remaining(ecu), 0);
}

#[test]
fn run_in_session() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();
    let _ecu = spawn_ecu(&bus);
    let (_task, helper) = setup(&bus);
    let ecu = EcuAddress::obd(0, 0x7E0);

    let outcome = helper
        .run_in_session(ecu, &[0x22, 0xF1, 0x90], Standard(UdsSessionType::Extended))
        .unwrap();
    let RequestOutcome::Success(resp) = outcome else {
        panic!("Unexpected outcome {outcome:?}");
    };
    assert_eq!(&resp[..3], &[0x62, 0xF1, 0x90]);
    assert_eq!(&resp[3..], VIN);

    assert_eq!(count_requests(&bus, &[0x10, 0x03]), 1);
    assert_eq!(count_requests(&bus, &[0x10, 0x01]), 1);
    assert_eq!(count_requests(&bus, &[0x3E, 0x80]), 2);

    // Order on the bus: session switch, service, back to default
    let log = bus.frames_with_id(0x7E0);
    let pos = |payload: &[u8]| {
        log.iter()
            .position(|f| f.frame.get_data()[1..].starts_with(payload))
            .unwrap()
    };
    assert!(pos(&[0x10, 0x03]) < pos(&[0x22, 0xF1, 0x90]));
    assert!(pos(&[0x22, 0xF1, 0x90]) < pos(&[0x10, 0x01]));
}

#[test]
fn negative_response_inside_session() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();
    let _ecu = spawn_ecu(&bus);
    let (_task, helper) = setup(&bus);
    let ecu = EcuAddress::obd(0, 0x7E0);

    let outcome = helper
        .run_in_session(ecu, &[0x22, 0x01, 0x01], Standard(UdsSessionType::Extended))
        .unwrap();
    assert_eq!(outcome, RequestOutcome::NegativeResponse(0x31));
    assert_eq!(count_requests(&bus, &[0x10, 0x01]), 1);
}

#[test]
fn enter_extended_session_keeps_alive() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();
    let _ecu = spawn_ecu(&bus);
    let (_task, helper) = setup(&bus);
    let ecu = EcuAddress::obd(0, 0x7E0);

    let outcome = helper.enter_extended_session(ecu).unwrap();
    assert_eq!(
        outcome,
        RequestOutcome::Success(vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4])
    );
    assert_eq!(
        helper.tester_present_remaining(ecu),
        helper.options().keepalive_seconds
    );

    // No keep-alive for an ECU that did not switch
    let silent = EcuAddress::obd(0, 0x7E1);
    assert_eq!(
        helper.enter_extended_session(silent).unwrap(),
        RequestOutcome::Timeout
    );
    assert_eq!(helper.tester_present_remaining(silent), 0);
}
