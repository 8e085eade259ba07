use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use ecu_poller::{
    BusId, DiagError,
    channel::IsoTPSettings,
    hardware::simulation::{SimulationBus, SimulationEcu},
    isotp::IsoTpEndpoint,
    poller::{
        BusPoller, FailureReason, OperatingState, PollEntry, PollReply, PollReplyHandler,
        PollerSettings, Pollers, ServiceKind,
    },
};

#[derive(Default)]
struct Recorder {
    replies: Vec<(u32, u16, Vec<u8>)>,
    failures: Vec<FailureReason>,
}

impl PollReplyHandler for Recorder {
    fn on_reply(&mut self, reply: &PollReply<'_>) {
        assert_eq!(reply.bytes_remaining, 0);
        self.replies
            .push((reply.responder, reply.pid, reply.payload.to_vec()));
    }

    fn on_failure(&mut self, _bus: BusId, _entry: &PollEntry, reason: FailureReason) {
        self.failures.push(reason);
    }
}

/// A multi-frame reply to a 16bit identifier request, reassembled from 7 frames,
/// is delivered exactly once and the entry honours its repeat period
#[test]
fn scenario_multi_frame_poll() {
    let _ = env_logger::try_init();
    let rec = Arc::new(Mutex::new(Recorder::default()));
    let mut poller = BusPoller::new(0, PollerSettings::default(), rec.clone());
    poller
        .set_pid_list(vec![PollEntry::new(
            0x7E4,
            0x7EC,
            ServiceKind::ReadDataByIdExtended,
            0x0101,
            &[0, 2],
        )])
        .unwrap();
    poller.set_state(OperatingState(1)).unwrap();

    let mut ecu = IsoTpEndpoint::new(0, IsoTPSettings::default());
    let t0 = Instant::now();

    let req = poller.tick(t0);
    assert_eq!(req.len(), 1);
    assert_eq!(req[0].get_address(), 0x7E4);
    let request = ecu.on_frame(&req[0], 0x7EC, t0).unwrap().unwrap();
    assert_eq!(request, vec![0x22, 0x01, 0x01]);

    let mut reply = vec![0x62, 0x01, 0x01];
    reply.extend((0..42u8).collect::<Vec<u8>>());
    ecu.send(0x7EC, &reply, t0).unwrap();

    let mut frames_from_ecu = 0;
    let mut now = t0;
    for _ in 0..20 {
        ecu.poll(now).unwrap();
        for f in ecu.take_frames() {
            frames_from_ecu += 1;
            for fc in poller.on_frame(&f, now) {
                assert_eq!(fc.get_address(), 0x7E4);
                assert_eq!(fc.get_data()[0], 0x30);
                ecu.on_frame(&fc, 0x7EC, now).unwrap();
            }
        }
        now += Duration::from_millis(25);
    }
    assert_eq!(frames_from_ecu, 7);
    assert!(rec.lock().unwrap().replies.is_empty());

    // Reply is dispatched on the next tick, the entry is not due again yet
    assert!(poller.tick(t0 + Duration::from_millis(1000)).is_empty());
    {
        let r = rec.lock().unwrap();
        assert_eq!(r.replies.len(), 1);
        assert_eq!(r.replies[0].0, 0x7EC);
        assert_eq!(r.replies[0].1, 0x0101);
        assert_eq!(r.replies[0].2, reply[3..].to_vec());
        assert!(r.failures.is_empty());
    }
    assert_eq!(poller.tick(t0 + Duration::from_millis(2000)).len(), 1);
    assert_eq!(rec.lock().unwrap().replies.len(), 1);
}

fn fast_settings() -> PollerSettings {
    PollerSettings {
        tick_period_ms: 20,
        response_timeout_ms: 200,
        ..Default::default()
    }
}

#[test]
fn threaded_pollers() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();
    let _ecu = SimulationEcu::spawn(
        bus.create_channel("ecu"),
        0x7E0,
        0x7E8,
        IsoTPSettings::default(),
        |req| match req {
            [0x01, 0x0C] => Some(vec![0x41, 0x0C, 0x1A, 0xF8]),
            _ => None,
        },
    )
    .unwrap();

    let rec = Arc::new(Mutex::new(Recorder::default()));
    let mut pollers = Pollers::new(rec.clone());
    pollers
        .add_bus(0, Box::new(bus.create_channel("poller")), fast_settings())
        .unwrap();

    pollers
        .set_pid_list(
            0,
            vec![PollEntry::new(0x7E0, 0x7E8, ServiceKind::ReadDataByPid, 0x0C, &[1])],
        )
        .unwrap();
    assert!(matches!(
        pollers.set_state(OperatingState(9)),
        Err(DiagError::StateOutOfRange { state: 9, count: 4 })
    ));
    assert!(matches!(pollers.handle(5), Err(DiagError::UnknownBus(5))));

    std::thread::sleep(Duration::from_millis(400));
    {
        let r = rec.lock().unwrap();
        assert!(r.replies.len() >= 3, "only {} replies", r.replies.len());
        assert!(r.replies.iter().all(|(id, pid, data)| *id == 0x7E8
            && *pid == 0x0C
            && data == &[0x1A, 0xF8]));
    }

    pollers.pause().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let paused_count = rec.lock().unwrap().replies.len();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(rec.lock().unwrap().replies.len(), paused_count);

    pollers.resume().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(rec.lock().unwrap().replies.len() > paused_count);

    let handle = pollers.handle(0).unwrap();
    pollers.shutdown();
    assert!(!handle.is_running());
    assert!(matches!(
        handle.set_throttling(2),
        Err(DiagError::PollerNotRunning(0))
    ));
}

#[test]
fn silent_ecu_fails_with_timeout() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();
    let rec = Arc::new(Mutex::new(Recorder::default()));
    let mut pollers = Pollers::new(rec.clone());
    pollers
        .add_bus(0, Box::new(bus.create_channel("poller")), fast_settings())
        .unwrap();
    pollers
        .set_pid_list(
            0,
            vec![PollEntry::new(0x7E2, 0x7EA, ServiceKind::ReadDataByPid, 0x0D, &[1])],
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(600));
    pollers.shutdown();

    let r = rec.lock().unwrap();
    assert!(r.replies.is_empty());
    assert!(!r.failures.is_empty());
    assert!(r.failures.iter().all(|f| *f == FailureReason::Timeout));
    // One request at a time: every request but the last one timed out before the next was sent
    let requests = bus.frames_with_id(0x7E2).len();
    assert!(requests <= r.failures.len() + 1);
}

#[test]
fn unsolicited_payload_must_fit_single_frame() {
    let bus = SimulationBus::new();
    let mut pollers = Pollers::new(Arc::new(Mutex::new(Recorder::default())));
    let handle = pollers
        .add_bus(0, Box::new(bus.create_channel("poller")), fast_settings())
        .unwrap();
    assert!(matches!(
        handle.send_unsolicited(0x7E4, &[0; 10]),
        Err(DiagError::ParameterInvalid(_))
    ));
    handle.send_unsolicited(0x7E4, &[0x3E, 0x80]).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    pollers.shutdown();
    let sent = bus.frames_with_id(0x7E4);
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0].frame.get_data()[0..3], &[0x02, 0x3E, 0x80]);
}
