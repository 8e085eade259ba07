use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ecu_poller::{
    channel::IsoTPSettings,
    hardware::simulation::{SimulationBus, SimulationEcu},
    poller::{BusTask, PollReply, PollReplyHandler, PollerSettings, RequestOutcome},
};

struct Ignore;

impl PollReplyHandler for Ignore {
    fn on_reply(&mut self, _reply: &PollReply<'_>) {}
}

/// Large payloads in both directions between the poller and a simulated ECU
#[test]
fn multi_frame_both_directions() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();
    // ECU asks for blocks of 4 frames
    let _ecu = SimulationEcu::spawn(
        bus.create_channel("ecu"),
        0x7E0,
        0x7E8,
        IsoTPSettings {
            block_size: 4,
            st_min: 2,
            ..Default::default()
        },
        |req| {
            let mut resp = req.to_vec();
            resp[0] += 0x40;
            Some(resp)
        },
    )
    .unwrap();
    let task = BusTask::spawn(
        0,
        Box::new(bus.create_channel("poller")),
        PollerSettings {
            tick_period_ms: 20,
            response_separation_ms: 1,
            ..Default::default()
        },
        Arc::new(Mutex::new(Ignore)),
    )
    .unwrap();
    let handle = task.handle();

    for len in [1usize, 7, 8, 62, 300] {
        bus.clear_log();
        let mut request = vec![0x2E];
        request.extend((1..len).map(|x| x as u8));
        let outcome = handle
            .send_synchronous(0x7E0, 0x7E8, &request, Duration::from_secs(2))
            .unwrap();
        let mut expected = request.clone();
        expected[0] = 0x6E;
        assert_eq!(outcome, RequestOutcome::Success(expected), "length {len}");

        let sent = bus.frames_with_id(0x7E0);
        let first = sent[0].frame.get_data()[0] & 0xF0;
        if len <= 7 {
            assert_eq!(first, 0x00, "length {len} must be a single frame");
        } else {
            assert_eq!(first, 0x10, "length {len} must start with a first frame");
            // Sequence numbers 1..F, then wrapping to 0
            let seqs: Vec<u8> = sent
                .iter()
                .map(|f| f.frame.get_data()[0])
                .filter(|b| b & 0xF0 == 0x20)
                .map(|b| b & 0x0F)
                .collect();
            for (i, s) in seqs.iter().enumerate() {
                assert_eq!(*s as usize, (i + 1) % 16);
            }
            // Flow control once after the first frame, then once per block of 4
            let fcs = bus
                .frames_with_id(0x7E8)
                .iter()
                .filter(|f| f.frame.get_data()[0] == 0x30)
                .count();
            assert_eq!(fcs, 1 + (seqs.len() - 1) / 4);
        }
    }
}

#[test]
fn empty_request_is_rejected() {
    let bus = SimulationBus::new();
    let task = BusTask::spawn(
        0,
        Box::new(bus.create_channel("poller")),
        PollerSettings::default(),
        Arc::new(Mutex::new(Ignore)),
    )
    .unwrap();
    assert!(
        task.handle()
            .send_synchronous(0x7E0, 0x7E8, &[], Duration::from_millis(100))
            .is_err()
    );
}
