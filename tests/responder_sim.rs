use std::time::{Duration, Instant};

use ecu_poller::{
    channel::{CanChannel, IsoTPSettings},
    hardware::simulation::{SimulationBus, SimulationCanChannel},
    isotp::IsoTpEndpoint,
    obd2::{EcuResponder, PidBinding, PidFormat, ResponderSettings, ResponderTask},
};

/// Scan tool side: sends `request` to `tx_id` and waits for the response from `rx_id`
fn exchange(
    channel: &mut SimulationCanChannel,
    endpoint: &mut IsoTpEndpoint,
    tx_id: u32,
    rx_id: u32,
    request: &[u8],
) -> Option<Vec<u8>> {
    endpoint.send(tx_id, request, Instant::now()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        let now = Instant::now();
        if let Ok(frames) = channel.read_packets(16, 2) {
            for f in frames.iter().filter(|f| f.get_address() == rx_id) {
                if let Some(resp) = endpoint.on_frame(f, tx_id, now).unwrap() {
                    return Some(resp);
                }
            }
        }
        endpoint.poll(Instant::now()).unwrap();
        let out = endpoint.take_frames();
        if !out.is_empty() {
            channel.write_packets(out, 0).unwrap();
        }
    }
    None
}

fn tester(bus: &SimulationBus, st_min: u8) -> (SimulationCanChannel, IsoTpEndpoint) {
    let mut channel = bus.create_channel("tester");
    channel.open().unwrap();
    let endpoint = IsoTpEndpoint::new(
        0,
        IsoTPSettings {
            st_min,
            ..Default::default()
        },
    );
    (channel, endpoint)
}

/// 20 PIDs in one request, answered with a 44 byte reply that is sent as
/// 1 first frame and 6 consecutive frames, paced by the scan tool's STmin
#[test]
fn scenario_twenty_pid_request() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();

    let mut responder = EcuResponder::new(ResponderSettings::default());
    for pid in 0x04..=0x17u8 {
        responder.bind(pid, PidBinding::internal(move || pid as f32));
    }
    // 18 PIDs take 1 byte, 0x0C and 0x10 take 2. Make it 44 bytes in total
    responder.bind_with_format(0x12, PidBinding::internal(|| 0x1234 as f32), PidFormat::Word);
    let _task = ResponderTask::spawn(Box::new(bus.create_channel("responder")), responder).unwrap();

    let (mut channel, mut endpoint) = tester(&bus, 10);
    let mut request = vec![0x01];
    request.extend(0x04..=0x17u8);
    let resp = exchange(&mut channel, &mut endpoint, 0x7E0, 0x7E8, &request).unwrap();

    assert_eq!(resp.len(), 44);
    assert_eq!(resp[0], 0x41);
    assert_eq!(&resp[1..3], &[0x04, 0x0A]);
    let word = resp.windows(3).position(|w| w == [0x12, 0x12, 0x34]);
    assert!(word.is_some());

    let frames: Vec<_> = bus
        .frames_with_id(0x7E8)
        .into_iter()
        .filter(|f| f.frame.get_data()[0] & 0xF0 != 0x30)
        .collect();
    assert_eq!(frames.len(), 7);
    assert_eq!(&frames[0].frame.get_data()[..2], &[0x10, 44]);
    for (i, f) in frames[1..].iter().enumerate() {
        assert_eq!(f.frame.get_data()[0], 0x21 + i as u8);
    }
    for pair in frames[1..].windows(2) {
        let gap = pair[1].time.duration_since(pair[0].time);
        assert!(gap >= Duration::from_millis(9), "CF gap {gap:?} below STmin");
    }
    // Flow control for our multi-frame request
    assert!(
        bus.frames_with_id(0x7E8)
            .iter()
            .any(|f| f.frame.get_data()[0] == 0x30)
    );
}

#[test]
fn bindings_through_handle() {
    let _ = env_logger::try_init();
    let bus = SimulationBus::new();
    let task = ResponderTask::spawn(
        Box::new(bus.create_channel("responder")),
        EcuResponder::new(ResponderSettings {
            vin: "WVWZZZ1JZXW000001".into(),
            ..Default::default()
        }),
    )
    .unwrap();
    let handle = task.handle();
    let (mut channel, mut endpoint) = tester(&bus, 0);

    assert_eq!(
        exchange(&mut channel, &mut endpoint, 0x7DF, 0x7E8, &[0x01, 0x0D]),
        Some(vec![0x7F, 0x01, 0x31])
    );
    handle
        .bind(0x0D, PidBinding::internal(|| 88.0))
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(
        exchange(&mut channel, &mut endpoint, 0x7DF, 0x7E8, &[0x01, 0x0D]),
        Some(vec![0x41, 0x0D, 88])
    );

    let vin = exchange(&mut channel, &mut endpoint, 0x7DF, 0x7E8, &[0x09, 0x02]).unwrap();
    assert_eq!(&vin[3..], b"WVWZZZ1JZXW000001");

    handle.unbind(0x0D).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(
        exchange(&mut channel, &mut endpoint, 0x7DF, 0x7E8, &[0x01, 0x0D]),
        Some(vec![0x7F, 0x01, 0x31])
    );

    drop(task);
    assert!(handle.unbind(0x0D).is_err());
}
