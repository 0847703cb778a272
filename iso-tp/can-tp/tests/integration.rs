//! End-to-end transfers between two endpoints over the in-memory mock bus.

use std::time::{Duration, Instant};

use can_frame_io::{Id, SplitTxRx, StandardId};
use can_frame_mock::{BusHandle, MockCan, MockFrame, MockRx, MockTx};
use can_tp::{
    Progress, RxStorage, StdClock, TimeoutKind, TpConfig, TpError, TpNode,
};
use embedded_can::Frame;

fn cfg(tx: u16, rx: u16, block_size: u8) -> TpConfig {
    TpConfig {
        tx_id: Id::Standard(StandardId::new(tx).unwrap()),
        rx_id: Id::Standard(StandardId::new(rx).unwrap()),
        block_size,
        st_min: Duration::from_millis(0),
        wft_max: 3,
        max_pdu_len: 256,
        n_bs: Duration::from_millis(500),
        n_cr: Duration::from_millis(500),
        ..TpConfig::default()
    }
}

fn node_on(
    bus: &BusHandle,
    cfg: TpConfig,
) -> TpNode<'static, MockTx, MockRx, MockFrame, StdClock> {
    let capacity = cfg.max_pdu_len;
    let (tx, rx) = MockCan::new_with_bus(bus, vec![]).unwrap().split();
    TpNode::with_std_clock(tx, rx, cfg, RxStorage::Owned(vec![0u8; capacity])).unwrap()
}

/// Drive sender and receiver until both finish (multi-frame transfers need interleaved polling
/// so flow control can be generated and consumed).
fn pump(
    sender: &mut TpNode<'static, MockTx, MockRx, MockFrame, StdClock>,
    receiver: &mut TpNode<'static, MockTx, MockRx, MockFrame, StdClock>,
    payload: &[u8],
) -> Vec<u8> {
    let mut delivered = Vec::new();
    let mut send_done = false;
    let mut recv_done = false;
    let start = Instant::now();
    let mut iterations = 0;

    while !(send_done && recv_done) {
        iterations += 1;
        assert!(iterations < 10_000, "state machine stuck");
        let now = Instant::now();

        if !send_done
            && matches!(
                sender.poll_send(payload, now).expect("send progress"),
                Progress::Completed
            )
        {
            send_done = true;
        }
        match receiver.poll_recv(now, &mut |data| delivered = data.to_vec()) {
            Ok(Progress::Completed) => recv_done = true,
            Ok(_) => {}
            Err(err) => panic!("recv error: {err:?}"),
        }

        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timeout waiting for completion"
        );
    }
    delivered
}

#[test]
fn single_frame_roundtrip() {
    let bus = BusHandle::new();
    let mut sender = node_on(&bus, cfg(0x100, 0x101, 0));
    let mut receiver = node_on(&bus, cfg(0x101, 0x100, 0));

    let delivered = pump(&mut sender, &mut receiver, &[0xAA, 0xBB, 0xCC]);
    assert_eq!(delivered, vec![0xAA, 0xBB, 0xCC]);
}

#[test]
fn single_frame_emits_exactly_one_frame() {
    let bus = BusHandle::new();
    let mut tap = bus.add_interface(vec![]).unwrap();
    let mut sender = node_on(&bus, cfg(0x110, 0x111, 0));

    sender
        .send(&[0xAA, 0xBB, 0xCC], Duration::from_millis(200))
        .expect("send");

    use can_frame_io::RxFrameIo;
    let frame = tap.try_recv().expect("one frame on the bus");
    assert_eq!(frame.data(), &[0x03, 0xAA, 0xBB, 0xCC]);
    assert!(tap.try_recv().is_err(), "no extra frames expected");
}

#[test]
fn empty_payload_roundtrip() {
    let bus = BusHandle::new();
    let mut sender = node_on(&bus, cfg(0x120, 0x121, 0));
    let mut receiver = node_on(&bus, cfg(0x121, 0x120, 0));

    let delivered = pump(&mut sender, &mut receiver, &[]);
    assert_eq!(delivered, Vec::<u8>::new());
}

#[test]
fn multi_frame_with_flow_control() {
    let bus = BusHandle::new();
    let mut sender = node_on(&bus, cfg(0x200, 0x201, 4));
    let mut receiver = node_on(&bus, cfg(0x201, 0x200, 4));

    let payload: Vec<u8> = (0u8..20).collect();
    let delivered = pump(&mut sender, &mut receiver, &payload);
    assert_eq!(delivered, payload);
}

#[test]
fn payload_lengths_across_the_segmentation_boundary() {
    let bus = BusHandle::new();
    let mut sender = node_on(&bus, cfg(0x210, 0x211, 2));
    let mut receiver = node_on(&bus, cfg(0x211, 0x210, 2));

    for len in [1usize, 6, 7, 8, 13, 14, 15, 62, 63, 64, 255] {
        let payload: Vec<u8> = (0..len).map(|v| (v & 0xFF) as u8).collect();
        let delivered = pump(&mut sender, &mut receiver, &payload);
        assert_eq!(delivered, payload, "length {len}");
    }
}

#[test]
fn extended_addressing_roundtrip() {
    let bus = BusHandle::new();
    let mut cfg_a = cfg(0x300, 0x301, 0);
    cfg_a.tx_addr = Some(0xAA);
    cfg_a.rx_addr = Some(0x55);
    let mut cfg_b = cfg(0x301, 0x300, 0);
    cfg_b.tx_addr = Some(0x55);
    cfg_b.rx_addr = Some(0xAA);

    let mut sender = node_on(&bus, cfg_a);
    let mut receiver = node_on(&bus, cfg_b);

    let payload: Vec<u8> = (0u8..40).collect();
    let delivered = pump(&mut sender, &mut receiver, &payload);
    assert_eq!(delivered, payload);
}

#[test]
fn back_to_back_transfers_on_one_session() {
    let bus = BusHandle::new();
    let mut sender = node_on(&bus, cfg(0x400, 0x401, 4));
    let mut receiver = node_on(&bus, cfg(0x401, 0x400, 4));

    let payload1: Vec<u8> = (0..120u16).map(|v| (v & 0xFF) as u8).collect();
    let payload2: Vec<u8> = (120..260u16).map(|v| (v & 0xFF) as u8).collect();

    assert_eq!(pump(&mut sender, &mut receiver, &payload1), payload1);
    assert_eq!(pump(&mut sender, &mut receiver, &payload2), payload2);
}

#[test]
fn unrelated_bus_noise_is_ignored() {
    let bus = BusHandle::new();
    let noise = bus.add_interface(vec![]).unwrap();
    let mut sender = node_on(&bus, cfg(0x500, 0x501, 4));
    let mut receiver = node_on(&bus, cfg(0x501, 0x500, 4));

    let payload: Vec<u8> = (0..96u16).map(|v| (v & 0xFF) as u8).collect();
    let mut delivered = Vec::new();
    let mut send_done = false;
    let mut recv_done = false;
    let mut iterations = 0;

    while !(send_done && recv_done) {
        iterations += 1;
        assert!(iterations < 10_000, "stuck during noise test");
        let now = Instant::now();

        if iterations % 3 == 0 {
            let noise_frame = MockFrame::new(
                Id::Standard(StandardId::new(0x777).unwrap()),
                &[0xDE, 0xAD, 0xBE, 0xEF],
            )
            .unwrap();
            noise.transmit(noise_frame).unwrap();
        }

        if !send_done
            && matches!(
                sender.poll_send(&payload, now).expect("send poll"),
                Progress::Completed
            )
        {
            send_done = true;
        }
        match receiver.poll_recv(now, &mut |data| delivered = data.to_vec()) {
            Ok(Progress::Completed) => recv_done = true,
            Ok(_) => {}
            Err(err) => panic!("recv failed under noise: {err:?}"),
        }
    }
    assert_eq!(delivered, payload);
}

#[test]
fn silent_peer_times_out_waiting_for_flow_control() {
    let bus = BusHandle::new();
    // A passive interface keeps the bus alive but never answers.
    let _peer = bus.add_interface(vec![]).unwrap();
    let mut config = cfg(0x600, 0x601, 0);
    config.n_bs = Duration::from_millis(50);
    let mut sender = node_on(&bus, config);

    let payload: Vec<u8> = (0..64u16).map(|v| (v & 0xFF) as u8).collect();
    let err = sender.send(&payload, Duration::from_secs(1));
    assert!(matches!(err, Err(TpError::Timeout(TimeoutKind::NBs))));
}

#[test]
fn blocking_recv_times_out_without_sender() {
    let bus = BusHandle::new();
    let mut receiver = node_on(&bus, cfg(0x610, 0x611, 0));

    let err = receiver.recv(Duration::from_millis(50), &mut |_| {});
    assert!(matches!(err, Err(TpError::Timeout(TimeoutKind::NAr))));
}

#[test]
fn receiver_overflow_aborts_both_sides() {
    let bus = BusHandle::new();
    let mut sender = node_on(&bus, cfg(0x620, 0x621, 4));
    let mut receiver = {
        let mut config = cfg(0x621, 0x620, 4);
        config.max_pdu_len = 8;
        node_on(&bus, config)
    };

    let payload: Vec<u8> = (0..32u16).map(|v| (v & 0xFF) as u8).collect();
    let start = Instant::now();
    let mut send_err = None;
    let mut recv_err = None;

    while (send_err.is_none() || recv_err.is_none()) && start.elapsed() < Duration::from_secs(2) {
        let now = Instant::now();
        if send_err.is_none() {
            match sender.poll_send(&payload, now) {
                Ok(_) => {}
                Err(err) => send_err = Some(err),
            }
        }
        if recv_err.is_none() {
            match receiver.poll_recv(now, &mut |_| {}) {
                Ok(_) => {}
                Err(err) => recv_err = Some(err),
            }
        }
    }

    assert!(matches!(recv_err, Some(TpError::BufferOverflow)));
    assert!(matches!(send_err, Some(TpError::FlowOverflow)));
}

#[test]
fn new_first_frame_aborts_a_send_awaiting_flow_control() {
    let bus = BusHandle::new();
    let peer = bus.add_interface(vec![]).unwrap();
    let mut sender = node_on(&bus, cfg(0x700, 0x701, 0));

    let payload: Vec<u8> = (0u8..20).collect();
    let now = Instant::now();
    assert_eq!(
        sender.poll_send(&payload, now).unwrap(),
        Progress::WaitingForFlowControl
    );

    // The peer starts its own transfer instead of answering with flow control.
    let ff = MockFrame::new(
        Id::Standard(StandardId::new(0x701).unwrap()),
        &[0x10, 0x14, 1, 2, 3, 4, 5, 6],
    )
    .unwrap();
    peer.transmit(ff).unwrap();

    let err = sender.poll_send(&payload, Instant::now());
    assert!(matches!(err, Err(TpError::UnexpectedFrame)));
}

#[test]
fn fd_frames_carry_larger_chunks() {
    let bus = BusHandle::new();
    let mut cfg_a = cfg(0x710, 0x711, 0);
    cfg_a.frame_len = 64;
    let mut cfg_b = cfg(0x711, 0x710, 0);
    cfg_b.frame_len = 64;

    let mut tap = bus.add_interface(vec![]).unwrap();
    let mut sender = node_on(&bus, cfg_a);
    let mut receiver = node_on(&bus, cfg_b);

    // 40 bytes fit one FD single frame (escape length byte).
    let payload: Vec<u8> = (0u8..40).collect();
    let delivered = pump(&mut sender, &mut receiver, &payload);
    assert_eq!(delivered, payload);

    use can_frame_io::RxFrameIo;
    let frame = tap.try_recv().expect("frame visible on tap");
    assert_eq!(frame.data()[0], 0x00);
    assert_eq!(frame.data()[1], 40);
}

#[test]
fn escape_length_pdu_beyond_4095_bytes() {
    let bus = BusHandle::new();
    let mut cfg_a = cfg(0x720, 0x721, 0);
    cfg_a.max_pdu_len = 6000;
    let mut cfg_b = cfg(0x721, 0x720, 0);
    cfg_b.max_pdu_len = 6000;

    let mut sender = node_on(&bus, cfg_a);
    let mut receiver = node_on(&bus, cfg_b);

    let payload: Vec<u8> = (0..5000u32).map(|v| (v & 0xFF) as u8).collect();
    let delivered = pump(&mut sender, &mut receiver, &payload);
    assert_eq!(delivered, payload);
}

#[test]
fn cancel_releases_the_session() {
    let bus = BusHandle::new();
    let _peer = bus.add_interface(vec![]).unwrap();
    let mut sender = node_on(&bus, cfg(0x730, 0x731, 0));

    let payload: Vec<u8> = (0u8..20).collect();
    let now = Instant::now();
    assert_eq!(
        sender.poll_send(&payload, now).unwrap(),
        Progress::WaitingForFlowControl
    );

    sender.cancel();

    // A fresh transfer starts from scratch after cancellation.
    let small = [0x01, 0x02];
    assert_eq!(
        sender.poll_send(&small, Instant::now()).unwrap(),
        Progress::Completed
    );
}
