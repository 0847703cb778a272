//! Deterministic state-machine tests driving `Sender` and `Receiver` directly with a manual
//! clock, so deadline and pacing behavior is asserted without wall-clock sleeps.

use core::time::Duration;

use can_frame_io::{Id, StandardId};
use can_tp::tx::FcFrame;
use can_tp::{
    Clock, FlowStatus, Progress, Receiver, RxFlowControl, RxOutcome, RxStorage, Segment, Sender,
    TimeoutKind, TpConfig, TpError,
};

/// Manual clock: instants are millisecond ticks supplied by the test.
#[derive(Clone, Copy, Debug)]
struct TestClock;

impl Clock for TestClock {
    type Instant = u64;

    fn now(&self) -> u64 {
        0
    }

    fn elapsed(&self, _earlier: u64) -> Duration {
        Duration::ZERO
    }

    fn add(&self, instant: u64, dur: Duration) -> u64 {
        instant + dur.as_millis() as u64
    }
}

/// Owned copy of an emitted segment, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Emitted {
    Single(Vec<u8>),
    First(u32, Vec<u8>),
    Consecutive(u8, Vec<u8>),
}

fn own(segment: &Segment<'_>) -> Emitted {
    match segment {
        Segment::Single { data, .. } => Emitted::Single(data.to_vec()),
        Segment::First { len, data } => Emitted::First(*len, data.to_vec()),
        Segment::Consecutive { sn, data } => Emitted::Consecutive(*sn, data.to_vec()),
        Segment::FlowControl { .. } => panic!("sender must not emit flow control"),
    }
}

fn test_cfg() -> TpConfig {
    TpConfig {
        tx_id: Id::Standard(StandardId::new(0x700).unwrap()),
        rx_id: Id::Standard(StandardId::new(0x708).unwrap()),
        n_bs: Duration::from_millis(100),
        n_cr: Duration::from_millis(100),
        wft_max: 2,
        ..TpConfig::default()
    }
}

type NoTransport = TpError<core::convert::Infallible>;

fn poll_collect(
    sender: &mut Sender<u64>,
    cfg: &TpConfig,
    payload: &[u8],
    now: u64,
    fc: &mut Option<FcFrame>,
) -> (Result<Progress, NoTransport>, Vec<Emitted>) {
    let mut emitted = Vec::new();
    let result = sender.poll(cfg, &TestClock, payload, now, fc, &mut |segment| {
        emitted.push(own(segment));
        Ok(())
    });
    (result, emitted)
}

fn cts(block_size: u8, st_min: u8) -> Option<FcFrame> {
    Some(FcFrame {
        status: FlowStatus::ClearToSend,
        block_size,
        st_min,
    })
}

#[test]
fn small_payload_is_one_single_frame() {
    let cfg = test_cfg();
    let mut sender = Sender::new();
    let mut fc = None;

    let (result, emitted) = poll_collect(&mut sender, &cfg, &[0xAA, 0xBB, 0xCC], 0, &mut fc);
    assert_eq!(result.unwrap(), Progress::Completed);
    assert_eq!(emitted, vec![Emitted::Single(vec![0xAA, 0xBB, 0xCC])]);
    assert!(sender.is_idle());
}

#[test]
fn fifteen_byte_pdu_is_ff_plus_two_cfs() {
    let cfg = test_cfg();
    let payload: Vec<u8> = (0..15).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 0, &mut fc);
    assert_eq!(result.unwrap(), Progress::WaitingForFlowControl);
    assert_eq!(emitted, vec![Emitted::First(15, payload[..6].to_vec())]);

    fc = cts(0, 0);
    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 1, &mut fc);
    assert_eq!(result.unwrap(), Progress::InFlight);
    assert_eq!(emitted, vec![Emitted::Consecutive(1, payload[6..13].to_vec())]);

    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 2, &mut fc);
    assert_eq!(result.unwrap(), Progress::Completed);
    assert_eq!(emitted, vec![Emitted::Consecutive(2, payload[13..].to_vec())]);
    assert!(sender.is_idle());
}

#[test]
fn sequence_nibble_wraps_mod_16() {
    let cfg = test_cfg();
    // 6 + 20 * 7 = 146 bytes: 20 consecutive frames, enough to wrap the nibble.
    let payload: Vec<u8> = (0..146u32).map(|v| v as u8).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    poll_collect(&mut sender, &cfg, &payload, 0, &mut fc).0.unwrap();
    fc = cts(0, 0);

    let mut nibbles = Vec::new();
    loop {
        let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 0, &mut fc);
        for e in &emitted {
            match e {
                Emitted::Consecutive(sn, _) => nibbles.push(*sn),
                other => panic!("unexpected segment {other:?}"),
            }
        }
        if result.unwrap() == Progress::Completed {
            break;
        }
    }
    assert_eq!(nibbles.len(), 20);
    for (i, sn) in nibbles.iter().enumerate() {
        assert_eq!(*sn, ((i + 1) & 0x0F) as u8);
    }
}

#[test]
fn st_min_paces_consecutive_frames() {
    let cfg = test_cfg();
    let payload: Vec<u8> = (0..30).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    poll_collect(&mut sender, &cfg, &payload, 0, &mut fc).0.unwrap();
    fc = cts(0, 10); // STmin 10 ms

    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 0, &mut fc);
    assert_eq!(result.unwrap(), Progress::InFlight);
    assert_eq!(emitted.len(), 1);

    // Before the pacing gap elapses nothing may be sent.
    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 5, &mut fc);
    assert_eq!(result.unwrap(), Progress::WouldBlock);
    assert!(emitted.is_empty());
    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 9, &mut fc);
    assert_eq!(result.unwrap(), Progress::WouldBlock);
    assert!(emitted.is_empty());

    // At exactly STmin the next frame goes out.
    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 10, &mut fc);
    assert_eq!(result.unwrap(), Progress::InFlight);
    assert_eq!(emitted.len(), 1);
}

#[test]
fn block_size_boundary_requests_new_flow_control() {
    let cfg = test_cfg();
    // 6 + 4 * 7 = 34 bytes: exactly 4 consecutive frames.
    let payload: Vec<u8> = (0..34).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    poll_collect(&mut sender, &cfg, &payload, 0, &mut fc).0.unwrap();
    fc = cts(2, 0);

    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 0, &mut fc);
    assert_eq!(result.unwrap(), Progress::InFlight);
    assert_eq!(emitted.len(), 1);
    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 0, &mut fc);
    // Exactly two frames per block, then the sender stops for flow control.
    assert_eq!(result.unwrap(), Progress::WaitingForFlowControl);
    assert_eq!(emitted.len(), 1);

    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 1, &mut fc);
    assert_eq!(result.unwrap(), Progress::WaitingForFlowControl);
    assert!(emitted.is_empty());

    fc = cts(2, 0);
    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 2, &mut fc);
    assert_eq!(result.unwrap(), Progress::InFlight);
    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 2, &mut fc);
    assert_eq!(result.unwrap(), Progress::Completed);
    assert_eq!(emitted.len(), 1);
}

#[test]
fn missing_flow_control_times_out_as_n_bs() {
    let cfg = test_cfg();
    let payload: Vec<u8> = (0..15).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    poll_collect(&mut sender, &cfg, &payload, 0, &mut fc).0.unwrap();

    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 99, &mut fc);
    assert_eq!(result.unwrap(), Progress::WaitingForFlowControl);

    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 100, &mut fc);
    assert_eq!(result, Err(TpError::Timeout(TimeoutKind::NBs)));
    assert!(sender.is_idle());
}

#[test]
fn wait_frames_extend_then_exhaust() {
    let cfg = test_cfg(); // wft_max = 2
    let payload: Vec<u8> = (0..15).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    poll_collect(&mut sender, &cfg, &payload, 0, &mut fc).0.unwrap();

    let wait = || {
        Some(FcFrame {
            status: FlowStatus::Wait,
            block_size: 0,
            st_min: 0,
        })
    };

    fc = wait();
    // Each Wait re-arms N_Bs from "now".
    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 90, &mut fc);
    assert_eq!(result.unwrap(), Progress::WaitingForFlowControl);
    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 150, &mut fc);
    assert_eq!(result.unwrap(), Progress::WaitingForFlowControl);

    fc = wait();
    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 160, &mut fc);
    assert_eq!(result.unwrap(), Progress::WaitingForFlowControl);

    // Third Wait exceeds wft_max.
    fc = wait();
    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 170, &mut fc);
    assert_eq!(result, Err(TpError::Timeout(TimeoutKind::NBs)));
}

#[test]
fn flow_control_overflow_aborts() {
    let cfg = test_cfg();
    let payload: Vec<u8> = (0..15).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    poll_collect(&mut sender, &cfg, &payload, 0, &mut fc).0.unwrap();
    fc = Some(FcFrame {
        status: FlowStatus::Overflow,
        block_size: 0,
        st_min: 0,
    });
    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 1, &mut fc);
    assert_eq!(result, Err(TpError::FlowOverflow));
    assert!(sender.is_idle());
}

#[test]
fn different_payload_while_in_flight_is_busy() {
    let cfg = test_cfg();
    let payload: Vec<u8> = (0..15).collect();
    let other: Vec<u8> = (0..20).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    poll_collect(&mut sender, &cfg, &payload, 0, &mut fc).0.unwrap();
    let (result, _) = poll_collect(&mut sender, &cfg, &other, 1, &mut fc);
    assert_eq!(result, Err(TpError::SessionBusy));
    // The original transfer survives.
    assert!(sender.is_waiting_for_fc());
}

#[test]
fn forced_tx_st_min_overrides_flow_control() {
    let mut cfg = test_cfg();
    cfg.force_tx_st_min = Some(Duration::from_millis(50));
    let payload: Vec<u8> = (0..30).collect();
    let mut sender = Sender::new();
    let mut fc = None;

    poll_collect(&mut sender, &cfg, &payload, 0, &mut fc).0.unwrap();
    fc = cts(0, 0); // peer says "as fast as possible"

    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 0, &mut fc);
    assert_eq!(result.unwrap(), Progress::InFlight);
    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 30, &mut fc);
    assert_eq!(result.unwrap(), Progress::WouldBlock);
    let (result, _) = poll_collect(&mut sender, &cfg, &payload, 50, &mut fc);
    assert_eq!(result.unwrap(), Progress::InFlight);
}

#[test]
fn long_pdu_uses_first_frame_escape() {
    let mut cfg = test_cfg();
    cfg.max_pdu_len = 6000;
    let payload = vec![0x5Au8; 5000];
    let mut sender = Sender::new();
    let mut fc = None;

    let (result, emitted) = poll_collect(&mut sender, &cfg, &payload, 0, &mut fc);
    assert_eq!(result.unwrap(), Progress::WaitingForFlowControl);
    match &emitted[0] {
        Emitted::First(len, data) => {
            assert_eq!(*len, 5000);
            // Escape header leaves two data bytes in a classic frame.
            assert_eq!(data.len(), 2);
        }
        other => panic!("expected first frame, got {other:?}"),
    }
}

// Receiver side.

fn rx_flow(block_size: u8, st_min: Duration) -> RxFlowControl {
    RxFlowControl { block_size, st_min }
}

#[test]
fn receiver_single_frame_completes_immediately() {
    let cfg = test_cfg();
    let mut receiver: Receiver<'_, u64> = Receiver::new(RxStorage::Owned(vec![0u8; 4095]));
    let outcome = receiver
        .on_segment(
            &cfg,
            &rx_flow(0, Duration::ZERO),
            &TestClock,
            0,
            Segment::Single {
                len: 3,
                data: &[0xAA, 0xBB, 0xCC],
            },
        )
        .unwrap();
    assert_eq!(outcome, RxOutcome::Completed(3));
    assert_eq!(receiver.take_completed(), &[0xAA, 0xBB, 0xCC]);
    assert!(receiver.is_idle());
}

#[test]
fn receiver_answers_first_frame_with_flow_control() {
    let cfg = test_cfg();
    let mut receiver: Receiver<'_, u64> = Receiver::new(RxStorage::Owned(vec![0u8; 4095]));
    let outcome = receiver
        .on_segment(
            &cfg,
            &rx_flow(4, Duration::from_millis(2)),
            &TestClock,
            0,
            Segment::First {
                len: 15,
                data: &[0, 1, 2, 3, 4, 5],
            },
        )
        .unwrap();
    assert_eq!(
        outcome,
        RxOutcome::SendFlowControl {
            status: FlowStatus::ClearToSend,
            block_size: 4,
            st_min: 2,
        }
    );
}

#[test]
fn skipped_sequence_nibble_is_a_sequence_error() {
    let cfg = test_cfg();
    let mut receiver: Receiver<'_, u64> = Receiver::new(RxStorage::Owned(vec![0u8; 4095]));
    let payload: Vec<u8> = (0..15).collect();
    receiver
        .on_segment(
            &cfg,
            &rx_flow(0, Duration::ZERO),
            &TestClock,
            0,
            Segment::First {
                len: 15,
                data: &payload[..6],
            },
        )
        .unwrap();

    // Expected nibble is 1; inject 3.
    let err = receiver.on_segment(
        &cfg,
        &rx_flow(0, Duration::ZERO),
        &TestClock,
        1,
        Segment::Consecutive {
            sn: 3,
            data: &payload[6..13],
        },
    );
    assert_eq!(err, Err(TpError::SequenceError));
    // Nothing is delivered and the machine is back to idle.
    assert!(receiver.is_idle());
    assert_eq!(receiver.take_completed(), &[] as &[u8]);
}

#[test]
fn receiver_block_boundary_emits_flow_control() {
    let cfg = test_cfg();
    let flow = rx_flow(2, Duration::ZERO);
    let mut receiver: Receiver<'_, u64> = Receiver::new(RxStorage::Owned(vec![0u8; 4095]));
    let payload: Vec<u8> = (0..34).collect();

    receiver
        .on_segment(
            &cfg,
            &flow,
            &TestClock,
            0,
            Segment::First {
                len: 34,
                data: &payload[..6],
            },
        )
        .unwrap();

    let o1 = receiver
        .on_segment(
            &cfg,
            &flow,
            &TestClock,
            1,
            Segment::Consecutive {
                sn: 1,
                data: &payload[6..13],
            },
        )
        .unwrap();
    assert_eq!(o1, RxOutcome::None);

    // Second frame of the block: grant the next block.
    let o2 = receiver
        .on_segment(
            &cfg,
            &flow,
            &TestClock,
            2,
            Segment::Consecutive {
                sn: 2,
                data: &payload[13..20],
            },
        )
        .unwrap();
    assert_eq!(
        o2,
        RxOutcome::SendFlowControl {
            status: FlowStatus::ClearToSend,
            block_size: 2,
            st_min: 0,
        }
    );

    receiver
        .on_segment(
            &cfg,
            &flow,
            &TestClock,
            3,
            Segment::Consecutive {
                sn: 3,
                data: &payload[20..27],
            },
        )
        .unwrap();
    let done = receiver
        .on_segment(
            &cfg,
            &flow,
            &TestClock,
            4,
            Segment::Consecutive {
                sn: 4,
                data: &payload[27..34],
            },
        )
        .unwrap();
    assert_eq!(done, RxOutcome::Completed(34));
    assert_eq!(receiver.take_completed(), payload.as_slice());
}

#[test]
fn n_cr_expiry_is_a_reception_timeout() {
    let cfg = test_cfg(); // n_cr = 100 ms
    let mut receiver: Receiver<'_, u64> = Receiver::new(RxStorage::Owned(vec![0u8; 4095]));
    receiver
        .on_segment(
            &cfg,
            &rx_flow(0, Duration::ZERO),
            &TestClock,
            0,
            Segment::First {
                len: 15,
                data: &[0, 1, 2, 3, 4, 5],
            },
        )
        .unwrap();

    assert_eq!(receiver.check_timeout(99), Ok(()));
    assert_eq!(
        receiver.check_timeout(100),
        Err(TpError::Timeout(TimeoutKind::NCr))
    );
    assert!(receiver.is_idle());
}

#[test]
fn listen_only_receiver_never_answers() {
    let mut cfg = test_cfg();
    cfg.listen_only = true;
    let mut receiver: Receiver<'_, u64> = Receiver::new(RxStorage::Owned(vec![0u8; 4095]));
    let payload: Vec<u8> = (0..15).collect();

    let outcome = receiver
        .on_segment(
            &cfg,
            &rx_flow(4, Duration::ZERO),
            &TestClock,
            0,
            Segment::First {
                len: 15,
                data: &payload[..6],
            },
        )
        .unwrap();
    assert_eq!(outcome, RxOutcome::None);

    let o1 = receiver
        .on_segment(
            &cfg,
            &rx_flow(4, Duration::ZERO),
            &TestClock,
            1,
            Segment::Consecutive {
                sn: 1,
                data: &payload[6..13],
            },
        )
        .unwrap();
    assert_eq!(o1, RxOutcome::None);

    let done = receiver
        .on_segment(
            &cfg,
            &rx_flow(4, Duration::ZERO),
            &TestClock,
            2,
            Segment::Consecutive {
                sn: 2,
                data: &payload[13..],
            },
        )
        .unwrap();
    assert_eq!(done, RxOutcome::Completed(15));
}

#[test]
fn oversized_announcement_is_a_buffer_overflow() {
    let mut cfg = test_cfg();
    cfg.max_pdu_len = 32;
    let mut receiver: Receiver<'_, u64> = Receiver::new(RxStorage::Owned(vec![0u8; 32]));
    let err = receiver.on_segment(
        &cfg,
        &rx_flow(0, Duration::ZERO),
        &TestClock,
        0,
        Segment::First {
            len: 100,
            data: &[0; 6],
        },
    );
    assert_eq!(err, Err(TpError::BufferOverflow));
}
