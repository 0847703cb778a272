//! Multi-peer session table behavior over the mock bus.

use std::time::{Duration, Instant};

use can_frame_io::SplitTxRx;
use can_frame_mock::{BusHandle, MockCan, MockFrame, MockRx, MockTx};
use can_tp::address::fixed29;
use can_tp::{
    Progress, RxStorage, SessionMux, StdClock, TpConfig, TpNode, rx_storages_from_buffers,
};

const MAX_PDU: usize = 256;

fn base_cfg() -> TpConfig {
    TpConfig {
        max_pdu_len: MAX_PDU,
        block_size: 4,
        n_bs: Duration::from_millis(500),
        n_cr: Duration::from_millis(500),
        ..TpConfig::default()
    }
}

fn peer_cfg(local: u8, remote: u8) -> TpConfig {
    TpConfig {
        tx_id: fixed29::encode_phys_id(remote, local),
        rx_id: fixed29::encode_phys_id(local, remote),
        max_pdu_len: MAX_PDU,
        block_size: 4,
        n_bs: Duration::from_millis(500),
        n_cr: Duration::from_millis(500),
        ..TpConfig::default()
    }
}

fn peer_node(
    bus: &BusHandle,
    local: u8,
    remote: u8,
) -> TpNode<'static, MockTx, MockRx, MockFrame, StdClock> {
    let (tx, rx) = MockCan::new_with_bus(bus, vec![]).unwrap().split();
    TpNode::with_std_clock(tx, rx, peer_cfg(local, remote), RxStorage::Owned(vec![0u8; MAX_PDU]))
        .unwrap()
}

#[test]
fn two_peers_reassemble_independently() {
    let bus = BusHandle::new();
    let mut bufs = [[0u8; MAX_PDU]; 4];
    let storages = rx_storages_from_buffers(&mut bufs);
    let (tx, rx) = MockCan::new_with_bus(&bus, vec![]).unwrap().split();
    let mut mux: SessionMux<'_, _, _, _, _, 4> =
        SessionMux::new(tx, rx, base_cfg(), StdClock, 0x10, storages).unwrap();

    let mut peer_a = peer_node(&bus, 0x20, 0x10);
    let mut peer_b = peer_node(&bus, 0x30, 0x10);

    let payload_a: Vec<u8> = (0..60u16).map(|v| (v & 0xFF) as u8).collect();
    let payload_b: Vec<u8> = (100..180u16).map(|v| (v & 0xFF) as u8).collect();

    let mut done_a = false;
    let mut done_b = false;
    let mut delivered: Vec<(u8, Vec<u8>)> = Vec::new();
    let start = Instant::now();

    // Interleave both senders so their consecutive frames mix on the bus.
    while !(done_a && done_b && delivered.len() == 2) {
        assert!(start.elapsed() < Duration::from_secs(5), "transfers stuck");
        let now = Instant::now();

        if !done_a
            && matches!(
                peer_a.poll_send(&payload_a, now).expect("peer a poll"),
                Progress::Completed
            )
        {
            done_a = true;
        }
        if !done_b
            && matches!(
                peer_b.poll_send(&payload_b, now).expect("peer b poll"),
                Progress::Completed
            )
        {
            done_b = true;
        }
        mux.poll_recv(now, &mut |reply_to, data| {
            delivered.push((reply_to, data.to_vec()));
        })
        .expect("mux poll");
    }

    delivered.sort_by_key(|(reply_to, _)| *reply_to);
    assert_eq!(delivered[0], (0x20, payload_a));
    assert_eq!(delivered[1], (0x30, payload_b));
}

#[test]
fn mux_sends_to_a_peer() {
    let bus = BusHandle::new();
    let mut bufs = [[0u8; MAX_PDU]; 2];
    let storages = rx_storages_from_buffers(&mut bufs);
    let (tx, rx) = MockCan::new_with_bus(&bus, vec![]).unwrap().split();
    let mut mux: SessionMux<'_, _, _, _, _, 2> =
        SessionMux::new(tx, rx, base_cfg(), StdClock, 0x10, storages).unwrap();

    let mut peer = peer_node(&bus, 0x44, 0x10);

    let payload: Vec<u8> = (0..50u8).collect();
    let mut delivered = Vec::new();
    let mut send_done = false;
    let mut recv_done = false;
    let start = Instant::now();

    while !(send_done && recv_done) {
        assert!(start.elapsed() < Duration::from_secs(5), "transfer stuck");
        let now = Instant::now();

        if !send_done
            && matches!(
                mux.poll_send_to(0x44, &payload, now).expect("mux send"),
                Progress::Completed
            )
        {
            send_done = true;
        }
        match peer.poll_recv(now, &mut |data| delivered = data.to_vec()) {
            Ok(Progress::Completed) => recv_done = true,
            Ok(_) => {}
            Err(err) => panic!("peer recv: {err:?}"),
        }
    }
    assert_eq!(delivered, payload);
}

#[test]
fn sessions_are_created_lazily_and_released() {
    let bus = BusHandle::new();
    let mut bufs = [[0u8; MAX_PDU]; 1];
    let storages = rx_storages_from_buffers(&mut bufs);
    let (tx, rx) = MockCan::new_with_bus(&bus, vec![]).unwrap().split();
    let mut mux: SessionMux<'_, _, _, _, _, 1> =
        SessionMux::new(tx, rx, base_cfg(), StdClock, 0x10, storages).unwrap();

    // With a single slot, two peers can still talk one after the other because terminal
    // sessions give their slot back.
    for remote in [0x20u8, 0x30u8] {
        let mut peer = peer_node(&bus, remote, 0x10);
        let payload: Vec<u8> = (0..40u8).collect();

        let mut got: Option<(u8, Vec<u8>)> = None;
        let mut send_done = false;
        let start = Instant::now();
        while !(send_done && got.is_some()) {
            assert!(start.elapsed() < Duration::from_secs(5), "transfer stuck");
            let now = Instant::now();
            if !send_done
                && matches!(
                    peer.poll_send(&payload, now).expect("peer send"),
                    Progress::Completed
                )
            {
                send_done = true;
            }
            mux.poll_recv(now, &mut |reply_to, data| {
                got = Some((reply_to, data.to_vec()));
            })
            .expect("mux recv");
        }
        assert_eq!(got, Some((remote, payload)));
    }
}

#[test]
fn functional_single_frame_reaches_all_listeners() {
    let bus = BusHandle::new();

    let mut bufs_a = [[0u8; MAX_PDU]; 2];
    let storages_a = rx_storages_from_buffers(&mut bufs_a);
    let (tx, rx) = MockCan::new_with_bus(&bus, vec![]).unwrap().split();
    let mut sender_mux: SessionMux<'_, _, _, _, _, 2> =
        SessionMux::new(tx, rx, base_cfg(), StdClock, 0x10, storages_a).unwrap();

    let mut bufs_b = [[0u8; MAX_PDU]; 2];
    let storages_b = rx_storages_from_buffers(&mut bufs_b);
    let (tx, rx) = MockCan::new_with_bus(&bus, vec![]).unwrap().split();
    let mut listener: SessionMux<'_, _, _, _, _, 2> =
        SessionMux::new(tx, rx, base_cfg(), StdClock, 0x21, storages_b)
            .unwrap()
            .with_functional_addr(0x33);

    sender_mux
        .send_functional_to(0x33, &[0x01, 0x02, 0x03], Duration::from_millis(100))
        .expect("functional send");

    let mut got = None;
    listener
        .recv(Duration::from_millis(200), &mut |reply_to, data| {
            got = Some((reply_to, data.to_vec()));
        })
        .expect("functional recv");
    assert_eq!(got, Some((0x10, vec![0x01, 0x02, 0x03])));
}
