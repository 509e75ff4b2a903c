//! Ring tests against the simulated DMA engine.

use std::{
    collections::VecDeque,
    sync::{Arc, Once},
};

use super::*;
use crate::mock::MockNic;

static INIT: Once = Once::new();

fn init_log() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

const MAC: [u8; 6] = [0x00, 0xab, 0xcd, 0xef, 0x80, 0x01];

fn config(rx_desc: usize, rx_bufs: usize, tx_desc: usize) -> NetDevConfig {
    NetDevConfig {
        rx_buf_size: 128,
        rx_buf_count: rx_bufs,
        rx_desc_count: rx_desc,
        tx_buf_size: 128,
        tx_buf_count: 8,
        tx_small_buf_count: 0,
        tx_desc_count: tx_desc,
        rx_alloc: AllocPolicy::NoWait,
        ..Default::default()
    }
}

fn started(cfg: NetDevConfig) -> (NetDevice<MockNic>, MockNic) {
    init_log();
    let nic = MockNic::new(MAC);
    let mut dev = NetDevice::new(nic.clone(), cfg, EventSignal::new()).unwrap();
    dev.start().unwrap();
    (dev, nic)
}

fn frame(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn received_bytes(frame: &RxFrame) -> Vec<u8> {
    let mut out = vec![0; frame.len()];
    assert_eq!(frame.copy_to(&mut out), frame.len());
    out
}

fn tx_buf(dev: &NetDevice<MockNic>, payload: &[u8]) -> NetBuf {
    let mut buf = dev.alloc_tx_buf(payload.len()).unwrap();
    buf.data_mut().copy_from_slice(payload);
    buf
}

/// Every pooled receive buffer is in exactly one place.
fn assert_rx_partition(dev: &NetDevice<MockNic>, held_by_task: usize) {
    let stats = dev.rx_stats();
    let pool = dev.rx_pool_stats();
    assert_eq!(
        stats.bound + stats.spares + stats.ready_bufs + stats.partial_bufs + pool.available
            + held_by_task,
        pool.capacity,
        "{stats:?} {pool:?}"
    );
}

#[test]
fn start_posts_every_descriptor() {
    let (dev, nic) = started(config(4, 10, 4));
    assert_eq!(nic.resets(), 1);
    assert!(nic.rx_enabled() && nic.tx_enabled());
    assert_eq!(dev.state(), DevState::Started);
    assert_eq!(
        dev.rx_census(),
        DescCensus {
            free: 0,
            posted: 4,
            completed: 0
        }
    );
    assert_eq!(dev.tx_census().free, 4);
    let stats = dev.rx_stats();
    assert_eq!(stats.bound, 4);
    assert_eq!(stats.spares, 6);
    assert_eq!(dev.rx_pool_stats().available, 0);
    assert_eq!(dev.mac(), MacAddress(MAC));
    assert_eq!(dev.name(), "mock-eth");
    assert_eq!(dev.irq(), Some(33));
}

#[test]
fn receive_single_frame() {
    let (dev, nic) = started(config(4, 6, 4));
    let bytes = frame(60, 7);
    assert!(nic.receive(&bytes));
    assert!(!dev.can_rx());

    let report = dev.handle_irq().unwrap();
    assert!(report.cause.contains(IrqCause::RX));
    assert_eq!(report.rx.frames, 1);
    assert_eq!(report.rx.descriptors, 1);
    assert_eq!(dev.signal().rx_notifications(), 1);
    assert_eq!(nic.rx_resumes(), 1);
    assert_eq!(dev.rx_cursor(), 1);
    assert!(dev.can_rx());

    let rx = dev.get_next_received_frame().unwrap();
    assert_eq!(rx.len(), 60);
    assert_eq!(rx.buffers().len(), 1);
    assert_eq!(received_bytes(&rx), bytes);
    assert_rx_partition(&dev, 1);
    assert!(dev.get_next_received_frame().is_none());

    drop(rx);
    // The next call tops the spare list up again.
    assert!(dev.get_next_received_frame().is_none());
    assert_eq!(dev.rx_stats().spares, 2);
    assert_rx_partition(&dev, 0);
}

#[test]
fn burst_with_two_spares_drops_the_third_frame() {
    let (dev, nic) = started(config(4, 6, 4));
    for seed in 0..3 {
        assert!(nic.receive(&frame(64, seed)));
    }

    let report = dev.handle_irq().unwrap();
    assert_eq!(report.rx.descriptors, 3);
    assert_eq!(report.rx.frames, 2);
    assert_eq!(report.rx.dropped, 1);

    let stats = dev.rx_stats();
    assert_eq!(stats.ready_frames, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.bound, 4);
    assert_eq!(dev.rx_census().posted, 4);
    assert_rx_partition(&dev, 0);

    let first = dev.get_next_received_frame().unwrap();
    let second = dev.get_next_received_frame().unwrap();
    assert_eq!(received_bytes(&first), frame(64, 0));
    assert_eq!(received_bytes(&second), frame(64, 1));
    assert!(dev.get_next_received_frame().is_none());
}

#[test]
fn damaged_frame_is_discarded_and_cursor_moves_on() {
    let (dev, nic) = started(config(4, 6, 4));
    assert!(nic.receive_damaged(&frame(64, 1)));
    assert!(nic.receive(&frame(64, 2)));

    let report = dev.handle_irq().unwrap();
    assert_eq!(report.rx.errors, 1);
    assert_eq!(report.rx.frames, 1);
    assert_eq!(dev.rx_cursor(), 2);

    let rx = dev.get_next_received_frame().unwrap();
    assert_eq!(received_bytes(&rx), frame(64, 2));
    assert_eq!(dev.rx_stats().errors, 1);
    assert_rx_partition(&dev, 1);
}

#[test]
fn frame_spanning_descriptors() {
    let (dev, nic) = started(config(4, 8, 4));
    let bytes = frame(300, 3);
    assert!(nic.receive(&bytes));

    let report = dev.handle_irq().unwrap();
    assert_eq!(report.rx.descriptors, 3);
    assert_eq!(report.rx.frames, 1);

    let rx = dev.get_next_received_frame().unwrap();
    assert_eq!(rx.len(), 300);
    let parts: Vec<usize> = rx.buffers().iter().map(NetBuf::data_len).collect();
    assert_eq!(parts, [128, 128, 44]);
    assert_eq!(received_bytes(&rx), bytes);
}

#[test]
fn spanning_frame_without_enough_spares_is_dropped_whole() {
    let (dev, nic) = started(config(4, 5, 4));
    assert!(nic.receive(&frame(300, 0)));
    let report = dev.handle_irq().unwrap();
    assert_eq!(report.rx.descriptors, 3);
    assert_eq!(report.rx.frames, 0);
    assert_eq!(report.rx.dropped, 1);
    assert_eq!(dev.rx_stats().spares, 1);
    assert_rx_partition(&dev, 0);

    // The ring is intact: the next small frame goes through.
    assert!(nic.receive(&frame(40, 9)));
    assert_eq!(dev.handle_irq().unwrap().rx.frames, 1);
    let rx = dev.get_next_received_frame().unwrap();
    assert_eq!(received_bytes(&rx), frame(40, 9));
}

#[test]
fn spurious_interrupt_is_a_no_op() {
    let (dev, nic) = started(config(4, 6, 4));
    nic.raise(IrqCause::RX);
    let report = dev.handle_irq().unwrap();
    assert_eq!(report.rx, RxHarvest::default());
    assert_eq!(dev.rx_cursor(), 0);
    assert_eq!(dev.signal().rx_notifications(), 0);
}

#[test]
fn out_of_order_completion_is_corruption() {
    let (mut dev, nic) = started(config(4, 6, 4));
    nic.complete_rx_at(2, 60);
    nic.raise(IrqCause::RX);

    assert_eq!(dev.handle_irq().unwrap_err(), DriverError::Corrupted);
    assert_eq!(dev.rx_cursor(), 0);
    assert_eq!(dev.rx_stats().corruptions, 1);
    assert_eq!(dev.rx_census().completed, 1);

    // A stop/start cycle resynchronizes ring and device.
    dev.stop().unwrap();
    dev.start().unwrap();
    assert_eq!(dev.rx_census().posted, 4);
    assert!(nic.receive(&frame(50, 5)));
    assert_eq!(dev.handle_irq().unwrap().rx.frames, 1);
}

#[test]
fn receive_stalls_when_ring_is_full() {
    let (dev, nic) = started(config(2, 4, 4));
    assert!(nic.receive(&frame(64, 0)));
    assert!(nic.receive(&frame(64, 1)));
    assert!(!nic.receive(&frame(64, 2)));
    assert_eq!(nic.rx_missed(), 1);

    let report = dev.handle_irq().unwrap();
    assert!(report.cause.contains(IrqCause::RX_STALLED));
    assert_eq!(report.rx.frames, 2);
    // Descriptors went straight back to the device.
    assert!(nic.receive(&frame(64, 3)));
}

#[test]
fn post_receive_buffer_rejects_posted_descriptor() {
    let (dev, _nic) = started(config(4, 6, 4));
    assert_eq!(dev.post_receive_buffer(0), Err(DriverError::BadState));
    assert_eq!(dev.post_receive_buffer(9), Err(DriverError::InvalidInput));
}

#[test]
fn post_receive_buffer_rejects_completed_descriptor() {
    let (dev, nic) = started(config(4, 6, 4));
    let first = frame(60, 1);
    let second = frame(70, 2);
    assert!(nic.receive(&first));
    assert!(nic.receive(&second));
    assert_eq!(dev.rx_census().completed, 2);

    assert_eq!(dev.post_receive_buffer(0), Err(DriverError::BadState));
    assert_eq!(dev.rx_census().completed, 2);
    assert_eq!(dev.rx_stats().spares, 2);

    let report = dev.handle_irq().unwrap();
    assert_eq!(report.rx.frames, 2);
    assert_eq!(dev.rx_stats().corruptions, 0);
    let rx = dev.get_next_received_frame().unwrap();
    assert_eq!(received_bytes(&rx), first);
    let rx = dev.get_next_received_frame().unwrap();
    assert_eq!(received_bytes(&rx), second);
}

#[test]
fn frames_before_a_corruption_are_still_delivered() {
    let (dev, nic) = started(config(4, 6, 4));
    let bytes = frame(60, 9);
    assert!(nic.receive(&bytes));
    nic.complete_rx_at(2, 60);
    nic.raise(IrqCause::RX);

    assert_eq!(dev.handle_irq().unwrap_err(), DriverError::Corrupted);
    let stats = dev.rx_stats();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.ready_frames, 1);
    assert_eq!(stats.corruptions, 1);
    assert_eq!(dev.rx_cursor(), 1);
    assert_eq!(dev.signal().rx_notifications(), 1);
    assert_eq!(nic.rx_resumes(), 1);

    let rx = dev.get_next_received_frame().unwrap();
    assert_eq!(received_bytes(&rx), bytes);
}

#[test]
fn receive_buffers_keep_the_index_offset() {
    let cfg = NetDevConfig {
        rx_buf_ix_offset: 2,
        ..config(4, 6, 4)
    };
    let (dev, nic) = started(cfg);
    assert_eq!(dev.rx_pool().buffer_len(), 130);
    // The device may still fill the whole configured size.
    let bytes = frame(128, 3);
    assert!(nic.receive(&bytes));
    assert_eq!(dev.handle_irq().unwrap().rx.frames, 1);

    let rx = dev.get_next_received_frame().unwrap();
    assert_eq!(rx.buffers().len(), 1);
    assert_eq!(rx.buffers()[0].headroom(), 2);
    assert_eq!(received_bytes(&rx), bytes);
}

#[test]
fn small_transmit_requests_use_the_small_pool() {
    let cfg = NetDevConfig {
        tx_small_buf_size: 60,
        tx_small_buf_count: 2,
        ..config(4, 6, 4)
    };
    let (dev, nic) = started(cfg);
    let small = dev.tx_small_pool().unwrap().clone();
    assert_eq!(small.buffer_len(), 60);

    let a = dev.alloc_tx_buf(40).unwrap();
    let b = dev.alloc_tx_buf(60).unwrap();
    assert!(Arc::ptr_eq(a.pool(), &small));
    assert!(Arc::ptr_eq(b.pool(), &small));
    assert_eq!(small.available(), 0);
    assert_eq!(dev.tx_pool().available(), 8);

    // Small pool exhausted, falls back to a large buffer.
    let c = dev.alloc_tx_buf(40).unwrap();
    assert!(Arc::ptr_eq(c.pool(), dev.tx_pool()));
    // Too big for a small buffer.
    drop(b);
    let d = dev.alloc_tx_buf(100).unwrap();
    assert!(Arc::ptr_eq(d.pool(), dev.tx_pool()));
    assert_eq!(small.available(), 1);
    assert_eq!(dev.tx_pool().available(), 6);
    assert_eq!(
        dev.alloc_tx_buf(129).unwrap_err(),
        DriverError::InvalidInput
    );
    drop((a, c, d));

    let payload = frame(42, 4);
    dev.transmit(tx_buf(&dev, &payload)).unwrap();
    assert_eq!(small.available(), 1);
    nic.process_tx(4);
    assert_eq!(nic.take_sent(), vec![payload]);
    dev.handle_irq().unwrap();
    assert_eq!(small.available(), 2);
}

#[test]
fn transmit_buffers_reserve_the_index_offset() {
    let cfg = NetDevConfig {
        tx_buf_ix_offset: 16,
        ..config(4, 6, 4)
    };
    let (dev, nic) = started(cfg);
    assert_eq!(dev.tx_pool().buffer_len(), 144);
    let buf = dev.alloc_tx_buf(128).unwrap();
    assert_eq!(buf.headroom(), 16);
    assert_eq!(buf.data_len(), 128);
    drop(buf);
    assert_eq!(
        dev.alloc_tx_buf(129).unwrap_err(),
        DriverError::InvalidInput
    );

    let payload = frame(90, 6);
    dev.transmit(tx_buf(&dev, &payload)).unwrap();
    nic.process_tx(4);
    assert_eq!(nic.take_sent(), vec![payload]);
}

#[test]
fn transmit_and_reclaim() {
    let (dev, nic) = started(config(4, 6, 4));
    let payload = frame(90, 11);
    dev.transmit(tx_buf(&dev, &payload)).unwrap();
    assert_eq!(nic.doorbells(), 1);
    assert_eq!(dev.tx_census().posted, 1);
    assert_eq!(dev.tx_pool().available(), 7);

    assert_eq!(nic.process_tx(8), 1);
    assert_eq!(nic.take_sent(), vec![payload]);
    assert_eq!(dev.tx_census().completed, 1);

    let report = dev.handle_irq().unwrap();
    assert_eq!(report.tx.descriptors, 1);
    assert_eq!(dev.signal().tx_notifications(), 1);
    assert_eq!(dev.tx_census().free, 4);
    assert_eq!(dev.tx_pool().available(), 8);
}

#[test]
fn busy_ring_hands_the_buffer_back() {
    let (dev, nic) = started(config(4, 6, 2));
    dev.transmit(tx_buf(&dev, b"one")).unwrap();
    dev.transmit(tx_buf(&dev, b"two")).unwrap();
    assert!(!dev.can_tx());

    let rejected = dev.transmit(tx_buf(&dev, b"three")).unwrap_err();
    assert!(rejected.is_busy());
    let buf = rejected.into_inner();
    assert_eq!(buf.data(), b"three");
    assert_eq!(dev.tx_stats().busy, 1);

    nic.process_tx(8);
    dev.handle_irq().unwrap();
    dev.transmit(buf).unwrap();
    nic.process_tx(8);
    assert_eq!(nic.take_sent(), vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
}

#[test]
fn doorbell_only_when_engine_idle() {
    let (dev, nic) = started(config(4, 6, 4));
    dev.transmit(tx_buf(&dev, b"a")).unwrap();
    dev.transmit(tx_buf(&dev, b"b")).unwrap();
    assert_eq!(nic.doorbells(), 1);

    assert_eq!(nic.process_tx(8), 2);
    dev.transmit(tx_buf(&dev, b"c")).unwrap();
    assert_eq!(nic.doorbells(), 2);
}

#[test]
fn multi_buffer_frame() {
    let (dev, nic) = started(config(4, 6, 4));
    let parts = [b"head".as_slice(), b"-body-".as_slice(), b"tail".as_slice()];
    let bufs: Vec<NetBuf> = parts.iter().map(|p| tx_buf(&dev, p)).collect();
    dev.transmit_frame(bufs).unwrap();
    assert_eq!(dev.tx_stats().in_flight, 3);

    // Not enough room for another two-part frame; all of it comes back.
    let more: Vec<NetBuf> = parts[..2].iter().map(|p| tx_buf(&dev, p)).collect();
    let rejected = dev.transmit_frame(more).unwrap_err();
    assert!(rejected.is_busy());
    assert_eq!(rejected.buf.len(), 2);
    drop(rejected);

    assert_eq!(nic.process_tx(8), 3);
    assert_eq!(nic.take_sent(), vec![b"head-body-tail".to_vec()]);
    assert_eq!(dev.handle_irq().unwrap().tx.descriptors, 3);
    assert_eq!(dev.tx_pool().available(), 8);
}

#[test]
fn transmit_error_is_counted() {
    let (dev, nic) = started(config(4, 6, 4));
    nic.fail_next_tx();
    dev.transmit(tx_buf(&dev, b"lost")).unwrap();
    nic.process_tx(8);
    let report = dev.handle_irq().unwrap();
    assert_eq!(report.tx.errors, 1);
    assert!(nic.take_sent().is_empty());
    assert_eq!(dev.tx_stats().errors, 1);
}

#[test]
fn stop_returns_every_buffer() {
    let (mut dev, nic) = started(config(4, 6, 4));
    assert!(nic.receive(&frame(64, 0)));
    assert!(nic.receive(&frame(64, 1)));
    dev.handle_irq().unwrap();
    dev.transmit(tx_buf(&dev, b"never sent")).unwrap();
    assert_eq!(dev.rx_stats().ready_frames, 2);

    dev.stop().unwrap();
    assert!(!nic.rx_enabled() && !nic.tx_enabled());
    assert_eq!(dev.state(), DevState::Stopped);
    assert_eq!(dev.rx_pool().available(), 6);
    assert_eq!(dev.tx_pool().available(), 8);
    assert_eq!(dev.rx_census().free, 4);
    assert_eq!(dev.tx_census().free, 4);
    assert!(dev.get_next_received_frame().is_none());
    assert_eq!(dev.stop(), Err(DriverError::BadState));
}

#[test]
fn lifecycle_errors() {
    init_log();
    let nic = MockNic::new(MAC);
    let mut dev = NetDevice::new(nic.clone(), config(4, 6, 4), ()).unwrap();
    let rejected = dev.transmit(dev.alloc_tx_buf(10).unwrap()).unwrap_err();
    assert_eq!(rejected.reason, DriverError::BadState);
    assert_eq!(dev.stop(), Err(DriverError::BadState));
    dev.start().unwrap();
    assert_eq!(dev.start(), Err(DriverError::BadState));
    assert_eq!(dev.alloc_tx_buf(129).unwrap_err(), DriverError::InvalidInput);

    assert!(NetDevice::new(nic, config(4, 4, 4), ()).is_err());
}

#[test]
fn random_traffic_keeps_rings_consistent() {
    let (dev, nic) = started(config(4, 7, 4));
    let mut held = Vec::new();
    let mut sent = VecDeque::new();

    for round in 0..500u32 {
        match fastrand::u8(0..4) {
            0 | 1 => {
                let bytes = frame(fastrand::usize(1..=400), round as u8);
                if nic.receive(&bytes) {
                    sent.push_back(bytes);
                }
            }
            2 => {
                dev.handle_irq().unwrap();
            }
            _ => {
                if let Some(rx) = dev.get_next_received_frame() {
                    // Frames arrive in order; dropped ones are skipped.
                    let bytes = received_bytes(&rx);
                    while sent.front().is_some_and(|f| *f != bytes) {
                        sent.pop_front();
                    }
                    assert!(sent.pop_front().is_some(), "frame out of order");
                    if fastrand::bool() {
                        held.push(rx);
                    }
                }
                if held.len() > 2 {
                    held.clear();
                }
            }
        }
        assert_eq!(dev.rx_census().total(), 4);
        assert_eq!(dev.rx_stats().partial_bufs, 0);
        let held_bufs: usize = held.iter().map(|f| f.buffers().len()).sum();
        assert_rx_partition(&dev, held_bufs);
    }
}
