//! End-to-end tests with dedicated queue workers
//!
//! The simulated device runs in loopback and auto-complete mode: every
//! transmitted frame completes immediately and is received again on the queue
//! the RSS table picks. A separate thread plays the interrupt controller.

use mqnic_core::rss::DEFAULT_RSS_KEY;
use mqnic_core::{AdapterConfig, SubmitError, TxPacket, toeplitz_hash};
use mqnic_integration_tests::{Harness, frame, frame_seq, init_tracing, test_config};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

const BATCH: u32 = 16;
const BATCHES: u32 = 50;

fn loopback_config(num_queues: u16) -> AdapterConfig {
    let mut config = test_config(num_queues);
    config.dedicated_workers = true;
    config.watchdog.shutdown_timeout_ms = 2_000;
    config
}

fn loopback_harness(num_queues: u16) -> Harness {
    let h = Harness::active(loopback_config(num_queues)).unwrap();
    h.dev.set_auto_complete(true);
    h.dev.set_loopback(true);
    h
}

/// Forward device interrupts to the adapter until `stop` is set
fn deliver_interrupts(h: &Harness, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let pending = h.dev.take_pending_interrupts();
        if pending.is_empty() {
            thread::sleep(Duration::from_micros(200));
            continue;
        }
        for qid in pending {
            if h.adapter.on_interrupt(qid).is_err() {
                return;
            }
        }
    }
}

#[test]
fn test_loopback_with_dedicated_workers() {
    init_tracing();
    let h = loopback_harness(4);
    let stop = AtomicBool::new(false);
    let total = BATCH * BATCHES;

    let received = thread::scope(|s| {
        s.spawn(|| deliver_interrupts(&h, &stop));

        let mut received = Vec::new();
        'batches: for batch in 0..BATCHES {
            for i in 0..BATCH {
                let seq = batch * BATCH + i;
                let len = 64 + (seq as usize * 37) % 1400;
                h.adapter
                    .submit(TxPacket::new(frame(seq, len)).with_flow_hash(seq))
                    .unwrap();
            }
            while received.len() < ((batch + 1) * BATCH) as usize {
                match h.rx.recv_timeout(Duration::from_secs(5)) {
                    Ok(packet) => received.push(packet),
                    Err(_) => break 'batches,
                }
            }
        }
        stop.store(true, Ordering::Release);
        received
    });

    assert_eq!(received.len(), total as usize);
    let seqs: BTreeSet<u32> = received
        .iter()
        .filter_map(|p| frame_seq(&p.to_vec()))
        .collect();
    assert_eq!(seqs, (0..total).collect::<BTreeSet<u32>>());

    for packet in &received {
        let data = packet.to_vec();
        let expected = toeplitz_hash(&DEFAULT_RSS_KEY, &data[..data.len().min(12)]);
        assert_eq!(packet.hash(), expected);
        assert_eq!(packet.queue_id(), h.adapter.queue_for_hash(expected));
    }

    let pairs: Vec<_> = (0..4).filter_map(|q| h.adapter.queue(q)).collect();
    h.adapter.deactivate().unwrap();

    let tx_packets: u64 = pairs.iter().map(|p| p.tx().stats().snapshot().packets).sum();
    let rx_packets: u64 = pairs.iter().map(|p| p.rx().stats().snapshot().packets).sum();
    assert_eq!(tx_packets, u64::from(total));
    assert_eq!(rx_packets, u64::from(total));
    assert_eq!(h.bus.active_mappings(), 0);
    assert_eq!(h.bus.bad_unmaps(), 0);
    assert_eq!(h.dev.live_queues(), 0);
}

#[test]
fn test_deactivate_under_load_releases_everything() {
    init_tracing();
    let h = loopback_harness(2);
    let stop = AtomicBool::new(false);
    let accepted = AtomicU32::new(0);

    thread::scope(|s| {
        s.spawn(|| deliver_interrupts(&h, &stop));

        for t in 0..3u32 {
            let h = &h;
            let accepted = &accepted;
            s.spawn(move || {
                let mut seq = t << 24;
                loop {
                    match h.adapter.submit(TxPacket::new(frame(seq, 256))) {
                        Ok(()) => {
                            accepted.fetch_add(1, Ordering::Relaxed);
                            seq += 1;
                        }
                        Err(SubmitError::RingFull(_)) => thread::yield_now(),
                        Err(SubmitError::QueueDown(_)) => break,
                    }
                }
            });
        }

        thread::sleep(Duration::from_millis(50));
        h.adapter.deactivate().unwrap();
        stop.store(true, Ordering::Release);
    });

    assert!(accepted.load(Ordering::Relaxed) > 0);
    assert!(!h.adapter.is_up());
    assert_eq!(h.bus.active_mappings(), 0);
    assert_eq!(h.bus.bad_unmaps(), 0);
    assert_eq!(h.dev.live_queues(), 0);
    assert_eq!(h.dev.resets(), 0);
}
