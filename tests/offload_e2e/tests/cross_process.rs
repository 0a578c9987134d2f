// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Offload channels between two or more OS processes
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 6 scenarios (SPSC order, signal wake, MPSC fan-in, seqlock, name cleanup, crash reclaim)
//!
//! Every `peer_*` test is a no-op unless re-executed by its scenario.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use offload_e2e::{peer_args, spawn_peer, unique_channel, wait_peer, PeerArgs, WorkItem, SCENARIO_BUDGET};
use offload_ipc::budget::{dequeue_budgeted, enqueue_budgeted, HostClock};
use offload_ipc::{
    Borrower, Consumer, MpscConsumer, MpscProducer, Owner, Producer, SeqLockConsumer,
    SeqLockProducer, SignalWaiter, SignalWaker, SpscConsumer, SpscProducer,
};

const ITEMS: u32 = 10_000;

fn run_peer(test: &str, args: &PeerArgs) {
    let child = spawn_peer(test, args).expect("spawn peer process");
    let status = wait_peer(child, SCENARIO_BUDGET).expect("peer finishes");
    assert!(status.success(), "peer {test} failed: {status}");
}

#[test]
fn spsc_preserves_order_across_processes() {
    let channel = unique_channel("spsc", 64);
    let tx = SpscProducer::<u32>::create(&channel).expect("create ring");
    let peer = spawn_peer("peer_spsc_consumer", &PeerArgs::new(channel, ITEMS, 0)).expect("spawn");

    let clock = HostClock::new();
    for value in 0..ITEMS {
        enqueue_budgeted(&clock, &tx, value, SCENARIO_BUDGET).expect("consumer keeps up");
    }
    let status = wait_peer(peer, SCENARIO_BUDGET).expect("peer finishes");
    assert!(status.success(), "consumer peer failed: {status}");
    assert!(tx.is_empty());
}

#[test]
fn peer_spsc_consumer() {
    let Some(args) = peer_args("peer_spsc_consumer") else { return };
    let rx = SpscConsumer::<u32>::attach(&args.channel).expect("attach ring");
    let clock = HostClock::new();
    for expected in 0..args.count {
        let value = dequeue_budgeted(&clock, &rx, SCENARIO_BUDGET).expect("producer keeps up");
        assert_eq!(value, expected);
    }
    assert_eq!(rx.dequeue(), None);
}

#[test]
fn signal_wakes_other_process() {
    let channel = unique_channel("signal", 16);
    let waiter = SignalWaiter::create(&channel).expect("create signal");
    let rx = SpscConsumer::<u32, Owner>::create(&channel).expect("create ring");
    let peer = spawn_peer("peer_signal_waker", &PeerArgs::new(channel, 100, 0)).expect("spawn");

    let (done_tx, done_rx) = mpsc::channel();
    let waiting = thread::spawn(move || {
        let mut received = Vec::new();
        while received.len() < 100 {
            waiter.wait();
            received.extend(std::iter::from_fn(|| rx.dequeue()));
        }
        let _ = done_tx.send(received);
    });

    let received = done_rx.recv_timeout(SCENARIO_BUDGET).expect("woken for every batch");
    assert_eq!(received, (0..100).collect::<Vec<_>>());
    waiting.join().expect("waiting thread");
    let status = wait_peer(peer, SCENARIO_BUDGET).expect("peer finishes");
    assert!(status.success(), "waker peer failed: {status}");
}

#[test]
fn peer_signal_waker() {
    let Some(args) = peer_args("peer_signal_waker") else { return };
    let tx = SpscProducer::<u32, Borrower>::attach(&args.channel).expect("attach ring");
    let waker = SignalWaker::attach(&args.channel).expect("attach signal");
    let clock = HostClock::new();
    for value in 0..args.count {
        enqueue_budgeted(&clock, &tx, value, SCENARIO_BUDGET).expect("room in ring");
        waker.wake();
        if value % 10 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    // A wake that coalesced with one already consumed must not strand the
    // tail of the stream.
    while !tx.is_empty() {
        waker.wake();
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn mpsc_fans_in_from_several_processes() {
    const PEERS: u32 = 3;
    let channel = unique_channel("mpsc", 64);
    let rx = MpscConsumer::<WorkItem>::create(&channel).expect("create ring");
    let peers: Vec<_> = (0..PEERS)
        .map(|tag| {
            spawn_peer("peer_mpsc_producer", &PeerArgs::new(channel.clone(), ITEMS, tag)).expect("spawn")
        })
        .collect();

    let clock = HostClock::new();
    let mut next: HashMap<u32, u32> = HashMap::new();
    for _ in 0..PEERS * ITEMS {
        let item = dequeue_budgeted(&clock, &rx, SCENARIO_BUDGET).expect("producers keep up");
        let expected = next.entry(item.producer).or_insert(0);
        assert_eq!(item.seq, *expected, "producer {} out of order", item.producer);
        *expected += 1;
    }
    for peer in peers {
        let status = wait_peer(peer, SCENARIO_BUDGET).expect("peer finishes");
        assert!(status.success(), "producer peer failed: {status}");
    }
    assert_eq!(rx.dequeue(), None);
    assert!((0..PEERS).all(|tag| next.get(&tag) == Some(&ITEMS)));
}

#[test]
fn peer_mpsc_producer() {
    let Some(args) = peer_args("peer_mpsc_producer") else { return };
    let tx = MpscProducer::<WorkItem>::attach(&args.channel).expect("attach ring");
    let second = tx.clone();
    let half = args.count / 2;
    let tag = args.tag;
    // Two threads of one process still produce a single ordered stream: the
    // second starts only after the first has finished its half.
    let first = thread::spawn(move || {
        for seq in 0..half {
            tx.enqueue_blocking(WorkItem { producer: tag, seq });
        }
    });
    first.join().expect("first half");
    let clock = HostClock::new();
    for seq in half..args.count {
        enqueue_budgeted(&clock, &second, WorkItem { producer: tag, seq }, SCENARIO_BUDGET)
            .expect("consumer keeps up");
    }
}

#[test]
fn seqlock_records_arrive_whole() {
    let channel = unique_channel("seqlock", 32);
    let rx = SeqLockConsumer::<[u64; 8], Owner>::create(&channel).expect("create ring");
    let peer = spawn_peer("peer_seqlock_producer", &PeerArgs::new(channel, ITEMS, 0)).expect("spawn");

    let clock = HostClock::new();
    for expected in 0..u64::from(ITEMS) {
        let record = dequeue_budgeted(&clock, &rx, SCENARIO_BUDGET).expect("producer keeps up");
        assert!(record.iter().all(|&word| word == expected), "torn or reordered record {record:?}");
    }
    let status = wait_peer(peer, SCENARIO_BUDGET).expect("peer finishes");
    assert!(status.success(), "producer peer failed: {status}");
}

#[test]
fn peer_seqlock_producer() {
    let Some(args) = peer_args("peer_seqlock_producer") else { return };
    let tx = SeqLockProducer::<[u64; 8], Borrower>::attach(&args.channel).expect("attach ring");
    let clock = HostClock::new();
    for value in 0..u64::from(args.count) {
        enqueue_budgeted(&clock, &tx, [value; 8], SCENARIO_BUDGET).expect("consumer keeps up");
    }
}

#[test]
fn borrower_exit_keeps_name_owner_drop_removes_it() {
    let channel = unique_channel("cleanup", 8);
    let tx = SpscProducer::<u32>::create(&channel).expect("create ring");
    let path = tx.name().dev_shm_path();
    assert!(tx.enqueue(7));

    run_peer("peer_borrower_exits", &PeerArgs::new(channel.clone(), 1, 0));
    assert!(path.exists(), "borrower exit must not remove the name");
    assert!(tx.is_empty(), "peer consumed the item");

    drop(tx);
    assert!(!path.exists());
    let again = SpscProducer::<u32>::create(&channel).expect("fresh owner after cleanup");
    assert!(again.is_empty());
}

#[test]
fn peer_borrower_exits() {
    let Some(args) = peer_args("peer_borrower_exits") else { return };
    let rx = SpscConsumer::<u32>::attach(&args.channel).expect("attach ring");
    assert_eq!(rx.dequeue(), Some(7));
}

#[test]
fn crashed_owner_name_is_reclaimed() {
    let channel = unique_channel("crash", 8);
    let path = channel.name(offload_shm::name::SPSC_PURPOSE).dev_shm_path();

    let peer = spawn_peer("peer_owner_crashes", &PeerArgs::new(channel.clone(), 1, 0)).expect("spawn");
    let status = wait_peer(peer, SCENARIO_BUDGET).expect("peer finishes");
    assert!(!status.success(), "peer was expected to abort");
    assert!(path.exists(), "an owner that never drops leaks its name");

    let tx = SpscProducer::<u32>::create(&channel).expect("stale object replaced");
    let rx = SpscConsumer::<u32>::attach(&channel).expect("attach");
    assert_eq!(rx.dequeue(), None, "fresh ring carries nothing over");
    drop(rx);
    drop(tx);
    assert!(!path.exists());
}

#[test]
fn peer_owner_crashes() {
    let Some(args) = peer_args("peer_owner_crashes") else { return };
    let tx = SpscProducer::<u32>::create(&args.channel).expect("create ring");
    assert!(tx.enqueue(1));
    std::process::abort();
}
