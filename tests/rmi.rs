//! Round trips through the reliable messaging layer between two in-process
//! ranks.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use multiwavelet::comm::{ThreadComm, Transport};
use multiwavelet::rmi::{Handler, Rmi, RmiConfig, RmiMessage, ATTR_ORDERED, ATTR_UNORDERED};

fn noop_handler() -> Handler {
    Arc::new(|_msg: RmiMessage| {})
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "timed out waiting for messages");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn ordered_messages_arrive_in_send_order() {
    const N: usize = 10_000;
    let mut comms = ThreadComm::group(2).into_iter();
    let c0 = Arc::new(comms.next().unwrap());
    let c1 = Arc::new(comms.next().unwrap());
    let config = RmiConfig::with(2048, 2);

    let received = Arc::new(Mutex::new(Vec::<u32>::new()));

    let receiver = {
        let received = received.clone();
        let c1 = c1.clone();
        thread::spawn(move || {
            let recorder: Handler = {
                let received = received.clone();
                Arc::new(move |msg: RmiMessage| {
                    let value = u32::from_le_bytes(msg.payload[..4].try_into().unwrap());
                    received.lock().push(value);
                })
            };
            let rmi = Rmi::new(c1.clone(), vec![noop_handler(), recorder], config);
            wait_until(Duration::from_secs(60), || received.lock().len() == N);
            assert_eq!(rmi.stats().nmsg_recv, N as u64);
            c1.barrier();
            rmi.end();
        })
    };

    let sender = thread::spawn(move || {
        let rmi = Rmi::new(c0.clone(), vec![noop_handler(), noop_handler()], config);
        for i in 0..N as u32 {
            rmi.isend(1, 1, ATTR_ORDERED, &i.to_le_bytes());
        }
        c0.barrier();
        assert_eq!(rmi.stats().nmsg_sent, N as u64);
        rmi.end();
    });

    sender.join().unwrap();
    receiver.join().unwrap();

    let seen = received.lock();
    assert_eq!(seen.len(), N);
    for (expect, &got) in seen.iter().enumerate() {
        assert_eq!(got, expect as u32, "message {expect} delivered out of order");
    }
}

#[test]
fn huge_messages_round_trip_byte_for_byte() {
    let mut comms = ThreadComm::group(2).into_iter();
    let c0 = Arc::new(comms.next().unwrap());
    let c1 = Arc::new(comms.next().unwrap());
    // Small eager buffers so the payload is forced through the rendezvous.
    let config = RmiConfig::with(1024, 2);
    let payload: Vec<u8> = (0..config.max_msg_len + 1)
        .map(|i| (i % 251) as u8)
        .collect();
    let expected = payload.clone();

    let received = Arc::new(Mutex::new(Vec::<u8>::new()));

    let receiver = {
        let received = received.clone();
        let c1 = c1.clone();
        let want = expected.len();
        thread::spawn(move || {
            let sink: Handler = {
                let received = received.clone();
                Arc::new(move |msg: RmiMessage| {
                    *received.lock() = msg.payload;
                })
            };
            let rmi = Rmi::new(c1.clone(), vec![noop_handler(), sink], config);
            wait_until(Duration::from_secs(60), || received.lock().len() == want);
            // The payload must have moved on the rendezvous data tag.
            assert_eq!(rmi.stats().nhuge_recv, 1);
            c1.barrier();
            rmi.end();
        })
    };

    let sender = thread::spawn(move || {
        let rmi = Rmi::new(c0.clone(), vec![noop_handler(), noop_handler()], config);
        rmi.isend(1, 1, ATTR_UNORDERED, &payload);
        c0.barrier();
        assert_eq!(rmi.stats().nhuge_sent, 1);
        rmi.end();
    });

    sender.join().unwrap();
    receiver.join().unwrap();

    assert_eq!(*received.lock(), expected);
}
