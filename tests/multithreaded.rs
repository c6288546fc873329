//! Multi-threaded integration test.

use spanalloc::SpanAlloc;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: SpanAlloc = SpanAlloc;

#[test]
fn test_multithreaded_alloc() {
    let num_threads = 8;
    let iterations = 1000;

    let handles: Vec<_> = (0..num_threads)
        .map(|thread| {
            std::thread::spawn(move || {
                let mut live: Vec<Vec<u64>> = Vec::new();
                for iteration in 0..iterations {
                    let values: Vec<u64> =
                        (0..50).map(|value| value + thread * iterations + iteration).collect();
                    live.push(values);
                    if live.len() > 10 {
                        live.remove(0);
                    }
                }
                live.len()
            })
        })
        .collect();

    for handle in handles {
        let kept = handle.join().unwrap();
        assert!(kept > 0);
    }
}

#[test]
fn test_cross_thread_free() {
    // Allocate on producer threads, free on the consumer
    let num_threads = 4;
    let items_per_thread = 500;

    let (sender, receiver) = std::sync::mpsc::channel::<Vec<Box<[u8; 64]>>>();

    let producers: Vec<_> = (0..num_threads)
        .map(|_| {
            let sender = sender.clone();
            std::thread::spawn(move || {
                let items: Vec<Box<[u8; 64]>> = (0..items_per_thread)
                    .map(|item| {
                        let mut bytes = [0u8; 64];
                        bytes[0] = (item & 0xFF) as u8;
                        Box::new(bytes)
                    })
                    .collect();
                sender.send(items).unwrap();
            })
        })
        .collect();

    drop(sender);

    let mut total = 0;
    for items in receiver {
        total += items.len();
        drop(items); // free memory allocated by other threads
    }

    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(total, num_threads * items_per_thread);
}

#[test]
fn test_ping_pong_churn() {
    // Two threads repeatedly exchange ownership of small blocks so the
    // remote free lists drain and refill many times
    let rounds = 200;
    let batch = 64;
    let (to_b, from_a) = std::sync::mpsc::channel::<Vec<Box<u64>>>();
    let (to_a, from_b) = std::sync::mpsc::channel::<Vec<Box<u64>>>();

    let thread_b = std::thread::spawn(move || {
        for _ in 0..rounds {
            let received = from_a.recv().unwrap();
            drop(received);
            let fresh: Vec<Box<u64>> = (0..batch).map(Box::new).collect();
            if to_a.send(fresh).is_err() {
                break;
            }
        }
    });

    for _ in 0..rounds {
        let fresh: Vec<Box<u64>> = (0..batch).map(Box::new).collect();
        to_b.send(fresh).unwrap();
        let received = from_b.recv().unwrap();
        assert_eq!(*received[0], 0);
        drop(received);
    }
    drop(to_b);
    thread_b.join().unwrap();
}

#[test]
fn test_arc_shared() {
    let data = Arc::new(vec![1u64, 2, 3, 4, 5]);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let data = Arc::clone(&data);
            std::thread::spawn(move || {
                assert_eq!(data.len(), 5);
                assert_eq!(data[2], 3);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_mixed_sizes_multithreaded() {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                let mut live: Vec<Box<dyn std::any::Any>> = Vec::new();
                for iteration in 0..200 {
                    match iteration % 5 {
                        0 => live.push(Box::new([0u8; 8])),
                        1 => live.push(Box::new([0u8; 64])),
                        2 => live.push(Box::new([0u8; 512])),
                        3 => live.push(Box::new([0u8; 4096])),
                        _ => live.push(Box::new(vec![0u8; 16384])),
                    }
                    if live.len() > 50 {
                        live.drain(..25);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_thread_exit_recycles_heap() {
    // Heaps released at thread exit are inherited by later threads
    for _ in 0..16 {
        std::thread::spawn(|| {
            let values: Vec<u64> = (0..1000).collect();
            assert_eq!(values.len(), 1000);
        })
        .join()
        .unwrap();
    }
}
