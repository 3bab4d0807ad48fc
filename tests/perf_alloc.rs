use std::alloc::System;
use std::hint::black_box;
use std::sync::Arc;

use iomigrater::clock::ManualClock;
use iomigrater::engine::Engine;
use iomigrater::tracer::event::{Completion, Device, Direction, EventKind, ProcessContext, RequestId};
use iomigrater::tracer::parse::parse_event;
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

const HEADER_SIZE: usize = 24;

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn header(ts: u64, req: u64, kind: EventKind) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&ts.to_le_bytes());
    buf.extend_from_slice(&req.to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&[0u8; 7]);
    buf
}

fn attribution_payload() -> Vec<u8> {
    let mut data = header(0, 0xffff_8881_0000_1000, EventKind::Attribution);
    data.extend_from_slice(&1337u32.to_le_bytes());
    data.push(1);
    data.extend_from_slice(&[0u8; 3]);
    let mut comm = [0u8; 16];
    comm[..3].copy_from_slice(b"fio");
    data.extend_from_slice(&comm);
    data
}

fn completion_payload() -> Vec<u8> {
    let mut data = header(123_456_789, 0xffff_8881_0000_1000, EventKind::Completion);
    data.extend_from_slice(&4_096u32.to_le_bytes());
    data.push(1);
    data.extend_from_slice(&[0u8; 3]);
    data.extend_from_slice(&259u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data
}

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn completion(req: u64) -> Completion {
    Completion {
        req: RequestId(req),
        ts_ns: 2_000,
        bytes: 4_096,
        direction: Direction::Write,
        device: Device::new(259, 0),
    }
}

/// Engine with its bucket created and tables already holding `warm` entries'
/// worth of capacity.
fn warm_engine(warm: u64) -> Engine {
    let engine = Engine::with_capacity(Arc::new(ManualClock::new(0)), 4_096, 64);
    for req in 0..warm {
        engine.on_attribution(RequestId(req), Some(ProcessContext::new(1337, "fio")));
        engine.on_start(RequestId(req), 1_000);
        engine.on_completion(&completion(req));
    }
    engine
}

#[test]
#[serial]
fn parse_attribution_event_allocates_zero() {
    let data = attribution_payload();

    let (_parsed, allocations, deallocations) = measure_alloc_counts(|| {
        let parsed = parse_event(&data).expect("parse attribution");
        black_box(parsed);
    });

    assert!(
        allocations <= 8,
        "attribution parse allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 8,
        "attribution parse deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn parse_mixed_batch_allocation_budget() {
    let attribution = attribution_payload();
    let start = header(1_000, 0xffff_8881_0000_1000, EventKind::Start);
    let completion = completion_payload();

    let (_parsed, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..512 {
            black_box(parse_event(&attribution).expect("parse attribution"));
            black_box(parse_event(&start).expect("parse start"));
            black_box(parse_event(&completion).expect("parse completion"));
        }
    });

    assert!(
        allocations <= 8,
        "mixed parse allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 8,
        "mixed parse deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn warm_request_lifecycle_allocation_budget() {
    let engine = warm_engine(256);

    let (_, allocations, _deallocations) = measure_alloc_counts(|| {
        for req in 10_000..10_512u64 {
            engine.on_attribution(RequestId(req), Some(ProcessContext::new(1337, "fio")));
            engine.on_start(RequestId(req), 1_000);
            black_box(engine.on_completion(&completion(req)));
        }
    });

    assert!(
        allocations <= 8,
        "warm lifecycle allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn missed_trace_allocation_budget() {
    let engine = warm_engine(1);

    let (_, allocations, _deallocations) = measure_alloc_counts(|| {
        for req in 50_000..50_512u64 {
            black_box(engine.on_completion(&completion(req)));
        }
    });

    assert!(
        allocations <= 8,
        "missed trace allocation budget exceeded: {}",
        allocations
    );
}
