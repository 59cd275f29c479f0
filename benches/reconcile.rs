//! Performance benchmarks for a3s-session
//!
//! Run with: cargo bench

use a3s_session::{merge_logs, RawEvent, Reconciler, SessionEvent, SessionView};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;

fn timeline(len: usize) -> Vec<SessionEvent> {
    (0..len)
        .map(|i| {
            let raw = match i % 4 {
                0 => RawEvent::new(
                    "message",
                    json!({"role": "assistant", "message": format!("note {}", i), "event_id": format!("e{}", i)}),
                ),
                1 => RawEvent::new(
                    "tool",
                    json!({
                        "tool_call_id": format!("call-{}", i),
                        "name": "shell",
                        "function": "shell_exec",
                        "args": {"id": "sh-1", "command": "make"},
                        "status": "called",
                        "event_id": format!("e{}", i),
                        "created_at": 1700000000 + i as i64
                    }),
                ),
                2 => RawEvent::new(
                    "step",
                    json!({"id": format!("{}", i % 8), "description": "step", "status": "running", "event_id": format!("e{}", i)}),
                ),
                _ => RawEvent::new(
                    "message",
                    json!({"role": "assistant", "message": "partial", "stream_id": format!("s{}", i / 16), "partial": true}),
                ),
            };
            SessionEvent::decode(raw).unwrap()
        })
        .collect()
}

fn bench_decode(c: &mut Criterion) {
    let raw = RawEvent::new(
        "tool",
        json!({
            "tool_call_id": "call-1",
            "name": "shell",
            "function": "shell_exec",
            "args": {"id": "sh-1", "command": "cargo test"},
            "content": {"console": [{"ps1": "$", "command": "cargo test", "output": "ok"}]},
            "status": "called",
            "event_id": "e1",
            "created_at": 1700000000
        }),
    );

    c.bench_function("SessionEvent::decode", |b| {
        b.iter(|| SessionEvent::decode(black_box(raw.clone())).unwrap());
    });
}

fn bench_apply(c: &mut Criterion) {
    let events = timeline(1_000);

    c.bench_function("Reconciler apply 1k", |b| {
        b.iter_batched(
            || events.clone(),
            |events| {
                let mut reconciler = Reconciler::new("bench");
                for event in events {
                    reconciler.apply(event);
                }
                reconciler
            },
            BatchSize::SmallInput,
        );
    });

    let warm = Reconciler::from_events("bench", events.clone());
    let duplicate = events[500].clone();
    c.bench_function("Reconciler apply duplicate", |b| {
        b.iter_batched(
            || (warm.clone(), duplicate.clone()),
            |(mut reconciler, event)| reconciler.apply(event),
            BatchSize::SmallInput,
        );
    });
}

fn bench_merge_logs(c: &mut Criterion) {
    let local = timeline(1_000);
    let remote: Vec<_> = local[..900].to_vec();

    c.bench_function("merge_logs 900 remote + 1k local", |b| {
        b.iter_batched(
            || (remote.clone(), local.clone()),
            |(remote, local)| merge_logs(remote, local),
            BatchSize::SmallInput,
        );
    });
}

fn bench_projection(c: &mut Criterion) {
    let session = Reconciler::from_events("bench", timeline(1_000)).into_session();

    c.bench_function("SessionView::project 1k", |b| {
        b.iter(|| SessionView::project(black_box(&session)));
    });
}

criterion_group!(benches, bench_decode, bench_apply, bench_merge_logs, bench_projection);
criterion_main!(benches);
