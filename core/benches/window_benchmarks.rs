//! Join evaluation benchmarks
//!
//! Benchmarks for the read path, which runs on every event page view:
//! - Window clock: phase and next-transition computation
//! - Capacity state: admission and promotion on a busy event
//! - Facade: full join state evaluation
//!
//! Run with: `cargo bench --bench window_benchmarks`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gather_core::window::{next_transition_at, phase_at};
use gather_core::{
    CapacityState, EventId, EventJoinConfig, JoinMode, Membership, MembershipStatus, UserId,
    evaluate,
};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 18, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn config() -> EventJoinConfig {
    let mut config = EventJoinConfig::new(
        EventId::new(),
        start(),
        start() + Duration::hours(3),
        JoinMode::Open,
        Some(50),
    );
    config.join_opens_offset = Some(Duration::days(7));
    config.join_cutoff_offset = Some(Duration::minutes(30));
    config.allow_join_late = true;
    config.late_join_cutoff_offset = Some(Duration::minutes(20));
    config
}

fn busy_capacity(config: &EventJoinConfig, waiting: usize) -> CapacityState {
    let mut state = CapacityState::new(config.event_id, config.max);
    for _ in 0..config.max.unwrap_or(0) {
        state.try_admit(UserId::new(), start());
    }
    for offset in 0..waiting {
        let at = start() - Duration::seconds(i64::try_from(offset).unwrap_or(0));
        state.enqueue(UserId::new(), at);
    }
    state
}

/// Benchmark the window clock
fn benchmark_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("window");
    group.throughput(Throughput::Elements(1));

    let config = config();
    let instants = [
        ("before_open", start() - Duration::days(8)),
        ("open", start() - Duration::days(1)),
        ("cutoff_closed", start() - Duration::minutes(10)),
        ("late_join_open", start() + Duration::minutes(10)),
        ("ended", start() + Duration::hours(4)),
    ];

    for (name, now) in instants {
        group.bench_with_input(BenchmarkId::new("phase_at", name), &now, |b, now| {
            b.iter(|| black_box(phase_at(black_box(*now), &config)));
        });
    }

    group.bench_function("next_transition_at", |b| {
        let now = start() - Duration::days(1);
        b.iter(|| black_box(next_transition_at(black_box(now), &config)));
    });

    group.finish();
}

/// Benchmark capacity mutations with a long waitlist
fn benchmark_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("capacity");
    let config = config();

    for waiting in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(1));
        let state = busy_capacity(&config, waiting);

        group.bench_with_input(
            BenchmarkId::new("release_and_promote", waiting),
            &state,
            |b, state| {
                let occupant = *state.occupants.keys().next().expect("full event");
                b.iter(|| {
                    let mut state = state.clone();
                    black_box(state.release_and_promote(occupant, start()));
                });
            },
        );

        group.bench_with_input(BenchmarkId::new("waitlist_position", waiting), &state, |b, state| {
            let last = state.waitlist.last().expect("non-empty waitlist").user_id;
            b.iter(|| black_box(state.waitlist_position(black_box(last))));
        });
    }

    group.finish();
}

/// Benchmark the join decision facade
fn benchmark_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    group.throughput(Throughput::Elements(1));

    let config = config();
    let capacity = busy_capacity(&config, 100);
    let now = start() - Duration::days(1);
    let waiting = capacity.waitlist[40].user_id;
    let membership = Membership::new(config.event_id, waiting, MembershipStatus::Waitlist, now);

    group.bench_function("anonymous_viewer", |b| {
        b.iter(|| black_box(evaluate(black_box(now), &config, &capacity, None)));
    });

    group.bench_function("waitlisted_member", |b| {
        b.iter(|| black_box(evaluate(black_box(now), &config, &capacity, Some(&membership))));
    });

    group.finish();
}

criterion_group!(benches, benchmark_window, benchmark_capacity, benchmark_evaluate);
criterion_main!(benches);
