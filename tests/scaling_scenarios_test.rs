//! Literal autoscaling scenarios driven tick by tick.

use std::time::{Duration, Instant};

use runnerd::pool::{Pool, PoolEntry};
use runnerd::scaling::{decide, Decision, Tunables};

fn tunables() -> Tunables {
    Tunables {
        min_runners: 1,
        max_runners: 3,
        up_threshold: 2,
        down_threshold: 0,
        cooldown: Duration::from_secs(60),
        check_interval: Duration::from_secs(30),
    }
}

fn entry(id: u32) -> PoolEntry {
    PoolEntry {
        id,
        name: format!("ci-x64-{id}"),
        labels: vec!["self-hosted".into(), "linux".into(), "x64".into()],
        started_at: Instant::now(),
    }
}

/// Drives the pool the way the manager applies controller decisions.
fn apply(pool: &Pool, next_id: &mut u32, decision: Decision) {
    match decision {
        Decision::Add(n) => {
            for _ in 0..n {
                pool.add(entry(*next_id));
                *next_id += 1;
            }
        }
        Decision::Remove(n) => {
            for id in pool.oldest_idle(n) {
                pool.remove(id);
            }
        }
        Decision::Hold | Decision::AtCapacity => {}
    }
}

#[test]
fn autoscale_up_then_cooldown() {
    let tunables = tunables();
    let pool = Pool::new();
    let mut next_id = 1;
    pool.add(entry(next_id));
    next_id += 1;

    // Tick 1 (t=30s): queue 5 against one idle runner.
    let decision = decide(5, pool.counts(), &tunables, false);
    assert_eq!(decision, Decision::Add(2));
    apply(&pool, &mut next_id, decision);
    assert_eq!(pool.counts().total, 3);

    // Tick 2 (t=60s): queue unchanged, cooldown active, no change.
    let decision = decide(5, pool.counts(), &tunables, true);
    assert!(matches!(decision, Decision::Hold | Decision::AtCapacity));
    apply(&pool, &mut next_id, decision);
    assert_eq!(pool.counts().total, 3);
}

#[test]
fn autoscale_down_to_single_idle() {
    let tunables = tunables();
    let pool = Pool::new();
    let mut next_id = 1;
    for _ in 0..3 {
        pool.add(entry(next_id));
        next_id += 1;
    }

    // Queue empty, three idle: drop to one.
    let decision = decide(0, pool.counts(), &tunables, false);
    assert_eq!(decision, Decision::Remove(2));
    apply(&pool, &mut next_id, decision);

    let counts = pool.counts();
    assert_eq!(counts.total, 1);
    assert_eq!(counts.idle, 1);
}

#[test]
fn growing_queue_at_max_never_exceeds_bounds() {
    let tunables = tunables();
    let pool = Pool::new();
    let mut next_id = 1;
    pool.add(entry(next_id));
    next_id += 1;

    let mut queue = 4;
    for _ in 0..10 {
        let counts = pool.counts();
        let decision = decide(queue, counts, &tunables, false);
        apply(&pool, &mut next_id, decision);

        let after = pool.counts();
        assert!(after.total >= tunables.min_runners);
        assert!(after.total <= tunables.max_runners);
        queue += 2;
    }
    assert_eq!(pool.counts().total, tunables.max_runners);
    // Saturated pool keeps reporting capacity pressure.
    assert_eq!(
        decide(queue, pool.counts(), &tunables, false),
        Decision::AtCapacity
    );
    assert_eq!(
        decide(queue, pool.counts(), &tunables, true),
        Decision::AtCapacity
    );
}

#[test]
fn removal_prefers_oldest_idle_runners() {
    let tunables = tunables();
    let pool = Pool::new();
    for id in 1..=3 {
        pool.add(entry(id));
        std::thread::sleep(Duration::from_millis(2));
    }
    pool.mark_busy(1);

    // Two idle (2, 3), queue empty, min 1: remove one, the oldest idle.
    let decision = decide(0, pool.counts(), &tunables, false);
    assert_eq!(decision, Decision::Remove(1));
    let victims = pool.oldest_idle(1);
    assert_eq!(victims, vec![2]);
}
