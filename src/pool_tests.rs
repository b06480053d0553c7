//! Pool partition and capability-index behavior.

use std::time::Instant;

use super::*;

fn entry(id: u32, labels: &[&str]) -> PoolEntry {
    PoolEntry {
        id,
        name: format!("runner-x64-{id}"),
        labels: labels.iter().map(|s| s.to_string()).collect(),
        started_at: Instant::now(),
    }
}

#[test]
fn new_runners_start_idle() {
    let pool = Pool::new();
    pool.add(entry(1, &["self-hosted", "linux", "x64"]));
    pool.add(entry(2, &["self-hosted", "linux", "arm64"]));

    let counts = pool.counts();
    assert_eq!(counts.total, 2);
    assert_eq!(counts.idle, 2);
    assert_eq!(counts.busy, 0);
}

#[test]
fn idle_and_busy_partition_the_pool() {
    let pool = Pool::new();
    pool.add(entry(1, &["x64"]));
    pool.add(entry(2, &["x64"]));
    pool.add(entry(3, &["x64"]));

    pool.mark_busy(2);
    let counts = pool.counts();
    assert_eq!(counts.idle + counts.busy, counts.total);
    assert_eq!(counts.busy, 1);

    // Marking twice does not double-count.
    pool.mark_busy(2);
    assert_eq!(pool.counts().busy, 1);

    pool.mark_idle(2);
    let counts = pool.counts();
    assert_eq!(counts.idle, 3);
    assert_eq!(counts.busy, 0);
}

#[test]
fn pick_idle_honors_required_tags() {
    let pool = Pool::new();
    pool.add(entry(1, &["self-hosted", "linux", "x64"]));
    pool.add(entry(2, &["self-hosted", "linux", "arm64", "gpu", "nvidia"]));

    assert_eq!(pool.pick_idle(&[]), Some(1));
    assert_eq!(pool.pick_idle(&["gpu"]), Some(2));
    assert_eq!(pool.pick_idle(&["gpu", "nvidia"]), Some(2));
    assert_eq!(pool.pick_idle(&["gpu", "amd"]), None);

    pool.mark_busy(2);
    assert_eq!(pool.pick_idle(&["gpu"]), None);
}

#[test]
fn oldest_idle_returns_in_start_order() {
    let pool = Pool::new();
    for id in 1..=4 {
        pool.add(entry(id, &["x64"]));
    }
    pool.mark_busy(1);

    let oldest = pool.oldest_idle(2);
    assert_eq!(oldest, vec![2, 3]);

    let all = pool.oldest_idle(10);
    assert_eq!(all, vec![2, 3, 4]);
}

#[test]
fn remove_drops_all_indexes() {
    let pool = Pool::new();
    pool.add(entry(1, &["x64", "gpu"]));
    pool.add(entry(2, &["x64"]));

    let removed = pool.remove(1).unwrap();
    assert_eq!(removed.id, 1);
    assert!(pool.remove(1).is_none());
    assert_eq!(pool.counts().total, 1);
    assert_eq!(pool.pick_idle(&["gpu"]), None);
    assert!(!pool.contains(1));
    assert!(pool.contains(2));
}

#[test]
fn reconcile_follows_platform_busy_flags() {
    let pool = Pool::new();
    pool.add(entry(1, &["x64"]));
    pool.add(entry(2, &["x64"]));

    let remote = vec![
        RemoteRunner {
            name: "runner-x64-1".into(),
            status: RemoteStatus::Online,
            busy: true,
        },
        RemoteRunner {
            name: "runner-x64-2".into(),
            status: RemoteStatus::Online,
            busy: false,
        },
        // Unknown platform entries are ignored.
        RemoteRunner {
            name: "somebody-else".into(),
            status: RemoteStatus::Online,
            busy: true,
        },
    ];
    pool.reconcile(&remote);

    let counts = pool.counts();
    assert_eq!(counts.busy, 1);
    assert_eq!(counts.idle, 1);
    assert_eq!(pool.pick_idle(&[]), Some(2));

    // A busy runner going offline is not kept busy.
    let remote = vec![RemoteRunner {
        name: "runner-x64-1".into(),
        status: RemoteStatus::Offline,
        busy: true,
    }];
    pool.reconcile(&remote);
    assert_eq!(pool.counts().idle, 2);
}

#[test]
fn members_missing_from_inventory_keep_their_partition() {
    let pool = Pool::new();
    pool.add(entry(1, &["x64"]));
    pool.mark_busy(1);

    pool.reconcile(&[]);
    assert_eq!(pool.counts().busy, 1);
}
