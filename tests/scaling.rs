//! Scaling and concurrency tests for the change store.
//!
//! Exercises:
//! - Version contiguity under concurrent writers on one entity
//! - Many writers across many entities
//! - Full-feed pagination without duplicates or gaps
//! - A live reader following the feed while writers commit
//! - Rebuild from the log on restart

use delta_sync::{
    CallerScope, ChangeStore, DeltaQuery, DeltaQueryService, EntityType, EntryId, OpType,
    ScopePolicy, StoreConfig, SyncError, Timestamp,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ENTRY_COUNT: usize = 20_000;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().to_path_buf(),
        sync_interval: 1_000,
        lock_timeout: Duration::from_secs(30),
        create_if_missing: true,
    }
}

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report(&self) {
        println!("  {} took {:.2}ms", self.name, self.elapsed_ms());
    }
}

fn assert_contiguous(versions: &mut [u64]) {
    versions.sort_unstable();
    for (i, v) in versions.iter().enumerate() {
        assert_eq!(*v, i as u64 + 1, "version gap or duplicate at position {}", i);
    }
}

#[test]
fn test_concurrent_writers_same_entity() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ChangeStore::open_or_create(test_config(&dir)).unwrap());

    let threads = 8;
    let per_thread = 100;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..per_thread)
                    .map(|_| {
                        store
                            .record_change(EntityType::Outing, Some("o-1"), OpType::Update, None)
                            .unwrap()
                            .version
                            .0
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut versions: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(versions.len(), threads * per_thread);
    assert_contiguous(&mut versions);

    let history = store.entity_history(EntityType::Outing, Some("o-1"));
    let mut history_versions: Vec<_> = history.iter().map(|e| e.version.0).collect();
    assert_contiguous(&mut history_versions);
}

#[test]
fn test_concurrent_transactions_with_rollbacks() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ChangeStore::open_or_create(test_config(&dir)).unwrap());

    let handles: Vec<_> = (0..6)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50 {
                    let result: Result<((), _), SyncError> = store.transaction(|txn| {
                        txn.record_change(EntityType::Signup, Some("s-1"), OpType::Update, None)?;
                        txn.record_change(EntityType::Outing, Some("o-1"), OpType::Update, None)?;
                        if (t + i) % 3 == 0 {
                            return Err(SyncError::Transaction("signup rejected".into()));
                        }
                        Ok(())
                    });
                    let _ = result;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for (entity_type, id) in [(EntityType::Signup, "s-1"), (EntityType::Outing, "o-1")] {
        let mut versions: Vec<_> = store
            .entity_history(entity_type, Some(id))
            .iter()
            .map(|e| e.version.0)
            .collect();
        assert_contiguous(&mut versions);
        assert_eq!(
            store.current_version(entity_type, Some(id)).0,
            versions.len() as u64
        );
    }
}

#[test]
fn test_many_entities_pagination_and_restart() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let store = Arc::new(ChangeStore::open_or_create(config.clone()).unwrap());
        let timer = Timer::new("populate");

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..ENTRY_COUNT / 4 {
                        let entity_type = EntityType::ALL[(t + i) % EntityType::ALL.len()];
                        let id = format!("e-{}", i % 250);
                        store
                            .record_change(entity_type, Some(&id), OpType::Update, None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        store.sync().unwrap();
        timer.report();
    }

    let timer = Timer::new("reopen");
    let store = Arc::new(ChangeStore::open_or_create(config).unwrap());
    timer.report();
    assert_eq!(store.stats().entry_count, ENTRY_COUNT as u64);

    let service = DeltaQueryService::new(Arc::clone(&store), ScopePolicy::default());
    let since = store.stats().oldest.unwrap().saturating_sub(Duration::from_secs(1));

    let timer = Timer::new("page through feed");
    let mut seen: Vec<EntryId> = Vec::new();
    let mut latest: HashMap<(EntityType, String), u64> = HashMap::new();
    let mut page = service.get_deltas(&DeltaQuery::since(since, 500), CallerScope::Privileged);
    loop {
        for entry in &page.items {
            let key = (entry.entity_type, entry.entity_id.clone().unwrap());
            let prev = latest.insert(key, entry.version.0).unwrap_or(0);
            assert_eq!(entry.version.0, prev + 1, "feed out of version order");
            seen.push(entry.id);
        }
        let next = page.next_cursor;
        match next {
            Some(cursor) => {
                page = service.get_deltas(&DeltaQuery::after(cursor, 500), CallerScope::Privileged)
            }
            None => break,
        }
    }
    timer.report();

    assert_eq!(seen.len(), ENTRY_COUNT);
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), ENTRY_COUNT);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_live_reader_sees_every_commit_once() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 1_000;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(ChangeStore::open_or_create(test_config(&dir)).unwrap());
    let service = Arc::new(DeltaQueryService::new(Arc::clone(&store), ScopePolicy::default()));
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let service = Arc::clone(&service);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut seen: Vec<(Timestamp, EntryId)> = Vec::new();
            let mut cursor: Option<EntryId> = None;
            loop {
                // Read the flag first so a drained page after it is final.
                let writers_done = done.load(Ordering::SeqCst);
                let query = match cursor {
                    Some(id) => DeltaQuery::after(id, 64),
                    None => DeltaQuery::since(Timestamp(0), 64),
                };
                let page = service.get_deltas(&query, CallerScope::Privileged);
                assert!(!page.cursor_invalid);

                if page.has_more {
                    cursor = page.next_cursor;
                } else if let Some(last) = page.items.last() {
                    cursor = Some(last.id);
                }

                let drained = page.items.is_empty();
                seen.extend(page.items.iter().map(|e| (e.created_at, e.id)));
                if drained {
                    if writers_done {
                        break;
                    }
                    thread::yield_now();
                }
            }
            seen
        })
    };

    let timer = Timer::new("write while reading");
    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let entity_type = EntityType::ALL[(t + i) % EntityType::ALL.len()];
                    let id = format!("w{}-{}", t, i % 50);
                    store
                        .record_change(entity_type, Some(&id), OpType::Update, None)
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);

    let seen = reader.join().unwrap();
    timer.report();

    assert_eq!(seen.len(), WRITERS * PER_WRITER);
    let unique: HashSet<_> = seen.iter().map(|(_, id)| *id).collect();
    assert_eq!(unique.len(), WRITERS * PER_WRITER);
    assert!(
        seen.windows(2).all(|w| w[0] < w[1]),
        "feed not strictly ascending by (created_at, id)"
    );
}
