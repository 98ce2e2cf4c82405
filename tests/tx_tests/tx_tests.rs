//! Tests for transactions
//!
//! These tests verify:
//! - Commit and rollback (explicit, on drop, on closure error)
//! - Snapshot isolation between readers and the writer
//! - The single writer slot and its timeout
//! - Page reuse once readers finish
//! - Consistency check and hot backup

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use boltkv::{BoltError, Db, Options};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_db() -> (TempDir, Db) {
    let temp_dir = TempDir::new().unwrap();
    let db = Db::open(temp_dir.path().join("test.db"), Options::default()).unwrap();
    (temp_dir, db)
}

fn setup_temp_db_with(options: Options) -> (TempDir, Db) {
    let temp_dir = TempDir::new().unwrap();
    let db = Db::open(temp_dir.path().join("test.db"), options).unwrap();
    (temp_dir, db)
}

fn put(db: &Db, key: &[u8], value: &[u8]) {
    db.update(|tx| -> boltkv::Result<()> {
        tx.create_bucket_if_not_exists(b"data")?.put(key, value)
    })
    .unwrap();
}

fn get(db: &Db, key: &[u8]) -> Option<Vec<u8>> {
    db.view(|tx| -> boltkv::Result<Option<Vec<u8>>> {
        match tx.bucket(b"data") {
            Ok(bucket) => bucket.get(key),
            Err(BoltError::BucketNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    })
    .unwrap()
}

#[derive(Debug)]
enum AppError {
    Store(BoltError),
    Rejected,
}

impl From<BoltError> for AppError {
    fn from(e: BoltError) -> Self {
        AppError::Store(e)
    }
}

// =============================================================================
// Commit / Rollback Tests
// =============================================================================

#[test]
fn test_commit_makes_writes_visible() {
    let (_temp, db) = setup_temp_db();

    let tx = db.begin(true).unwrap();
    tx.create_bucket(b"data").unwrap().put(b"k", b"v").unwrap();
    tx.commit().unwrap();

    assert_eq!(get(&db, b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_rollback_discards_writes() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"keep", b"1");

    let tx = db.begin(true).unwrap();
    let bucket = tx.bucket(b"data").unwrap();
    bucket.put(b"discard", b"2").unwrap();
    bucket.delete(b"keep").unwrap();
    tx.rollback();

    assert_eq!(get(&db, b"keep"), Some(b"1".to_vec()));
    assert_eq!(get(&db, b"discard"), None);
}

#[test]
fn test_drop_rolls_back_and_frees_writer() {
    let options = Options::builder()
        .write_lock_timeout(Duration::from_millis(200))
        .build();
    let (_temp, db) = setup_temp_db_with(options);

    {
        let tx = db.begin(true).unwrap();
        tx.create_bucket(b"data").unwrap();
    }

    assert_eq!(get(&db, b"anything"), None);
    assert!(db.begin(true).is_ok());
}

#[test]
fn test_update_error_rolls_back() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"k", b"old");

    let result: Result<(), AppError> = db.update(|tx| {
        tx.bucket(b"data")?.put(b"k", b"new")?;
        Err(AppError::Rejected)
    });

    assert!(matches!(result, Err(AppError::Rejected)));
    assert_eq!(get(&db, b"k"), Some(b"old".to_vec()));
}

#[test]
fn test_update_maps_store_errors() {
    let (_temp, db) = setup_temp_db();

    let result: Result<(), AppError> = db.update(|tx| {
        tx.bucket(b"missing")?;
        Ok(())
    });

    assert!(matches!(result, Err(AppError::Store(BoltError::BucketNotFound))));
}

#[test]
fn test_update_returns_value() {
    let (_temp, db) = setup_temp_db();

    let seq = db
        .update(|tx| -> boltkv::Result<u64> {
            let bucket = tx.create_bucket(b"data")?;
            bucket.next_sequence()?;
            bucket.next_sequence()
        })
        .unwrap();
    assert_eq!(seq, 2);
}

#[test]
fn test_read_tx_is_not_writable() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"k", b"v");

    let tx = db.begin(false).unwrap();
    assert!(!tx.writable());
    let bucket = tx.bucket(b"data").unwrap();
    assert!(matches!(bucket.put(b"a", b"b"), Err(BoltError::TxNotWritable)));
    assert!(matches!(bucket.delete(b"k"), Err(BoltError::TxNotWritable)));
    assert!(matches!(tx.create_bucket(b"x"), Err(BoltError::TxNotWritable)));
    assert!(matches!(tx.delete_bucket(b"data"), Err(BoltError::TxNotWritable)));
    assert!(matches!(tx.commit(), Err(BoltError::TxNotWritable)));
}

#[test]
fn test_transaction_ids() {
    let (_temp, db) = setup_temp_db();

    assert_eq!(db.begin(false).unwrap().id(), 1);
    {
        let tx = db.begin(true).unwrap();
        assert_eq!(tx.id(), 2);
        tx.create_bucket(b"data").unwrap();
        tx.commit().unwrap();
    }
    assert_eq!(db.begin(false).unwrap().id(), 2);
    assert_eq!(db.begin(true).unwrap().id(), 3);
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_reader_keeps_its_snapshot() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"k", b"v1");

    let reader = db.begin(false).unwrap();

    put(&db, b"k", b"v2");
    put(&db, b"other", b"x");

    let bucket = reader.bucket(b"data").unwrap();
    assert_eq!(bucket.get(b"k").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(bucket.get(b"other").unwrap(), None);
    drop(reader);

    assert_eq!(get(&db, b"k"), Some(b"v2".to_vec()));
}

#[test]
fn test_writer_sees_own_uncommitted_writes() {
    let (_temp, db) = setup_temp_db();

    let tx = db.begin(true).unwrap();
    let bucket = tx.create_bucket(b"data").unwrap();
    bucket.put(b"k", b"v").unwrap();
    assert_eq!(bucket.get(b"k").unwrap(), Some(b"v".to_vec()));

    // Not visible outside until commit.
    assert_eq!(get(&db, b"k"), None);
    tx.commit().unwrap();
    assert_eq!(get(&db, b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_reader_survives_file_growth() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"k", b"v");

    let reader = db.begin(false).unwrap();
    db.update(|tx| -> boltkv::Result<()> {
        let bucket = tx.bucket(b"data")?;
        for i in 0..5_000u32 {
            bucket.put(&i.to_be_bytes(), &[7u8; 100])?;
        }
        Ok(())
    })
    .unwrap();

    let bucket = reader.bucket(b"data").unwrap();
    assert_eq!(bucket.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(bucket.get(&0u32.to_be_bytes()).unwrap(), None);
}

// =============================================================================
// Writer Slot Tests
// =============================================================================

#[test]
fn test_second_writer_times_out() {
    let options = Options::builder()
        .write_lock_timeout(Duration::from_millis(100))
        .build();
    let (_temp, db) = setup_temp_db_with(options);

    let _writer = db.begin(true).unwrap();
    let result = db.begin(true);
    assert!(matches!(result, Err(BoltError::LockTimeout("writer"))));

    // Readers are never blocked by the writer.
    assert!(db.begin(false).is_ok());
}

#[test]
fn test_writers_are_serialized() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"counter", &0u64.to_be_bytes());
    let db = Arc::new(db);

    let mut handles = vec![];
    for _ in 0..4 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                db.update(|tx| -> boltkv::Result<()> {
                    let bucket = tx.bucket(b"data")?;
                    let current = bucket.get(b"counter")?.unwrap();
                    let n = u64::from_be_bytes(current.try_into().unwrap());
                    bucket.put(b"counter", &(n + 1).to_be_bytes())
                })
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let value = get(&db, b"counter").unwrap();
    assert_eq!(u64::from_be_bytes(value.try_into().unwrap()), 100);
}

#[test]
fn test_concurrent_readers_during_writes() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"a", b"1");
    let db = Arc::new(db);

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..50u32 {
                put(&db, &i.to_be_bytes(), b"x");
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..50 {
                    db.view(|tx| -> boltkv::Result<()> {
                        let bucket = tx.bucket(b"data")?;
                        assert_eq!(bucket.get(b"a")?, Some(b"1".to_vec()));
                        tx.check()
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

// =============================================================================
// Page Reuse Tests
// =============================================================================

#[test]
fn test_pages_reused_without_readers() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"k", b"v");
    let before = db.stats().page_count;

    for i in 0..100u32 {
        put(&db, b"k", &i.to_be_bytes());
    }

    let after = db.stats().page_count;
    assert!(after <= before + 4, "high-water mark grew from {} to {}", before, after);
}

#[test]
fn test_open_reader_pins_freed_pages() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"k", b"v");

    let reader = db.begin(false).unwrap();
    for i in 0..10u32 {
        put(&db, b"k", &i.to_be_bytes());
    }
    assert!(db.stats().pending_pages > 0);
    assert_eq!(db.stats().open_read_txs, 1);

    // The reader still sees its snapshot intact.
    let bucket = reader.bucket(b"data").unwrap();
    assert_eq!(bucket.get(b"k").unwrap(), Some(b"v".to_vec()));
    reader.check().unwrap();
    drop(reader);

    put(&db, b"k", b"final");
    put(&db, b"k", b"final");
    assert_eq!(db.stats().pending_pages, 3);
    assert!(db.stats().free_pages > 0);
}

// =============================================================================
// Check / Backup Tests
// =============================================================================

#[test]
fn test_check_after_many_changes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.db");
    let db = Db::open(&path, Options::default()).unwrap();

    db.update(|tx| -> boltkv::Result<()> {
        let bucket = tx.create_bucket(b"data")?;
        for i in 0..3_000u32 {
            bucket.put(&i.to_be_bytes(), format!("value-{}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| -> boltkv::Result<()> {
        let bucket = tx.bucket(b"data")?;
        for i in (0..3_000u32).filter(|i| i % 3 != 0) {
            bucket.delete(&i.to_be_bytes())?;
        }
        Ok(())
    })
    .unwrap();
    db.view(|tx| tx.check()).unwrap();
    db.close().unwrap();
    drop(db);

    let db = Db::open(&path, Options::default()).unwrap();
    db.view(|tx| -> boltkv::Result<()> {
        tx.check()?;
        let bucket = tx.bucket(b"data")?;
        assert_eq!(bucket.stats()?.key_count, 1_000);
        assert_eq!(bucket.get(&3u32.to_be_bytes())?, Some(b"value-3".to_vec()));
        assert_eq!(bucket.get(&4u32.to_be_bytes())?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_copy_file_produces_valid_database() {
    let (temp, db) = setup_temp_db();
    put(&db, b"k", b"v");
    db.update(|tx| -> boltkv::Result<()> {
        tx.create_bucket(b"more")?.create_bucket(b"nested")?.put(b"n", b"1")
    })
    .unwrap();

    let backup = temp.path().join("backup.db");
    db.view(|tx| tx.copy_file(&backup)).unwrap();

    // Later writes do not reach the backup.
    put(&db, b"k", b"changed");

    let copy = Db::open(&backup, Options::default()).unwrap();
    copy.view(|tx| -> boltkv::Result<()> {
        tx.check()?;
        assert_eq!(tx.bucket(b"data")?.get(b"k")?, Some(b"v".to_vec()));
        let nested = tx.bucket(b"more")?.bucket(b"nested")?;
        assert_eq!(nested.get(b"n")?, Some(b"1".to_vec()));
        Ok(())
    })
    .unwrap();

    // The copy accepts new writes.
    copy.update(|tx| -> boltkv::Result<()> { tx.bucket(b"data")?.put(b"x", b"y") })
        .unwrap();
}

#[test]
fn test_write_to_size_matches_tx_size() {
    let (_temp, db) = setup_temp_db();
    put(&db, b"k", b"v");

    let tx = db.begin(false).unwrap();
    let mut buf = Vec::new();
    let written = tx.write_to(&mut buf).unwrap();
    assert_eq!(written, tx.size());
    assert_eq!(buf.len() as u64, written);
}

#[test]
fn test_large_commit_splits_leaves() {
    let (_temp, db) = setup_temp_db();

    let tx = db.begin(true).unwrap();
    let bucket = tx.create_bucket(b"data").unwrap();
    for i in 0..1_000u32 {
        bucket.put(&i.to_be_bytes(), &[0u8; 64]).unwrap();
    }
    assert!(tx.stats().node_count > 0);
    tx.commit().unwrap();

    db.view(|tx| -> boltkv::Result<()> {
        let stats = tx.bucket(b"data")?.stats()?;
        assert!(stats.leaf_pages > 1);
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.key_count, 1_000);
        Ok(())
    })
    .unwrap();
}
