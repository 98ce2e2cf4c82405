//! Tests for Cursor
//!
//! These tests verify:
//! - Forward and backward iteration across leaf pages
//! - Seek semantics (exact, between keys, past the end)
//! - Nested buckets appearing as bucket entries
//! - Deleting under the cursor while iterating
//! - Cursors in write transactions see uncommitted changes

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

fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

/// Bucket "b" holding keys 0, step, 2*step, ... below `n`
fn setup_keys(db: &Db, n: u32, step: u32) {
    db.update(|tx| -> boltkv::Result<()> {
        let bucket = tx.create_bucket(b"b")?;
        for i in (0..n).step_by(step as usize) {
            bucket.put(&key(i), format!("v{}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_empty_bucket() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"b").map(|_| ())).unwrap();

    db.view(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.bucket(b"b")?.cursor();
        assert_eq!(cursor.first()?, None);
        assert_eq!(cursor.last()?, None);
        assert_eq!(cursor.seek(b"a")?, None);
        assert_eq!(cursor.next()?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_forward_iteration_in_order() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 1_000, 1);

    db.view(|tx| -> boltkv::Result<()> {
        assert!(tx.bucket(b"b")?.stats()?.leaf_pages > 1);

        let mut cursor = tx.bucket(b"b")?.cursor();
        let mut expected = 0u32;
        let mut item = cursor.first()?;
        while let Some((k, v)) = item {
            assert_eq!(k, key(expected));
            assert_eq!(v, format!("v{}", expected).into_bytes());
            expected += 1;
            item = cursor.next()?;
        }
        assert_eq!(expected, 1_000);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_backward_iteration_in_order() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 1_000, 1);

    db.view(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.bucket(b"b")?.cursor();
        let mut expected = 1_000u32;
        let mut item = cursor.last()?;
        while let Some((k, _)) = item {
            expected -= 1;
            assert_eq!(k, key(expected));
            item = cursor.prev()?;
        }
        assert_eq!(expected, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_direction_changes() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 10, 1);

    db.view(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.bucket(b"b")?.cursor();
        assert_eq!(cursor.seek(&key(5))?.map(|(k, _)| k), Some(key(5)));
        assert_eq!(cursor.next()?.map(|(k, _)| k), Some(key(6)));
        assert_eq!(cursor.prev()?.map(|(k, _)| k), Some(key(5)));
        assert_eq!(cursor.prev()?.map(|(k, _)| k), Some(key(4)));

        assert_eq!(cursor.first()?.map(|(k, _)| k), Some(key(0)));
        assert_eq!(cursor.prev()?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_prev_after_running_off_the_end() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 3, 1);

    db.view(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.bucket(b"b")?.cursor();
        assert_eq!(cursor.last()?.map(|(k, _)| k), Some(key(2)));
        assert_eq!(cursor.next()?, None);
        assert_eq!(cursor.next()?, None);
        assert_eq!(cursor.prev()?.map(|(k, _)| k), Some(key(2)));
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Seek Tests
// =============================================================================

#[test]
fn test_seek() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 5_000, 10);

    db.view(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.bucket(b"b")?.cursor();

        // Exact match
        let (k, v) = cursor.seek(&key(1_230))?.unwrap();
        assert_eq!(k, key(1_230));
        assert_eq!(v, b"v1230".to_vec());

        // Between keys lands on the successor
        assert_eq!(cursor.seek(&key(1_235))?.map(|(k, _)| k), Some(key(1_240)));
        assert_eq!(cursor.next()?.map(|(k, _)| k), Some(key(1_250)));

        // Before the first key
        assert_eq!(cursor.seek(b"")?.map(|(k, _)| k), Some(key(0)));

        // Past the last key
        assert_eq!(cursor.seek(&key(4_991))?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_seek_lands_on_every_leaf_boundary() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 2_000, 2);

    db.view(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.bucket(b"b")?.cursor();
        for i in (1..1_999).step_by(2) {
            let found = cursor.seek(&key(i))?.map(|(k, _)| k);
            assert_eq!(found, Some(key(i + 1)), "seek {}", i);
        }
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Nested Bucket Tests
// =============================================================================

#[test]
fn test_nested_bucket_entries() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| -> boltkv::Result<()> {
        let bucket = tx.create_bucket(b"b")?;
        bucket.put(b"a", b"1")?;
        bucket.create_bucket(b"m")?.put(b"inner", b"x")?;
        bucket.put(b"z", b"2")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.bucket(b"b")?.cursor();

        assert_eq!(cursor.first()?, Some((b"a".to_vec(), b"1".to_vec())));
        assert!(!cursor.is_bucket());

        assert_eq!(cursor.next()?, Some((b"m".to_vec(), Vec::new())));
        assert!(cursor.is_bucket());

        assert_eq!(cursor.next()?, Some((b"z".to_vec(), b"2".to_vec())));
        assert!(!cursor.is_bucket());
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_root_cursor_lists_buckets() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| -> boltkv::Result<()> {
        tx.create_bucket(b"two")?;
        tx.create_bucket(b"one")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.cursor();
        assert_eq!(cursor.first()?.map(|(k, _)| k), Some(b"one".to_vec()));
        assert!(cursor.is_bucket());
        assert_eq!(cursor.next()?.map(|(k, _)| k), Some(b"two".to_vec()));
        assert_eq!(cursor.next()?, None);
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Write Transaction Tests
// =============================================================================

#[test]
fn test_cursor_sees_uncommitted_writes() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 100, 2);

    let tx = db.begin(true).unwrap();
    let bucket = tx.bucket(b"b").unwrap();
    bucket.put(&key(1), b"new").unwrap();
    bucket.delete(&key(0)).unwrap();

    let mut cursor = bucket.cursor();
    assert_eq!(cursor.first().unwrap(), Some((key(1), b"new".to_vec())));
    assert_eq!(cursor.next().unwrap().map(|(k, _)| k), Some(key(2)));
    assert_eq!(cursor.bucket().name(), b"b".to_vec());
}

#[test]
fn test_delete_while_iterating() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 2_000, 1);

    db.update(|tx| -> boltkv::Result<()> {
        let mut cursor = tx.bucket(b"b")?.cursor();
        let mut item = cursor.first()?;
        while let Some((k, _)) = item {
            let n = u32::from_be_bytes(k[..4].try_into().unwrap());
            if n % 2 == 0 {
                cursor.delete()?;
            }
            item = cursor.next()?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| -> boltkv::Result<()> {
        tx.check()?;
        let mut seen = Vec::new();
        tx.bucket(b"b")?.for_each(|k, _| {
            seen.push(u32::from_be_bytes(k[..4].try_into().unwrap()));
            Ok(())
        })?;
        let expected: Vec<u32> = (1..2_000).step_by(2).collect();
        assert_eq!(seen, expected);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_requires_writable_tx() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 10, 1);

    let tx = db.begin(false).unwrap();
    let mut cursor = tx.bucket(b"b").unwrap().cursor();
    cursor.first().unwrap();
    assert!(matches!(cursor.delete(), Err(BoltError::TxNotWritable)));
}

#[test]
fn test_delete_rejects_bucket_entries() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"b").map(|_| ())).unwrap();

    let tx = db.begin(true).unwrap();
    let mut cursor = tx.cursor();
    assert!(cursor.first().unwrap().is_some());
    assert!(matches!(cursor.delete(), Err(BoltError::IncompatibleValue)));
}

#[test]
fn test_cursor_expires_with_its_bucket() {
    let (_temp, db) = setup_temp_db();
    setup_keys(&db, 10, 1);

    let tx = db.begin(true).unwrap();
    let mut cursor = tx.bucket(b"b").unwrap().cursor();
    assert!(cursor.first().unwrap().is_some());

    tx.delete_bucket(b"b").unwrap();
    assert!(matches!(cursor.next(), Err(BoltError::CursorExpired)));
    assert!(matches!(cursor.first(), Err(BoltError::CursorExpired)));
    assert!(matches!(cursor.delete(), Err(BoltError::CursorExpired)));
}
