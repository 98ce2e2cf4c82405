//! Tests for the free list
//!
//! These tests verify:
//! - Pending pages are not reusable until released
//! - Contiguous allocation
//! - Rollback of pending frees
//! - Persisting to and loading from a free-list page

use boltkv::page::{flags, write_header, FreeList, Page, PAGE_HEADER_SIZE};
use boltkv::BoltError;

// =============================================================================
// Helper Functions
// =============================================================================

/// Free list with the given ids freed by txid 1 and released
fn free_list_with(ids: &[u64]) -> FreeList {
    let mut freelist = FreeList::new();
    for &id in ids {
        freelist.free(1, id, 0).unwrap();
    }
    freelist.release(1);
    freelist
}

fn write_to_buffer(freelist: &FreeList, page_size: usize) -> Vec<u8> {
    let pages = freelist.size().div_ceil(page_size);
    let mut buf = vec![0u8; pages * page_size];
    freelist.write(2, (pages - 1) as u32, &mut buf);
    buf
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_allocate_from_empty_list() {
    let mut freelist = FreeList::new();
    assert_eq!(freelist.allocate(1), None);
}

#[test]
fn test_allocate_contiguous_run() {
    let mut freelist = free_list_with(&[3, 5, 6, 7, 10]);

    assert_eq!(freelist.allocate(3), Some(5));
    assert_eq!(freelist.free_count(), 2);
    assert!(!freelist.is_free(6));

    // No run of two remains.
    assert_eq!(freelist.allocate(2), None);
    assert_eq!(freelist.allocate(1), Some(3));
    assert_eq!(freelist.allocate(1), Some(10));
    assert_eq!(freelist.allocate(1), None);
}

#[test]
fn test_pending_pages_wait_for_release() {
    let mut freelist = FreeList::new();
    freelist.free(7, 20, 0).unwrap();

    assert_eq!(freelist.pending_count(), 1);
    assert!(freelist.is_free(20));
    assert_eq!(freelist.allocate(1), None);

    freelist.release(6);
    assert_eq!(freelist.allocate(1), None);

    freelist.release(7);
    assert_eq!(freelist.pending_count(), 0);
    assert_eq!(freelist.allocate(1), Some(20));
}

#[test]
fn test_free_includes_overflow_pages() {
    let mut freelist = FreeList::new();
    freelist.free(3, 10, 2).unwrap();

    assert_eq!(freelist.count(), 3);
    assert!(freelist.is_free(10));
    assert!(freelist.is_free(11));
    assert!(freelist.is_free(12));
    assert!(!freelist.is_free(13));
}

#[test]
fn test_free_rejects_meta_pages() {
    let mut freelist = FreeList::new();
    assert!(matches!(freelist.free(2, 0, 0), Err(BoltError::Corrupted(_))));
    assert!(matches!(freelist.free(2, 1, 0), Err(BoltError::Corrupted(_))));
}

#[test]
fn test_double_free_detected() {
    let mut freelist = FreeList::new();
    freelist.free(2, 9, 0).unwrap();
    assert!(matches!(freelist.free(3, 9, 0), Err(BoltError::Corrupted(_))));
}

#[test]
fn test_rollback_forgets_pending() {
    let mut freelist = FreeList::new();
    freelist.free(3, 5, 1).unwrap();
    freelist.free(4, 8, 0).unwrap();

    freelist.rollback(3);

    assert_eq!(freelist.pending_count(), 1);
    assert!(!freelist.is_free(5));
    assert!(!freelist.is_free(6));
    assert!(freelist.is_free(8));
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_write_and_read_page() {
    let mut freelist = free_list_with(&[4, 9, 12]);
    freelist.free(5, 30, 0).unwrap();

    let buf = write_to_buffer(&freelist, 4096);
    let page = Page::new(&buf);
    assert_eq!(page.flags(), flags::FREELIST);
    assert_eq!(page.count(), 4);

    // Pending ids come back as free.
    let loaded = FreeList::read(&page).unwrap();
    assert_eq!(loaded.all_ids(), vec![4, 9, 12, 30]);
    assert_eq!(loaded.free_count(), 4);
    assert_eq!(loaded.pending_count(), 0);
}

#[test]
fn test_large_list_uses_count_overflow() {
    let ids: Vec<u64> = (2..70_002).collect();
    let freelist = free_list_with(&ids);
    assert_eq!(freelist.size(), PAGE_HEADER_SIZE + (ids.len() + 1) * 8);

    let buf = write_to_buffer(&freelist, 4096);
    let page = Page::new(&buf);
    assert_eq!(page.count(), 0xFFFF);
    assert!(page.overflow() > 0);

    let loaded = FreeList::read(&page).unwrap();
    assert_eq!(loaded.free_count(), ids.len());
    assert_eq!(loaded.all_ids(), ids);
}

#[test]
fn test_read_rejects_truncated_list() {
    let freelist = free_list_with(&[4, 9, 12]);
    let mut buf = write_to_buffer(&freelist, 4096);

    // Claim more ids than the page can hold.
    write_header(&mut buf, 2, flags::FREELIST, 1000, 0);
    let result = FreeList::read(&Page::new(&buf));
    assert!(matches!(result, Err(BoltError::Corrupted(_))));

    // Same with the count stored in the first slot.
    write_header(&mut buf, 2, flags::FREELIST, 0xFFFF, 0);
    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8].copy_from_slice(&u64::MAX.to_le_bytes());
    let result = FreeList::read(&Page::new(&buf));
    assert!(matches!(result, Err(BoltError::Corrupted(_))));
}

#[test]
fn test_read_rejects_other_page_types() {
    let mut buf = vec![0u8; 4096];
    write_header(&mut buf, 3, flags::LEAF, 0, 0);
    let result = FreeList::read(&Page::new(&buf));
    assert!(matches!(result, Err(BoltError::Corrupted(_))));
}
