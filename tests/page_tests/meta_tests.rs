//! Tests for meta pages
//!
//! These tests verify:
//! - Encoding and decoding of the meta record
//! - Checksum, magic and version validation
//! - Slot selection by transaction id

use boltkv::page::{Meta, MAGIC, PAGE_HEADER_SIZE, VERSION};
use boltkv::BoltError;

fn encoded(meta: &mut Meta) -> Vec<u8> {
    let mut page = vec![0u8; 4096];
    meta.write_page(&mut page);
    page
}

#[test]
fn test_new_meta_is_valid() {
    let meta = Meta::new(4096, 1, 2, 3, 4);
    assert_eq!(meta.magic, MAGIC);
    assert_eq!(meta.version, VERSION);
    assert!(meta.validate().is_ok());
}

#[test]
fn test_write_then_decode() {
    let mut meta = Meta::new(4096, 7, 12, 15, 40);
    meta.root.sequence = 99;
    let page = encoded(&mut meta);

    let decoded = Meta::decode(&page).unwrap();
    assert_eq!(decoded, meta);
    assert!(decoded.validate().is_ok());
    assert_eq!(decoded.root.root, 15);
    assert_eq!(decoded.root.sequence, 99);
}

#[test]
fn test_slot_alternates_with_txid() {
    assert_eq!(Meta::new(4096, 0, 2, 3, 4).slot(), 0);
    assert_eq!(Meta::new(4096, 1, 2, 3, 4).slot(), 1);
    assert_eq!(Meta::new(4096, 10, 2, 3, 4).slot(), 0);

    let mut meta = Meta::new(4096, 5, 2, 3, 4);
    let page = encoded(&mut meta);
    // Page header id is the slot.
    assert_eq!(page[0], 1);
}

#[test]
fn test_checksum_detects_torn_write() {
    let mut meta = Meta::new(4096, 3, 2, 3, 4);
    let mut page = encoded(&mut meta);
    page[PAGE_HEADER_SIZE + 40] ^= 0xFF;

    let decoded = Meta::decode(&page).unwrap();
    assert!(matches!(decoded.validate(), Err(BoltError::Corrupted(_))));
}

#[test]
fn test_bad_magic_rejected() {
    let mut meta = Meta::new(4096, 3, 2, 3, 4);
    meta.magic = 0xDEAD_BEEF;
    let page = encoded(&mut meta);

    let decoded = Meta::decode(&page).unwrap();
    assert!(matches!(decoded.validate(), Err(BoltError::InvalidDatabase(_))));
}

#[test]
fn test_version_mismatch_rejected() {
    let mut meta = Meta::new(4096, 3, 2, 3, 4);
    meta.version = VERSION + 1;
    let page = encoded(&mut meta);

    let decoded = Meta::decode(&page).unwrap();
    assert!(matches!(
        decoded.validate(),
        Err(BoltError::VersionMismatch { found, .. }) if found == VERSION + 1
    ));
}

#[test]
fn test_decode_short_buffer() {
    assert!(matches!(
        Meta::decode(&[0u8; 20]),
        Err(BoltError::InvalidDatabase(_))
    ));
}
