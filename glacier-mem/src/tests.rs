use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{perm, GuestMemory, MemError, PAGE_SIZE};

#[test]
fn write_across_boundary() {
    let mem = GuestMemory::new();
    assert!(mem.map_memory_len(0x20000, 0x2000, perm::RW));

    let payload = [0xFE; 0xFFC];
    mem.write_bytes(0x20170, &payload, perm::WRITE).unwrap();

    let mut output = [0x00; 0xFFC];
    mem.read_bytes(0x20170, &mut output, perm::READ).unwrap();

    assert_eq!(&output[..], &payload[..])
}

#[test]
fn overlapping_map_is_rejected() {
    let mem = GuestMemory::new();
    assert!(mem.map_memory_len(0x1000, 0x1000, perm::RW));
    assert!(!mem.map_memory_len(0x1800, 0x1000, perm::RW));
    assert!(mem.map_memory_len(0x2000, 0x1000, perm::RW));
}

#[test]
fn unmapped_access() {
    let mem = GuestMemory::new();
    assert!(mem.map_memory_len(0x1000, 0x1000, perm::RW));

    assert_eq!(mem.read::<4>(0x3000, perm::READ), Err(MemError::Unmapped));
    assert_eq!(mem.write(0x3000, [0; 4], perm::WRITE), Err(MemError::Unmapped));

    // An access that starts in a mapped page and runs off the end must fail without writing.
    assert_eq!(mem.write(0x1ffe, [0xaa; 4], perm::WRITE), Err(MemError::Unmapped));
    assert_eq!(mem.read::<2>(0x1ffe, perm::READ), Ok([0, 0]));
}

#[test]
fn permission_checks() {
    let mem = GuestMemory::new();
    assert!(mem.map_memory_len(0x1000, 0x1000, perm::RX));
    assert!(mem.map_memory_len(0x2000, 0x1000, perm::RW));

    assert_eq!(mem.write(0x1000, [1], perm::WRITE), Err(MemError::WriteViolation));
    assert!(mem.read::<4>(0x1000, perm::READ).is_ok());

    assert!(mem.is_executable(0x1000, 4));
    assert!(!mem.is_executable(0x2000, 4));
    assert!(!mem.is_executable(0x1ffe, 4));
    assert!(!mem.is_executable(0x8000, 4));

    mem.update_perm(0x2000, 0x1000, perm::RWX).unwrap();
    assert!(mem.is_executable(0x2000, 4));
}

#[test]
fn read_word_is_little_endian() {
    let mem = GuestMemory::new();
    assert!(mem.map_memory_len(0x1000, PAGE_SIZE, perm::RX));
    mem.write_bytes(0x1004, &[0x1f, 0x20, 0x03, 0xd5], perm::NONE).unwrap();
    assert_eq!(mem.read_word(0x1004), Ok(0xd503201f));
}

#[test]
fn write_hook_only_fires_for_code_pages() {
    let mem = GuestMemory::new();
    assert!(mem.map_memory_len(0x1000, 0x2000, perm::RWX));

    let hits = Arc::new(AtomicU64::new(0));
    let last = Arc::new(AtomicU64::new(0));
    let id = {
        let (hits, last) = (hits.clone(), last.clone());
        mem.add_write_hook(Box::new(move |addr: u64, len: u64| {
            hits.fetch_add(1, Ordering::Relaxed);
            last.store(addr + len, Ordering::Relaxed);
        }))
    };

    mem.write(0x1100, [1, 2, 3, 4], perm::WRITE).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 0);

    mem.mark_code(0x1000, 8);
    assert!(mem.is_code(0x1ff0));
    assert!(!mem.is_code(0x2000));

    mem.write(0x1100, [5, 6, 7, 8], perm::WRITE).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert_eq!(last.load(Ordering::Relaxed), 0x1104);

    mem.write(0x2100, [5, 6, 7, 8], perm::WRITE).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    // Updating permissions keeps the code marker.
    mem.update_perm(0x1000, 0x1000, perm::RW).unwrap();
    assert!(mem.is_code(0x1000));

    assert!(mem.remove_write_hook(id));
    mem.write(0x1100, [0; 4], perm::WRITE).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn access_ending_at_the_top_of_the_address_space() {
    let mem = GuestMemory::new();
    let last_page = u64::MAX - (PAGE_SIZE - 1);
    assert!(mem.map_memory_len(last_page, PAGE_SIZE, perm::RW));

    let value = 0x0102_0304_0506_0708_u64.to_le_bytes();
    mem.write(u64::MAX - 7, value, perm::WRITE).unwrap();
    assert_eq!(mem.read::<8>(u64::MAX - 7, perm::READ), Ok(value));
    assert_eq!(mem.read::<1>(u64::MAX, perm::READ), Ok([0x01]));

    assert_eq!(mem.read::<8>(u64::MAX - 6, perm::READ), Err(MemError::AddressOverflow));
    assert_eq!(mem.write(u64::MAX, [0; 2], perm::WRITE), Err(MemError::AddressOverflow));
}
