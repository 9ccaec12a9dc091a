pub mod perm;

#[cfg(test)]
mod tests;

use hashbrown::HashMap;
use parking_lot::RwLock;

pub use crate::perm::{MemError, MemResult};

pub const PAGE_BITS: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Called with the `(start, len)` of a write that touched a page containing translated code.
pub trait WriteHook: Send + Sync {
    fn modified(&self, addr: u64, len: u64);
}

impl<F> WriteHook for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn modified(&self, addr: u64, len: u64) {
        self(addr, len)
    }
}

struct Page {
    data: Box<[u8]>,
    perm: u8,
}

impl Page {
    fn new(perm: u8) -> Self {
        Self { data: vec![0; PAGE_SIZE as usize].into_boxed_slice(), perm: perm | perm::MAP }
    }
}

/// Paged guest memory that can be shared between execution threads and the translator.
///
/// Pages are guarded by a single reader-writer lock: lookups from the decoder and from compiled
/// code take the read side, writes take the write side only for the duration of the copy.
#[derive(Default)]
pub struct GuestMemory {
    pages: RwLock<HashMap<u64, Page>>,
    write_hooks: RwLock<Vec<(usize, Box<dyn WriteHook>)>>,
    next_hook_id: std::sync::atomic::AtomicUsize,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `len` bytes starting at `start` (rounded out to page boundaries) with `perm`. Returns
    /// `false` without mapping anything if any of the pages are already mapped.
    pub fn map_memory_len(&self, start: u64, len: u64, perm: u8) -> bool {
        let Some((first, last)) = page_range(start, len)
        else {
            return false;
        };

        let mut pages = self.pages.write();
        if (first..=last).any(|index| pages.contains_key(&index)) {
            tracing::debug!("map_memory_len: {start:#x} (len={len:#x}) overlaps existing mapping");
            return false;
        }
        for index in first..=last {
            pages.insert(index, Page::new(perm));
        }
        true
    }

    pub fn unmap_memory_len(&self, start: u64, len: u64) -> bool {
        let Some((first, last)) = page_range(start, len)
        else {
            return false;
        };

        let mut pages = self.pages.write();
        let mut removed = false;
        for index in first..=last {
            removed |= pages.remove(&index).is_some();
        }
        removed
    }

    /// Replaces the permissions of every page overlapping `[start, start + len)`. The code-cache
    /// marker is preserved.
    pub fn update_perm(&self, start: u64, len: u64, perm: u8) -> MemResult<()> {
        let (first, last) = page_range(start, len).ok_or(MemError::AddressOverflow)?;

        let mut pages = self.pages.write();
        for index in first..=last {
            let page = pages.get_mut(&index).ok_or(MemError::Unmapped)?;
            page.perm = perm | perm::MAP | (page.perm & perm::IN_CODE_CACHE);
        }
        Ok(())
    }

    pub fn get_perm(&self, addr: u64) -> u8 {
        self.pages.read().get(&(addr >> PAGE_BITS)).map_or(perm::NONE, |page| page.perm)
    }

    /// Returns whether every byte in `[addr, addr + len)` is mapped executable.
    pub fn is_executable(&self, addr: u64, len: u64) -> bool {
        let Some((first, last)) = page_range(addr, len)
        else {
            return false;
        };
        let pages = self.pages.read();
        (first..=last).all(|index| {
            pages.get(&index).map_or(false, |page| perm::check(page.perm, perm::EXEC).is_ok())
        })
    }

    /// Reads a little-endian instruction word without checking permissions, callers are expected
    /// to have checked [GuestMemory::is_executable] first.
    pub fn read_word(&self, addr: u64) -> MemResult<u32> {
        Ok(u32::from_le_bytes(self.read::<4>(addr, perm::NONE)?))
    }

    pub fn read<const N: usize>(&self, addr: u64, perm: u8) -> MemResult<[u8; N]> {
        let mut buf = [0; N];
        self.read_bytes(addr, &mut buf, perm)?;
        Ok(buf)
    }

    pub fn write<const N: usize>(&self, addr: u64, value: [u8; N], perm: u8) -> MemResult<()> {
        self.write_bytes(addr, &value, perm)
    }

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8], perm: u8) -> MemResult<()> {
        let pages = self.pages.read();
        for_each_chunk(addr, buf.len(), |index, offset, range| {
            let page = pages.get(&index).ok_or(MemError::Unmapped)?;
            perm::check(page.perm, perm)?;
            buf[range.clone()].copy_from_slice(&page.data[offset..offset + range.len()]);
            Ok(())
        })
    }

    pub fn write_bytes(&self, addr: u64, buf: &[u8], perm: u8) -> MemResult<()> {
        let mut touched_code = false;
        {
            let mut pages = self.pages.write();

            // Check the whole range up front so a faulting write never partially lands.
            for_each_chunk(addr, buf.len(), |index, _, _| {
                let page = pages.get(&index).ok_or(MemError::Unmapped)?;
                perm::check(page.perm, perm)
            })?;

            for_each_chunk(addr, buf.len(), |index, offset, range| {
                let page = pages.get_mut(&index).ok_or(MemError::Unmapped)?;
                touched_code |= page.perm & perm::IN_CODE_CACHE != 0;
                page.data[offset..offset + range.len()].copy_from_slice(&buf[range]);
                Ok(())
            })?;
        }

        if touched_code {
            tracing::trace!("write to code page: {addr:#x} (len={})", buf.len());
            self.notify_modified(addr, buf.len() as u64);
        }
        Ok(())
    }

    /// Marks the pages covering `[addr, addr + len)` as containing translated code.
    pub fn mark_code(&self, addr: u64, len: u64) {
        let Some((first, last)) = page_range(addr, len)
        else {
            return;
        };
        let mut pages = self.pages.write();
        for index in first..=last {
            if let Some(page) = pages.get_mut(&index) {
                page.perm |= perm::IN_CODE_CACHE;
            }
        }
    }

    pub fn is_code(&self, addr: u64) -> bool {
        self.get_perm(addr) & perm::IN_CODE_CACHE != 0
    }

    /// Registers a hook that is invoked after every write that lands on a page marked with
    /// [GuestMemory::mark_code]. Returns an id that can be passed to
    /// [GuestMemory::remove_write_hook].
    pub fn add_write_hook(&self, hook: Box<dyn WriteHook>) -> usize {
        let id = self.next_hook_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.write_hooks.write().push((id, hook));
        id
    }

    pub fn remove_write_hook(&self, id: usize) -> bool {
        let mut hooks = self.write_hooks.write();
        let len = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != len
    }

    fn notify_modified(&self, addr: u64, len: u64) {
        for (_, hook) in self.write_hooks.read().iter() {
            hook.modified(addr, len);
        }
    }
}

/// Returns the first and last page index covered by `[start, start + len)`.
fn page_range(start: u64, len: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let end = start.checked_add(len - 1)?;
    Some((start >> PAGE_BITS, end >> PAGE_BITS))
}

/// Splits an access of `len` bytes at `addr` into per-page chunks, calling `f` with the page
/// index, the offset within the page and the range within the caller's buffer.
fn for_each_chunk(
    addr: u64,
    len: usize,
    mut f: impl FnMut(u64, usize, std::ops::Range<usize>) -> MemResult<()>,
) -> MemResult<()> {
    if len != 0 {
        addr.checked_add(len as u64 - 1).ok_or(MemError::AddressOverflow)?;
    }

    let mut done = 0;
    while done < len {
        let current = addr + done as u64;
        let offset = (current & PAGE_MASK) as usize;
        let chunk = (PAGE_SIZE as usize - offset).min(len - done);
        f(current >> PAGE_BITS, offset, done..done + chunk)?;
        done += chunk;
    }
    Ok(())
}
