//! Kernel page pool.
//!
//! A fixed slab of kernel pages pre-mapped at [`KPOOL_BASE_VIRT`] in every
//! address space and backed by frames booked at boot. Allocation is one bit
//! per page; freeing never migrates memory. Thread kernel stacks and other
//! short-lived kernel pages come from here.

use spin::Mutex;

use crate::error::KpoolError;

use super::{VirtAddr, KPOOL_BASE_VIRT, KPOOL_SIZE, PAGE_SHIFT, PAGE_SIZE};

/// Number of pages in the pool.
pub const KPOOL_PAGES: usize = KPOOL_SIZE as usize / PAGE_SIZE;

const BITMAP_WORDS: usize = KPOOL_PAGES / 64;

struct Bits {
    /// 1 = free, 0 = in use.
    words: [u64; BITMAP_WORDS],
    free: usize,
}

/// Fixed-count slab of kernel pages.
pub struct Kpool {
    inner: Mutex<Bits>,
}

impl Kpool {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Bits {
                words: [u64::MAX; BITMAP_WORDS],
                free: KPOOL_PAGES,
            }),
        }
    }

    /// Takes one kernel page, returning its virtual address.
    pub fn get(&self) -> Result<VirtAddr, KpoolError> {
        let mut bits = self.inner.lock();

        for word in 0..BITMAP_WORDS {
            if bits.words[word] == 0 {
                continue;
            }
            let bit = bits.words[word].trailing_zeros() as usize;
            bits.words[word] &= !(1 << bit);
            bits.free -= 1;
            let idx = word * 64 + bit;
            return Ok(VirtAddr::new(KPOOL_BASE_VIRT + (idx << PAGE_SHIFT) as u32));
        }

        Err(KpoolError::Exhausted)
    }

    /// Returns a kernel page to the pool.
    pub fn put(&self, addr: VirtAddr) -> Result<(), KpoolError> {
        if !addr.is_page_aligned()
            || addr.as_u32() < KPOOL_BASE_VIRT
            || addr.as_u32() >= KPOOL_BASE_VIRT + KPOOL_SIZE
        {
            return Err(KpoolError::InvalidPage);
        }

        let idx = ((addr.as_u32() - KPOOL_BASE_VIRT) >> PAGE_SHIFT) as usize;
        let (word, bit) = (idx / 64, idx % 64);

        let mut bits = self.inner.lock();
        if bits.words[word] & (1 << bit) != 0 {
            return Err(KpoolError::DoublePut);
        }
        bits.words[word] |= 1 << bit;
        bits.free += 1;
        Ok(())
    }

    pub fn free_pages(&self) -> usize {
        self.inner.lock().free
    }
}

impl Default for Kpool {
    fn default() -> Self {
        Self::new()
    }
}

/// The system kernel page pool.
static KPOOL: Kpool = Kpool::new();

pub fn init() {
    log::info!("initializing the kernel page pool ({} pages)", KPOOL_PAGES);
}

/// Takes one kernel page from the system pool.
pub fn kpage_get() -> Result<VirtAddr, KpoolError> {
    KPOOL.get()
}

/// Returns a kernel page to the system pool; a double put is a soft error.
pub fn kpage_put(addr: VirtAddr) -> Result<(), KpoolError> {
    KPOOL.put(addr).map_err(|e| {
        log::warn!("bad kernel page put (addr={}): {:?}", addr, e);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_come_from_the_pool_region() {
        let pool = Kpool::new();
        let page = pool.get().unwrap();
        assert!(page.as_u32() >= KPOOL_BASE_VIRT);
        assert!(page.as_u32() < KPOOL_BASE_VIRT + KPOOL_SIZE);
        assert!(page.is_page_aligned());
    }

    #[test]
    fn get_put_round_trip() {
        let pool = Kpool::new();
        let before = pool.free_pages();
        let page = pool.get().unwrap();
        assert_eq!(pool.free_pages(), before - 1);
        pool.put(page).unwrap();
        assert_eq!(pool.free_pages(), before);
    }

    #[test]
    fn double_put_is_rejected() {
        let pool = Kpool::new();
        let page = pool.get().unwrap();
        pool.put(page).unwrap();
        assert_eq!(pool.put(page), Err(KpoolError::DoublePut));
    }

    #[test]
    fn foreign_addresses_are_rejected() {
        let pool = Kpool::new();
        assert_eq!(
            pool.put(VirtAddr::new(0x2000)),
            Err(KpoolError::InvalidPage)
        );
        assert_eq!(
            pool.put(VirtAddr::new(KPOOL_BASE_VIRT + 1)),
            Err(KpoolError::InvalidPage)
        );
    }

    #[test]
    fn pool_exhausts_at_fixed_count() {
        let pool = Kpool::new();
        for _ in 0..KPOOL_PAGES {
            pool.get().unwrap();
        }
        assert_eq!(pool.get(), Err(KpoolError::Exhausted));
    }
}
