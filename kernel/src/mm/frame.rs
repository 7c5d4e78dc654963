//! Page frame allocator.
//!
//! One bit per physical frame in the DRAM window, guarded by a single spin
//! lock. Boot code books the kernel image, the kernel page pool, and the
//! module regions before the first allocation; `frame_alloc_any` then only
//! ever hands out frames from the user range.

use spin::Mutex;

use crate::error::FrameError;

use super::{FrameNumber, PhysAddr, FRAME_NULL, NUM_FRAMES, PAGE_SHIFT, USER_BASE_PHYS};

const BITMAP_WORDS: usize = NUM_FRAMES / 64;

/// First frame number eligible for `alloc_any`.
const USER_BASE_FRAME: usize = (USER_BASE_PHYS as usize) >> PAGE_SHIFT;

/// Allocator statistics, observable outside the critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub booked: usize,
}

struct Bits {
    /// 1 = free, 0 = allocated.
    words: [u64; BITMAP_WORDS],
    /// 1 = booked at boot; never allocatable, never freeable.
    booked: [u64; BITMAP_WORDS],
    free: usize,
    booked_count: usize,
}

/// Bitmap allocator over the DRAM window.
pub struct FrameAllocator {
    inner: Mutex<Bits>,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Bits {
                words: [u64::MAX; BITMAP_WORDS],
                booked: [0; BITMAP_WORDS],
                free: NUM_FRAMES,
                booked_count: 0,
            }),
        }
    }

    fn in_window(frame: FrameNumber) -> bool {
        (frame.as_u32() as usize) < NUM_FRAMES
    }

    /// Allocates the lowest free frame in the user range.
    pub fn alloc_any(&self) -> Option<FrameNumber> {
        let mut bits = self.inner.lock();

        for idx in USER_BASE_FRAME..NUM_FRAMES {
            let (word, bit) = (idx / 64, idx % 64);
            if bits.words[word] & (1 << bit) != 0 {
                bits.words[word] &= !(1 << bit);
                bits.free -= 1;
                return Some(FrameNumber::new(idx as u32));
            }
        }

        None
    }

    /// Reserves a specific frame.
    pub fn alloc(&self, frame: FrameNumber) -> Result<(), FrameError> {
        if !Self::in_window(frame) {
            return Err(FrameError::InvalidFrame);
        }

        let idx = frame.as_u32() as usize;
        let (word, bit) = (idx / 64, idx % 64);

        let mut bits = self.inner.lock();
        if bits.words[word] & (1 << bit) == 0 {
            return Err(FrameError::Busy);
        }
        bits.words[word] &= !(1 << bit);
        bits.free -= 1;
        Ok(())
    }

    /// Releases a frame. Double frees fail instead of corrupting state, and
    /// booked frames are never released.
    pub fn free(&self, frame: FrameNumber) -> Result<(), FrameError> {
        if !Self::in_window(frame) {
            return Err(FrameError::InvalidFrame);
        }

        let idx = frame.as_u32() as usize;
        let (word, bit) = (idx / 64, idx % 64);

        let mut bits = self.inner.lock();
        if bits.booked[word] & (1 << bit) != 0 {
            return Err(FrameError::InvalidFrame);
        }
        if bits.words[word] & (1 << bit) != 0 {
            return Err(FrameError::DoubleFree);
        }
        bits.words[word] |= 1 << bit;
        bits.free += 1;
        Ok(())
    }

    /// Books the physical range `[base, end)`: marks it allocated and
    /// permanently off limits to `alloc_any` and `free`.
    pub fn book_range(&self, base: PhysAddr, end: PhysAddr) -> Result<(), FrameError> {
        if base.as_u32() > end.as_u32() {
            return Err(FrameError::InvalidFrame);
        }

        let first = (base.as_u32() as usize) >> PAGE_SHIFT;
        let last = ((end.as_u32() as usize) + super::PAGE_SIZE - 1) >> PAGE_SHIFT;
        if last > NUM_FRAMES {
            return Err(FrameError::InvalidFrame);
        }

        let mut bits = self.inner.lock();

        // Refuse to book over live allocations.
        for idx in first..last {
            let (word, bit) = (idx / 64, idx % 64);
            let allocated = bits.words[word] & (1 << bit) == 0;
            let booked = bits.booked[word] & (1 << bit) != 0;
            if allocated && !booked {
                return Err(FrameError::Busy);
            }
        }

        for idx in first..last {
            let (word, bit) = (idx / 64, idx % 64);
            if bits.booked[word] & (1 << bit) == 0 {
                if bits.words[word] & (1 << bit) != 0 {
                    bits.words[word] &= !(1 << bit);
                    bits.free -= 1;
                }
                bits.booked[word] |= 1 << bit;
                bits.booked_count += 1;
            }
        }

        Ok(())
    }

    /// Whether `frame` is currently allocated (booked counts as allocated).
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        if !Self::in_window(frame) {
            return false;
        }
        let idx = frame.as_u32() as usize;
        let bits = self.inner.lock();
        bits.words[idx / 64] & (1 << (idx % 64)) == 0
    }

    pub fn stats(&self) -> FrameStats {
        let bits = self.inner.lock();
        FrameStats {
            total: NUM_FRAMES,
            free: bits.free,
            booked: bits.booked_count,
        }
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The system frame allocator.
static FRAMES: FrameAllocator = FrameAllocator::new();

/// Initializes the frame allocator. All frames start free; boot books the
/// reserved ranges right after.
pub fn init() {
    log::info!("initializing the page frame allocator");
}

/// Allocates the lowest free user-range frame, or [`FRAME_NULL`].
pub fn frame_alloc_any() -> FrameNumber {
    FRAMES.alloc_any().unwrap_or(FRAME_NULL)
}

/// Reserves a specific frame.
pub fn frame_alloc(frame: FrameNumber) -> Result<(), FrameError> {
    FRAMES.alloc(frame)
}

/// Releases a frame; a double free is a soft error.
pub fn frame_free(frame: FrameNumber) -> Result<(), FrameError> {
    FRAMES.free(frame).map_err(|e| {
        log::warn!("bad frame free (frame={}): {:?}", frame.as_u32(), e);
        e
    })
}

/// Books the physical range `[base, end)`.
pub fn frame_book_range(base: PhysAddr, end: PhysAddr) -> Result<(), FrameError> {
    FRAMES.book_range(base, end)
}

/// Whether `frame` is currently allocated in the system allocator.
pub fn frame_is_allocated(frame: FrameNumber) -> bool {
    FRAMES.is_allocated(frame)
}

/// System allocator statistics.
pub fn frame_stats() -> FrameStats {
    FRAMES.stats()
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use crate::mm::PAGE_SIZE;

    #[test]
    fn alloc_free_round_trip_restores_state() {
        let frames = FrameAllocator::new();
        let before = frames.stats();

        let frame = frames.alloc_any().unwrap();
        assert!(frames.is_allocated(frame));
        assert_eq!(frames.stats().free, before.free - 1);

        frames.free(frame).unwrap();
        assert_eq!(frames.stats(), before);
    }

    #[test]
    fn conservation_holds_across_operations() {
        let frames = FrameAllocator::new();
        frames
            .book_range(PhysAddr(0), PhysAddr(USER_BASE_PHYS))
            .unwrap();

        let a = frames.alloc_any().unwrap();
        let b = frames.alloc_any().unwrap();
        let stats = frames.stats();
        assert_eq!(stats.free, stats.total - stats.booked - 2);

        frames.free(a).unwrap();
        frames.free(b).unwrap();
        let stats = frames.stats();
        assert_eq!(stats.free + stats.booked, stats.total);
    }

    #[test]
    fn alloc_any_stays_out_of_booked_ranges() {
        let frames = FrameAllocator::new();
        frames
            .book_range(PhysAddr(0), PhysAddr(USER_BASE_PHYS))
            .unwrap();
        // Book one extra page right at the start of the user range.
        frames
            .book_range(
                PhysAddr(USER_BASE_PHYS),
                PhysAddr(USER_BASE_PHYS + PAGE_SIZE as u32),
            )
            .unwrap();

        let frame = frames.alloc_any().unwrap();
        assert_eq!(frame.as_u32() as usize, USER_BASE_FRAME + 1);
    }

    #[test]
    fn double_free_is_rejected() {
        let frames = FrameAllocator::new();
        let frame = frames.alloc_any().unwrap();
        frames.free(frame).unwrap();
        assert_eq!(frames.free(frame), Err(FrameError::DoubleFree));
    }

    #[test]
    fn booked_frames_cannot_be_freed() {
        let frames = FrameAllocator::new();
        frames
            .book_range(PhysAddr(0), PhysAddr(PAGE_SIZE as u32))
            .unwrap();
        assert_eq!(
            frames.free(FrameNumber::new(0)),
            Err(FrameError::InvalidFrame)
        );
    }

    #[test]
    fn specific_alloc_conflicts_are_busy() {
        let frames = FrameAllocator::new();
        let frame = FrameNumber::new(USER_BASE_FRAME as u32 + 7);
        frames.alloc(frame).unwrap();
        assert_eq!(frames.alloc(frame), Err(FrameError::Busy));
        frames.free(frame).unwrap();
    }

    #[test]
    fn exhaustion_count_is_reproducible() {
        // Shrink the window by booking everything but a handful of frames,
        // then drain, refill, and drain again.
        let frames = FrameAllocator::new();
        let keep = 5;
        frames
            .book_range(
                PhysAddr(USER_BASE_PHYS + (keep * PAGE_SIZE) as u32),
                PhysAddr((NUM_FRAMES * PAGE_SIZE) as u32),
            )
            .unwrap();
        frames
            .book_range(PhysAddr(0), PhysAddr(USER_BASE_PHYS))
            .unwrap();

        let mut taken = alloc::vec::Vec::new();
        while let Some(frame) = frames.alloc_any() {
            taken.push(frame);
        }
        let count = taken.len();
        assert_eq!(count, keep);

        for frame in taken.drain(..) {
            frames.free(frame).unwrap();
        }

        let mut again = 0;
        while frames.alloc_any().is_some() {
            again += 1;
        }
        assert_eq!(again, count);
    }
}
