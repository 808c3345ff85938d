// ============================================================================
// SCRATCH POOL — recycle transient pixel buffers to avoid per-call allocation
// ============================================================================

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::canvas::TiledImage;

/// Key for pooled buffers: (width, height).
type PoolKey = (u32, u32);

/// A pool of scratch images keyed by dimensions.
///
/// Thresholded composites need a private copy of a projection for the
/// duration of one `apply` call.  Buffers are handed out through
/// [`ScratchGuard`], which returns them on drop, so every exit path
/// (including early returns and unwinding) gives the buffer back.  Two
/// concurrent callers never observe the same buffer: a buffer lives either
/// in the pool or in exactly one guard.
pub struct ScratchPool {
    pool: Mutex<HashMap<PoolKey, Vec<TiledImage>>>,
    /// Maximum number of buffers to keep per key.
    max_per_key: usize,
    outstanding: AtomicUsize,
}

impl ScratchPool {
    pub fn new(max_per_key: usize) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            max_per_key,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Check out a transparent buffer of the given size.
    pub fn checkout(&self, width: u32, height: u32) -> ScratchGuard<'_> {
        let recycled = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.get_mut(&(width, height)).and_then(|v| v.pop()));
        let image = recycled.unwrap_or_else(|| TiledImage::new(width, height));
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        ScratchGuard { pool: self, image: Some(image) }
    }

    /// Return a buffer to the pool for future reuse.
    /// If the pool is full for this key, the buffer is simply dropped.
    fn release(&self, mut image: TiledImage) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        image.clear();
        let key: PoolKey = (image.width(), image.height());
        if let Ok(mut pool) = self.pool.lock() {
            let entry = pool.entry(key).or_default();
            if entry.len() < self.max_per_key {
                entry.push(image);
            }
        }
    }

    /// Total number of buffers currently idle in the pool.
    pub fn pooled_count(&self) -> usize {
        self.pool
            .lock()
            .map(|pool| pool.values().map(|v| v.len()).sum())
            .unwrap_or(0)
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Scoped checkout of a pooled buffer.
pub struct ScratchGuard<'a> {
    pool: &'a ScratchPool,
    image: Option<TiledImage>,
}

impl Deref for ScratchGuard<'_> {
    type Target = TiledImage;

    fn deref(&self) -> &TiledImage {
        // Only `drop` takes the image out.
        self.image.as_ref().unwrap_or_else(|| unreachable!("scratch buffer used after release"))
    }
}

impl DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut TiledImage {
        self.image.as_mut().unwrap_or_else(|| unreachable!("scratch buffer used after release"))
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            self.pool.release(image);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use image::Rgba;

    #[test]
    fn buffers_are_recycled_clean() {
        let pool = ScratchPool::new(2);
        {
            let mut a = pool.checkout(16, 16);
            a.fill_rect(Rect::new(0, 0, 4, 4), Rgba([9, 9, 9, 255]));
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.pooled_count(), 1);
        let b = pool.checkout(16, 16);
        assert_eq!(b.chunk_count(), 0);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn concurrent_checkouts_get_distinct_buffers() {
        let pool = ScratchPool::new(4);
        let mut a = pool.checkout(8, 8);
        let b = pool.checkout(8, 8);
        a.put_pixel(0, 0, Rgba([1, 1, 1, 255]));
        assert_eq!(b.get_pixel(0, 0)[3], 0);
        drop(a);
        drop(b);
        assert_eq!(pool.pooled_count(), 2);
    }

    #[test]
    fn guard_returns_buffer_on_early_exit() {
        let pool = ScratchPool::new(1);
        let try_use = |fail: bool| -> Option<()> {
            let _guard = pool.checkout(4, 4);
            if fail {
                return None;
            }
            Some(())
        };
        assert!(try_use(true).is_none());
        assert!(try_use(false).is_some());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn guard_returns_buffer_on_panic() {
        let pool = ScratchPool::new(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = pool.checkout(4, 4);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.outstanding(), 0);
    }
}
