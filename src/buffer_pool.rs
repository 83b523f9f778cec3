// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{collections::HashMap, ops, sync::Arc};

use parking_lot::Mutex;

use crate::types::PixelFormat;

/// Key identifying a bucket of interchangeable frame storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct BucketKey {
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
}

struct PoolInner {
    capacity_per_key: usize,
    // Buckets keyed by (w,h,stride,format). Each holds returned storage.
    buckets: Mutex<HashMap<BucketKey, Vec<Vec<u8>>>>,
}

/// Recycles raw frame storage between copy-on-submit, retained originals and
/// verification decodes, so steady-state encoding stops allocating.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// `capacity_per_key` is the maximum number of **idle** buffers retained
    /// per (w,h,stride,format). Returns beyond that are freed instead.
    pub fn new(capacity_per_key: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity_per_key,
                buckets: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get zeroed storage for one frame of the given shape. Reuses a returned
    /// buffer when one is available, otherwise allocates.
    pub fn get(&self, width: u32, height: u32, stride: usize, format: PixelFormat) -> PooledBytes {
        let key = BucketKey { width, height, stride, format };

        let reused = {
            let mut buckets = self.inner.buckets.lock();
            buckets.get_mut(&key).and_then(|v| v.pop())
        };

        let data = match reused {
            Some(mut data) => {
                data.fill(0);
                data
            }
            None => vec![0u8; stride * height as usize],
        };

        PooledBytes { pool: Some(self.inner.clone()), key, data }
    }

    #[cfg(test)]
    fn idle_count(&self, width: u32, height: u32, stride: usize, format: PixelFormat) -> usize {
        let key = BucketKey { width, height, stride, format };
        self.inner.buckets.lock().get(&key).map_or(0, |v| v.len())
    }
}

/// Frame storage that returns to its pool on drop.
pub struct PooledBytes {
    pool: Option<Arc<PoolInner>>,
    key: BucketKey,
    data: Vec<u8>,
}

impl PooledBytes {
    /// Consume and keep the storage; it will not return to the pool.
    pub fn detach(mut self) -> Vec<u8> {
        self.pool = None;
        std::mem::take(&mut self.data)
    }
}

impl ops::Deref for PooledBytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] { &self.data }
}

impl ops::DerefMut for PooledBytes {
    fn deref_mut(&mut self) -> &mut [u8] { &mut self.data }
}

impl Drop for PooledBytes {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            if self.data.is_empty() {
                return;
            }
            let mut buckets = pool.buckets.lock();
            let entry = buckets.entry(self.key).or_default();
            if entry.len() < pool.capacity_per_key {
                entry.push(std::mem::take(&mut self.data));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returned_storage_is_reused() {
        let pool = BufferPool::new(4);
        let mut buf = pool.get(8, 2, 32, PixelFormat::V216);
        buf[0] = 0xff;
        drop(buf);
        assert_eq!(pool.idle_count(8, 2, 32, PixelFormat::V216), 1);

        // Reuse hands back zeroed storage.
        let buf = pool.get(8, 2, 32, PixelFormat::V216);
        assert_eq!(pool.idle_count(8, 2, 32, PixelFormat::V216), 0);
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn idle_capacity_is_bounded() {
        let pool = BufferPool::new(1);
        let a = pool.get(8, 2, 32, PixelFormat::V216);
        let b = pool.get(8, 2, 32, PixelFormat::V216);
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(8, 2, 32, PixelFormat::V216), 1);
    }

    #[test]
    fn buckets_do_not_mix_shapes() {
        let pool = BufferPool::new(4);
        drop(pool.get(8, 2, 32, PixelFormat::V216));
        drop(pool.get(8, 2, 64, PixelFormat::AYUV64));
        assert_eq!(pool.idle_count(8, 2, 32, PixelFormat::V216), 1);
        assert_eq!(pool.idle_count(8, 2, 64, PixelFormat::AYUV64), 1);
    }

    #[test]
    fn detached_storage_stays_out() {
        let pool = BufferPool::new(4);
        let buf = pool.get(8, 2, 32, PixelFormat::V216);
        let data = buf.detach();
        assert_eq!(data.len(), 64);
        assert_eq!(pool.idle_count(8, 2, 32, PixelFormat::V216), 0);
    }
}
