//! Memoized decoding of native-encoded text.
//!
//! Keys are the raw encoded bytes, compared by content, so two buffers
//! holding the same bytes share one entry. An entry weighs its key length
//! plus two units per UTF-16 code unit of the decoded string. Keys longer
//! than the configured limit skip the cache so one large payload cannot push
//! out many small reusable ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cache::{CacheStats, Weigher, WeightedLruCache};
use crate::config::CoreConfig;
use crate::error::HandleResult;
use crate::handle::NativeHandle;
use crate::lock;
use crate::native::NativeApi;

/// Default weight budget of the text cache.
pub const DEFAULT_TEXT_CACHE_CAPACITY: usize = 1_000_000;

/// Default length above which encoded keys bypass the cache.
pub const DEFAULT_TEXT_CACHE_MAX_KEY_LEN: usize = 1_000;

/// `key bytes + 2 × UTF-16 length of the decoded text`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextWeigher;

impl Weigher<Vec<u8>, Arc<str>> for TextWeigher {
    fn weigh(&self, key: &Vec<u8>, value: &Arc<str>) -> usize {
        key.len() + 2 * value.encode_utf16().count()
    }
}

pub type TextCache = WeightedLruCache<Vec<u8>, Arc<str>, TextWeigher>;

/// Decoder memoizing the native API's `decode_text`.
///
/// # Examples
///
/// ```
/// use handlegrip::config::CoreConfig;
/// use handlegrip::native::RecordingNativeApi;
/// use handlegrip::text::TextDecodeCache;
/// use std::sync::Arc;
///
/// let api = Arc::new(RecordingNativeApi::default());
/// let decoder = TextDecodeCache::new(api.clone(), &CoreConfig::default());
///
/// assert_eq!(&*decoder.decode(b"hello").unwrap(), "hello");
/// assert_eq!(&*decoder.decode(b"hello").unwrap(), "hello");
/// assert_eq!(api.decode_calls(), 1);
/// ```
pub struct TextDecodeCache {
    cache: TextCache,
    max_key_len: usize,
    api: Arc<dyn NativeApi>,
    bypassed: AtomicUsize,
}

impl TextDecodeCache {
    pub fn new(api: Arc<dyn NativeApi>, config: &CoreConfig) -> Self {
        Self::with_limits(
            api,
            config.text_cache_capacity,
            config.text_cache_max_key_len,
        )
    }

    pub fn with_limits(api: Arc<dyn NativeApi>, capacity: usize, max_key_len: usize) -> Self {
        Self {
            cache: WeightedLruCache::new(capacity, TextWeigher),
            max_key_len,
            api,
            bypassed: AtomicUsize::new(0),
        }
    }

    /// Decode `bytes`, serving repeated content from the cache.
    ///
    /// Decode failures are returned as-is and never cached.
    pub fn decode(&self, bytes: &[u8]) -> HandleResult<Arc<str>> {
        if bytes.len() > self.max_key_len {
            self.bypassed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(len = bytes.len(), "text too long for cache, decoding directly");
            return self.api.decode_text(bytes).map(Arc::from);
        }

        if let Some(text) = self.cache.get(bytes) {
            tracing::trace!(len = bytes.len(), "text cache hit");
            return Ok(text);
        }

        tracing::trace!(len = bytes.len(), "text cache miss");
        let text: Arc<str> = Arc::from(self.api.decode_text(bytes)?);
        self.cache.insert(bytes.to_vec(), Arc::clone(&text));
        Ok(text)
    }

    /// Lock `handle`, copy out `length` bytes (the whole block if `None`) and
    /// decode them.
    pub fn decode_handle(&self, handle: &NativeHandle, length: Option<usize>) -> HandleResult<Arc<str>> {
        let bytes = lock::with_lock(&*self.api, handle, length, |view| view.to_vec())?;
        self.decode(&bytes)
    }

    pub fn cache(&self) -> &TextCache {
        &self.cache
    }

    pub fn max_key_len(&self) -> usize {
        self.max_key_len
    }

    /// Lookups that skipped the cache because the key was too long.
    pub fn bypassed(&self) -> usize {
        self.bypassed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            bypasses: self.bypassed(),
            ..self.cache.stats()
        }
    }
}
