//! # Codec
//!
//! Interface to the collaborator that turns raw bytes into the in-memory
//! representation kept by the memory tier. Real decoding (images, scaling)
//! lives outside this crate; [`PassthroughDecoder`] keeps the bytes as-is.

use bytes::Bytes;

use crate::cache::{CacheKey, CacheResult, Cacheable};

/// A decoded asset ready for the memory tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAsset {
    pub key: CacheKey,
    pub payload: Bytes,
    /// Eviction weight, e.g. the decoded byte size
    pub cost: u64,
}

impl Cacheable for DecodedAsset {
    fn cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    fn cache_cost(&self) -> u64 {
        self.cost
    }
}

pub trait Decoder: Send + Sync {
    fn decode(&self, key: &CacheKey, data: Bytes) -> CacheResult<DecodedAsset>;
}

/// Keeps the raw bytes, costing them by length
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDecoder;

impl Decoder for PassthroughDecoder {
    fn decode(&self, key: &CacheKey, data: Bytes) -> CacheResult<DecodedAsset> {
        Ok(DecodedAsset {
            key: key.clone(),
            cost: data.len() as u64,
            payload: data,
        })
    }
}
