//! Concrete pipeline stages
//!
//! Each stage implements [`Producer`](crate::producer::Producer) over its
//! upstream and reports start and finish events to the request listener
//! under its `NAME`.
//!
//! - Caches: [`BitmapMemoryCacheProducer`], [`BitmapMemoryCacheGetProducer`],
//!   [`EncodedMemoryCacheProducer`], [`PostprocessedBitmapMemoryCacheProducer`],
//!   [`DiskCacheReadProducer`], [`DiskCacheWriteProducer`]
//! - Work: [`NetworkFetchProducer`], [`DecodeProducer`],
//!   [`ResizeAndRotateProducer`], [`PostprocessorProducer`]
//! - Plumbing: [`MultiplexProducer`], [`ThreadHandoffProducer`],
//!   [`SwallowResultProducer`], metadata add/remove

pub mod bitmap_cache;
pub mod decode;
pub mod disk_cache;
pub mod encoded_cache;
pub mod metadata;
pub mod multiplex;
pub mod network_fetch;
pub mod postprocessed_cache;
pub mod postprocessor;
pub mod resize;
pub mod swallow;
pub mod thread_handoff;

pub use bitmap_cache::{BitmapMemoryCacheGetProducer, BitmapMemoryCacheProducer};
pub use decode::DecodeProducer;
pub use disk_cache::{DiskCacheReadProducer, DiskCacheWriteProducer};
pub use encoded_cache::EncodedMemoryCacheProducer;
pub use metadata::{AddMetaDataProducer, RemoveMetaDataProducer};
pub use multiplex::{bitmap_multiplex, encoded_multiplex, MultiplexProducer};
pub use network_fetch::NetworkFetchProducer;
pub use postprocessed_cache::PostprocessedBitmapMemoryCacheProducer;
pub use postprocessor::PostprocessorProducer;
pub use resize::ResizeAndRotateProducer;
pub use swallow::SwallowResultProducer;
pub use thread_handoff::ThreadHandoffProducer;

use crate::context::RequestContext;
use crate::listener::StageExtras;

/// Extras key telling whether a cache stage found a value
pub const EXTRA_CACHED_VALUE_FOUND: &str = "cached_value_found";

/// Build a stage's extras map, only if the listener asked for one
pub(crate) fn stage_extras(
    context: &RequestContext,
    producer: &str,
    entries: &[(&str, String)],
) -> Option<StageExtras> {
    if !context.listener().requires_extra_map(context, producer) {
        return None;
    }
    Some(
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect(),
    )
}

/// `cached_value_found` extras for cache stages
pub(crate) fn cache_extras(
    context: &RequestContext,
    producer: &str,
    found: bool,
) -> Option<StageExtras> {
    stage_extras(
        context,
        producer,
        &[(EXTRA_CACHED_VALUE_FOUND, found.to_string())],
    )
}
