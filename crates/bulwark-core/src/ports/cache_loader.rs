//! CacheLoader port: source of values when warming the cache.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::TaskError;

/// Loads the value for a cache key. `Ok(None)` means the source has nothing
/// for that key (the key is skipped, not an error).
#[async_trait]
pub trait CacheLoader<V>: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<V>, TaskError>;
}

pub struct FnLoader<F, V> {
    f: F,
    _value: PhantomData<fn() -> V>,
}

#[async_trait]
impl<F, Fut, V> CacheLoader<V> for FnLoader<F, V>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<V>, TaskError>> + Send,
    V: Send + 'static,
{
    async fn load(&self, key: &str) -> Result<Option<V>, TaskError> {
        (self.f)(key.to_string()).await
    }
}

/// Adapts a closure into a `CacheLoader`.
pub fn loader_fn<F, Fut, V>(f: F) -> Arc<dyn CacheLoader<V>>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<V>, TaskError>> + Send + 'static,
    V: Send + 'static,
{
    Arc::new(FnLoader {
        f,
        _value: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_loader_maps_keys() {
        let loader = loader_fn(|key: String| async move {
            if key.starts_with("known") {
                Ok(Some(key.len()))
            } else {
                Ok(None)
            }
        });

        assert_eq!(loader.load("known:1").await.unwrap(), Some(7));
        assert_eq!(loader.load("other").await.unwrap(), None);
    }
}
