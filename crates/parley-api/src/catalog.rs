//! Cached model listings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_types::{ApiError, CallContext, ModelInfo, Provider};
use tokio::sync::RwLock;

/// Default time a model listing stays fresh.
pub const DEFAULT_MODEL_TTL: Duration = Duration::from_secs(300);

struct CachedModels {
    fetched_at: Instant,
    models: Vec<ModelInfo>,
}

/// Caches a provider's model list for a fixed TTL.
pub struct ModelCatalog {
    provider: Arc<dyn Provider>,
    ttl: Duration,
    cache: RwLock<Option<CachedModels>>,
}

impl ModelCatalog {
    pub fn new(provider: Arc<dyn Provider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Return cached models if fresh, otherwise fetch and cache them.
    pub async fn models(&self, ctx: &CallContext) -> Result<Vec<ModelInfo>, ApiError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.models.clone());
                }
            }
        }

        let models = self.provider.list_models(ctx).await?;
        tracing::debug!(
            "Fetched {} models from {}",
            models.len(),
            self.provider.name()
        );

        let mut cache = self.cache.write().await;
        *cache = Some(CachedModels {
            fetched_at: Instant::now(),
            models: models.clone(),
        });
        Ok(models)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
