use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::{QueueError, Result};

/// Produces message ids for senders.
#[async_trait]
pub trait IdGenerator: Send + Sync {
    async fn generate(&self) -> anyhow::Result<String>;
}

#[async_trait]
impl<F, Fut> IdGenerator for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn generate(&self) -> anyhow::Result<String> {
        (self)().await
    }
}

/// Random UUID v4 ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

#[async_trait]
impl IdGenerator for UuidGenerator {
    async fn generate(&self) -> anyhow::Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

/// Generate an id up front, before anything is sent.
pub(crate) async fn generate_id(generator: Option<&Arc<dyn IdGenerator>>) -> Result<Option<String>> {
    match generator {
        Some(generator) => generator
            .generate()
            .await
            .map(Some)
            .map_err(|e| QueueError::IdGeneration(format!("{:#}", e))),
        None => Ok(None),
    }
}

/// Pick the id returned from a send: generated, then backend-assigned, then empty.
pub(crate) fn resolve_id(generated: Option<String>, backend_assigned: Option<String>) -> String {
    generated.or(backend_assigned).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uuid_generator_is_unique() {
        let a = UuidGenerator.generate().await.unwrap();
        let b = UuidGenerator.generate().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[tokio::test]
    async fn test_generate_id_maps_failure() {
        let failing: Arc<dyn IdGenerator> =
            Arc::new(|| async { Err::<String, _>(anyhow::anyhow!("sequence exhausted")) });
        let err = generate_id(Some(&failing)).await.unwrap_err();
        assert!(matches!(err, QueueError::IdGeneration(ref m) if m.contains("sequence exhausted")));
    }

    #[test]
    fn test_resolve_id_precedence() {
        assert_eq!(resolve_id(Some("gen".into()), Some("broker".into())), "gen");
        assert_eq!(resolve_id(None, Some("broker".into())), "broker");
        assert_eq!(resolve_id(None, None), "");
    }
}
