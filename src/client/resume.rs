//! Resume resolution: map a local file onto a server-side upload.
//!
//! The cached upload id is only a hint. Whatever path is taken, the received
//! set handed to the scheduler comes from the server.

use crate::{
    client::{
        api::TransferApi,
        error::{TransferError, TransferResult},
        fingerprint::Fingerprint,
        scheduler::UploadPlan,
        source::ChunkSource,
        state::{LocalState, LocalStateStore},
    },
    models::chunk::ChunkLayout,
    protocol::{InitRequest, InitResponse},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ResumeResolver {
    api: Arc<dyn TransferApi>,
    store: Arc<LocalStateStore>,
    chunk_size: u64,
}

impl ResumeResolver {
    /// `chunk_size` must match the server's; the server rejects an `init`
    /// whose chunk count disagrees with its own.
    pub fn new(api: Arc<dyn TransferApi>, store: Arc<LocalStateStore>, chunk_size: u64) -> Self {
        Self {
            api,
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn resolve(&self, source: &dyn ChunkSource) -> TransferResult<UploadPlan> {
        let fingerprint = Fingerprint::of(source).await?;
        self.resolve_with(source, fingerprint).await
    }

    pub async fn resolve_with(
        &self,
        source: &dyn ChunkSource,
        fingerprint: Fingerprint,
    ) -> TransferResult<UploadPlan> {
        let mut req = InitRequest {
            fingerprint: Some(fingerprint.as_str().to_string()),
            filename: source.name().to_string(),
            total_size: source.size(),
            total_chunks: ChunkLayout::new(source.size(), self.chunk_size).total_chunks(),
            upload_id: None,
        };

        if let Some(cached) = self.store.load().await? {
            if cached.fingerprint == fingerprint {
                req.upload_id = Some(cached.upload_id);
                match self.api.init(&req).await {
                    Ok(resp) => {
                        info!(upload_id = %resp.upload_id, "resuming cached upload");
                        return self.adopt(source, fingerprint, resp).await;
                    }
                    Err(TransferError::NotFound(msg)) => {
                        warn!(upload_id = %cached.upload_id, "cached upload unknown to server: {}", msg);
                        self.store.clear().await?;
                        req.upload_id = None;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let resp = self.api.init(&req).await?;
        info!(
            upload_id = %resp.upload_id,
            status = %resp.status,
            received = resp.received_indices.len(),
            "upload resolved by fingerprint"
        );
        self.adopt(source, fingerprint, resp).await
    }

    /// Discard the upload on the server and forget it locally.
    pub async fn reset(&self, plan: &UploadPlan) -> TransferResult<()> {
        self.api.reset(plan.upload_id).await?;
        self.store.clear().await?;
        info!(upload_id = %plan.upload_id, "upload reset");
        Ok(())
    }

    async fn adopt(
        &self,
        source: &dyn ChunkSource,
        fingerprint: Fingerprint,
        resp: InitResponse,
    ) -> TransferResult<UploadPlan> {
        let layout = ChunkLayout::new(source.size(), resp.chunk_size);
        if layout.total_chunks() != resp.total_chunks {
            return Err(TransferError::Protocol(format!(
                "server expects {} chunks, local file has {}",
                resp.total_chunks,
                layout.total_chunks()
            )));
        }
        let plan = UploadPlan {
            upload_id: resp.upload_id,
            fingerprint,
            layout,
            received: resp
                .received_indices
                .into_iter()
                .filter(|i| *i < layout.total_chunks())
                .collect(),
        };
        self.store
            .save(&LocalState {
                fingerprint: plan.fingerprint.clone(),
                upload_id: plan.upload_id,
                filename: source.name().to_string(),
                size: source.size(),
                content_type: source.content_type().map(str::to_string),
                received_indices: plan.received.iter().copied().collect(),
                updated_at: Utc::now(),
            })
            .await?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{source::MemorySource, test_support::FakeServer};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn setup(fake: &Arc<FakeServer>) -> (TempDir, Arc<LocalStateStore>, ResumeResolver) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStateStore::new(dir.path().join("state.json")));
        let resolver = ResumeResolver::new(fake.clone(), store.clone(), fake.chunk_size());
        (dir, store, resolver)
    }

    #[tokio::test]
    async fn fresh_file_resolves_by_fingerprint() {
        let data: Vec<u8> = (0u8..20).collect();
        let fake = Arc::new(FakeServer::new(4, 20));
        let (_dir, store, resolver) = setup(&fake);
        let source = MemorySource::new("f.bin", data).with_content_type("application/zip");

        let plan = resolver.resolve(&source).await.unwrap();
        assert_eq!(plan.upload_id, fake.upload_id());
        assert!(plan.received.is_empty());
        assert_eq!(plan.missing(), vec![0, 1, 2, 3, 4]);

        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.upload_id, plan.upload_id);
        assert_eq!(saved.fingerprint, plan.fingerprint);
        assert_eq!(saved.content_type.as_deref(), Some("application/zip"));
        assert!(fake.init_calls()[0].upload_id.is_none());
    }

    #[tokio::test]
    async fn server_set_wins_over_local_cache() {
        let data: Vec<u8> = (0u8..20).collect();
        let fake = Arc::new(FakeServer::new(4, 20));
        fake.preload(&[0, 2, 4], &data);
        let (_dir, store, resolver) = setup(&fake);
        let source = MemorySource::new("f.bin", data);
        let fingerprint = Fingerprint::of(&source).await.unwrap();

        // The cache claims progress the server never saw.
        store
            .save(&LocalState {
                fingerprint: fingerprint.clone(),
                upload_id: fake.upload_id(),
                filename: "f.bin".into(),
                size: 20,
                content_type: None,
                received_indices: vec![0, 1, 2, 3],
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let plan = resolver.resolve_with(&source, fingerprint).await.unwrap();
        assert_eq!(plan.missing(), vec![1, 3]);
        assert_eq!(fake.init_calls()[0].upload_id, Some(fake.upload_id()));
        assert_eq!(
            store.load().await.unwrap().unwrap().received_indices,
            vec![0, 2, 4]
        );
    }

    #[tokio::test]
    async fn unknown_cached_id_falls_back_to_fingerprint() {
        let data: Vec<u8> = (0u8..20).collect();
        let fake = Arc::new(FakeServer::new(4, 20));
        let (_dir, store, resolver) = setup(&fake);
        let source = MemorySource::new("f.bin", data);
        let fingerprint = Fingerprint::of(&source).await.unwrap();
        let stale_id = Uuid::new_v4();

        store
            .save(&LocalState {
                fingerprint: fingerprint.clone(),
                upload_id: stale_id,
                filename: "f.bin".into(),
                size: 20,
                content_type: None,
                received_indices: vec![0],
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let plan = resolver.resolve_with(&source, fingerprint).await.unwrap();
        assert_ne!(plan.upload_id, stale_id);
        assert_eq!(plan.upload_id, fake.upload_id());
        assert_eq!(fake.init_calls().len(), 2);
        assert_eq!(store.load().await.unwrap().unwrap().upload_id, plan.upload_id);
    }

    #[tokio::test]
    async fn reset_forgets_both_sides() {
        let data: Vec<u8> = (0u8..20).collect();
        let fake = Arc::new(FakeServer::new(4, 20));
        fake.preload(&[1], &data);
        let (_dir, store, resolver) = setup(&fake);
        let source = MemorySource::new("f.bin", data);

        let plan = resolver.resolve(&source).await.unwrap();
        resolver.reset(&plan).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(fake.received_indices().is_empty());

        let again = resolver.resolve(&source).await.unwrap();
        assert_ne!(again.upload_id, plan.upload_id);
        assert!(again.received.is_empty());
    }
}
