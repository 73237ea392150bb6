//! Temporary database + storage root for service tests.

use crate::services::{
    chunk_store::ChunkStore, finalizer::Finalizer, layout::ArtifactLayout,
    registry::UploadRegistry, upload_service::UploadService,
};
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) const TEST_CHUNK_SIZE: u64 = 4;

pub(crate) struct TestEnv {
    pub service: UploadService,
    pub registry: UploadRegistry,
    pub chunks: ChunkStore,
    pub finalizer: Finalizer,
    pub layout: ArtifactLayout,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let db = crate::db::connect(&url).await.expect("Failed to open database");
        crate::db::run_migrations(&db)
            .await
            .expect("Failed to run migrations");
        let db = Arc::new(db);

        let service = UploadService::new(db.clone(), dir.path().join("objects"), TEST_CHUNK_SIZE);
        let layout = service.layout.clone();
        let registry = service.registry().clone();
        let chunks = service.chunks().clone();
        let finalizer = Finalizer::new(registry.clone(), chunks.clone(), layout.clone());

        Self {
            service,
            registry,
            chunks,
            finalizer,
            layout,
            _dir: dir,
        }
    }
}
