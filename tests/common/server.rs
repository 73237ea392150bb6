//! Server test utilities.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use chunked_upload::{app, db, services::upload_service::UploadService};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: Router,
    pub service: UploadService,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage and `chunk_size`.
    pub async fn new(chunk_size: u64) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let db_url = format!("sqlite://{}", temp_dir.path().join("meta.db").display());
        let pool = db::connect(&db_url).await.expect("Failed to open database");
        db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        let service = UploadService::new(
            Arc::new(pool),
            temp_dir.path().join("uploads"),
            chunk_size,
        );
        service
            .layout
            .ensure_dirs()
            .await
            .expect("Failed to create storage directories");

        Self {
            router: app(service.clone()),
            service,
            _temp_dir: temp_dir,
        }
    }

    /// Serve the router on an ephemeral local port.
    pub async fn spawn(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to read local addr");
        let router = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("server error");
        });
        addr
    }

    pub async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    pub async fn chunk(
        &self,
        upload_id: Option<&str>,
        index: Option<&str>,
        bytes: Vec<u8>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("POST").uri("/upload/chunk");
        if let Some(id) = upload_id {
            builder = builder.header("upload-id", id);
        }
        if let Some(index) = index {
            builder = builder.header("chunk-index", index);
        }
        self.send(builder.body(Body::from(bytes)).unwrap()).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}
