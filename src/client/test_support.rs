//! In-process stand-in for an upload server.

use crate::{
    client::{
        api::TransferApi,
        error::{TransferError, TransferResult},
    },
    models::{chunk::ChunkLayout, upload::UploadStatus},
    protocol::{ChunkAck, FinalizeResponse, InitRequest, InitResponse},
};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::Semaphore;
use uuid::Uuid;

pub(crate) struct FakeServer {
    layout: ChunkLayout,
    inner: Mutex<Inner>,
    gate: Option<Semaphore>,
    entered: AtomicUsize,
}

struct Inner {
    upload_id: Uuid,
    fingerprint: Option<String>,
    received: BTreeMap<u64, Bytes>,
    final_hash: Option<String>,
    failures: HashMap<u64, u32>,
    forget_on_finalize: Vec<u64>,
    sends: Vec<u64>,
    finalize_calls: u32,
    init_calls: Vec<InitRequest>,
}

impl FakeServer {
    pub fn new(chunk_size: u64, total_size: u64) -> Self {
        Self {
            layout: ChunkLayout::new(total_size, chunk_size),
            inner: Mutex::new(Inner {
                upload_id: Uuid::new_v4(),
                fingerprint: None,
                received: BTreeMap::new(),
                final_hash: None,
                failures: HashMap::new(),
                forget_on_finalize: Vec::new(),
                sends: Vec::new(),
                finalize_calls: 0,
                init_calls: Vec::new(),
            }),
            gate: None,
            entered: AtomicUsize::new(0),
        }
    }

    /// Hold every chunk request until [`Self::open_gate`].
    pub fn with_gate(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn open_gate(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.layout.chunk_size
    }

    pub fn upload_id(&self) -> Uuid {
        self.inner.lock().unwrap().upload_id
    }

    pub fn preload(&self, indices: &[u64], data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        for &index in indices {
            let range = self.layout.range(index).unwrap();
            inner.received.insert(
                index,
                Bytes::copy_from_slice(&data[range.start as usize..range.end as usize]),
            );
        }
    }

    /// Mark the upload finalized with whatever has been preloaded.
    pub fn complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.final_hash = Some(assembled_hash(&inner.received));
    }

    pub fn fail_times(&self, index: u64, times: u32) {
        self.inner.lock().unwrap().failures.insert(index, times);
    }

    pub fn forget_on_first_finalize(&self, indices: &[u64]) {
        self.inner.lock().unwrap().forget_on_finalize = indices.to_vec();
    }

    /// Chunk requests that reached the server, including gated ones.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Indices of chunk requests that passed the gate, in arrival order.
    pub fn sends(&self) -> Vec<u64> {
        self.inner.lock().unwrap().sends.clone()
    }

    pub fn finalize_calls(&self) -> u32 {
        self.inner.lock().unwrap().finalize_calls
    }

    pub fn init_calls(&self) -> Vec<InitRequest> {
        self.inner.lock().unwrap().init_calls.clone()
    }

    pub fn received_indices(&self) -> Vec<u64> {
        self.inner.lock().unwrap().received.keys().copied().collect()
    }
}

fn assembled_hash(received: &BTreeMap<u64, Bytes>) -> String {
    let mut hasher = Sha256::new();
    for bytes in received.values() {
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

#[async_trait]
impl TransferApi for FakeServer {
    async fn init(&self, req: &InitRequest) -> TransferResult<InitResponse> {
        let mut inner = self.inner.lock().unwrap();
        inner.init_calls.push(req.clone());
        match req.upload_id {
            Some(id) if id != inner.upload_id => {
                return Err(TransferError::NotFound(format!("upload `{}` not found", id)));
            }
            Some(_) => {}
            None => {
                if inner.fingerprint.is_some() && inner.fingerprint != req.fingerprint {
                    inner.upload_id = Uuid::new_v4();
                    inner.received.clear();
                    inner.final_hash = None;
                }
                inner.fingerprint = req.fingerprint.clone();
            }
        }
        Ok(InitResponse {
            status: if inner.final_hash.is_some() {
                UploadStatus::Completed
            } else {
                UploadStatus::Receiving
            },
            upload_id: inner.upload_id,
            received_indices: inner.received.keys().copied().collect(),
            chunk_size: self.layout.chunk_size,
            total_chunks: self.layout.total_chunks(),
            final_hash: inner.final_hash.clone(),
        })
    }

    async fn send_chunk(
        &self,
        upload_id: Uuid,
        index: u64,
        bytes: Bytes,
    ) -> TransferResult<ChunkAck> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.sends.push(index);
        if upload_id != inner.upload_id {
            return Err(TransferError::NotFound(upload_id.to_string()));
        }
        if inner.final_hash.is_some() {
            return Err(TransferError::Stale("upload is COMPLETED".into()));
        }
        if let Some(left) = inner.failures.get_mut(&index) {
            if *left > 0 {
                *left -= 1;
                return Err(TransferError::Rejected {
                    status: 503,
                    code: "internal".into(),
                    message: "injected failure".into(),
                });
            }
        }
        let etag = format!("{:x}", md5::compute(&bytes));
        inner.received.insert(index, bytes);
        Ok(ChunkAck {
            status: "ok".into(),
            chunk_index: index,
            etag,
        })
    }

    async fn finalize(&self, upload_id: Uuid) -> TransferResult<FinalizeResponse> {
        let mut inner = self.inner.lock().unwrap();
        inner.finalize_calls += 1;
        if upload_id != inner.upload_id {
            return Err(TransferError::NotFound(upload_id.to_string()));
        }
        if let Some(hash) = &inner.final_hash {
            return Ok(FinalizeResponse {
                hash: hash.clone(),
                entry_names: Vec::new(),
                already_completed: true,
            });
        }
        for index in std::mem::take(&mut inner.forget_on_finalize) {
            inner.received.remove(&index);
        }
        let total = self.layout.total_chunks();
        if (inner.received.len() as u64) < total {
            return Err(TransferError::Incomplete(format!(
                "{} of {} chunks received",
                inner.received.len(),
                total
            )));
        }
        let hash = assembled_hash(&inner.received);
        inner.final_hash = Some(hash.clone());
        Ok(FinalizeResponse {
            hash,
            entry_names: Vec::new(),
            already_completed: false,
        })
    }

    async fn reset(&self, upload_id: Uuid) -> TransferResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if upload_id != inner.upload_id {
            return Err(TransferError::NotFound(upload_id.to_string()));
        }
        inner.upload_id = Uuid::new_v4();
        inner.fingerprint = None;
        inner.received.clear();
        inner.final_hash = None;
        Ok(())
    }
}
