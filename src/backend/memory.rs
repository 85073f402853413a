//! In-process fake of [MetadataStore] and [ChunkStore], used by the test
//! suite in `fs::tests`. Modeled directly on tvix-castore's
//! `MemoryBlobService`/`MemoryBlobWriter`: a `parking_lot::RwLock` guarding
//! an in-memory table, with `close()` moving a buffer into the table.
//!
//! This is not a query engine: filters and updates only support the small,
//! fixed vocabulary this crate's own call sites ever issue (`$set`, `$inc`,
//! `$addToSet`, `$pull`, `$unset`, and flat equality filters). That's
//! sufficient because both sides — the queries and this store — are owned
//! by this crate.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use bson::{Bson, Document};
use parking_lot::RwLock;

use super::{ChunkStore, ChunkWriter, Error, MetadataStore, Result};

#[derive(Clone, Default)]
pub struct MemoryMetadataStore {
    docs: Arc<RwLock<Vec<Document>>>,
    unique_fields: Arc<RwLock<Vec<String>>>,
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(k, v)| doc.get(k) == Some(v))
}

fn apply_update(doc: &mut Document, update: &Document) {
    if let Some(Bson::Document(set)) = update.get("$set") {
        for (k, v) in set {
            doc.insert(k.clone(), v.clone());
        }
    }
    if let Some(Bson::Document(inc)) = update.get("$inc") {
        for (k, v) in inc {
            let delta = v.as_i64().unwrap_or(0);
            let cur = doc.get_i64(k).unwrap_or(0);
            doc.insert(k.clone(), Bson::Int64(cur + delta));
        }
    }
    if let Some(Bson::Document(add)) = update.get("$addToSet") {
        for (k, v) in add {
            let arr = doc
                .entry(k.clone())
                .or_insert_with(|| Bson::Array(Vec::new()));
            if let Bson::Array(items) = arr {
                if !items.contains(v) {
                    items.push(v.clone());
                }
            }
        }
    }
    if let Some(Bson::Document(pull)) = update.get("$pull") {
        for (k, v) in pull {
            if let Some(Bson::Array(items)) = doc.get_mut(k) {
                let pred = v.as_document();
                items.retain(|item| match (pred, item.as_document()) {
                    (Some(pred), Some(item_doc)) => {
                        !pred.iter().all(|(pk, pv)| item_doc.get(pk) == Some(pv))
                    }
                    _ => item != v,
                });
            }
        }
    }
    if let Some(Bson::Document(unset)) = update.get("$unset") {
        for (k, _) in unset {
            doc.remove(k);
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let docs = self.docs.read();
        Ok(docs.iter().find(|d| matches(d, &filter)).cloned())
    }

    async fn insert_one(&self, doc: Document) -> Result<()> {
        let mut docs = self.docs.write();
        let id = doc.get("_id").cloned();
        if id.is_some() && docs.iter().any(|d| d.get("_id") == id.as_ref()) {
            return Err(Error::DuplicateKey);
        }
        let unique_fields = self.unique_fields.read();
        if !unique_fields.is_empty() {
            let collides = docs.iter().any(|d| {
                unique_fields
                    .iter()
                    .all(|f| d.get(f.as_str()) == doc.get(f.as_str()))
            });
            if collides {
                return Err(Error::DuplicateKey);
            }
        }
        docs.push(doc);
        Ok(())
    }

    async fn update_one(&self, filter: Document, update: Document) -> Result<()> {
        let mut docs = self.docs.write();
        if let Some(doc) = docs.iter_mut().find(|d| matches(d, &filter)) {
            apply_update(doc, &update);
        }
        Ok(())
    }

    async fn delete_one(&self, filter: Document) -> Result<()> {
        let mut docs = self.docs.write();
        if let Some(pos) = docs.iter().position(|d| matches(d, &filter)) {
            docs.remove(pos);
        }
        Ok(())
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<Option<Document>> {
        let mut docs = self.docs.write();
        match docs.iter_mut().find(|d| matches(d, &filter)) {
            Some(doc) => {
                let pre_image = doc.clone();
                apply_update(doc, &update);
                Ok(Some(pre_image))
            }
            None => Ok(None),
        }
    }

    async fn create_unique_index(&self, fields: &[&str]) -> Result<()> {
        *self.unique_fields.write() = fields.iter().map(|s| s.to_string()).collect();
        Ok(())
    }
}

struct ChunkRecord {
    data: Vec<u8>,
    #[allow(dead_code)]
    filename: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct MemoryChunkStore {
    chunks: Arc<RwLock<HashMap<i64, ChunkRecord>>>,
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn new_file(&self, id: i64, filename: Vec<u8>) -> Result<Box<dyn ChunkWriter>> {
        Ok(Box::new(MemoryChunkWriter {
            chunks: self.chunks.clone(),
            id,
            filename,
            buf: Vec::new(),
            closed: false,
        }))
    }

    async fn open(&self, id: i64) -> Result<Option<Box<dyn super::ChunkReader>>> {
        let chunks = self.chunks.read();
        Ok(chunks
            .get(&id)
            .map(|r| Box::new(Cursor::new(r.data.clone())) as Box<dyn super::ChunkReader>))
    }

    async fn set_filename(&self, id: i64, filename: Vec<u8>) -> Result<()> {
        let mut chunks = self.chunks.write();
        match chunks.get_mut(&id) {
            Some(r) => {
                r.filename = filename;
                Ok(())
            }
            None => Err(Error::Storage(format!("no chunked object for inode {id}"))),
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.chunks.write().remove(&id);
        Ok(())
    }

    async fn length(&self, id: i64) -> Result<Option<u64>> {
        Ok(self.chunks.read().get(&id).map(|r| r.data.len() as u64))
    }
}

pub struct MemoryChunkWriter {
    chunks: Arc<RwLock<HashMap<i64, ChunkRecord>>>,
    id: i64,
    filename: Vec<u8>,
    buf: Vec<u8>,
    closed: bool,
}

impl tokio::io::AsyncWrite for MemoryChunkWriter {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "already closed",
            )));
        }
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ChunkWriter for MemoryChunkWriter {
    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.chunks.write().insert(
                self.id,
                ChunkRecord {
                    data: self.buf.clone(),
                    filename: self.filename.clone(),
                },
            );
            self.closed = true;
        }
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buf.len() as u64
    }
}
