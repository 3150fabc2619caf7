// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Documents exchanged through journal packs.
//!
//! Two kinds travel through a pack, told apart once by their identifier
//! prefix and never re-inspected afterwards:
//!
//! - **Chunks** (`h:` prefix): content-addressed, immutable payloads.
//!   Identity is the id alone.
//! - **Regular documents**: JSON objects with `_id`, `_rev` and arbitrary
//!   fields, including their `_revisions` history. Every revision is a
//!   distinct history entry, so identity is `id-rev`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier prefix marking a content-addressed chunk.
pub const CHUNK_ID_PREFIX: &str = "h:";

/// Check whether an identifier names a chunk.
pub fn is_chunk_id(id: &str) -> bool {
    id.starts_with(CHUNK_ID_PREFIX)
}

/// Dedup key of a regular document revision.
pub fn revision_dockey(id: &str, revision: &str) -> String {
    format!("{}-{}", id, revision)
}

/// Content-addressed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDoc {
    pub id: String,
    pub data: String,
}

impl ChunkDoc {
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }
}

/// A revision of a regular document.
///
/// Everything besides `_id`/`_rev` (body, `_revisions`, metadata) stays in
/// `fields` untouched so replicated inserts keep the exact remote lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegularDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub revision: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RegularDoc {
    pub fn new(id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: revision.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn dockey(&self) -> String {
        revision_dockey(&self.id, &self.revision)
    }
}

/// A record inside a journal pack.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Chunk(ChunkDoc),
    Regular(RegularDoc),
}

impl Document {
    pub fn id(&self) -> &str {
        match self {
            Document::Chunk(chunk) => &chunk.id,
            Document::Regular(doc) => &doc.id,
        }
    }

    /// Dedup identity: content id for chunks, `id-rev` for documents.
    pub fn dockey(&self) -> String {
        match self {
            Document::Chunk(chunk) => chunk.id.clone(),
            Document::Regular(doc) => doc.dockey(),
        }
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, Document::Chunk(_))
    }
}

impl From<ChunkDoc> for Document {
    fn from(chunk: ChunkDoc) -> Self {
        Document::Chunk(chunk)
    }
}

impl From<RegularDoc> for Document {
    fn from(doc: RegularDoc) -> Self {
        Document::Regular(doc)
    }
}
