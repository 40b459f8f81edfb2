// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Trait boundaries for the storage engine, inverted-index iterators and the
//! query-string parser. This crate ships no concrete implementation of any of
//! them; integration tests supply in-memory doubles (see `tests/mock_store`).

use crate::request::SearchOptions;
use crate::Result;

pub type DocId = u64;

#[derive(Clone, Debug)]
pub struct FieldSchema {
    pub name: String,
    pub sortable: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub fields: Vec<FieldSchema>,
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IndexStats {
    pub num_docs: u64,
    pub avg_doc_len: f64,
}

/// The document store: resolves field values and schema metadata for a single index.
pub trait DocStore: Send + Sync {
    fn schema(&self) -> &Schema;
    fn stats(&self) -> IndexStats;
    fn load_field(&self, doc_id: DocId, field: &str) -> Option<serde_json::Value>;
    fn has_byte_offsets(&self) -> bool;

    /// The bit this field occupies in an `INFIELDS`/text-node field mask, or `None`
    /// if `name` is not in the schema. The default numbers fields by schema position,
    /// which is sufficient for a single-index test double; a real implementation
    /// assigns bits at field-creation time and never reuses one.
    fn field_mask(&self, name: &str) -> Option<u64> {
        let idx = self.schema().fields.iter().position(|f| f.name == name)?;
        Some(1u64 << idx)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConcurrentContext {
    /// When set, the concurrent-search budget (in iterator reads) before a yield is forced.
    pub yield_every: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct IndexRow {
    pub doc_id: DocId,
    pub freq: u32,
    pub field_mask: u64,
}

/// A single-index scan in progress. `read` returns rows until exhausted.
pub trait IndexIterator: Send {
    fn read(&mut self) -> Result<Option<IndexRow>>;
}

/// Builds iterators over a parsed [`Ast`].
pub trait IndexReader: Send + Sync {
    fn iterate(
        &self,
        ast: &Ast,
        opts: &SearchOptions,
        ctx: &ConcurrentContext,
    ) -> Result<Box<dyn IndexIterator>>;
}

#[derive(Clone, Debug)]
pub enum AstNode {
    Token { text: String, field_mask: u64 },
    Union(Vec<AstNode>),
    Phrase(Vec<AstNode>),
    Wildcard,
}

/// A pre-extended-mode numeric or geo filter, parsed positionally alongside the
/// query string and transferred onto the AST during `apply_context` rather than
/// expressed as query-string syntax.
#[derive(Clone, Debug)]
pub enum LegacyFilter {
    Numeric { field: String, min: f64, max: f64 },
    Geo { field: String, lon: f64, lat: f64, radius: f64, unit: String },
}

#[derive(Clone, Debug)]
pub struct Ast {
    pub root: AstNode,
    pub legacy_filters: Vec<LegacyFilter>,
    pub payload: Option<Vec<u8>>,
}

/// Parses (and, separately, expands) the query-string portion of a request.
pub trait QueryParser: Send + Sync {
    fn parse(&self, opts: &SearchOptions, text: &str) -> Result<Ast>;
}
