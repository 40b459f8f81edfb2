// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory document store, index reader and query parser used to exercise
//! a compiled [`Request`](aggcore::request::Request) end to end without any
//! real storage or tokenization engine behind it.
//!
//! Like the simulated backend this is modeled on, it depends on a few simplifying
//! assumptions: there is exactly one "index" (no sharding), every field is stored
//! as a [`serde_json::Value`], and full-text matching is a case-insensitive
//! substring test rather than real tokenization.

use std::collections::HashMap;

use aggcore::collaborators::{
    Ast, AstNode, ConcurrentContext, DocStore, FieldSchema, IndexIterator, IndexReader, IndexRow,
    Schema,
};
use aggcore::request::SearchOptions;
use aggcore::{ErrorKind, Result};
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber for tests that want to assert on
/// emitted spans/events. Idempotent, so any number of tests can call it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub struct Document {
    pub id: u64,
    pub fields: HashMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: u64) -> Self {
        Self { id, fields: HashMap::new() }
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

pub struct InMemoryStore {
    schema: Schema,
    docs: Vec<Document>,
    has_byte_offsets: bool,
}

impl InMemoryStore {
    pub fn new(fields: &[(&str, bool)]) -> Self {
        Self {
            schema: Schema {
                fields: fields
                    .iter()
                    .map(|(name, sortable)| FieldSchema { name: name.to_string(), sortable: *sortable })
                    .collect(),
            },
            docs: Vec::new(),
            has_byte_offsets: false,
        }
    }

    pub fn with_byte_offsets(mut self) -> Self {
        self.has_byte_offsets = true;
        self
    }

    pub fn insert(&mut self, doc: Document) {
        self.docs.push(doc);
    }
}

impl DocStore for InMemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn stats(&self) -> aggcore::collaborators::IndexStats {
        let total_len: usize = self
            .docs
            .iter()
            .flat_map(|d| d.fields.values())
            .map(|v| v.to_string().len())
            .sum();
        aggcore::collaborators::IndexStats {
            num_docs: self.docs.len() as u64,
            avg_doc_len: if self.docs.is_empty() { 0.0 } else { total_len as f64 / self.docs.len() as f64 },
        }
    }

    fn load_field(&self, doc_id: u64, field: &str) -> Option<serde_json::Value> {
        self.docs.iter().find(|d| d.id == doc_id)?.fields.get(field).cloned()
    }

    fn has_byte_offsets(&self) -> bool {
        self.has_byte_offsets
    }
}

/// Matches the parsed query against every document in `store` up front and hands
/// back an iterator over the matching ids, in ascending doc-id order.
pub struct LinearScanIndexReader<'s> {
    store: &'s InMemoryStore,
}

impl<'s> LinearScanIndexReader<'s> {
    pub fn new(store: &'s InMemoryStore) -> Self {
        Self { store }
    }
}

impl<'s> IndexReader for LinearScanIndexReader<'s> {
    fn iterate(
        &self,
        ast: &Ast,
        _opts: &SearchOptions,
        _ctx: &ConcurrentContext,
    ) -> Result<Box<dyn IndexIterator>> {
        let mut matches: Vec<u64> = self
            .store
            .docs
            .iter()
            .filter(|d| node_matches(&ast.root, d))
            .map(|d| d.id)
            .collect();
        matches.sort_unstable();
        Ok(Box::new(VecIterator { ids: matches.into_iter() }))
    }
}

fn node_matches(node: &AstNode, doc: &Document) -> bool {
    match node {
        AstNode::Wildcard => true,
        AstNode::Token { text, .. } => doc
            .fields
            .values()
            .any(|v| value_contains(v, text)),
        AstNode::Union(children) => children.iter().any(|c| node_matches(c, doc)),
        AstNode::Phrase(children) => children.iter().all(|c| node_matches(c, doc)),
    }
}

fn value_contains(value: &serde_json::Value, needle: &str) -> bool {
    match value {
        serde_json::Value::String(s) => s.to_lowercase().contains(&needle.to_lowercase()),
        other => other.to_string().to_lowercase().contains(&needle.to_lowercase()),
    }
}

struct VecIterator {
    ids: std::vec::IntoIter<u64>,
}

impl IndexIterator for VecIterator {
    fn read(&mut self) -> Result<Option<IndexRow>> {
        Ok(self.ids.next().map(|doc_id| IndexRow { doc_id, freq: 1, field_mask: u64::MAX }))
    }
}

/// Turns `*` into a wildcard and anything else into an AND (phrase) of its
/// whitespace-separated terms. Nowhere near a real query grammar; exists to
/// give `LinearScanIndexReader` something to match against in tests.
pub struct WhitespaceQueryParser;

impl aggcore::collaborators::QueryParser for WhitespaceQueryParser {
    fn parse(&self, _opts: &SearchOptions, text: &str) -> Result<Ast> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ErrorKind::ParseArgs.with_message("empty query string"));
        }
        let root = if text == "*" {
            AstNode::Wildcard
        } else {
            let terms: Vec<AstNode> = text
                .split_whitespace()
                .map(|t| AstNode::Token { text: t.to_string(), field_mask: u64::MAX })
                .collect();
            if terms.len() == 1 {
                terms.into_iter().next().unwrap()
            } else {
                AstNode::Phrase(terms)
            }
        };
        Ok(Ast { root, legacy_filters: Vec::new(), payload: None })
    }
}
