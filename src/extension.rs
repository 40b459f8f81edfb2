// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pluggable scorers and query expanders.
//!
//! Built-ins are registered eagerly under the name `DEFAULT`. Additional
//! implementations can be registered in-process or loaded from a shared object
//! exporting a `RS_ExtensionInit` entry point.

use std::collections::HashMap;
use std::ffi::c_int;
use std::path::Path;
use std::sync::Arc;

use crate::collaborators::{AstNode, DocId, IndexStats};
use crate::{ErrorKind, Result};

#[derive(Clone, Copy, Debug)]
pub struct ScoringFunctionArgs {
    pub doc_id: DocId,
    pub term_freq: u32,
    pub stats: IndexStats,
}

pub trait ScoringFunction: Send + Sync {
    fn score(&self, args: &ScoringFunctionArgs) -> f64;
}

struct DefaultScorer;

impl ScoringFunction for DefaultScorer {
    fn score(&self, args: &ScoringFunctionArgs) -> f64 {
        if args.stats.avg_doc_len <= 0.0 {
            return args.term_freq as f64;
        }
        // A plain TF-IDF-shaped score; good enough to exercise sorting/ranking
        // without depending on a real statistics/index implementation.
        let idf = (1.0 + args.stats.num_docs as f64).ln();
        args.term_freq as f64 * idf
    }
}

/// Mutable view over the AST node currently being expanded, handed to a
/// [`QueryExpander`] so it can union-wrap, append or replace it.
pub struct ExpansionContext<'a> {
    node: &'a mut AstNode,
    field_mask: u64,
    payload: &'a mut Option<Vec<u8>>,
}

impl<'a> ExpansionContext<'a> {
    fn ensure_union(&mut self) {
        if !matches!(self.node, AstNode::Union(_)) {
            let original = std::mem::replace(self.node, AstNode::Wildcard);
            *self.node = AstNode::Union(vec![original]);
        }
    }

    /// Appends a token to this node, union-wrapping it first if it isn't already a union.
    pub fn expand_token(&mut self, text: &str) {
        self.ensure_union();
        if let AstNode::Union(children) = self.node {
            children.push(AstNode::Token {
                text: text.to_string(),
                field_mask: self.field_mask,
            });
        }
    }

    /// Builds a phrase from `tokens` and either replaces this node or unions it in.
    pub fn expand_token_with_phrase(&mut self, tokens: &[String], replace: bool) {
        let phrase = AstNode::Phrase(
            tokens
                .iter()
                .map(|t| AstNode::Token {
                    text: t.clone(),
                    field_mask: self.field_mask,
                })
                .collect(),
        );
        if replace {
            *self.node = phrase;
            return;
        }
        self.ensure_union();
        if let AstNode::Union(children) = self.node {
            children.push(phrase);
        }
    }

    pub fn set_payload(&mut self, bytes: Vec<u8>) {
        *self.payload = Some(bytes);
    }
}

pub trait QueryExpander: Send + Sync {
    fn expand(&self, ctx: &mut ExpansionContext, text: &str);
}

/// Appends the lowercased token unchanged. Exercises the union-wrap machinery
/// without depending on a real stemmer, which is out of scope for this crate.
struct DefaultExpander;

impl QueryExpander for DefaultExpander {
    fn expand(&self, ctx: &mut ExpansionContext, text: &str) {
        ctx.expand_token(&text.to_lowercase());
    }
}

fn expand_node(node: &mut AstNode, field_mask_override: &mut u64, expander: &dyn QueryExpander, payload: &mut Option<Vec<u8>>) {
    match node {
        AstNode::Token { text, field_mask } => {
            *field_mask_override = *field_mask;
            let text = text.clone();
            let mut ctx = ExpansionContext {
                node,
                field_mask: *field_mask_override,
                payload,
            };
            expander.expand(&mut ctx, &text);
        }
        AstNode::Union(children) | AstNode::Phrase(children) => {
            for child in children {
                expand_node(child, field_mask_override, expander, payload);
            }
        }
        AstNode::Wildcard => {}
    }
}

/// Walks every token node of `ast`, invoking `expander` on it.
pub fn expand_ast(ast: &mut crate::collaborators::Ast, expander: &dyn QueryExpander) {
    let mut field_mask = 0;
    expand_node(&mut ast.root, &mut field_mask, expander, &mut ast.payload);
}

/// Signature a dynamically loaded extension must export as `RS_ExtensionInit`.
pub type ExtensionInitFn = unsafe extern "C" fn(&mut ExtensionRegistry) -> c_int;

pub struct ExtensionRegistry {
    scorers: HashMap<String, Arc<dyn ScoringFunction>>,
    expanders: HashMap<String, Arc<dyn QueryExpander>>,
    // Kept alive for the registry's lifetime; registered functions may point into these.
    libraries: Vec<libloading::Library>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionRegistry {
    pub const DEFAULT_NAME: &'static str = "DEFAULT";

    pub fn new() -> Self {
        let mut registry = Self {
            scorers: HashMap::new(),
            expanders: HashMap::new(),
            libraries: Vec::new(),
        };
        registry
            .register_scoring_function(Self::DEFAULT_NAME, Arc::new(DefaultScorer))
            .expect("default scorer name cannot already be registered");
        registry
            .register_query_expander(Self::DEFAULT_NAME, Arc::new(DefaultExpander))
            .expect("default expander name cannot already be registered");
        registry
    }

    pub fn register_scoring_function(&mut self, name: &str, f: Arc<dyn ScoringFunction>) -> Result<()> {
        if self.scorers.contains_key(name) {
            return Err(ErrorKind::InvalidArgument
                .with_message(format!("scoring function '{name}' is already registered")));
        }
        self.scorers.insert(name.to_string(), f);
        Ok(())
    }

    pub fn register_query_expander(&mut self, name: &str, e: Arc<dyn QueryExpander>) -> Result<()> {
        if self.expanders.contains_key(name) {
            return Err(ErrorKind::InvalidArgument
                .with_message(format!("query expander '{name}' is already registered")));
        }
        self.expanders.insert(name.to_string(), e);
        Ok(())
    }

    pub fn get_scoring_function(&self, name: &str) -> Option<Arc<dyn ScoringFunction>> {
        self.scorers.get(name).cloned()
    }

    pub fn get_query_expander(&self, name: &str) -> Option<Arc<dyn QueryExpander>> {
        self.expanders.get(name).cloned()
    }

    /// Opens a shared object and invokes its `RS_ExtensionInit` entry point, which
    /// registers its scorers/expanders into this registry.
    ///
    /// # Safety
    /// Loads and executes arbitrary native code from `path`. The caller is responsible
    /// for trusting the library being loaded.
    pub unsafe fn load_dynamic(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let lib = libloading::Library::new(path).map_err(|e| {
            ErrorKind::Io.with_message(format!("could not load extension '{}': {e}", path.display()))
        })?;
        let init: libloading::Symbol<ExtensionInitFn> =
            lib.get(b"RS_ExtensionInit\0").map_err(|e| {
                ErrorKind::Io.with_message(format!(
                    "extension '{}' does not export RS_ExtensionInit: {e}",
                    path.display()
                ))
            })?;
        let rc = init(self);
        if rc != 0 {
            return Err(ErrorKind::Io.with_message(format!(
                "RS_ExtensionInit in '{}' returned failure status {rc}",
                path.display()
            )));
        }
        self.libraries.push(lib);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scorer_and_expander_are_preregistered() {
        let registry = ExtensionRegistry::new();
        assert!(registry.get_scoring_function("DEFAULT").is_some());
        assert!(registry.get_query_expander("DEFAULT").is_some());
    }

    #[test]
    fn registering_a_duplicate_name_fails() {
        let mut registry = ExtensionRegistry::new();
        let err = registry
            .register_scoring_function("DEFAULT", Arc::new(DefaultScorer))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn expand_token_wraps_a_bare_token_into_a_union() {
        let mut node = AstNode::Token {
            text: "run".into(),
            field_mask: 1,
        };
        let mut payload = None;
        let mut ctx = ExpansionContext {
            node: &mut node,
            field_mask: 1,
            payload: &mut payload,
        };
        ctx.expand_token("running");
        match node {
            AstNode::Union(children) => assert_eq!(children.len(), 2),
            other => panic!("expected union, got {other:?}"),
        }
    }
}
