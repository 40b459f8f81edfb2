// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The top-level compiled execution unit. A [`Request`] moves through four
//! stages: `Compile` (pure parsing, done by [`crate::parser`]), `apply_context`
//! (binds to a live index), `build_pipeline` (wires the processor chain), and
//! `execute` (owned by the returned [`crate::pipeline::Pipeline`]).

use crate::collaborators::{Ast, ConcurrentContext, DocStore, IndexReader, LegacyFilter, QueryParser};
use crate::config::ServerConfig;
use crate::extension::ExtensionRegistry;
use crate::lookup::{KeyFlags, KeyOpenMode, Lookup};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::plan::{AggPlan, Step};
use crate::{ErrorKind, Result};

/// Orthogonal request modes and output toggles. Mirrors the original engine's
/// `QEXEC_F_*` bitset, renamed to match what each bit actually governs here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestFlags(u32);

impl RequestFlags {
    pub const NONE: Self = Self(0);
    pub const SIMPLE: Self = Self(1 << 0);
    pub const EXTENDED: Self = Self(1 << 1);
    pub const CURSOR: Self = Self(1 << 2);
    pub const NO_ROWS: Self = Self(1 << 3);
    pub const SEND_SCORES: Self = Self(1 << 4);
    pub const SEND_SORTKEYS: Self = Self(1 << 5);
    pub const SEND_PAYLOADS: Self = Self(1 << 6);
    pub const NO_FIELDS: Self = Self(1 << 7);
    pub const SEND_HIGHLIGHT: Self = Self(1 << 8);
    pub const EXPLAIN_SCORE: Self = Self(1 << 9);
    pub const RAW_IDS: Self = Self(1 << 10);
    pub const INORDER: Self = Self(1 << 11);
    pub const VERBATIM: Self = Self(1 << 12);
    pub const NO_STOPWORDS: Self = Self(1 << 13);
    pub const NO_CONTENT: Self = Self(1 << 14);
    /// Set by `_NUM_SSTRING`: report numeric values as typed JSON rather than strings.
    pub const TYPED: Self = Self(1 << 15);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for RequestFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPolicy {
    Return,
    Fail,
}

#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    pub field_mask: u64,
    pub scorer: Option<String>,
    pub expander: Option<String>,
    pub language: Option<String>,
    pub stopwords: Option<Vec<String>>,
    pub in_keys: Vec<String>,
    pub in_ids: Vec<u64>,
    pub slop: Option<i64>,
    pub payload: Option<Vec<u8>>,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub max_idle: Option<std::time::Duration>,
    pub cursor_count: Option<u64>,
    /// Field names named in `INFIELDS`, resolved to `field_mask` during `apply_context`
    /// once the schema is available.
    pub in_fields: Vec<String>,
    /// Legacy `FILTER`/`GEOFILTER` clauses, parsed positionally alongside the plan.
    /// Moved onto the `Ast` (never copied) by `apply_context`.
    pub legacy_filters: Vec<LegacyFilter>,
}

#[derive(Clone, Debug)]
pub struct HighlightSettings {
    pub open_tag: String,
    pub close_tag: String,
}

#[derive(Clone, Debug)]
pub struct SummarizeSettings {
    pub separator: String,
    pub fragment_count: u32,
    pub fragment_len: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ReturnedField {
    pub name: String,
    pub explicit_return: bool,
    pub highlight: Option<HighlightSettings>,
    pub summarize: Option<SummarizeSettings>,
}

/// The set of output fields, and whether the request narrowed it with an explicit `RETURN`.
#[derive(Clone, Debug, Default)]
pub struct FieldList {
    fields: Vec<ReturnedField>,
    explicit_return: bool,
}

impl FieldList {
    pub fn get_create_field(&mut self, name: &str) -> &mut ReturnedField {
        if let Some(idx) = self.fields.iter().position(|f| f.name == name) {
            return &mut self.fields[idx];
        }
        self.fields.push(ReturnedField {
            name: name.to_string(),
            ..Default::default()
        });
        self.fields.last_mut().unwrap()
    }

    pub fn set_explicit_return(&mut self) {
        self.explicit_return = true;
    }

    /// After parsing, drops fields that weren't explicitly named if any explicit
    /// `RETURN` was used at all.
    pub fn restrict_return(&mut self) {
        if self.explicit_return {
            self.fields.retain(|f| f.explicit_return);
        }
    }

    pub fn fields(&self) -> &[ReturnedField] {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut [ReturnedField] {
        &mut self.fields
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit_return
    }
}

pub struct Request {
    pub flags: RequestFlags,
    pub query_string: String,
    pub options: SearchOptions,
    pub plan: AggPlan,
    pub returned_fields: FieldList,
    pub ast: Option<Ast>,
}

impl Request {
    pub fn new(query_string: impl Into<String>) -> Self {
        Self {
            flags: RequestFlags::NONE,
            query_string: query_string.into(),
            options: SearchOptions::default(),
            plan: AggPlan::new(Lookup::new()),
            returned_fields: FieldList::default(),
            ast: None,
        }
    }

    /// Parses a full command's keyword-argument tail into a fresh, compiled `Request`.
    /// `tokens` is everything after the index name and query string; the query
    /// string itself is passed separately since it is always mandatory and first.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn compile(query_string: impl Into<String>, tokens: &[String], config: &ServerConfig) -> Result<Self> {
        let mut request = Self::new(query_string);
        crate::parser::parse(&mut request, tokens, config)?;
        Ok(request)
    }

    /// Rejects the transition if the request is already in the other mode.
    pub fn ensure_simple_mode(&mut self, reason: &'static str) -> Result<()> {
        if self.flags.contains(RequestFlags::EXTENDED) {
            return Err(ErrorKind::InvalidArgument
                .with_message(format!("{reason} is not supported when an aggregation clause is used")));
        }
        self.flags.insert(RequestFlags::SIMPLE);
        Ok(())
    }

    pub fn ensure_extended_mode(&mut self, reason: &'static str) -> Result<()> {
        if self.flags.contains(RequestFlags::SIMPLE) {
            return Err(ErrorKind::InvalidArgument
                .with_message(format!("{reason} is not supported in simple search mode")));
        }
        self.flags.insert(RequestFlags::EXTENDED);
        Ok(())
    }

    /// Binds the compiled request to a live index: validates field/language/scorer
    /// references, parses and expands the query string, and prepares a root lookup
    /// populated from the schema.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn apply_context(
        &mut self,
        docstore: &dyn DocStore,
        query_parser: &dyn QueryParser,
        extensions: &ExtensionRegistry,
    ) -> Result<()> {
        if self.flags.contains(RequestFlags::SEND_HIGHLIGHT) && !docstore.has_byte_offsets() {
            return Err(ErrorKind::InvalidArgument
                .with_message("cannot use HIGHLIGHT: index was not built with byte offsets"));
        }

        if let Some(scorer) = &self.options.scorer {
            if extensions.get_scoring_function(scorer).is_none() {
                return Err(ErrorKind::NoScorer.with_message(format!("no such scoring function: {scorer}")));
            }
        }

        if let Some(expander) = &self.options.expander {
            if extensions.get_query_expander(expander).is_none() {
                return Err(ErrorKind::InvalidArgument
                    .with_message(format!("no such query expander: {expander}")));
            }
        }

        let schema = docstore.schema();
        if let Step::Root { lookup } = &mut self.plan.steps_mut()[0] {
            for field in &schema.fields {
                let mut flags = KeyFlags::DOC_SOURCE;
                if field.sortable {
                    flags = flags | KeyFlags::SORT_VALUE_SOURCE;
                }
                lookup.get_key(&field.name, flags, KeyOpenMode::CreateOrOpen);
            }
        }

        for name in &self.options.in_fields {
            let mask = docstore
                .field_mask(name)
                .ok_or_else(|| ErrorKind::NoProperty.with_message(format!("no such field '{name}'")))?;
            self.options.field_mask |= mask;
        }

        let mut ast = query_parser.parse(&self.options, &self.query_string)?;
        // Ownership of the legacy filters moves to the AST; `mem::take` leaves an
        // empty `Vec` behind rather than requiring a manual double-free check.
        ast.legacy_filters = std::mem::take(&mut self.options.legacy_filters);

        let expander_name = self.options.expander.as_deref().unwrap_or(ExtensionRegistry::DEFAULT_NAME);
        if let Some(expander) = extensions.get_query_expander(expander_name) {
            crate::extension::expand_ast(&mut ast, expander.as_ref());
        }

        self.ast = Some(ast);
        tracing::debug!(flags = ?self.flags, "context applied");
        Ok(())
    }

    /// Builds the processor chain from the compiled plan.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn build_pipeline(
        &mut self,
        docstore: &dyn DocStore,
        index_reader: &dyn IndexReader,
        extensions: &ExtensionRegistry,
        config: &ServerConfig,
    ) -> Result<Pipeline> {
        let ast = self
            .ast
            .as_ref()
            .ok_or_else(|| ErrorKind::Internal.with_message("build_pipeline called before apply_context"))?;
        let ctx = ConcurrentContext::default();
        let iterator = index_reader.iterate(ast, &self.options, &ctx)?;
        PipelineBuilder::new(self, docstore, extensions, config).build(iterator)
    }
}
