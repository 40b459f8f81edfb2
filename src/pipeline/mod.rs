// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The pull-based result-processor chain.
//!
//! Each [`ResultProcessor`] holds the "rest" of the pipeline as a [`PipelineSlice`]
//! and calls `rest.pull()` to ask for its next input row, the same recursive
//! shape as this crate's node/producer split: a closed terminal producer
//! ([`RowProducer`], here the index-iterator reader) plus an open, ordered list
//! of transforming nodes above it.
//!
//! Nodes are stored in natural build order (the first one pushed sits closest
//! to the producer); [`PipelineSlice::pull`] walks the slice from its far end
//! inward so that the most-recently-pushed node is the first one called.

mod grouper;
mod reducer;
mod sorter;

use std::collections::HashMap;

use crate::collaborators::{DocStore, IndexIterator};
use crate::config::ServerConfig;
use crate::extension::{ExtensionRegistry, ScoringFunctionArgs};
use crate::expr::{self, Expr};
use crate::lookup::{KeyFlags, KeyOpenMode, Lookup};
use crate::plan::{LookupMode, Step};
use crate::request::{Request, RequestFlags};
use crate::{ErrorKind, Result};

pub use grouper::{GroupSpec, Grouper};
pub use reducer::Reducer;
pub use sorter::Sorter;

/// One row flowing through the pipeline: a document id, a score, and a sparse
/// vector of values indexed by position in the prevailing [`Lookup`].
#[derive(Clone, Debug)]
pub struct Row {
    pub doc_id: u64,
    pub score: f64,
    values: Vec<Option<serde_json::Value>>,
}

impl Row {
    pub fn new(doc_id: u64) -> Self {
        Self {
            doc_id,
            score: 0.0,
            values: Vec::new(),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&serde_json::Value> {
        self.values.get(idx).and_then(Option::as_ref)
    }

    pub fn set(&mut self, idx: usize, value: serde_json::Value) {
        if idx >= self.values.len() {
            self.values.resize(idx + 1, None);
        }
        self.values[idx] = Some(value);
    }
}

pub struct ProcessorResult {
    pub row: Option<Row>,
    pub eof: bool,
}

impl ProcessorResult {
    pub const EOF: Self = Self { row: None, eof: true };

    pub fn row(row: Row) -> Self {
        Self { row: Some(row), eof: false }
    }
}

/// The terminal data source at the bottom of the chain.
pub trait RowProducer: Send {
    fn produce(&mut self) -> Result<ProcessorResult>;
}

/// A transforming stage in the chain.
pub trait ResultProcessor: Send {
    fn next(&mut self, rest: PipelineSlice) -> Result<ProcessorResult>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A view over some suffix of the node list, plus the producer at the very bottom.
pub struct PipelineSlice<'a> {
    nodes: &'a mut [Box<dyn ResultProcessor>],
    producer: &'a mut dyn RowProducer,
}

impl<'a> PipelineSlice<'a> {
    pub fn new(nodes: &'a mut [Box<dyn ResultProcessor>], producer: &'a mut dyn RowProducer) -> Self {
        Self { nodes, producer }
    }

    pub fn pull(&mut self) -> Result<ProcessorResult> {
        match self.nodes.split_last_mut() {
            Some((node, rest)) => node.next(PipelineSlice {
                nodes: rest,
                producer: self.producer,
            }),
            None => self.producer.produce(),
        }
    }
}

/// The built, runnable pipeline: a producer and its stack of processors.
pub struct Pipeline {
    producer: Box<dyn RowProducer>,
    nodes: Vec<Box<dyn ResultProcessor>>,
}

impl Pipeline {
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let mut slice = PipelineSlice::new(&mut self.nodes, self.producer.as_mut());
        Ok(slice.pull()?.row)
    }
}

// --- terminal producer -------------------------------------------------------

struct IndexIteratorReader {
    iterator: Box<dyn IndexIterator>,
}

impl RowProducer for IndexIteratorReader {
    fn produce(&mut self) -> Result<ProcessorResult> {
        match self.iterator.read()? {
            Some(r) => Ok(ProcessorResult::row(Row::new(r.doc_id))),
            None => Ok(ProcessorResult::EOF),
        }
    }
}

// --- simple processors ---------------------------------------------------

struct ScorerProcessor {
    scorer: std::sync::Arc<dyn crate::extension::ScoringFunction>,
    stats: crate::collaborators::IndexStats,
    explain: bool,
}

impl ResultProcessor for ScorerProcessor {
    fn next(&mut self, mut rest: PipelineSlice) -> Result<ProcessorResult> {
        let result = rest.pull()?;
        match result.row {
            Some(mut row) => {
                row.score = self.scorer.score(&ScoringFunctionArgs {
                    doc_id: row.doc_id,
                    term_freq: 1,
                    stats: self.stats,
                });
                if self.explain {
                    tracing::trace!(doc_id = row.doc_id, score = row.score, "explain-score");
                }
                Ok(ProcessorResult::row(row))
            }
            None => Ok(result),
        }
    }
}

struct Pager {
    offset: u64,
    remaining: u64,
    skipped: bool,
}

impl Pager {
    fn new(offset: u64, limit: u64) -> Self {
        Self { offset, remaining: limit, skipped: false }
    }
}

impl ResultProcessor for Pager {
    fn next(&mut self, mut rest: PipelineSlice) -> Result<ProcessorResult> {
        if !self.skipped {
            for _ in 0..self.offset {
                if rest.pull()?.row.is_none() {
                    return Ok(ProcessorResult::EOF);
                }
            }
            self.skipped = true;
        }
        if self.remaining == 0 {
            return Ok(ProcessorResult::EOF);
        }
        let result = rest.pull()?;
        if result.row.is_some() {
            self.remaining -= 1;
        }
        Ok(result)
    }
}

struct Loader<'d> {
    docstore: &'d dyn DocStore,
    fields: Vec<(usize, String)>,
}

impl<'d> ResultProcessor for Loader<'d> {
    fn next(&mut self, mut rest: PipelineSlice) -> Result<ProcessorResult> {
        let result = rest.pull()?;
        match result.row {
            Some(mut row) => {
                for (idx, name) in &self.fields {
                    if let Some(value) = self.docstore.load_field(row.doc_id, name) {
                        row.set(*idx, value);
                    }
                }
                Ok(ProcessorResult::row(row))
            }
            None => Ok(result),
        }
    }
}

struct Projector {
    expr: Expr,
    src_lookup: Lookup,
    dst_idx: usize,
}

impl ResultProcessor for Projector {
    fn next(&mut self, mut rest: PipelineSlice) -> Result<ProcessorResult> {
        let result = rest.pull()?;
        match result.row {
            Some(mut row) => {
                let values = row_values_for_eval(&row, &self.src_lookup);
                let value = expr::eval(&self.expr, &self.src_lookup, &values)?;
                row.set(self.dst_idx, value);
                Ok(ProcessorResult::row(row))
            }
            None => Ok(result),
        }
    }
}

struct FilterProcessor {
    expr: Expr,
    src_lookup: Lookup,
}

impl ResultProcessor for FilterProcessor {
    fn next(&mut self, mut rest: PipelineSlice) -> Result<ProcessorResult> {
        loop {
            let result = rest.pull()?;
            match result.row {
                Some(row) => {
                    let values = row_values_for_eval(&row, &self.src_lookup);
                    let keep = expr::truthy(&expr::eval(&self.expr, &self.src_lookup, &values)?);
                    if keep {
                        return Ok(ProcessorResult::row(row));
                    }
                }
                None => return Ok(result),
            }
        }
    }
}

struct Highlighter<'d> {
    docstore: &'d dyn DocStore,
    fields: Vec<(usize, String, String, String)>, // idx, field name, open tag, close tag
}

impl<'d> ResultProcessor for Highlighter<'d> {
    fn next(&mut self, mut rest: PipelineSlice) -> Result<ProcessorResult> {
        let result = rest.pull()?;
        match result.row {
            Some(mut row) => {
                let _ = self.docstore; // byte-offset lookups would key off this in a full index.
                for (idx, _name, open, close) in &self.fields {
                    if let Some(serde_json::Value::String(s)) = row.get(*idx).cloned() {
                        row.set(*idx, serde_json::Value::String(format!("{open}{s}{close}")));
                    }
                }
                Ok(ProcessorResult::row(row))
            }
            None => Ok(result),
        }
    }
}

fn row_values_for_eval(row: &Row, lookup: &Lookup) -> Vec<Option<serde_json::Value>> {
    (0..lookup.len()).map(|i| row.get(i).cloned()).collect()
}

// --- builder ---------------------------------------------------------------

pub struct PipelineBuilder<'r, 'd, 'x> {
    request: &'r mut Request,
    docstore: &'d dyn DocStore,
    extensions: &'x ExtensionRegistry,
    config: &'r ServerConfig,
}

impl<'r, 'd, 'x> PipelineBuilder<'r, 'd, 'x> {
    pub fn new(
        request: &'r mut Request,
        docstore: &'d dyn DocStore,
        extensions: &'x ExtensionRegistry,
        config: &'r ServerConfig,
    ) -> Self {
        Self { request, docstore, extensions, config }
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn build(self, iterator: Box<dyn IndexIterator>) -> Result<Pipeline> {
        let _ = self.config;
        let is_search = self.request.flags.contains(RequestFlags::SIMPLE)
            || !self.request.flags.contains(RequestFlags::EXTENDED);

        let mut nodes: Vec<Box<dyn ResultProcessor>> = Vec::new();

        if is_search && !self.request.plan.has_query_sortby() {
            let scorer_name = self
                .request
                .options
                .scorer
                .clone()
                .unwrap_or_else(|| ExtensionRegistry::DEFAULT_NAME.to_string());
            let scorer = self
                .extensions
                .get_scoring_function(&scorer_name)
                .ok_or_else(|| ErrorKind::NoScorer.with_message(format!("no such scoring function: {scorer_name}")))?;
            nodes.push(Box::new(ScorerProcessor {
                scorer,
                stats: self.docstore.stats(),
                explain: self.request.flags.contains(RequestFlags::EXPLAIN_SCORE),
            }));
        }

        let step_count = self.request.plan.steps().len();
        for idx in 0..step_count {
            let kind_name = self.request.plan.steps()[idx].kind_name();
            match &self.request.plan.steps()[idx] {
                Step::Root { .. } | Step::Distribute => {}
                Step::Group(_) => self.push_group(idx, &mut nodes)?,
                Step::Arrange(_) => self.push_arrange(idx, &mut nodes)?,
                Step::Apply(_) => self.push_apply(idx, &mut nodes)?,
                Step::Filter(_) => self.push_filter(idx, &mut nodes)?,
                Step::Load(_) => self.push_load(idx, &mut nodes)?,
            }
            tracing::debug!(step = kind_name, "pushed pipeline stage");
        }

        if !self.request.plan.has_query_sortby() && is_search {
            self.push_default_arrange(&mut nodes)?;
        }

        if is_search && !self.request.flags.contains(RequestFlags::NO_FIELDS) {
            self.push_output_loader(&mut nodes)?;
            if self.request.flags.contains(RequestFlags::SEND_HIGHLIGHT) {
                self.push_highlighter(&mut nodes)?;
            }
        }

        Ok(Pipeline {
            producer: Box::new(IndexIteratorReader { iterator }),
            nodes,
        })
    }

    fn push_group(&mut self, idx: usize, nodes: &mut Vec<Box<dyn ResultProcessor>>) -> Result<()> {
        let prev_lookup = self.request.plan.resolve_lookup(idx.saturating_sub(1), LookupMode::Last).clone();
        let is_direct_from_root = self.request.plan.is_still_root_lookup(idx);

        let Step::Group(group) = &mut self.request.plan.steps_mut()[idx] else {
            unreachable!()
        };

        let mut pre_group_load_fields: Vec<(usize, String)> = Vec::new();
        let mut maybe_queue_load = |src: usize, name: &str, pre_group_load_fields: &mut Vec<(usize, String)>| {
            let key = prev_lookup.key(src);
            if is_direct_from_root
                && key.flags.contains(KeyFlags::DOC_SOURCE)
                && !key.flags.contains(KeyFlags::SORT_VALUE_SOURCE)
                && !pre_group_load_fields.iter().any(|(_, n): &(usize, String)| n == name)
            {
                pre_group_load_fields.push((src, name.to_string()));
            }
        };

        let mut group_key_indices = Vec::new();
        for name in &group.group_keys {
            let src_idx = prev_lookup
                .find(name)
                .ok_or_else(|| ErrorKind::NoProperty.with_message(format!("no such property '@{name}'")))?;
            maybe_queue_load(src_idx, name, &mut pre_group_load_fields);
            group_key_indices.push(src_idx);
            group.lookup.get_key(name, KeyFlags::NONE, KeyOpenMode::CreateOrOpen);
        }

        let mut reducer_specs = Vec::new();
        for reducer in &group.reducers {
            let src_idx = if reducer.args.is_empty() {
                None
            } else {
                let name = reducer.args[0].trim_start_matches('@');
                let src = prev_lookup
                    .find(name)
                    .ok_or_else(|| ErrorKind::NoProperty.with_message(format!("no such property '@{name}'")))?;
                maybe_queue_load(src, name, &mut pre_group_load_fields);
                Some(src)
            };
            let dst_idx = group.lookup.get_key(&reducer.alias, KeyFlags::NONE, KeyOpenMode::CreateOrOpen).unwrap();
            reducer_specs.push((reducer.name.clone(), src_idx, dst_idx));
        }

        if !pre_group_load_fields.is_empty() {
            nodes.push(Box::new(Loader {
                docstore: self.docstore,
                fields: pre_group_load_fields,
            }));
        }

        let dst_group_key_indices = group
            .group_keys
            .iter()
            .map(|name| group.lookup.find(name).unwrap())
            .collect();

        nodes.push(Box::new(Grouper::new(GroupSpec {
            group_key_indices,
            reducers: reducer_specs,
            dst_group_key_indices,
        })));
        Ok(())
    }

    fn push_arrange(&mut self, idx: usize, nodes: &mut Vec<Box<dyn ResultProcessor>>) -> Result<()> {
        let prev_lookup = self.request.plan.resolve_lookup(idx, LookupMode::Prev).clone();
        let Step::Arrange(arrange) = &self.request.plan.steps()[idx] else {
            unreachable!()
        };
        let mut sort_keys = Vec::new();
        for name in &arrange.sort_keys {
            let k = prev_lookup
                .find(name)
                .ok_or_else(|| ErrorKind::NoProperty.with_message(format!("no such property '@{name}'")))?;
            sort_keys.push(Some(k));
        }
        if sort_keys.is_empty() {
            sort_keys.push(None);
        }
        let effective_limit = if arrange.limit == 0 && arrange.offset == 0 { 10 } else { arrange.offset + arrange.limit.max(1) };
        nodes.push(Box::new(Sorter::new(sort_keys, arrange.asc_bitmap, effective_limit as usize)));
        if arrange.offset > 0 || arrange.limit > 0 {
            nodes.push(Box::new(Pager::new(arrange.offset, if arrange.limit == 0 { 10 } else { arrange.limit })));
        }
        Ok(())
    }

    fn push_default_arrange(&mut self, nodes: &mut Vec<Box<dyn ResultProcessor>>) -> Result<()> {
        nodes.push(Box::new(Sorter::new(vec![None], 0, 10)));
        nodes.push(Box::new(Pager::new(0, 10)));
        Ok(())
    }

    fn push_apply(&mut self, idx: usize, nodes: &mut Vec<Box<dyn ResultProcessor>>) -> Result<()> {
        let prev_lookup = self.request.plan.resolve_lookup(idx, LookupMode::Prev).clone();
        let Step::Apply(step) = &mut self.request.plan.steps_mut()[idx] else {
            unreachable!()
        };
        let expr = match step.expr.clone() {
            Some(e) => e,
            None => expr::parse(&step.expr_text)?,
        };
        step.expr = Some(expr.clone());
        let mut referenced = Vec::new();
        expr::referenced_fields(&expr, &mut referenced);
        for name in &referenced {
            prev_lookup
                .find(name)
                .ok_or_else(|| ErrorKind::NoProperty.with_message(format!("no such property '@{name}'")))?;
        }
        let alias = step.alias.clone().unwrap_or_else(|| step.expr_text.clone());
        let dst_idx = step.lookup.get_key(&alias, KeyFlags::NONE, KeyOpenMode::ExclusiveCreate)
            .ok_or_else(|| ErrorKind::InvalidArgument.with_message(format!("duplicate alias '{alias}'")))?;
        nodes.push(Box::new(Projector { expr, src_lookup: prev_lookup, dst_idx }));
        Ok(())
    }

    fn push_filter(&mut self, idx: usize, nodes: &mut Vec<Box<dyn ResultProcessor>>) -> Result<()> {
        let prev_lookup = self.request.plan.resolve_lookup(idx, LookupMode::Prev).clone();
        let Step::Filter(step) = &mut self.request.plan.steps_mut()[idx] else {
            unreachable!()
        };
        let expr = match step.expr.clone() {
            Some(e) => e,
            None => expr::parse(&step.expr_text)?,
        };
        step.expr = Some(expr.clone());
        let mut referenced = Vec::new();
        expr::referenced_fields(&expr, &mut referenced);
        for name in &referenced {
            prev_lookup
                .find(name)
                .ok_or_else(|| ErrorKind::NoProperty.with_message(format!("no such property '@{name}'")))?;
        }
        nodes.push(Box::new(FilterProcessor { expr, src_lookup: prev_lookup }));
        Ok(())
    }

    fn push_load(&mut self, idx: usize, nodes: &mut Vec<Box<dyn ResultProcessor>>) -> Result<()> {
        if !self.request.plan.is_still_root_lookup(idx) {
            return Err(ErrorKind::InvalidArgument
                .with_message("LOAD cannot be applied after projectors or reducers"));
        }
        let Step::Load(step) = &mut self.request.plan.steps_mut()[idx] else {
            unreachable!()
        };
        let mut fields = Vec::new();
        for name in &step.fields {
            if let Some(idx) = step.lookup.get_key(name, KeyFlags::DOC_SOURCE, KeyOpenMode::ExclusiveCreate) {
                fields.push((idx, name.clone()));
            }
        }
        if !fields.is_empty() {
            nodes.push(Box::new(Loader { docstore: self.docstore, fields }));
        }
        Ok(())
    }

    fn push_output_loader(&mut self, nodes: &mut Vec<Box<dyn ResultProcessor>>) -> Result<()> {
        let explicit = self.request.returned_fields.is_explicit();
        let last_lookup = self.request.plan.resolve_lookup(self.request.plan.steps().len() - 1, LookupMode::Last).clone();
        let mut fields = Vec::new();
        if explicit {
            for f in self.request.returned_fields.fields() {
                if let Some(idx) = last_lookup.find(&f.name) {
                    fields.push((idx, f.name.clone()));
                }
            }
        } else {
            for (idx, key) in last_lookup.iter() {
                if key.flags.contains(KeyFlags::DOC_SOURCE) {
                    fields.push((idx, key.name.clone()));
                }
            }
        }
        if !fields.is_empty() {
            nodes.push(Box::new(Loader { docstore: self.docstore, fields }));
        }
        Ok(())
    }

    fn push_highlighter(&mut self, nodes: &mut Vec<Box<dyn ResultProcessor>>) -> Result<()> {
        let last_lookup = self.request.plan.resolve_lookup(self.request.plan.steps().len() - 1, LookupMode::Last).clone();
        let mut fields = Vec::new();
        for f in self.request.returned_fields.fields() {
            if let Some(hl) = &f.highlight {
                if let Some(idx) = last_lookup.find(&f.name) {
                    fields.push((idx, f.name.clone(), hl.open_tag.clone(), hl.close_tag.clone()));
                }
            }
        }
        if !fields.is_empty() {
            nodes.push(Box::new(Highlighter { docstore: self.docstore, fields }));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct StaticProducer {
        rows: std::vec::IntoIter<Row>,
    }

    impl StaticProducer {
        pub fn new(rows: Vec<Row>) -> Self {
            Self { rows: rows.into_iter() }
        }
    }

    impl RowProducer for StaticProducer {
        fn produce(&mut self) -> Result<ProcessorResult> {
            match self.rows.next() {
                Some(row) => Ok(ProcessorResult::row(row)),
                None => Ok(ProcessorResult::EOF),
            }
        }
    }

    pub fn row_with_score(doc_id: u64, score: f64) -> Row {
        let mut row = Row::new(doc_id);
        row.score = score;
        row
    }
}
