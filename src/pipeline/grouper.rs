// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Group-by-then-reduce. Buffers nothing about row identity: every incoming row
//! is folded into its group's reducers immediately, and only the final reducer
//! outputs, one row per distinct group key, are retained.

use std::collections::HashMap;

use super::reducer::Reducer;
use super::{PipelineSlice, ProcessorResult, ResultProcessor, Row};
use crate::Result;

pub struct GroupSpec {
    /// Indices, in the upstream lookup, of the fields being grouped on.
    pub group_key_indices: Vec<usize>,
    /// For each reducer: the upstream source-key index to feed it (`None` for `COUNT`),
    /// and the destination index in this step's own lookup.
    pub reducers: Vec<(String, Option<usize>, usize)>,
    /// Destination indices, in this step's own lookup, for the group-key columns themselves.
    pub dst_group_key_indices: Vec<usize>,
}

struct GroupState {
    key_values: Vec<Option<serde_json::Value>>,
    reducers: Vec<Reducer>,
}

pub struct Grouper {
    spec: GroupSpec,
    groups: HashMap<String, GroupState>,
    order: Vec<String>,
    output: Option<std::vec::IntoIter<Row>>,
}

impl Grouper {
    pub fn new(spec: GroupSpec) -> Self {
        Self {
            spec,
            groups: HashMap::new(),
            order: Vec::new(),
            output: None,
        }
    }

    fn group_key(values: &[Option<serde_json::Value>]) -> String {
        serde_json::to_string(values).unwrap_or_default()
    }

    fn ingest(&mut self, row: &Row) -> Result<()> {
        let key_values: Vec<_> = self
            .spec
            .group_key_indices
            .iter()
            .map(|&idx| row.get(idx).cloned())
            .collect();
        let key = Self::group_key(&key_values);
        if !self.groups.contains_key(&key) {
            let reducers = self
                .spec
                .reducers
                .iter()
                .map(|(name, _, _)| Reducer::from_name(name, &[]))
                .collect::<Result<Vec<_>>>()?;
            self.groups.insert(
                key.clone(),
                GroupState {
                    key_values: key_values.clone(),
                    reducers,
                },
            );
            self.order.push(key.clone());
        }
        let state = self.groups.get_mut(&key).unwrap();
        for (reducer, (_, src_idx, _)) in state.reducers.iter_mut().zip(self.spec.reducers.iter()) {
            let value = src_idx.and_then(|i| row.get(i));
            reducer.accumulate(value);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Vec<Row> {
        let mut rows = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            let state = self.groups.remove(&key).expect("group recorded in `order`");
            let mut out = Row::new(0);
            for (dst_idx, value) in self
                .spec
                .dst_group_key_indices
                .iter()
                .zip(state.key_values.into_iter())
            {
                if let Some(v) = value {
                    out.set(*dst_idx, v);
                }
            }
            for (reducer, (_, _, dst_idx)) in state.reducers.into_iter().zip(self.spec.reducers.iter()) {
                out.set(*dst_idx, reducer.finalize());
            }
            rows.push(out);
        }
        rows
    }
}

impl ResultProcessor for Grouper {
    fn next(&mut self, mut rest: PipelineSlice) -> Result<ProcessorResult> {
        if self.output.is_none() {
            loop {
                let result = rest.pull()?;
                match result.row {
                    Some(row) => self.ingest(&row)?,
                    None => break,
                }
            }
            self.output = Some(self.finalize().into_iter());
        }
        match self.output.as_mut().and_then(Iterator::next) {
            Some(row) => Ok(ProcessorResult::row(row)),
            None => Ok(ProcessorResult::EOF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::StaticProducer;
    use crate::pipeline::Row;

    #[test]
    fn groups_rows_and_counts_per_group() {
        let mut r1 = Row::new(1);
        r1.set(0, serde_json::json!("a"));
        let mut r2 = Row::new(2);
        r2.set(0, serde_json::json!("a"));
        let mut r3 = Row::new(3);
        r3.set(0, serde_json::json!("b"));

        let mut producer = StaticProducer::new(vec![r1, r2, r3]);
        let spec = GroupSpec {
            group_key_indices: vec![0],
            reducers: vec![("COUNT".to_string(), None, 1)],
            dst_group_key_indices: vec![0],
        };
        let mut grouper = Grouper::new(spec);
        let mut counts = HashMap::new();
        loop {
            let mut nodes: Vec<Box<dyn ResultProcessor>> = vec![];
            let slice = PipelineSlice::new(&mut nodes, &mut producer);
            let result = grouper.next(slice).unwrap();
            match result.row {
                Some(row) => {
                    let key = row.get(0).unwrap().as_str().unwrap().to_string();
                    counts.insert(key, row.get(1).unwrap().as_u64().unwrap());
                }
                None => break,
            }
        }
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));
    }
}
