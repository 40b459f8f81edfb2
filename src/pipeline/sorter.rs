// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A bounded sort, implemented as a max-heap of size `limit` that is drained in
//! reverse at the end.
//!
//! [`std::collections::BinaryHeap`] is a max-heap, so rows are wrapped so that
//! `Ord` reports the *worst* row (by the caller's desired order) as the
//! greatest — that's the row a bounded heap should evict first, and the row
//! `peek`/`pop` hand back when trimming to `limit`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{PipelineSlice, ProcessorResult, ResultProcessor, Row};
use crate::Result;

struct HeapRow {
    row: Row,
    sort_keys: Vec<Option<usize>>,
    asc_bitmap: u64,
}

fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    match (a.and_then(|v| v.as_f64()), b.and_then(|v| v.as_f64())) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => format!("{a:?}").cmp(&format!("{b:?}")),
    }
}

impl HeapRow {
    /// Returns `Greater` when `self` is the *worse* of the two rows under the
    /// desired sort order — i.e. the one a bounded heap should be willing to evict.
    fn rank(&self, other: &Self) -> Ordering {
        for (i, key) in self.sort_keys.iter().enumerate() {
            let ascending = self.asc_bitmap & (1 << i) != 0;
            let (a, b) = match key {
                Some(idx) => (self.row.get(*idx), other.row.get(*idx)),
                // No named sort key: fall back to score.
                None => (Some(&serde_json::json!(self.row.score)), Some(&serde_json::json!(other.row.score))),
            };
            let mut ord = compare_values(a, b);
            if !ascending {
                ord = ord.reverse();
            }
            match ord {
                Ordering::Equal => continue,
                // `self` sorts first in desired order => `self` is "better" => not the eviction
                // candidate => report Less so the heap keeps `other` on top instead.
                Ordering::Less => return Ordering::Less,
                Ordering::Greater => return Ordering::Greater,
            }
        }
        // Stable tie-break: ascending doc-id. The row with the *larger* doc-id is
        // the nominal loser so ties still produce a deterministic eviction order.
        self.row.doc_id.cmp(&other.row.doc_id)
    }
}

impl PartialEq for HeapRow {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}
impl Eq for HeapRow {}
impl PartialOrd for HeapRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.rank(other))
    }
}
impl Ord for HeapRow {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

pub struct Sorter {
    sort_keys: Vec<Option<usize>>,
    asc_bitmap: u64,
    limit: usize,
    heap: BinaryHeap<HeapRow>,
    drained: Option<std::vec::IntoIter<Row>>,
}

impl Sorter {
    pub fn new(sort_keys: Vec<Option<usize>>, asc_bitmap: u64, limit: usize) -> Self {
        Self {
            sort_keys,
            asc_bitmap,
            limit: limit.max(1),
            heap: BinaryHeap::new(),
            drained: None,
        }
    }

    fn fill(&mut self, mut rest: PipelineSlice) -> Result<()> {
        loop {
            let result = rest.pull()?;
            match result.row {
                Some(row) => {
                    self.heap.push(HeapRow {
                        row,
                        sort_keys: self.sort_keys.clone(),
                        asc_bitmap: self.asc_bitmap,
                    });
                    if self.heap.len() > self.limit {
                        self.heap.pop();
                    }
                }
                None => break,
            }
        }
        // The heap holds the `limit` best rows in worst-first order; draining it
        // with `pop` yields worst-to-best, so reverse to get best-first.
        let mut rows: Vec<Row> = self.heap.drain().map(|hr| hr.row).collect();
        rows.reverse();
        rows.sort_by(|a, b| {
            let ha = HeapRow {
                row: a.clone(),
                sort_keys: self.sort_keys.clone(),
                asc_bitmap: self.asc_bitmap,
            };
            let hb = HeapRow {
                row: b.clone(),
                sort_keys: self.sort_keys.clone(),
                asc_bitmap: self.asc_bitmap,
            };
            ha.rank(&hb)
        });
        self.drained = Some(rows.into_iter());
        Ok(())
    }
}

impl ResultProcessor for Sorter {
    fn next(&mut self, rest: PipelineSlice) -> Result<ProcessorResult> {
        if self.drained.is_none() {
            self.fill(rest)?;
        }
        match self.drained.as_mut().and_then(Iterator::next) {
            Some(row) => Ok(ProcessorResult::row(row)),
            None => Ok(ProcessorResult::EOF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{row_with_score, StaticProducer};

    #[test]
    fn bounds_output_to_limit_smallest_by_score() {
        let rows = vec![
            row_with_score(1, 3.0),
            row_with_score(2, 1.0),
            row_with_score(3, 2.0),
            row_with_score(4, 5.0),
        ];
        let mut producer = StaticProducer::new(rows);
        let mut sorter = Sorter::new(vec![None], 1, 2);
        let mut nodes: Vec<Box<dyn ResultProcessor>> = vec![];
        let slice = PipelineSlice::new(&mut nodes, &mut producer);
        let first = sorter.next(slice).unwrap();
        assert_eq!(first.row.unwrap().doc_id, 2);
    }
}
