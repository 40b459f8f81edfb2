// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The aggregation plan: an ordered list of typed steps, each optionally owning a
//! [`Lookup`] that extends the schema visible to steps after it.

use crate::expr::Expr;
use crate::lookup::Lookup;

#[derive(Clone, Debug)]
pub struct ReducerSpec {
    pub name: String,
    pub args: Vec<String>,
    pub alias: String,
}

#[derive(Clone, Debug)]
pub struct GroupStep {
    pub group_keys: Vec<String>,
    pub reducers: Vec<ReducerSpec>,
    pub lookup: Lookup,
}

#[derive(Clone, Debug, Default)]
pub struct ArrangeStep {
    pub sort_keys: Vec<String>,
    /// Bit `i` set means key `i` sorts ascending.
    pub asc_bitmap: u64,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Clone, Debug)]
pub struct MapFilterStep {
    pub expr_text: String,
    pub expr: Option<Expr>,
    /// Destination alias; only meaningful for `Apply` steps.
    pub alias: Option<String>,
    pub lookup: Lookup,
}

#[derive(Clone, Debug)]
pub struct LoadStep {
    pub fields: Vec<String>,
    pub lookup: Lookup,
}

#[derive(Clone, Debug)]
pub enum Step {
    Root { lookup: Lookup },
    Group(GroupStep),
    Arrange(ArrangeStep),
    Apply(MapFilterStep),
    Filter(MapFilterStep),
    Load(LoadStep),
    Distribute,
}

impl Step {
    /// `Filter` never returns a lookup here even though `MapFilterStep` carries one:
    /// a filter introduces no new named fields, so it must stay transparent to
    /// `AggPlan::resolve_lookup`'s backward walk rather than shadowing whatever
    /// lookup-owning step preceded it.
    pub fn lookup(&self) -> Option<&Lookup> {
        match self {
            Step::Root { lookup } => Some(lookup),
            Step::Group(g) => Some(&g.lookup),
            Step::Apply(m) => Some(&m.lookup),
            Step::Load(l) => Some(&l.lookup),
            Step::Filter(_) | Step::Arrange(_) | Step::Distribute => None,
        }
    }

    pub fn lookup_mut(&mut self) -> Option<&mut Lookup> {
        match self {
            Step::Root { lookup } => Some(lookup),
            Step::Group(g) => Some(&mut g.lookup),
            Step::Apply(m) => Some(&mut m.lookup),
            Step::Load(l) => Some(&mut l.lookup),
            Step::Filter(_) | Step::Arrange(_) | Step::Distribute => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Step::Root { .. } => "ROOT",
            Step::Group(_) => "GROUPBY",
            Step::Arrange(_) => "ARRANGE",
            Step::Apply(_) => "APPLY",
            Step::Filter(_) => "FILTER",
            Step::Load(_) => "LOAD",
            Step::Distribute => "DISTRIBUTE",
        }
    }
}

/// Which direction [`AggPlan::resolve_lookup`] should search relative to a given step index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupMode {
    /// Always the root lookup.
    First,
    /// The nearest lookup-owning step strictly before the given index.
    Prev,
    /// The nearest lookup-owning step at or before the given index.
    Last,
}

#[derive(Clone, Debug)]
pub struct AggPlan {
    steps: Vec<Step>,
}

impl AggPlan {
    pub fn new(root_lookup: Lookup) -> Self {
        Self {
            steps: vec![Step::Root { lookup: root_lookup }],
        }
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Returns the tail `Arrange` step, creating one if the plan doesn't
    /// already end with one. Lets adjacent `LIMIT`/`SORTBY` clauses merge
    /// into a single step instead of building a sort-then-sort chain.
    pub fn get_or_create_arrange_step(&mut self) -> &mut ArrangeStep {
        if !matches!(self.steps.last(), Some(Step::Arrange(_))) {
            self.steps.push(Step::Arrange(ArrangeStep::default()));
        }
        match self.steps.last_mut() {
            Some(Step::Arrange(step)) => step,
            _ => unreachable!("just ensured the tail step is Arrange"),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    pub fn root_lookup(&self) -> &Lookup {
        self.steps[0].lookup().expect("root step always owns a lookup")
    }

    /// Resolves the prevailing lookup visible to the step at `idx`, per `mode`.
    pub fn resolve_lookup(&self, idx: usize, mode: LookupMode) -> &Lookup {
        if mode == LookupMode::First {
            return self.root_lookup();
        }
        let upper = match mode {
            LookupMode::Last => idx,
            LookupMode::Prev => idx.saturating_sub(1),
            LookupMode::First => unreachable!(),
        };
        self.steps[..=upper.min(self.steps.len() - 1)]
            .iter()
            .rev()
            .find_map(Step::lookup)
            .unwrap_or_else(|| self.root_lookup())
    }

    /// True if the prevailing lookup at `idx` is still the root lookup, i.e. no
    /// projection, reducer, or load has run yet. Step 0 is always `Root` itself
    /// and is excluded: it's the baseline, not something that shadows it.
    pub fn is_still_root_lookup(&self, idx: usize) -> bool {
        self.steps[1..idx.max(1)].iter().all(|s| s.lookup().is_none())
    }

    /// Finds the first `Arrange` step that sits after a `Group` step, or the first
    /// `Arrange` step overall if there is no `Group`.
    pub fn has_query_sortby(&self) -> bool {
        let first_group = self.steps.iter().position(|s| matches!(s, Step::Group(_)));
        match first_group {
            Some(gi) => self.steps[gi..].iter().any(|s| matches!(s, Step::Arrange(_))),
            None => self.steps.iter().any(|s| matches!(s, Step::Arrange(_))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{KeyFlags, KeyOpenMode};

    #[test]
    fn resolve_lookup_first_is_always_root() {
        let mut root = Lookup::new();
        root.get_key("a", KeyFlags::NONE, KeyOpenMode::CreateOrOpen);
        let mut plan = AggPlan::new(root);
        plan.push(Step::Load(LoadStep {
            fields: vec!["b".into()],
            lookup: Lookup::new(),
        }));
        assert_eq!(plan.resolve_lookup(1, LookupMode::First).len(), 1);
    }

    #[test]
    fn resolve_lookup_prev_skips_lookupless_steps() {
        let plan = AggPlan::new(Lookup::new());
        // Arrange owns no lookup, so Prev at idx 1 (hypothetical arrange) should fall back to root.
        assert_eq!(plan.resolve_lookup(0, LookupMode::Prev).len(), 0);
    }

    #[test]
    fn has_query_sortby_detects_arrange_after_group() {
        let mut plan = AggPlan::new(Lookup::new());
        plan.push(Step::Group(GroupStep {
            group_keys: vec![],
            reducers: vec![],
            lookup: Lookup::new(),
        }));
        assert!(!plan.has_query_sortby());
        plan.push(Step::Arrange(ArrangeStep::default()));
        assert!(plan.has_query_sortby());
    }
}
