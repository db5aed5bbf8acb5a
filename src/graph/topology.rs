//! Topological analysis of stage graphs.
//!
//! Provides algorithms for:
//! - Upstream closure (every stage a stage depends on)
//! - Topological sorting (producers before consumers)
//! - Depth levels and sink/source detection

use crate::core::error::{PipelineError, PipelineResult, StageId};
use crate::graph::stage::Stage;
use indexmap::{IndexMap, IndexSet};
use std::collections::VecDeque;

/// Analyzer over a fixed set of stages.
///
/// Edges are read from the stages' input connections; producers outside the
/// set are ignored.
pub struct TopologyAnalyzer {
    stages: IndexMap<StageId, Stage>,
    /// producer -> consumers, one entry per connection
    consumers: IndexMap<StageId, Vec<StageId>>,
    /// consumer -> producers, one entry per connection
    producers: IndexMap<StageId, Vec<StageId>>,
}

impl TopologyAnalyzer {
    /// Create an analyzer for `stages`.
    pub fn new(stages: impl IntoIterator<Item = Stage>) -> Self {
        let stages: IndexMap<StageId, Stage> =
            stages.into_iter().map(|stage| (stage.id(), stage)).collect();

        let mut consumers: IndexMap<StageId, Vec<StageId>> =
            stages.keys().map(|id| (*id, Vec::new())).collect();
        let mut producers: IndexMap<StageId, Vec<StageId>> =
            stages.keys().map(|id| (*id, Vec::new())).collect();

        for (id, stage) in &stages {
            for producer in stage.producers() {
                let producer_id = producer.id();
                if let Some(list) = consumers.get_mut(&producer_id) {
                    list.push(*id);
                    if let Some(upstream) = producers.get_mut(id) {
                        upstream.push(producer_id);
                    }
                }
            }
        }

        Self {
            stages,
            consumers,
            producers,
        }
    }

    /// Create an analyzer over `roots` and everything upstream of them.
    pub fn from_roots<'a>(roots: impl IntoIterator<Item = &'a Stage>) -> Self {
        Self::new(upstream_closure(roots))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(&id)
    }

    /// Stages in producer-before-consumer order (Kahn's algorithm).
    pub fn topological_sort(&self) -> PipelineResult<Vec<Stage>> {
        let mut in_degree: IndexMap<StageId, usize> = self
            .producers
            .iter()
            .map(|(id, upstream)| (*id, upstream.len()))
            .collect();

        let mut queue: VecDeque<StageId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut result = Vec::with_capacity(self.stages.len());
        while let Some(id) = queue.pop_front() {
            if let Some(stage) = self.stages.get(&id) {
                result.push(stage.clone());
            }
            for consumer in self.consumers.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(consumer) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*consumer);
                    }
                }
            }
        }

        // Stages never reaching in-degree zero sit on or behind a cycle
        if result.len() != self.stages.len() {
            let remaining = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(PipelineError::CycleDetected { stages: remaining });
        }

        Ok(result)
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_sort().is_err()
    }

    /// Group stages by depth: level 0 holds the sources, level `n` the stages
    /// whose longest path from a source has `n` edges.
    pub fn levels(&self) -> PipelineResult<Vec<Vec<Stage>>> {
        let sorted = self.topological_sort()?;
        let mut depth: IndexMap<StageId, usize> = IndexMap::new();
        let mut levels: Vec<Vec<Stage>> = Vec::new();

        for stage in sorted {
            let level = self.producers[&stage.id()]
                .iter()
                .filter_map(|producer| depth.get(producer))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(stage.id(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(stage);
        }

        Ok(levels)
    }

    /// Stages no other stage in the set consumes.
    pub fn sinks(&self) -> Vec<Stage> {
        self.consumers
            .iter()
            .filter(|(_, consumers)| consumers.is_empty())
            .filter_map(|(id, _)| self.stages.get(id).cloned())
            .collect()
    }

    /// Stages with no producer in the set.
    pub fn sources(&self) -> Vec<Stage> {
        self.producers
            .iter()
            .filter(|(_, producers)| producers.is_empty())
            .filter_map(|(id, _)| self.stages.get(id).cloned())
            .collect()
    }
}

/// `roots` and every stage upstream of them, each once.
///
/// Terminates on cyclic graphs.
pub fn upstream_closure<'a>(roots: impl IntoIterator<Item = &'a Stage>) -> Vec<Stage> {
    let mut seen: IndexSet<StageId> = IndexSet::new();
    let mut result = Vec::new();
    let mut queue: VecDeque<Stage> = roots.into_iter().cloned().collect();

    while let Some(stage) = queue.pop_front() {
        if seen.insert(stage.id()) {
            queue.extend(stage.producers());
            result.push(stage);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::PipelineResult;
    use crate::core::port::{PortDefinition, StagePorts};
    use crate::core::types::DataKind;
    use crate::execution::{ExecutionContext, PipelineContext};
    use crate::graph::stage::ProcessObject;

    struct Join;

    impl ProcessObject for Join {
        fn name(&self) -> &str {
            "join"
        }

        fn ports(&self) -> StagePorts {
            StagePorts::new()
                .input(PortDefinition::input(0, DataKind::Any).optional())
                .input(PortDefinition::input(1, DataKind::Any).optional())
                .output(PortDefinition::output(0, DataKind::Image))
        }

        fn execute(&mut self, _ctx: &mut ExecutionContext) -> PipelineResult<()> {
            Ok(())
        }
    }

    fn stage(context: &PipelineContext) -> Stage {
        Stage::new(Join, context)
    }

    fn connect(consumer: &Stage, input: usize, producer: &Stage) {
        consumer
            .set_input_connection(input, producer.get_output_port(0).unwrap())
            .unwrap();
    }

    fn position(order: &[Stage], stage: &Stage) -> usize {
        order.iter().position(|s| s == stage).unwrap()
    }

    #[test]
    fn test_topological_sort_diamond() {
        let context = PipelineContext::default();
        let (a, b, c, d) = (stage(&context), stage(&context), stage(&context), stage(&context));
        connect(&b, 0, &a);
        connect(&c, 0, &a);
        connect(&d, 0, &b);
        connect(&d, 1, &c);

        let analyzer = TopologyAnalyzer::from_roots([&d]);
        assert_eq!(analyzer.len(), 4);
        let order = analyzer.topological_sort().unwrap();
        assert!(position(&order, &a) < position(&order, &b));
        assert!(position(&order, &a) < position(&order, &c));
        assert!(position(&order, &b) < position(&order, &d));
        assert!(position(&order, &c) < position(&order, &d));

        let levels = analyzer.levels().unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[1].len(), 2);
        assert_eq!(analyzer.sinks(), vec![d.clone()]);
        assert_eq!(analyzer.sources(), vec![a.clone()]);
    }

    #[test]
    fn test_cycle() {
        let context = PipelineContext::default();
        let (a, b, c) = (stage(&context), stage(&context), stage(&context));
        connect(&b, 0, &a);
        connect(&c, 0, &b);
        connect(&a, 0, &c);

        let analyzer = TopologyAnalyzer::from_roots([&c]);
        assert_eq!(analyzer.len(), 3);
        assert!(analyzer.has_cycle());
        match analyzer.topological_sort() {
            Err(PipelineError::CycleDetected { stages }) => assert_eq!(stages.len(), 3),
            other => panic!("expected a cycle, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_producers_outside_set_are_ignored() {
        let context = PipelineContext::default();
        let (a, b) = (stage(&context), stage(&context));
        connect(&b, 0, &a);
        let analyzer = TopologyAnalyzer::new([b.clone()]);
        assert_eq!(analyzer.sources(), vec![b.clone()]);
        assert_eq!(analyzer.topological_sort().unwrap().len(), 1);
    }
}
