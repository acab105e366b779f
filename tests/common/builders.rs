//! Builders for tables, query graphs and dispatchers

use stageflow::pipeline::{
    AggregateFunction, AggregateOperator, AggregateSpec, AnyOperator, CmpOp, Dispatcher,
    DispatcherConfig, FilterOperator, MemoryTable, PacketDescriptor, PageSource, Predicate,
    ResourceSet, ScanOperator, StagePolicy, Tuple,
};
use stageflow::topology::CpuHandle;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Rows `(i % groups, i)` for `i` in `0..rows`
pub fn grouped_table(rows: i64, groups: i64) -> Arc<dyn PageSource> {
    Arc::new(
        (0..rows)
            .map(|i| Tuple::pair(i % groups, i))
            .collect::<MemoryTable>(),
    )
}

/// Builder for test dispatchers
pub struct DispatcherBuilder {
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig {
                workers: 2,
                resources: ResourceSet::new(16, 256, 8),
                default_buffer_capacity: 64,
                scratch_block_size: 4096,
                quantum_tuples: 32,
                max_packets: 64,
                ..DispatcherConfig::default()
            },
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn resources(mut self, resources: ResourceSet) -> Self {
        self.config.resources = resources;
        self
    }

    pub fn cpus(mut self, cpus: Vec<CpuHandle>) -> Self {
        self.config.cpus = cpus;
        self
    }

    pub fn stage_policy(mut self, policy: StagePolicy) -> Self {
        self.config.stage_policy = policy;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.default_buffer_capacity = capacity;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher::new(self.config).expect("dispatcher config is valid")
    }
}

pub fn scan(table: &Arc<dyn PageSource>) -> PacketDescriptor {
    PacketDescriptor::new(AnyOperator::scan(ScanOperator::new(Arc::clone(table))))
}

pub fn filter(column: usize, op: CmpOp, value: i64) -> PacketDescriptor {
    PacketDescriptor::new(AnyOperator::filter(FilterOperator::new(Predicate::new(
        column, op, value,
    ))))
}

pub fn aggregate(spec: AggregateSpec) -> PacketDescriptor {
    PacketDescriptor::new(AnyOperator::aggregate(AggregateOperator::new(spec)))
}

/// scan → filter(column 1 `op` value) → sum of column 1 grouped by column 0
pub fn sum_by_group_query(table: &Arc<dyn PageSource>, op: CmpOp, value: i64) -> PacketDescriptor {
    aggregate(AggregateSpec::grouped(0, AggregateFunction::Sum, 1))
        .with_input(filter(1, op, value).with_input(scan(table)))
}

/// Sequential reference for [`sum_by_group_query`] over [`grouped_table`]
pub fn expected_sum_by_group(rows: i64, groups: i64, keep: impl Fn(i64) -> bool) -> Vec<Tuple> {
    let mut sums = BTreeMap::new();
    for i in (0..rows).filter(|&i| keep(i)) {
        *sums.entry(i % groups).or_insert(0i64) += i;
    }
    sums.into_iter().map(|(k, v)| Tuple::pair(k, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_sum_by_group() {
        let rows = expected_sum_by_group(6, 2, |_| true);
        assert_eq!(rows, vec![Tuple::pair(0, 6), Tuple::pair(1, 9)]);
    }
}
