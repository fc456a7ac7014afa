use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::collectives::total_sharded_size;
use crate::errors::{Diagnostic, ShardyError};
use crate::groups::ShardingGroups;
use crate::ir::{AllowedDirection, Module, OperationId, OperationKind, ValueId};
use crate::manual::local_sharding;
use crate::sharding::TensorSharding;

use super::Pass;

/// Configuration of the [`PropagationPass`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PropagationOptions {
    /// Maximum number of link evaluations before propagation gives up with a
    /// [`ShardyError::PropagationDidNotConverge`] error.
    pub max_iterations: usize,

    /// If `true`, propagation only refines the open dimensions of values that already have a sharding, and never
    /// assigns a sharding to a value that does not have one.
    pub propagate_through_open_dimensions_only: bool,

    /// If `true`, shardings with higher-priority dimensions (i.e., smaller `pN` values) win over more sharded ones
    /// when choosing what a link proposes. Otherwise priorities are ignored.
    pub respect_priorities: bool,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self { max_iterations: 10_000, propagate_through_open_dimensions_only: false, respect_priorities: true }
    }
}

/// Where the sharding of a value is stored. Values that share a storage (e.g., all targets of a data-flow edge)
/// always have the same sharding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum ShardingStorage {
    Edge(OperationId),
    Value(ValueId),
}

fn sharding_storage(module: &Module, value: ValueId) -> ShardingStorage {
    if let Some(edge) = module.data_flow_edge_for_target(value) {
        return ShardingStorage::Edge(edge);
    }
    match module.defining_operation(value) {
        Some(operation) if matches!(module.operation(operation).kind(), OperationKind::DataFlowEdge { .. }) => {
            ShardingStorage::Edge(operation)
        }
        _ => ShardingStorage::Value(value),
    }
}

/// Identity relationship between values. Every evaluation proposes the most sharded sharding among `members`,
/// `inputs`, and `fixed`, and every member adopts it where it is compatible. Inputs only contribute their shardings.
#[derive(Clone, Debug)]
struct Link {
    kind: &'static str,
    members: Vec<ValueId>,
    inputs: Vec<ValueId>,
    fixed: Vec<TensorSharding>,
}

impl Link {
    fn new(kind: &'static str, members: Vec<ValueId>) -> Self {
        Self { kind, members, inputs: Vec::new(), fixed: Vec::new() }
    }
}

fn collect_links(module: &Module) -> Result<Vec<Link>, Diagnostic> {
    let mut links = Vec::new();
    for operation in module.walk() {
        let data = module.operation(operation);
        match data.kind() {
            OperationKind::Generic(generic) if generic.elementwise => {
                let members = data.operands().iter().chain(data.results()).copied().collect();
                links.push(Link::new("element-wise", members));
            }
            OperationKind::ShardingConstraint { sharding } => {
                let mut link = Link::new("sharding constraint", data.operands().to_vec());
                link.fixed.push(sharding.clone());
                links.push(link);
            }
            OperationKind::PropagationBarrier { allowed_direction } => {
                let (input, result) = (data.operands()[0], data.results()[0]);
                match allowed_direction {
                    AllowedDirection::Forward => {
                        links.push(Link { inputs: vec![input], ..Link::new("propagation barrier", vec![result]) })
                    }
                    AllowedDirection::Backward => {
                        links.push(Link { inputs: vec![result], ..Link::new("propagation barrier", vec![input]) })
                    }
                    AllowedDirection::None | AllowedDirection::Both => {}
                }
            }
            OperationKind::ManualComputation(computation) => {
                for (operand, sharding) in data.operands().iter().zip(computation.in_shardings.shardings()) {
                    let mut link = Link::new("manual computation operand", vec![*operand]);
                    link.fixed.push(sharding.clone());
                    links.push(link);
                }
                if let Some(terminator) = module.terminator(data.regions()[0]) {
                    let returned = module.operation(terminator).operands();
                    for (value, sharding) in returned.iter().zip(computation.out_shardings.shardings()) {
                        let mut link = Link::new("manual computation result", vec![*value]);
                        link.fixed.push(local_sharding(sharding, computation.manual_axes.as_slice()));
                        links.push(link);
                    }
                }
            }
            _ => {}
        }
        if let Some(data_flow_op) = module.shardable_data_flow_op(operation) {
            for owner in data_flow_op.owners(module) {
                let mut members = vec![owner];
                members.extend(data_flow_op.sources(module, owner));
                members.extend(data_flow_op.non_owner_targets(module, owner));
                links.push(Link::new("data-flow edge", members));
            }
        }
    }
    for group in ShardingGroups::build(module)?.groups() {
        links.push(Link::new("sharding group", group.members.clone()));
    }
    Ok(links)
}

/// Sharding propagation over the links of a [`Module`] (see the crate documentation for the link kinds).
///
/// Propagation is a worklist algorithm: every link is evaluated once, and every link that contains a value whose
/// sharding changed is evaluated again, until nothing changes. Updates are monotonic (a value either gets its first
/// sharding or gets more axes in its open dimensions), so the algorithm always reaches a fixpoint, but it is bounded
/// by [`PropagationOptions::max_iterations`] nonetheless. Shardings that are intrinsic to an operation (e.g., the
/// results of reshards and collectives) and the operands of collectives (whose `out_sharding` depends on them) are
/// never changed. Once done, all members of each sharding group must have the same sharding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropagationPass {
    options: PropagationOptions,
}

impl PropagationPass {
    /// Creates a new [`PropagationPass`].
    pub fn new(options: PropagationOptions) -> Self {
        Self { options }
    }

    /// Returns the [`PropagationOptions`] of this [`PropagationPass`].
    pub fn options(&self) -> &PropagationOptions {
        &self.options
    }

    fn candidate(&self, module: &Module, shardings: &[TensorSharding]) -> Option<TensorSharding> {
        let key = |sharding: &TensorSharding| {
            let priority = if self.options.respect_priorities {
                sharding.dimensions().iter().filter_map(|dimension| dimension.priority()).min().map(Reverse)
            } else {
                None
            };
            let sharded_size = module
                .meshes()
                .resolve(sharding.mesh())
                .ok()
                .and_then(|mesh| total_sharded_size(sharding, mesh).ok())
                .unwrap_or(0);
            (priority, sharded_size, sharding.sharding_axes().count())
        };
        let mut best: Option<(&TensorSharding, _)> = None;
        for sharding in shardings {
            let sharding_key = key(sharding);
            if best.as_ref().is_none_or(|(_, best_key)| sharding_key > *best_key) {
                best = Some((sharding, sharding_key));
            }
        }
        best.map(|(sharding, _)| sharding.clone())
    }

    /// Returns the sharding that `value` should have after adopting `candidate`, given its `current` sharding:
    ///
    ///   - a value without a sharding adopts `candidate` as is, if it is valid for its type,
    ///   - otherwise, every open dimension whose axes are a strict prefix of the corresponding `candidate` dimension
    ///     is extended to the `candidate` axes, one dimension at a time and only while the result stays valid.
    ///
    /// Returns [`None`] if nothing can be adopted.
    fn refine(
        &self,
        module: &Module,
        value: ValueId,
        current: Option<&TensorSharding>,
        candidate: &TensorSharding,
    ) -> Option<TensorSharding> {
        let shape = module.r#type(value).shape();
        let mesh = module.meshes().resolve(candidate.mesh()).ok()?;
        let Some(current) = current else {
            if self.options.propagate_through_open_dimensions_only {
                return None;
            }
            return candidate.validate_with_mesh(shape, mesh).is_ok().then(|| candidate.clone());
        };
        if current.mesh() != candidate.mesh() || current.rank() != candidate.rank() {
            trace!(value = value.index(), "skipping candidate sharding on a different mesh");
            return None;
        }
        let mut refined = current.clone();
        for (dimension, (current_dimension, candidate_dimension)) in
            current.dimensions().iter().zip(candidate.dimensions()).enumerate()
        {
            let axes = candidate_dimension.axes();
            if !current_dimension.is_open()
                || current_dimension.axes() == axes
                || !axes.starts_with(current_dimension.axes())
            {
                continue;
            }
            let mut dimensions = refined.dimensions().to_vec();
            dimensions[dimension] = current_dimension.with_axes(axes.to_vec());
            let tentative = refined.with_dimensions(dimensions);
            match tentative.validate_with_mesh(shape, mesh) {
                Ok(()) => refined = tentative,
                Err(error) => trace!(value = value.index(), dimension, %error, "skipping conflicting dimension"),
            }
        }
        Some(refined)
    }

    /// Evaluates `link` and returns the members whose sharding changed.
    fn evaluate(
        &self,
        module: &mut Module,
        link: &Link,
        pinned: &HashSet<ShardingStorage>,
        storages: &HashMap<ValueId, ShardingStorage>,
    ) -> Result<Vec<ValueId>, Diagnostic> {
        let shardings = link
            .members
            .iter()
            .chain(link.inputs.iter())
            .filter_map(|value| module.sharding(*value))
            .chain(link.fixed.iter().cloned())
            .collect::<Vec<_>>();
        let Some(candidate) = self.candidate(module, shardings.as_slice()) else { return Ok(Vec::new()) };
        let mut updated = Vec::new();
        for member in &link.members {
            if storages.get(member).is_some_and(|storage| pinned.contains(storage))
                || !module.is_sharding_settable(*member)
            {
                continue;
            }
            let current = module.sharding(*member);
            let Some(refined) = self.refine(module, *member, current.as_ref(), &candidate) else { continue };
            if current.as_ref() == Some(&refined) {
                continue;
            }
            trace!(link = link.kind, value = member.index(), sharding = %refined, "updated sharding");
            module.set_sharding(*member, refined)?;
            updated.push(*member);
        }
        Ok(updated)
    }
}

impl Pass for PropagationPass {
    fn name(&self) -> &'static str {
        "sdy-propagate"
    }

    fn run(&self, module: &mut Module) -> Result<bool, Diagnostic> {
        let links = collect_links(module)?;
        let mut storages = HashMap::new();
        let mut links_by_storage: HashMap<ShardingStorage, Vec<usize>> = HashMap::new();
        for (index, link) in links.iter().enumerate() {
            for value in link.members.iter().chain(link.inputs.iter()) {
                let storage = *storages.entry(*value).or_insert_with(|| sharding_storage(module, *value));
                let linked = links_by_storage.entry(storage).or_default();
                if linked.last() != Some(&index) {
                    linked.push(index);
                }
            }
        }
        let pinned = module
            .walk()
            .into_iter()
            .filter(|operation| module.operation(*operation).kind().as_collective().is_some())
            .map(|operation| sharding_storage(module, module.operation(operation).operands()[0]))
            .collect::<HashSet<_>>();

        let mut worklist = (0..links.len()).collect::<VecDeque<_>>();
        let mut queued = vec![true; links.len()];
        let mut iterations = 0;
        let mut update_count = 0;
        while let Some(index) = worklist.pop_front() {
            queued[index] = false;
            iterations += 1;
            if iterations > self.options.max_iterations {
                let error = ShardyError::PropagationDidNotConverge { max_iterations: self.options.max_iterations };
                return Err(Diagnostic::module(error));
            }
            for value in self.evaluate(module, &links[index], &pinned, &storages)? {
                update_count += 1;
                let storage = storages.get(&value).copied().unwrap_or(ShardingStorage::Value(value));
                for linked in links_by_storage.get(&storage).into_iter().flatten() {
                    if !queued[*linked] {
                        queued[*linked] = true;
                        worklist.push_back(*linked);
                    }
                }
            }
        }
        debug!(link_count = links.len(), iterations, update_count, "propagation converged");

        ShardingGroups::build(module)?.check_consistent(module)?;
        Ok(update_count > 0)
    }
}
