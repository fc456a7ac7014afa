//! Data-flow edges of structural operations.
//!
//! A structural operation (e.g., a `stablehlo.while` loop or a `sdy.named_computation`) passes values through
//! unchanged along a number of _edges_. Each edge has an _owner_ (one designated target, typically an operation
//! result), a set of _sources_ (operands and region terminator operands flowing into the edge), and a set of
//! _targets_ (results and block arguments that carry the same value). Propagation treats every edge as an identity
//! between all of its sources and targets, regardless of which structural operation it belongs to.
//!
//! For operations from other dialects, the sharding of an edge lives in a `sdy.data_flow_edge` operation that is
//! attached to the edge owner (see [`Module::data_flow_edge_for_target`]). Named computations store their edge
//! shardings in their own `in_shardings` and `out_shardings` instead.

use std::fmt::Debug;

use tracing::trace;

use crate::errors::Diagnostic;
use crate::ir::{BlockId, Module, OperationId, OperationKind, ValueDefinition, ValueId};
use crate::sharding::TensorSharding;

/// Strategy used to apply the sharding of a data-flow edge to one of its concrete targets. This is the hook through
/// which each kind of structural operation decides how edge shardings are represented on its results and block
/// arguments.
pub trait TargetShardingTransform: Debug + Send + Sync {
    /// Returns the sharding that `target` should carry when its edge has sharding `sharding`.
    fn transform(&self, module: &Module, target: ValueId, sharding: &TensorSharding) -> TensorSharding;
}

/// [`TargetShardingTransform`] that applies the edge sharding to every target unchanged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityTargetTransform;

impl TargetShardingTransform for IdentityTargetTransform {
    fn transform(&self, _module: &Module, _target: ValueId, sharding: &TensorSharding) -> TensorSharding {
        sharding.clone()
    }
}

/// [`TargetShardingTransform`] for structural operations whose targets follow the implicit replication convention:
/// explicitly replicated axes are dropped (all unused axes are replicated anyway).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ImplicitReplicationTargetTransform;

impl TargetShardingTransform for ImplicitReplicationTargetTransform {
    fn transform(&self, _module: &Module, _target: ValueId, sharding: &TensorSharding) -> TensorSharding {
        sharding.with_replicated(Vec::new())
    }
}

/// Structural operation whose values flow along data-flow edges.
pub trait ShardableDataFlowOp {
    /// Returns the operation that this is a view of.
    fn operation(&self) -> OperationId;

    /// Returns the owners of all edges of this operation.
    fn owners(&self, module: &Module) -> Vec<ValueId>;

    /// Returns the sources of the edge owned by `owner`.
    fn sources(&self, module: &Module, owner: ValueId) -> Vec<ValueId>;

    /// Returns the targets of the edge owned by `owner`, excluding `owner` itself.
    fn non_owner_targets(&self, module: &Module, owner: ValueId) -> Vec<ValueId>;

    /// Applies the edge sharding `sharding` to `target`.
    fn transform_target_sharding(&self, module: &Module, target: ValueId, sharding: &TensorSharding) -> TensorSharding;
}

/// [`ShardableDataFlowOp`] view of an operation from another dialect with regions (e.g., a loop or a conditional).
///
/// The owners are the results. The sources of result `i` are operand `i` and operand `i` of the terminator of every
/// region that returns one value per result. The other targets of result `i` are the `i`-th arguments of every
/// region that takes one argument per result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionDataFlow {
    operation: OperationId,
}

impl RegionDataFlow {
    fn edge_regions(module: &Module, operation: OperationId) -> impl Iterator<Item = BlockId> + '_ {
        module.operation(operation).regions().iter().copied()
    }

    fn result_index(module: &Module, owner: ValueId) -> Option<usize> {
        match module.definition(owner) {
            ValueDefinition::OperationResult { index, .. } => Some(index),
            ValueDefinition::BlockArgument { .. } => None,
        }
    }
}

impl ShardableDataFlowOp for RegionDataFlow {
    fn operation(&self) -> OperationId {
        self.operation
    }

    fn owners(&self, module: &Module) -> Vec<ValueId> {
        module.operation(self.operation).results().to_vec()
    }

    fn sources(&self, module: &Module, owner: ValueId) -> Vec<ValueId> {
        let Some(index) = Self::result_index(module, owner) else { return Vec::new() };
        let operation = module.operation(self.operation);
        let result_count = operation.results().len();
        let mut sources = operation.operand(index).into_iter().collect::<Vec<_>>();
        for region in Self::edge_regions(module, self.operation) {
            if let Some(terminator) = module.terminator(region) {
                let returned = module.operation(terminator).operands();
                if returned.len() == result_count {
                    sources.push(returned[index]);
                }
            }
        }
        sources
    }

    fn non_owner_targets(&self, module: &Module, owner: ValueId) -> Vec<ValueId> {
        let Some(index) = Self::result_index(module, owner) else { return Vec::new() };
        let result_count = module.operation(self.operation).results().len();
        Self::edge_regions(module, self.operation)
            .filter_map(|region| {
                let arguments = module.block_arguments(region);
                (arguments.len() == result_count).then(|| arguments[index])
            })
            .collect()
    }

    fn transform_target_sharding(&self, module: &Module, target: ValueId, sharding: &TensorSharding) -> TensorSharding {
        match module.operation(self.operation).kind() {
            OperationKind::Generic(generic) => match module.target_sharding_transforms.get(&generic.name) {
                Some(transform) => transform.transform(module, target, sharding),
                None => IdentityTargetTransform.transform(module, target, sharding),
            },
            _ => sharding.clone(),
        }
    }
}

/// [`ShardableDataFlowOp`] view of a `sdy.named_computation`: operand `i` flows into block argument `i`, and terminator
/// operand `i` flows into result `i`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NamedComputationDataFlow {
    operation: OperationId,
}

impl ShardableDataFlowOp for NamedComputationDataFlow {
    fn operation(&self) -> OperationId {
        self.operation
    }

    fn owners(&self, module: &Module) -> Vec<ValueId> {
        let operation = module.operation(self.operation);
        let mut owners = operation.regions().iter().flat_map(|region| module.block_arguments(*region).to_vec()).collect::<Vec<_>>();
        owners.extend_from_slice(operation.results());
        owners
    }

    fn sources(&self, module: &Module, owner: ValueId) -> Vec<ValueId> {
        let operation = module.operation(self.operation);
        match module.definition(owner) {
            ValueDefinition::BlockArgument { index, .. } => operation.operand(index).into_iter().collect(),
            ValueDefinition::OperationResult { index, .. } => operation
                .regions()
                .iter()
                .filter_map(|region| module.terminator(*region))
                .filter_map(|terminator| module.operation(terminator).operand(index))
                .collect(),
        }
    }

    fn non_owner_targets(&self, _module: &Module, _owner: ValueId) -> Vec<ValueId> {
        Vec::new()
    }

    fn transform_target_sharding(&self, _: &Module, _: ValueId, sharding: &TensorSharding) -> TensorSharding {
        sharding.clone()
    }
}

/// Single data-flow edge, as seen by propagation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFlowEdge {
    /// Structural operation that the edge belongs to.
    pub structural_operation: OperationId,

    /// Designated target that represents the edge.
    pub owner: ValueId,

    /// Values that flow into the edge.
    pub sources: Vec<ValueId>,

    /// Values that carry the edge value, excluding [`DataFlowEdge::owner`].
    pub targets: Vec<ValueId>,

    /// Authoritative sharding of every target of the edge, if any.
    pub sharding: Option<TensorSharding>,

    /// `sdy.data_flow_edge` operation that stores [`DataFlowEdge::sharding`], if the edge has one.
    pub edge_operation: Option<OperationId>,
}

impl Module {
    /// Returns a [`ShardableDataFlowOp`] view of `operation`, if it is a structural operation.
    pub fn shardable_data_flow_op(&self, operation: OperationId) -> Option<Box<dyn ShardableDataFlowOp>> {
        let data = &self.operations[operation.index()];
        if data.erased {
            return None;
        }
        match &data.kind {
            OperationKind::Generic(_) if !data.regions.is_empty() => Some(Box::new(RegionDataFlow { operation })),
            OperationKind::NamedComputation(_) => Some(Box::new(NamedComputationDataFlow { operation })),
            _ => None,
        }
    }

    fn region_data_flow_owner(&self, operation: OperationId, index: usize) -> Option<ValueId> {
        let data = &self.operations[operation.index()];
        match &data.kind {
            OperationKind::Generic(_) if !data.regions.is_empty() && !data.erased => data.results.get(index).copied(),
            _ => None,
        }
    }

    /// Returns the live `sdy.data_flow_edge` operation attached to `owner`, if any.
    pub fn data_flow_edge_of_owner(&self, owner: ValueId) -> Option<OperationId> {
        self.operations.iter().enumerate().find_map(|(index, operation)| {
            (!operation.erased
                && matches!(operation.kind, OperationKind::DataFlowEdge { .. })
                && operation.operands.first() == Some(&owner))
            .then(|| OperationId::new(index))
        })
    }

    /// Returns the `sdy.data_flow_edge` operation of the edge that `value` is a target of. `value` may be the edge
    /// owner itself or any other target of the edge (e.g., a loop block argument).
    pub fn data_flow_edge_for_target(&self, value: ValueId) -> Option<OperationId> {
        if let Some(edge) = self.data_flow_edge_of_owner(value) {
            return Some(edge);
        }
        let ValueDefinition::BlockArgument { block, index } = self.values[value.index()].definition else {
            return None;
        };
        let parent = self.blocks[block.index()].parent?;
        let result_count = self.operations[parent.index()].results.len();
        if self.blocks[block.index()].arguments.len() != result_count {
            return None;
        }
        self.region_data_flow_owner(parent, index).and_then(|owner| self.data_flow_edge_of_owner(owner))
    }

    /// Returns the `sdy.data_flow_edge` operation of the edge that the `operand_index`-th operand of `user` flows into,
    /// if that operand is a source of a data-flow edge.
    pub fn data_flow_edge_for_source(&self, user: OperationId, operand_index: usize) -> Option<OperationId> {
        let data = &self.operations[user.index()];
        let owner = match &data.kind {
            OperationKind::Generic(_) => self.region_data_flow_owner(user, operand_index),
            OperationKind::Return => {
                let parent = self.blocks[data.block.index()].parent?;
                if data.operands.len() != self.operations[parent.index()].results.len() {
                    return None;
                }
                self.region_data_flow_owner(parent, operand_index)
            }
            _ => None,
        }?;
        self.data_flow_edge_of_owner(owner)
    }

    /// Returns all data-flow edges of all live structural operations, in pre-order.
    pub fn data_flow_edges(&self) -> Vec<DataFlowEdge> {
        let mut edges = Vec::new();
        for operation in self.walk() {
            let Some(data_flow_op) = self.shardable_data_flow_op(operation) else { continue };
            for owner in data_flow_op.owners(self) {
                edges.push(DataFlowEdge {
                    structural_operation: operation,
                    owner,
                    sources: data_flow_op.sources(self, owner),
                    targets: data_flow_op.non_owner_targets(self, owner),
                    sharding: self.sharding(owner),
                    edge_operation: self.data_flow_edge_of_owner(owner),
                });
            }
        }
        edges
    }

    /// Attaches a `sdy.data_flow_edge` to every edge owner of every generic structural operation that does not have
    /// one yet, redirecting all other uses of the owner to the edge. The initial sharding of each edge is the
    /// sharding that was stored on the owner (or, failing that, on one of its targets). Returns the number of edges
    /// that were added.
    pub(crate) fn insert_data_flow_edges(&mut self) -> Result<usize, Diagnostic> {
        let mut inserted = 0;
        for operation in self.walk() {
            if !matches!(self.operations[operation.index()].kind, OperationKind::Generic(_)) {
                continue;
            }
            let Some(data_flow_op) = self.shardable_data_flow_op(operation) else { continue };
            let block = self.operations[operation.index()].block;
            let mut position = self.blocks[block.index()]
                .operations
                .iter()
                .position(|other| *other == operation)
                .map(|position| position + 1)
                .unwrap_or(self.blocks[block.index()].operations.len());
            for owner in data_flow_op.owners(self) {
                if self.data_flow_edge_of_owner(owner).is_some() {
                    continue;
                }
                let targets = data_flow_op.non_owner_targets(self, owner);
                let sharding = std::iter::once(owner)
                    .chain(targets.iter().copied())
                    .find_map(|value| self.values[value.index()].sharding.clone());
                let r#type = self.values[owner.index()].r#type.clone();
                let kind = OperationKind::DataFlowEdge { sharding };
                let edge = self.insert_operation(block, Some(position), kind, vec![owner], vec![r#type], Vec::new())?;
                position += 1;
                let edge_result = self.operations[edge.index()].results[0];
                self.replace_all_uses_except(owner, edge_result, Some(edge));
                for value in std::iter::once(owner).chain(targets) {
                    self.values[value.index()].sharding = None;
                }
                trace!(owner = owner.index(), edge = edge.index(), "inserted data-flow edge");
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Moves the sharding of the `sdy.data_flow_edge` operation `edge` onto the owner and the other targets of its
    /// edge (through the owning operation's [`ShardableDataFlowOp::transform_target_sharding`]), redirects the uses
    /// of the edge to its owner, and erases it.
    pub(crate) fn sink_data_flow_edge(&mut self, edge: OperationId) {
        let owner = self.operations[edge.index()].operands[0];
        let edge_result = self.operations[edge.index()].results[0];
        let sharding = match &self.operations[edge.index()].kind {
            OperationKind::DataFlowEdge { sharding } => sharding.clone(),
            _ => None,
        };
        let structural_operation = self.defining_operation(owner).and_then(|operation| {
            self.shardable_data_flow_op(operation)
        });
        if let (Some(sharding), Some(data_flow_op)) = (sharding, structural_operation) {
            let targets = data_flow_op.non_owner_targets(self, owner);
            let transformed = std::iter::once(owner)
                .chain(targets)
                .map(|target| (target, data_flow_op.transform_target_sharding(self, target, &sharding)))
                .collect::<Vec<_>>();
            for (target, sharding) in transformed {
                self.values[target.index()].sharding = Some(sharding);
            }
        }
        self.replace_all_uses_with(edge_result, owner);
        self.erase_operation(edge);
        trace!(owner = owner.index(), edge = edge.index(), "sank data-flow edge");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use crate::axis::AxisRef;
    use crate::errors::ShardyError;
    use crate::ir::GenericOperation;
    use crate::mesh::{Mesh, MeshAxis};
    use crate::sharding::DimensionSharding;
    use crate::types::{ElementType, TensorType};

    use super::*;

    fn tensor_8() -> TensorType {
        TensorType::new([8], ElementType::F32)
    }

    /// Builds `%0:2 = "stablehlo.while"(%arg0, %arg1) ({ ^bb0(%arg2, %arg3): "stablehlo.return"(%arg2, %arg3) })`.
    fn while_module() -> (Module, OperationId, Vec<ValueId>, Vec<ValueId>) {
        let mut module = Module::new("main");
        let mesh = Mesh::new(vec![MeshAxis::new("a", 2).unwrap(), MeshAxis::new("b", 2).unwrap()]).unwrap();
        module.declare_mesh("mesh", mesh).unwrap();
        let body = module.body();
        let inputs = vec![module.add_argument(tensor_8(), None).unwrap(), module.add_argument(tensor_8(), None).unwrap()];
        let region = module.region(&[tensor_8(), tensor_8()]);
        let region_arguments = module.block_arguments(region).to_vec();
        let add = module
            .generic(
                region,
                GenericOperation::elementwise("stablehlo.add"),
                &[region_arguments[0], region_arguments[1]],
                &[tensor_8()],
                &[],
            )
            .unwrap();
        let sum = module.operation(add).result(0).unwrap();
        module.r#return(region, &[sum, region_arguments[1]]).unwrap();
        let while_op = module
            .generic(body, GenericOperation::new("stablehlo.while"), &inputs, &[tensor_8(), tensor_8()], &[region])
            .unwrap();
        let results = module.operation(while_op).results().to_vec();
        module.r#return(body, &results).unwrap();
        (module, while_op, inputs, region_arguments)
    }

    #[test]
    fn test_region_data_flow() {
        let (module, while_op, inputs, region_arguments) = while_module();
        let data_flow_op = module.shardable_data_flow_op(while_op).unwrap();
        let results = module.operation(while_op).results().to_vec();
        assert_eq!(data_flow_op.owners(&module), results);
        let region = module.operation(while_op).regions()[0];
        let returned = module.operation(module.terminator(region).unwrap()).operands().to_vec();
        assert_eq!(data_flow_op.sources(&module, results[0]), vec![inputs[0], returned[0]]);
        assert_eq!(data_flow_op.non_owner_targets(&module, results[1]), vec![region_arguments[1]]);
        assert_eq!(module.data_flow_edges().len(), 2);
    }

    #[test]
    fn test_data_flow_edge_lookups() {
        let (mut module, while_op, inputs, region_arguments) = while_module();
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::open(["a"])]);
        module.set_sharding(region_arguments[0], sharding.clone()).unwrap();
        assert_eq!(module.insert_data_flow_edges().unwrap(), 2);
        assert!(module.verify().is_ok());

        let results = module.operation(while_op).results().to_vec();
        let edge = module.data_flow_edge_for_target(results[0]).unwrap();
        assert_eq!(module.data_flow_edge_for_target(region_arguments[0]), Some(edge));
        assert_eq!(module.data_flow_edge_for_source(while_op, 0), Some(edge));
        let region = module.operation(while_op).regions()[0];
        let terminator = module.terminator(region).unwrap();
        assert_eq!(module.data_flow_edge_for_source(terminator, 0), Some(edge));
        assert_eq!(module.data_flow_edge_for_target(inputs[0]), None);

        // The sharding moved from the block argument onto the edge, and all targets read it through the edge.
        assert_eq!(module.sharding(results[0]), Some(sharding.clone()));
        assert_eq!(module.sharding(region_arguments[0]), Some(sharding.clone()));
        assert_eq!(module.uses(results[0]), vec![(edge, 0)]);

        let updated = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a", "b"])]);
        module.set_sharding(region_arguments[0], updated.clone()).unwrap();
        assert_eq!(module.sharding(module.operation(edge).result(0).unwrap()), Some(updated.clone()));

        module.sink_data_flow_edge(edge);
        assert!(module.data_flow_edge_for_target(results[0]).is_none());
        assert_eq!(module.sharding(results[0]), Some(updated.clone()));
        assert_eq!(module.sharding(region_arguments[0]), Some(updated));
    }

    #[test]
    fn test_target_sharding_transforms() {
        let (mut module, while_op, _, region_arguments) = while_module();
        module.register_target_sharding_transform("stablehlo.while", Arc::new(ImplicitReplicationTargetTransform));
        let sharding = TensorSharding::with_replicated_axes(
            "mesh",
            vec![DimensionSharding::closed(["a"])],
            vec![AxisRef::full("b")],
        );
        module.insert_data_flow_edges().unwrap();
        let results = module.operation(while_op).results().to_vec();
        module.set_sharding(results[1], sharding).unwrap();
        let edge = module.data_flow_edge_for_target(results[1]).unwrap();
        module.sink_data_flow_edge(edge);
        let expected = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"])]);
        assert_eq!(module.sharding(results[1]), Some(expected.clone()));
        assert_eq!(module.sharding(region_arguments[1]), Some(expected));
    }

    #[test]
    fn test_invalid_data_flow_edge_owner() {
        let (mut module, _, inputs, _) = while_module();
        let body = module.body();
        let error = module.data_flow_edge(body, inputs[0], None).unwrap_err();
        assert!(matches!(error.error, ShardyError::InvalidDataFlowEdgeOwner { .. }));
    }
}
