use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::axis::AxisRef;
use crate::collectives::{AllGather, AllReduce, AllSlice, AllToAll, AllToAllParam, CollectivePermute, ReduceScatter};
use crate::data_flow::TargetShardingTransform;
use crate::errors::{Diagnostic, ShardyError};
use crate::manual::local_sharding;
use crate::mesh::{Mesh, MeshRegistry};
use crate::sharding::{TensorSharding, TensorShardingPerValue};
use crate::types::TensorType;

use super::{
    AllowedDirection, BlockId, GenericOperation, ManualComputation, NamedComputation, Operation, OperationId,
    OperationKind, ValueId,
};

/// Definition site of a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueDefinition {
    /// The `index`-th argument of `block`.
    BlockArgument { block: BlockId, index: usize },

    /// The `index`-th result of `operation`.
    OperationResult { operation: OperationId, index: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ValueData {
    pub(crate) r#type: TensorType,
    pub(crate) definition: ValueDefinition,
    pub(crate) sharding: Option<TensorSharding>,
    /// `(user, operand_index)` pairs, including users that are erased or detached.
    pub(crate) uses: Vec<(OperationId, usize)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct BlockData {
    pub(crate) arguments: Vec<ValueId>,
    pub(crate) operations: Vec<OperationId>,
    pub(crate) parent: Option<OperationId>,
}

/// Module containing named meshes and a single function-like entry body (printed as `func.func @<name>`).
#[derive(Clone, Debug)]
pub struct Module {
    pub(crate) function_name: String,
    pub(crate) meshes: MeshRegistry,
    pub(crate) values: Vec<ValueData>,
    pub(crate) operations: Vec<Operation>,
    pub(crate) blocks: Vec<BlockData>,
    pub(crate) body: BlockId,
    pub(crate) target_sharding_transforms: HashMap<String, Arc<dyn TargetShardingTransform>>,
}

impl Module {
    /// Creates a new empty [`Module`] whose entry body is printed as `func.func @<function_name>`.
    pub fn new<N: Into<String>>(function_name: N) -> Self {
        Self {
            function_name: function_name.into(),
            meshes: MeshRegistry::new(),
            values: Vec::new(),
            operations: Vec::new(),
            blocks: vec![BlockData::default()],
            body: BlockId::new(0),
            target_sharding_transforms: HashMap::new(),
        }
    }

    /// Returns the name of the entry function of this module.
    pub fn function_name(&self) -> &str {
        self.function_name.as_str()
    }

    /// Returns the registry of meshes declared in this module.
    pub fn meshes(&self) -> &MeshRegistry {
        &self.meshes
    }

    /// Declares a mesh named `mesh_name` at module scope.
    pub fn declare_mesh<S: AsRef<str>>(&mut self, mesh_name: S, mesh: Mesh) -> Result<(), Diagnostic> {
        let mesh_name = mesh_name.as_ref();
        self.meshes.declare(mesh_name, mesh).map_err(|error| Diagnostic::mesh(mesh_name, error))
    }

    /// Returns the entry body of this module.
    pub fn body(&self) -> BlockId {
        self.body
    }

    /// Registers the [`TargetShardingTransform`] that is used for the data-flow edges of generic operations named
    /// `operation_name`. Operations without a registered transform use
    /// [`IdentityTargetTransform`](crate::data_flow::IdentityTargetTransform).
    pub fn register_target_sharding_transform<N: Into<String>>(
        &mut self,
        operation_name: N,
        transform: Arc<dyn TargetShardingTransform>,
    ) {
        self.target_sharding_transforms.insert(operation_name.into(), transform);
    }

    /// Adds an argument of type `r#type` to the entry body, optionally with a sharding.
    pub fn add_argument(&mut self, r#type: TensorType, sharding: Option<TensorSharding>) -> Result<ValueId, Diagnostic> {
        if let Some(sharding) = &sharding {
            sharding.validate(r#type.shape(), &self.meshes).map_err(Diagnostic::module)?;
        }
        let block = self.body;
        let value = self.push_value(r#type, ValueDefinition::BlockArgument {
            block,
            index: self.blocks[block.0].arguments.len(),
        });
        self.values[value.0].sharding = sharding;
        self.blocks[block.0].arguments.push(value);
        Ok(value)
    }

    /// Creates a new detached block with arguments of the provided types, to be used as the region of a
    /// region-bearing operation.
    pub fn region(&mut self, argument_types: &[TensorType]) -> BlockId {
        let block = BlockId::new(self.blocks.len());
        self.blocks.push(BlockData::default());
        for (index, r#type) in argument_types.iter().enumerate() {
            let value = self.push_value(r#type.clone(), ValueDefinition::BlockArgument { block, index });
            self.blocks[block.0].arguments.push(value);
        }
        block
    }

    fn push_value(&mut self, r#type: TensorType, definition: ValueDefinition) -> ValueId {
        let value = ValueId::new(self.values.len());
        self.values.push(ValueData { r#type, definition, sharding: None, uses: Vec::new() });
        value
    }

    /// Returns the type of `value`.
    pub fn r#type(&self, value: ValueId) -> &TensorType {
        &self.values[value.0].r#type
    }

    /// Returns the definition site of `value`.
    pub fn definition(&self, value: ValueId) -> ValueDefinition {
        self.values[value.0].definition
    }

    /// Returns the operation that defines `value`, if `value` is an operation result.
    pub fn defining_operation(&self, value: ValueId) -> Option<OperationId> {
        match self.values[value.0].definition {
            ValueDefinition::OperationResult { operation, .. } => Some(operation),
            ValueDefinition::BlockArgument { .. } => None,
        }
    }

    /// Returns the block in which `value` is defined.
    pub fn defining_block(&self, value: ValueId) -> BlockId {
        match self.values[value.0].definition {
            ValueDefinition::BlockArgument { block, .. } => block,
            ValueDefinition::OperationResult { operation, .. } => self.operations[operation.0].block,
        }
    }

    /// Returns the operation with id `operation`.
    pub fn operation(&self, operation: OperationId) -> &Operation {
        &self.operations[operation.0]
    }

    /// Returns the arguments of `block`.
    pub fn block_arguments(&self, block: BlockId) -> &[ValueId] {
        self.blocks[block.0].arguments.as_slice()
    }

    /// Returns the operations of `block`, in order.
    pub fn block_operations(&self, block: BlockId) -> &[OperationId] {
        self.blocks[block.0].operations.as_slice()
    }

    /// Returns the operation that `block` is a region of (or [`None`] for the entry body and for detached blocks).
    pub fn block_parent(&self, block: BlockId) -> Option<OperationId> {
        self.blocks[block.0].parent
    }

    /// Returns the terminator of `block`, if its last operation is a return.
    pub fn terminator(&self, block: BlockId) -> Option<OperationId> {
        self.blocks[block.0]
            .operations
            .last()
            .copied()
            .filter(|operation| matches!(self.operations[operation.0].kind, OperationKind::Return))
    }

    /// Returns all live operations in pre-order (each operation precedes the operations nested in its regions).
    pub fn walk(&self) -> Vec<OperationId> {
        let mut operations = Vec::with_capacity(self.operations.len());
        self.walk_block(self.body, &mut operations);
        operations
    }

    fn walk_block(&self, block: BlockId, operations: &mut Vec<OperationId>) {
        for operation in &self.blocks[block.0].operations {
            operations.push(*operation);
            for region in &self.operations[operation.0].regions {
                self.walk_block(*region, operations);
            }
        }
    }

    /// Returns `true` if `operation` has not been erased and is nested (possibly transitively) in the entry body.
    fn is_live(&self, mut operation: OperationId) -> bool {
        loop {
            let data = &self.operations[operation.0];
            if data.erased {
                return false;
            }
            if data.block == self.body {
                return true;
            }
            match self.blocks[data.block.0].parent {
                Some(parent) => operation = parent,
                None => return false,
            }
        }
    }

    /// Returns all uses of `value` by live operations as `(user, operand_index)` pairs, in the order in which they
    /// were created.
    pub fn uses(&self, value: ValueId) -> Vec<(OperationId, usize)> {
        self.values[value.0].uses.iter().copied().filter(|(user, _)| self.is_live(*user)).collect()
    }

    /// Returns `true` if `value` is used by at least one live operation.
    pub fn has_uses(&self, value: ValueId) -> bool {
        self.values[value.0].uses.iter().any(|(user, _)| self.is_live(*user))
    }

    /// Replaces every use of `from` by a live operation with `to`.
    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) {
        self.replace_all_uses_except(from, to, None);
    }

    pub(crate) fn replace_all_uses_except(&mut self, from: ValueId, to: ValueId, except: Option<OperationId>) {
        if from == to {
            return;
        }
        let (moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.values[from.0].uses)
            .into_iter()
            .partition(|(user, _)| Some(*user) != except && self.is_live(*user));
        self.values[from.0].uses = kept;
        for (user, index) in moved {
            self.operations[user.0].operands[index] = to;
            self.values[to.0].uses.push((user, index));
        }
    }

    /// Replaces the `index`-th operand of `operation` with `value`.
    pub fn set_operand(&mut self, operation: OperationId, index: usize, value: ValueId) {
        let previous = std::mem::replace(&mut self.operations[operation.0].operands[index], value);
        self.values[previous.0].uses.retain(|r#use| *r#use != (operation, index));
        self.values[value.0].uses.push((operation, index));
    }

    fn drop_uses_by(&mut self, operation: OperationId) {
        for operand in self.operations[operation.0].operands.clone() {
            self.values[operand.0].uses.retain(|(user, _)| *user != operation);
        }
    }

    /// Erases `operation` (along with every operation nested in its regions) from its block. The results of the
    /// erased operation must not have any remaining uses.
    pub fn erase_operation(&mut self, operation: OperationId) {
        let block = self.operations[operation.0].block;
        self.blocks[block.0].operations.retain(|other| *other != operation);
        let mut erased = vec![operation];
        while let Some(operation) = erased.pop() {
            self.operations[operation.0].erased = true;
            self.drop_uses_by(operation);
            for region in self.operations[operation.0].regions.clone() {
                erased.extend(self.blocks[region.0].operations.drain(..));
            }
        }
        trace!(operation = operation.0, "erased operation");
    }

    pub(crate) fn replace_kind(&mut self, operation: OperationId, kind: OperationKind) {
        self.operations[operation.0].kind = kind;
    }

    /// Inserts a new operation into `block` at `position` (or at its end), verifying it. The operation is rolled back
    /// if verification fails.
    pub(crate) fn insert_operation(
        &mut self,
        block: BlockId,
        position: Option<usize>,
        kind: OperationKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
        regions: Vec<BlockId>,
    ) -> Result<OperationId, Diagnostic> {
        let operation = OperationId::new(self.operations.len());
        let fail = |error: ShardyError| Diagnostic::operation(operation, kind.mnemonic(), error);
        if let Some(operand) = operands.iter().find(|operand| operand.0 >= self.values.len()) {
            return Err(fail(ShardyError::UnknownValue { value: operand.to_string() }));
        }
        if let Some(region) = regions.iter().find(|region| self.blocks[region.0].parent.is_some()) {
            return Err(fail(ShardyError::RegionAlreadyAttached { block: region.0 }));
        }
        if regions.iter().any(|region| self.terminator(*region).is_none()) {
            return Err(fail(ShardyError::MissingTerminator));
        }

        let value_count = self.values.len();
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, r#type)| self.push_value(r#type, ValueDefinition::OperationResult { operation, index }))
            .collect();
        let mnemonic = kind.mnemonic().to_string();
        for (index, operand) in operands.iter().enumerate() {
            self.values[operand.0].uses.push((operation, index));
        }
        self.operations.push(Operation { kind, operands, results, regions: regions.clone(), block, erased: false });
        for region in &regions {
            self.blocks[region.0].parent = Some(operation);
        }
        let position = position.unwrap_or(self.blocks[block.0].operations.len());
        self.blocks[block.0].operations.insert(position, operation);

        if let Err(error) = self.verify_operation(operation) {
            self.blocks[block.0].operations.remove(position);
            for region in &regions {
                self.blocks[region.0].parent = None;
            }
            self.drop_uses_by(operation);
            self.operations.pop();
            self.values.truncate(value_count);
            return Err(Diagnostic::operation(operation, mnemonic, error));
        }
        trace!(operation = operation.0, mnemonic = %mnemonic, "inserted operation");
        Ok(operation)
    }

    fn insert_unary(&mut self, block: BlockId, input: ValueId, kind: OperationKind) -> Result<ValueId, Diagnostic> {
        let result_types = match self.values.get(input.0) {
            Some(value) => vec![value.r#type.clone()],
            None => Vec::new(),
        };
        let operation = self.insert_operation(block, None, kind, vec![input], result_types, Vec::new())?;
        Ok(self.operations[operation.0].results[0])
    }

    /// Appends a `sdy.sharding_constraint` of `input` to `block`.
    pub fn sharding_constraint(
        &mut self,
        block: BlockId,
        input: ValueId,
        sharding: TensorSharding,
    ) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::ShardingConstraint { sharding })
    }

    /// Appends a `sdy.reshard` of `input` to `block`.
    pub fn reshard(&mut self, block: BlockId, input: ValueId, sharding: TensorSharding) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::Reshard { sharding })
    }

    /// Appends a `sdy.sharding_group` that adds `input` to the group `group_id`.
    pub fn sharding_group(&mut self, block: BlockId, input: ValueId, group_id: i64) -> Result<OperationId, Diagnostic> {
        let kind = OperationKind::ShardingGroup { group_id };
        self.insert_operation(block, None, kind, vec![input], Vec::new(), Vec::new())
    }

    /// Appends a `sdy.all_gather` of `input` to `block`.
    pub fn all_gather(
        &mut self,
        block: BlockId,
        input: ValueId,
        gathering_axes: Vec<Vec<AxisRef>>,
        out_sharding: TensorSharding,
    ) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::AllGather(AllGather { gathering_axes, out_sharding }))
    }

    /// Appends a `sdy.all_slice` of `input` to `block`.
    pub fn all_slice(
        &mut self,
        block: BlockId,
        input: ValueId,
        slicing_axes: Vec<Vec<AxisRef>>,
        out_sharding: TensorSharding,
    ) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::AllSlice(AllSlice { slicing_axes, out_sharding }))
    }

    /// Appends a `sdy.all_to_all` of `input` to `block`.
    pub fn all_to_all(
        &mut self,
        block: BlockId,
        input: ValueId,
        params: Vec<AllToAllParam>,
        out_sharding: TensorSharding,
    ) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::AllToAll(AllToAll { params, out_sharding }))
    }

    /// Appends a `sdy.collective_permute` of `input` to `block`.
    pub fn collective_permute(
        &mut self,
        block: BlockId,
        input: ValueId,
        out_sharding: TensorSharding,
    ) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::CollectivePermute(CollectivePermute { out_sharding }))
    }

    /// Appends a `sdy.all_reduce` of `input` to `block`.
    pub fn all_reduce(
        &mut self,
        block: BlockId,
        input: ValueId,
        reduction_axes: Vec<AxisRef>,
        out_sharding: TensorSharding,
    ) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::AllReduce(AllReduce { reduction_axes, out_sharding }))
    }

    /// Appends a `sdy.reduce_scatter` of `input` to `block`.
    pub fn reduce_scatter(
        &mut self,
        block: BlockId,
        input: ValueId,
        reduce_scatter_axes: Vec<Vec<AxisRef>>,
        out_sharding: TensorSharding,
    ) -> Result<ValueId, Diagnostic> {
        let kind = OperationKind::ReduceScatter(ReduceScatter { reduce_scatter_axes, out_sharding });
        self.insert_unary(block, input, kind)
    }

    /// Appends a `sdy.data_flow_edge` of the edge owner `input` to `block`. Note that the edge must become the only
    /// user of `input` (see [`Module::verify`]).
    pub fn data_flow_edge(
        &mut self,
        block: BlockId,
        input: ValueId,
        sharding: Option<TensorSharding>,
    ) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::DataFlowEdge { sharding })
    }

    /// Appends a `sdy.propagation_barrier` of `input` to `block`.
    pub fn propagation_barrier(
        &mut self,
        block: BlockId,
        input: ValueId,
        allowed_direction: AllowedDirection,
    ) -> Result<ValueId, Diagnostic> {
        self.insert_unary(block, input, OperationKind::PropagationBarrier { allowed_direction })
    }

    /// Appends a `sdy.constant` with the provided (verbatim) `value` and type to `block`.
    pub fn constant<V: Into<String>>(
        &mut self,
        block: BlockId,
        value: V,
        r#type: TensorType,
    ) -> Result<ValueId, Diagnostic> {
        let kind = OperationKind::Constant { value: value.into() };
        let operation = self.insert_operation(block, None, kind, Vec::new(), vec![r#type], Vec::new())?;
        Ok(self.operations[operation.0].results[0])
    }

    /// Appends an operation from another dialect to `block`.
    pub fn generic(
        &mut self,
        block: BlockId,
        operation: GenericOperation,
        operands: &[ValueId],
        result_types: &[TensorType],
        regions: &[BlockId],
    ) -> Result<OperationId, Diagnostic> {
        self.insert_operation(
            block,
            None,
            OperationKind::Generic(operation),
            operands.to_vec(),
            result_types.to_vec(),
            regions.to_vec(),
        )
    }

    /// Appends the terminator of `block` (a region or the entry body) returning `values`.
    pub fn r#return(&mut self, block: BlockId, values: &[ValueId]) -> Result<OperationId, Diagnostic> {
        self.insert_operation(block, None, OperationKind::Return, values.to_vec(), Vec::new(), Vec::new())
    }

    /// Appends a `sdy.manual_computation` to `block` with `body` as its region. `result_types` are the global types
    /// of the results.
    pub fn manual_computation(
        &mut self,
        block: BlockId,
        operands: &[ValueId],
        body: BlockId,
        in_shardings: TensorShardingPerValue,
        out_shardings: TensorShardingPerValue,
        manual_axes: Vec<String>,
        result_types: &[TensorType],
    ) -> Result<OperationId, Diagnostic> {
        let kind = OperationKind::ManualComputation(ManualComputation { in_shardings, out_shardings, manual_axes });
        self.insert_operation(block, None, kind, operands.to_vec(), result_types.to_vec(), vec![body])
    }

    /// Appends a `sdy.named_computation` to `block` with `body` as its region. The result types are the types of the
    /// values returned by `body`.
    pub fn named_computation<N: Into<String>>(
        &mut self,
        block: BlockId,
        name: N,
        operands: &[ValueId],
        body: BlockId,
        in_shardings: Option<TensorShardingPerValue>,
        out_shardings: Option<TensorShardingPerValue>,
    ) -> Result<OperationId, Diagnostic> {
        let result_types = self
            .terminator(body)
            .map(|terminator| {
                let operands = &self.operations[terminator.0].operands;
                operands.iter().map(|value| self.values[value.0].r#type.clone()).collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let kind = OperationKind::NamedComputation(NamedComputation { name: name.into(), in_shardings, out_shardings });
        self.insert_operation(block, None, kind, operands.to_vec(), result_types, vec![body])
    }

    /// Returns the current sharding of `value`, if it has one.
    ///
    /// The sharding is looked up in the following order: (i) the data-flow edge that `value` is an owner or a target
    /// of, (ii) the operation that defines `value` when the sharding is intrinsic to it (e.g., the `out_sharding` of
    /// a collective or the local view of the `in_shardings` of a manual computation for its block arguments), and
    /// (iii) the sharding attached to `value` itself.
    pub fn sharding(&self, value: ValueId) -> Option<TensorSharding> {
        if let Some(edge) = self.data_flow_edge_for_target(value) {
            if let OperationKind::DataFlowEdge { sharding } = &self.operations[edge.0].kind {
                return sharding.clone();
            }
        }
        let stored = || self.values[value.0].sharding.clone();
        match self.values[value.0].definition {
            ValueDefinition::OperationResult { operation, index } => match &self.operations[operation.0].kind {
                OperationKind::ShardingConstraint { sharding } | OperationKind::Reshard { sharding } => {
                    Some(sharding.clone())
                }
                OperationKind::DataFlowEdge { sharding } => sharding.clone(),
                OperationKind::ManualComputation(computation) => computation.out_shardings.get(index).cloned(),
                OperationKind::NamedComputation(computation) => {
                    computation.out_shardings.as_ref().and_then(|shardings| shardings.get(index)).cloned()
                }
                kind => match kind.as_collective() {
                    Some(collective) => Some(collective.out_sharding().clone()),
                    None => stored(),
                },
            },
            ValueDefinition::BlockArgument { block, index } => {
                match self.blocks[block.0].parent.map(|parent| &self.operations[parent.0].kind) {
                    Some(OperationKind::ManualComputation(computation)) => computation
                        .in_shardings
                        .get(index)
                        .map(|sharding| local_sharding(sharding, computation.manual_axes.as_slice())),
                    Some(OperationKind::NamedComputation(computation)) => {
                        computation.in_shardings.as_ref().and_then(|shardings| shardings.get(index)).cloned()
                    }
                    _ => stored(),
                }
            }
        }
    }

    /// Returns `true` if [`Module::set_sharding`] can replace the sharding of `value`.
    pub fn is_sharding_settable(&self, value: ValueId) -> bool {
        if self.data_flow_edge_for_target(value).is_some() {
            return true;
        }
        match self.values[value.0].definition {
            ValueDefinition::OperationResult { operation, .. } => {
                let kind = &self.operations[operation.0].kind;
                kind.stores_result_shardings()
                    || matches!(kind, OperationKind::DataFlowEdge { .. } | OperationKind::NamedComputation(_))
            }
            ValueDefinition::BlockArgument { block, .. } => !matches!(
                self.blocks[block.0].parent.map(|parent| &self.operations[parent.0].kind),
                Some(OperationKind::ManualComputation(_)),
            ),
        }
    }

    /// Replaces the sharding of `value` with `sharding`, after validating it against the type of `value`.
    ///
    /// Shardings that are intrinsic to an operation (e.g., the sharding of a `sdy.reshard` result or of a collective)
    /// cannot be replaced and result in a [`ShardyError::ShardingNotSettable`] error.
    pub fn set_sharding(&mut self, value: ValueId, sharding: TensorSharding) -> Result<(), Diagnostic> {
        sharding
            .validate(self.values[value.0].r#type.shape(), &self.meshes)
            .map_err(|error| self.value_diagnostic(value, error))?;
        if let Some(edge) = self.data_flow_edge_for_target(value) {
            self.operations[edge.0].kind = OperationKind::DataFlowEdge { sharding: Some(sharding) };
            return Ok(());
        }
        let not_settable = |module: &Self| {
            module.value_diagnostic(value, ShardyError::ShardingNotSettable { value: value.to_string() })
        };
        match self.values[value.0].definition {
            ValueDefinition::OperationResult { operation, index } => {
                let ranks = self.operations[operation.0]
                    .results
                    .iter()
                    .map(|result| self.values[result.0].r#type.rank())
                    .collect::<Vec<_>>();
                if self.operations[operation.0].kind.stores_result_shardings() {
                    self.values[value.0].sharding = Some(sharding);
                    return Ok(());
                }
                match &mut self.operations[operation.0].kind {
                    OperationKind::DataFlowEdge { sharding: edge_sharding } => *edge_sharding = Some(sharding),
                    OperationKind::NamedComputation(computation) => {
                        set_sharding_per_value(&mut computation.out_shardings, index, sharding, ranks.as_slice())
                    }
                    _ => return Err(not_settable(self)),
                }
            }
            ValueDefinition::BlockArgument { block, index } => {
                let ranks = self.blocks[block.0]
                    .arguments
                    .iter()
                    .map(|argument| self.values[argument.0].r#type.rank())
                    .collect::<Vec<_>>();
                let Some(parent) = self.blocks[block.0].parent else {
                    self.values[value.0].sharding = Some(sharding);
                    return Ok(());
                };
                match &mut self.operations[parent.0].kind {
                    OperationKind::ManualComputation(_) => return Err(not_settable(self)),
                    OperationKind::NamedComputation(computation) => {
                        set_sharding_per_value(&mut computation.in_shardings, index, sharding, ranks.as_slice())
                    }
                    _ => self.values[value.0].sharding = Some(sharding),
                }
            }
        }
        Ok(())
    }

    /// Returns a [`Diagnostic`] for `error` attached to the operation that defines `value` (or to the module for block
    /// arguments).
    pub(crate) fn value_diagnostic(&self, value: ValueId, error: ShardyError) -> Diagnostic {
        match self.values.get(value.0).map(|data| data.definition) {
            Some(ValueDefinition::OperationResult { operation, .. }) => {
                Diagnostic::operation(operation, self.operations[operation.0].mnemonic(), error)
            }
            _ => Diagnostic::module(error),
        }
    }

    /// Returns a [`Diagnostic`] for `error` attached to `operation`.
    pub(crate) fn operation_diagnostic(&self, operation: OperationId, error: ShardyError) -> Diagnostic {
        Diagnostic::operation(operation, self.operations[operation.0].mnemonic(), error)
    }
}

fn set_sharding_per_value(
    shardings: &mut Option<TensorShardingPerValue>,
    index: usize,
    sharding: TensorSharding,
    ranks: &[usize],
) {
    let current = shardings
        .take()
        .unwrap_or_else(|| TensorShardingPerValue::fully_open(sharding.mesh().clone(), ranks));
    *shardings = Some(current.replacing(index, sharding));
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::errors::ErrorKind;
    use crate::mesh::MeshAxis;
    use crate::sharding::DimensionSharding;
    use crate::types::ElementType;

    use super::*;

    fn test_module() -> Module {
        let mut module = Module::new("main");
        let mesh = Mesh::new(vec![MeshAxis::new("a", 2).unwrap(), MeshAxis::new("b", 2).unwrap()]).unwrap();
        module.declare_mesh("mesh", mesh).unwrap();
        module
    }

    fn tensor_8x8() -> TensorType {
        TensorType::new([8, 8], ElementType::F32)
    }

    #[test]
    fn test_module_construction_and_uses() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"]), DimensionSharding::open(["b"])]);
        let constrained = module.sharding_constraint(body, input, sharding.clone()).unwrap();
        let add = module
            .generic(body, GenericOperation::elementwise("stablehlo.add"), &[constrained, input], &[tensor_8x8()], &[])
            .unwrap();
        let sum = module.operation(add).result(0).unwrap();
        module.r#return(body, &[sum]).unwrap();

        assert_eq!(module.block_arguments(body), &[input]);
        assert_eq!(module.block_operations(body).len(), 3);
        assert_eq!(module.sharding(constrained), Some(sharding));
        assert_eq!(module.sharding(input), None);
        assert_eq!(module.uses(input).len(), 2);
        assert_eq!(module.uses(constrained), vec![(add, 0)]);
        assert!(module.terminator(body).is_some());
        assert!(module.verify().is_ok());

        module.replace_all_uses_with(constrained, input);
        assert!(!module.has_uses(constrained));
        let constraint = module.defining_operation(constrained).unwrap();
        module.erase_operation(constraint);
        assert!(module.operation(constraint).is_erased());
        assert_eq!(module.block_operations(body).len(), 2);
        assert_eq!(module.uses(input).len(), 2);
    }

    #[test]
    fn test_use_tracking_across_mutations() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();
        let other = module.add_argument(tensor_8x8(), None).unwrap();
        let invalid = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"])]);
        assert!(module.reshard(body, input, invalid).is_err());
        assert!(!module.has_uses(input));

        let region = module.region(&[tensor_8x8()]);
        let argument = module.block_arguments(region)[0];
        let abs = module
            .generic(region, GenericOperation::elementwise("stablehlo.abs"), &[argument], &[tensor_8x8()], &[])
            .unwrap();
        let absolute = module.operation(abs).result(0).unwrap();
        module.r#return(region, &[absolute]).unwrap();
        assert!(module.uses(argument).is_empty());

        let while_op = module
            .generic(body, GenericOperation::new("stablehlo.while"), &[input], &[tensor_8x8()], &[region])
            .unwrap();
        assert_eq!(module.uses(argument), vec![(abs, 0)]);
        assert_eq!(module.uses(input), vec![(while_op, 0)]);

        module.set_operand(while_op, 0, other);
        assert!(!module.has_uses(input));
        assert_eq!(module.uses(other), vec![(while_op, 0)]);

        module.replace_all_uses_with(other, input);
        assert!(!module.has_uses(other));
        assert_eq!(module.uses(input), vec![(while_op, 0)]);

        module.erase_operation(while_op);
        assert!(!module.has_uses(input));
        assert!(!module.has_uses(argument));
        assert!(module.operation(abs).is_erased());
    }

    #[test]
    fn test_failed_construction_is_rolled_back() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(TensorType::new([3], ElementType::F32), None).unwrap();
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"])]);
        let error = module.reshard(body, input, sharding).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Divisibility);
        assert!(module.block_operations(body).is_empty());
        assert_eq!(module.values.len(), 1);

        let sharding = TensorSharding::new("missing", vec![DimensionSharding::replicated()]);
        let error = module.add_argument(TensorType::new([4], ElementType::F32), Some(sharding)).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::SymbolResolution);
    }

    #[test]
    fn test_sharding_settability() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"]), DimensionSharding::replicated()]);
        let resharded = module.reshard(body, input, sharding.clone()).unwrap();
        assert!(module.is_sharding_settable(input));
        assert!(!module.is_sharding_settable(resharded));
        module.set_sharding(input, sharding.clone()).unwrap();
        assert_eq!(module.sharding(input), Some(sharding.clone()));
        let error = module.set_sharding(resharded, sharding).unwrap_err();
        assert!(matches!(error.error, ShardyError::ShardingNotSettable { .. }));
        let invalid = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"])]);
        assert_eq!(module.set_sharding(input, invalid).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_declare_mesh_errors() {
        let mut module = test_module();
        let other = Mesh::new(vec![MeshAxis::new("x", 8).unwrap()]).unwrap();
        let error = module.declare_mesh("other", other).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MeshConsistency);
        assert_eq!(
            error.to_string(),
            "'sdy.mesh' @other: mesh '@other' has 8 device(s), but mesh '@mesh' has 4 device(s)",
        );
        assert!(module.declare_mesh("maximal", Mesh::maximal(3)).is_ok());
    }
}
