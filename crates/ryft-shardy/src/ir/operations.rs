use std::fmt::Display;

use crate::collectives::{AllGather, AllReduce, AllSlice, AllToAll, CollectiveOp, CollectivePermute, ReduceScatter};
use crate::sharding::{TensorSharding, TensorShardingPerValue};

use super::{BlockId, ValueId};

/// Name of the attribute that is used to store the sharding of values that are not defined by an `sdy` operation
/// (e.g., function arguments and results of operations from other dialects).
pub const SHARDING_ATTRIBUTE: &str = "sdy.sharding";

/// Name of the attribute that is used to store [`PropagationBarrier`](OperationKind::PropagationBarrier) directions.
pub const ALLOWED_DIRECTION_ATTRIBUTE: &str = "allowed_direction";

/// Name of the attribute that is used to store [`ShardingGroup`](OperationKind::ShardingGroup) ids.
pub const GROUP_ID_ATTRIBUTE: &str = "group_id";

/// Direction in which sharding information may cross a propagation barrier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AllowedDirection {
    /// Shardings may only flow from the input to the result.
    Forward,

    /// Shardings may only flow from the result to the input.
    Backward,

    /// Shardings may not cross the barrier at all.
    None,

    /// Shardings may flow in both directions. This is rejected by the verifier, since such a barrier is a no-op.
    Both,
}

impl AllowedDirection {
    /// Returns `true` if shardings may flow from the input to the result.
    pub fn allows_forward(&self) -> bool {
        matches!(self, Self::Forward | Self::Both)
    }

    /// Returns `true` if shardings may flow from the result to the input.
    pub fn allows_backward(&self) -> bool {
        matches!(self, Self::Backward | Self::Both)
    }
}

impl Display for AllowedDirection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(formatter, "FORWARD"),
            Self::Backward => write!(formatter, "BACKWARD"),
            Self::None => write!(formatter, "NONE"),
            Self::Both => write!(formatter, "BOTH"),
        }
    }
}

/// Attributes of a `sdy.manual_computation`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManualComputation {
    /// Global shardings of the operands.
    pub in_shardings: TensorShardingPerValue,

    /// Global shardings of the results.
    pub out_shardings: TensorShardingPerValue,

    /// Names of the mesh axes over which the body is written manually, in mesh order.
    pub manual_axes: Vec<String>,
}

/// Attributes of a `sdy.named_computation`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamedComputation {
    /// Name of the computation (e.g., the name of the function that was inlined).
    pub name: String,

    /// Shardings of the block arguments. These also store the shardings that propagation assigns to them.
    pub in_shardings: Option<TensorShardingPerValue>,

    /// Shardings of the results. These also store the shardings that propagation assigns to them.
    pub out_shardings: Option<TensorShardingPerValue>,
}

/// Opaque operation from another dialect (e.g., `stablehlo.add` or `stablehlo.while`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GenericOperation {
    /// Fully-qualified operation name (e.g., `stablehlo.add`).
    pub name: String,

    /// If `true`, every result is computed element-wise from same-shaped operands, which means that shardings can
    /// propagate between all of its operands and results unchanged.
    pub elementwise: bool,
}

impl GenericOperation {
    /// Creates a new [`GenericOperation`] without any known propagation rule.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self { name: name.into(), elementwise: false }
    }

    /// Creates a new element-wise [`GenericOperation`].
    pub fn elementwise<N: Into<String>>(name: N) -> Self {
        Self { name: name.into(), elementwise: true }
    }

    /// Returns the dialect prefix of the operation name (e.g., `stablehlo` for `stablehlo.while`).
    pub fn dialect(&self) -> &str {
        self.name.split_once('.').map(|(dialect, _)| dialect).unwrap_or(self.name.as_str())
    }
}

/// Closed set of operation kinds that a [`Module`](super::Module) can contain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `sdy.sharding_constraint`: marks the desired sharding of a value.
    ShardingConstraint { sharding: TensorSharding },

    /// `sdy.reshard`: explicit change of sharding.
    Reshard { sharding: TensorSharding },

    /// `sdy.sharding_group`: adds its input to the sharding group `group_id`.
    ShardingGroup { group_id: i64 },

    /// `sdy.all_gather`.
    AllGather(AllGather),

    /// `sdy.all_slice`.
    AllSlice(AllSlice),

    /// `sdy.all_to_all`.
    AllToAll(AllToAll),

    /// `sdy.collective_permute`.
    CollectivePermute(CollectivePermute),

    /// `sdy.all_reduce`.
    AllReduce(AllReduce),

    /// `sdy.reduce_scatter`.
    ReduceScatter(ReduceScatter),

    /// `sdy.data_flow_edge`: attached to the edge owner of a structural operation from another dialect.
    DataFlowEdge { sharding: Option<TensorSharding> },

    /// `sdy.manual_computation`.
    ManualComputation(ManualComputation),

    /// `sdy.named_computation`.
    NamedComputation(NamedComputation),

    /// `sdy.constant`: `value` is kept verbatim (e.g., `dense<1.000000e+00>`).
    Constant { value: String },

    /// `sdy.propagation_barrier`.
    PropagationBarrier { allowed_direction: AllowedDirection },

    /// Region terminator (`sdy.return` inside `sdy` region operations and `return` for the entry body).
    Return,

    /// Operation from another dialect.
    Generic(GenericOperation),
}

impl OperationKind {
    /// Returns the mnemonic of this operation kind (e.g., `sdy.all_gather`).
    pub fn mnemonic(&self) -> &str {
        match self {
            Self::ShardingConstraint { .. } => "sdy.sharding_constraint",
            Self::Reshard { .. } => "sdy.reshard",
            Self::ShardingGroup { .. } => "sdy.sharding_group",
            Self::AllGather(operation) => operation.mnemonic(),
            Self::AllSlice(operation) => operation.mnemonic(),
            Self::AllToAll(operation) => operation.mnemonic(),
            Self::CollectivePermute(operation) => operation.mnemonic(),
            Self::AllReduce(operation) => operation.mnemonic(),
            Self::ReduceScatter(operation) => operation.mnemonic(),
            Self::DataFlowEdge { .. } => "sdy.data_flow_edge",
            Self::ManualComputation(_) => "sdy.manual_computation",
            Self::NamedComputation(_) => "sdy.named_computation",
            Self::Constant { .. } => "sdy.constant",
            Self::PropagationBarrier { .. } => "sdy.propagation_barrier",
            Self::Return => "sdy.return",
            Self::Generic(operation) => operation.name.as_str(),
        }
    }

    /// Returns this operation as a [`CollectiveOp`], if it is one.
    pub fn as_collective(&self) -> Option<&dyn CollectiveOp> {
        match self {
            Self::AllGather(operation) => Some(operation),
            Self::AllSlice(operation) => Some(operation),
            Self::AllToAll(operation) => Some(operation),
            Self::CollectivePermute(operation) => Some(operation),
            Self::AllReduce(operation) => Some(operation),
            Self::ReduceScatter(operation) => Some(operation),
            _ => None,
        }
    }

    /// Returns `true` if the results of this operation store their shardings in [`SHARDING_ATTRIBUTE`] (as opposed
    /// to the sharding being an intrinsic part of the operation).
    pub(crate) fn stores_result_shardings(&self) -> bool {
        matches!(self, Self::Generic(_) | Self::Constant { .. } | Self::PropagationBarrier { .. })
    }

    /// Returns `true` if the regions of this operation cannot refer to values defined outside of them.
    pub(crate) fn is_isolated_from_above(&self) -> bool {
        matches!(self, Self::ManualComputation(_) | Self::NamedComputation(_))
    }
}

/// Operation stored in a [`Module`](super::Module).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub(crate) kind: OperationKind,
    pub(crate) operands: Vec<ValueId>,
    pub(crate) results: Vec<ValueId>,
    pub(crate) regions: Vec<BlockId>,
    pub(crate) block: BlockId,
    pub(crate) erased: bool,
}

impl Operation {
    /// Returns the kind of this operation (along with its kind-specific attributes).
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// Returns the mnemonic of this operation.
    pub fn mnemonic(&self) -> &str {
        self.kind.mnemonic()
    }

    /// Returns the operands of this operation.
    pub fn operands(&self) -> &[ValueId] {
        self.operands.as_slice()
    }

    /// Returns the `index`-th operand of this operation, if it exists.
    pub fn operand(&self, index: usize) -> Option<ValueId> {
        self.operands.get(index).copied()
    }

    /// Returns the results of this operation.
    pub fn results(&self) -> &[ValueId] {
        self.results.as_slice()
    }

    /// Returns the `index`-th result of this operation, if it exists.
    pub fn result(&self, index: usize) -> Option<ValueId> {
        self.results.get(index).copied()
    }

    /// Returns the (single-block) regions of this operation.
    pub fn regions(&self) -> &[BlockId] {
        self.regions.as_slice()
    }

    /// Returns the block that contains this operation.
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Returns `true` if this operation has been erased from its [`Module`](super::Module).
    pub fn is_erased(&self) -> bool {
        self.erased
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_allowed_direction() {
        assert!(AllowedDirection::Forward.allows_forward());
        assert!(!AllowedDirection::Forward.allows_backward());
        assert!(AllowedDirection::Backward.allows_backward());
        assert!(!AllowedDirection::None.allows_forward());
        assert_eq!(AllowedDirection::Backward.to_string(), "BACKWARD");
        assert_eq!(AllowedDirection::None.to_string(), "NONE");
    }

    #[test]
    fn test_operation_kind_mnemonics() {
        let sharding = TensorSharding::fully_replicated("mesh", 1);
        let all_reduce = OperationKind::AllReduce(AllReduce { reduction_axes: Vec::new(), out_sharding: sharding });
        assert_eq!(all_reduce.mnemonic(), "sdy.all_reduce");
        assert!(all_reduce.as_collective().is_some());
        assert_eq!(OperationKind::ShardingGroup { group_id: 0 }.mnemonic(), "sdy.sharding_group");
        let while_op = OperationKind::Generic(GenericOperation::new("stablehlo.while"));
        assert_eq!(while_op.mnemonic(), "stablehlo.while");
        assert!(while_op.as_collective().is_none());
        assert_eq!(GenericOperation::new("stablehlo.while").dialect(), "stablehlo");
        assert_eq!(GenericOperation::new("custom").dialect(), "custom");
    }
}
