use std::fmt::Display;

use thiserror::Error;

use crate::ir::OperationId;

/// Coarse classification of [`ShardyError`]s. Every concrete error belongs to exactly one of these kinds, which is
/// useful for callers that only care about _why_ a piece of IR was rejected and not about the precise details.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// Meshes declared in the same module disagree with each other, or a single mesh is malformed.
    MeshConsistency,

    /// An axis or sub-axis is assigned more than once, or an axis reference is malformed.
    AxisOverlap,

    /// An axis-size product does not divide a dimension, or a manual axis would require padding.
    Divisibility,

    /// Ranks, types, or arities do not line up.
    ShapeMismatch,

    /// A collective declares an `out_sharding` that its transform does not produce.
    OutShardingMismatch,

    /// A canonical ordering or uniqueness requirement is violated.
    Ordering,

    /// A mesh or an axis name cannot be resolved.
    SymbolResolution,

    /// An operation is used in a structurally invalid way (e.g., wrong kind of owner or a meaningless attribute).
    InvalidOperation,

    /// Sharding propagation could not reach a consistent fixpoint.
    Propagation,
}

/// Error type for mesh declarations, sharding validation, collective verification, and the passes that operate on a
/// [`Module`](crate::ir::Module).
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardyError {
    #[error("mesh axis names must be non-empty")]
    EmptyMeshAxisName,

    #[error("mesh axis '{axis_name}' must have size > 0 and must keep the mesh device count within usize")]
    InvalidMeshAxisSize { axis_name: String },

    #[error("mesh axis '{axis_name}' appears more than once")]
    DuplicateMeshAxisName { axis_name: String },

    #[error("mesh has {actual_count} device id(s), but axis sizes imply {expected_count} device(s)")]
    MeshDeviceIdCountMismatch { expected_count: usize, actual_count: usize },

    #[error("mesh device id {device_id} appears more than once")]
    DuplicateMeshDeviceId { device_id: usize },

    #[error("mesh device id {device_id} is out of range for a mesh with {device_count} device(s)")]
    MeshDeviceIdOutOfRange { device_id: usize, device_count: usize },

    #[error("mesh device ids must not be the identity ordering; omit them instead")]
    IotaMeshDeviceIds,

    #[error("mesh symbol names must be non-empty and must not contain whitespace: '{mesh_name}'")]
    InvalidMeshSymbolName { mesh_name: String },

    #[error("mesh '@{mesh_name}' is declared more than once")]
    DuplicateMeshSymbol { mesh_name: String },

    #[error(
        "mesh '@{mesh_name}' has {device_count} device(s), \
         but mesh '@{other_mesh_name}' has {other_device_count} device(s)"
    )]
    MeshDeviceCountConflict {
        mesh_name: String,
        device_count: usize,
        other_mesh_name: String,
        other_device_count: usize,
    },

    #[error("shardings refer to incompatible meshes {lhs} and {rhs}")]
    IncompatibleMeshes { lhs: String, rhs: String },

    #[error("unknown mesh '@{mesh_name}'")]
    UnknownMesh { mesh_name: String },

    #[error("unknown axis '{axis_name}' in mesh {mesh}")]
    UnknownMeshAxis { axis_name: String, mesh: String },

    #[error("manual axes {axes} need at least one in or out sharding to resolve their mesh")]
    ManualAxesWithoutMesh { axes: String },

    #[error("invalid sub-axis {axis}: {reason}")]
    InvalidSubAxis { axis: String, reason: String },

    #[error("axis {axis} overlaps with axis {other_axis}, which is already in use")]
    OverlappingAxes { axis: String, other_axis: String },

    #[error("axis {axis} is already assigned and cannot be used to slice dimension #{dimension}")]
    AxisAlreadyInUse { axis: String, dimension: usize },

    #[error(
        "dimension #{dimension} of size {dimension_size} is not divisible by the product of its axis sizes \
         ({sharded_size})"
    )]
    IndivisibleDimension { dimension: usize, dimension_size: usize, sharded_size: usize },

    #[error(
        "dimension #{dimension} of size {dimension_size} is not divisible by the product of its manual axis sizes \
         ({manual_size}); manual axes must not require padding"
    )]
    ManualAxisPadding { dimension: usize, dimension_size: usize, manual_size: usize },

    #[error("sharding has rank {sharding_rank}, but the tensor has rank {tensor_rank}")]
    RankMismatch { sharding_rank: usize, tensor_rank: usize },

    #[error("expected {what} of type `{expected}`, but got `{actual}`")]
    TypeMismatch { what: String, expected: String, actual: String },

    #[error("expected {expected} {what}, but got {actual}")]
    ArityMismatch { what: String, expected: usize, actual: usize },

    #[error("the operand has no sharding and this operation requires one")]
    MissingOperandSharding,

    #[error("out_sharding {actual} does not match the sharding {expected} computed from the operand sharding")]
    OutShardingMismatch { expected: String, actual: String },

    #[error("operand sharding and out_sharding have different dimension shardings: {operand} vs {out}")]
    DimensionShardingMismatch { operand: String, out: String },

    #[error(
        "dimension #{dimension} is sharded by {operand_size} device(s) in the operand, \
         but by {out_size} device(s) in the out_sharding"
    )]
    ShardedSizeMismatch { dimension: usize, operand_size: usize, out_size: usize },

    #[error("axis {axis} is not a reduction axis candidate: it is already used in the {location}")]
    ReductionAxisInUse { axis: String, location: String },

    #[error("axes {axes} are not a suffix of the axes {dimension_axes} of dimension #{dimension}")]
    AxesNotSuffix { axes: String, dimension_axes: String, dimension: usize },

    #[error("all_to_all requires at least one parameter")]
    EmptyAllToAllParams,

    #[error("all_to_all parameter axes must be non-empty (source dimension #{dimension})")]
    EmptyAllToAllAxes { dimension: usize },

    #[error("dimension #{dimension} is used more than once across all_to_all parameters")]
    AllToAllDimensionReused { dimension: usize },

    #[error("all_to_all source dimensions must be strictly ascending, but #{current} follows #{previous}")]
    AllToAllSourceDimensionsNotAscending { previous: usize, current: usize },

    #[error("all_to_all source and target dimensions must differ (dimension #{dimension})")]
    AllToAllSameDimension { dimension: usize },

    #[error("dimension #{dimension} is out of range for rank {rank}")]
    DimensionOutOfRange { dimension: usize, rank: usize },

    #[error("axes {axes} are not sorted in mesh order or contain duplicates")]
    UnsortedAxes { axes: String },

    #[error("sub-axes {axis} and {other_axis} are adjacent and must be merged")]
    UnmergedSubAxes { axis: String, other_axis: String },

    #[error("manual axis {axis} follows free axis {free_axis} in dimension #{dimension}")]
    ManualAxisAfterFreeAxis { axis: String, free_axis: String, dimension: usize },

    #[error("manual axis {axis} is split into a sub-axis, which is not supported")]
    ManualSubAxis { axis: String },

    #[error("propagation_barrier with allowed_direction=BOTH is meaningless; remove the barrier instead")]
    BothDirectionBarrier,

    #[error("data_flow_edge input must be a result of a structural operation from another dialect, got {owner}")]
    InvalidDataFlowEdgeOwner { owner: String },

    #[error("edge owner {owner} must have exactly one user, which is its data_flow_edge")]
    DataFlowEdgeOwnerHasOtherUsers { owner: String },

    #[error("value {value} does not belong to this module")]
    UnknownValue { value: String },

    #[error("operation {operation} does not belong to this module or has been erased")]
    UnknownOperation { operation: String },

    #[error("the sharding of {value} is fixed by its defining operation and cannot be replaced")]
    ShardingNotSettable { value: String },

    #[error("region block #{block} is already attached to another operation")]
    RegionAlreadyAttached { block: usize },

    #[error("region terminator must be an `sdy.return` (or `return` for the entry body)")]
    MissingTerminator,

    #[error("value {value} is defined after its use or outside of the enclosing region")]
    ValueNotInScope { value: String },

    #[error("sharding group {group_id} contains values with different shardings: {sharding} and {other_sharding}")]
    ShardingGroupConflict { group_id: i64, sharding: String, other_sharding: String },

    #[error("sharding group {group_id} crosses a manual_computation boundary")]
    ShardingGroupCrossesManualComputation { group_id: i64 },

    #[error("propagation did not converge within {max_iterations} iteration(s)")]
    PropagationDidNotConverge { max_iterations: usize },

    #[error("sharding_constraint operations are not allowed after propagation")]
    UnexpectedShardingConstraint,
}

impl ShardyError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyMeshAxisName
            | Self::InvalidMeshAxisSize { .. }
            | Self::DuplicateMeshAxisName { .. }
            | Self::MeshDeviceIdCountMismatch { .. }
            | Self::DuplicateMeshDeviceId { .. }
            | Self::MeshDeviceIdOutOfRange { .. }
            | Self::IotaMeshDeviceIds
            | Self::InvalidMeshSymbolName { .. }
            | Self::DuplicateMeshSymbol { .. }
            | Self::MeshDeviceCountConflict { .. }
            | Self::IncompatibleMeshes { .. } => ErrorKind::MeshConsistency,
            Self::UnknownMesh { .. } | Self::UnknownMeshAxis { .. } | Self::ManualAxesWithoutMesh { .. } => {
                ErrorKind::SymbolResolution
            }
            Self::InvalidSubAxis { .. }
            | Self::OverlappingAxes { .. }
            | Self::AxisAlreadyInUse { .. }
            | Self::ReductionAxisInUse { .. }
            | Self::ManualSubAxis { .. } => ErrorKind::AxisOverlap,
            Self::IndivisibleDimension { .. } | Self::ManualAxisPadding { .. } => ErrorKind::Divisibility,
            Self::RankMismatch { .. } | Self::TypeMismatch { .. } | Self::ArityMismatch { .. } => {
                ErrorKind::ShapeMismatch
            }
            Self::MissingOperandSharding
            | Self::OutShardingMismatch { .. }
            | Self::DimensionShardingMismatch { .. }
            | Self::ShardedSizeMismatch { .. } => ErrorKind::OutShardingMismatch,
            Self::AxesNotSuffix { .. }
            | Self::EmptyAllToAllParams
            | Self::EmptyAllToAllAxes { .. }
            | Self::AllToAllDimensionReused { .. }
            | Self::AllToAllSourceDimensionsNotAscending { .. }
            | Self::AllToAllSameDimension { .. }
            | Self::DimensionOutOfRange { .. }
            | Self::UnsortedAxes { .. }
            | Self::UnmergedSubAxes { .. }
            | Self::ManualAxisAfterFreeAxis { .. } => ErrorKind::Ordering,
            Self::BothDirectionBarrier
            | Self::InvalidDataFlowEdgeOwner { .. }
            | Self::DataFlowEdgeOwnerHasOtherUsers { .. }
            | Self::UnknownValue { .. }
            | Self::UnknownOperation { .. }
            | Self::ShardingNotSettable { .. }
            | Self::RegionAlreadyAttached { .. }
            | Self::MissingTerminator
            | Self::ValueNotInScope { .. }
            | Self::UnexpectedShardingConstraint => ErrorKind::InvalidOperation,
            Self::ShardingGroupConflict { .. }
            | Self::ShardingGroupCrossesManualComputation { .. }
            | Self::PropagationDidNotConverge { .. } => ErrorKind::Propagation,
        }
    }
}

/// Location that a [`Diagnostic`] is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticLocation {
    /// The enclosing [`Module`](crate::ir::Module) as a whole.
    Module,

    /// A mesh declaration with the provided symbol name.
    Mesh(String),

    /// A specific operation, identified by its [`OperationId`] and its mnemonic (e.g., `sdy.all_gather`).
    Operation { id: OperationId, mnemonic: String },
}

impl Display for DiagnosticLocation {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Module => write!(formatter, "module"),
            Self::Mesh(mesh_name) => write!(formatter, "'sdy.mesh' @{mesh_name}"),
            Self::Operation { id, mnemonic } => write!(formatter, "'{mnemonic}' op #{}", id.index()),
        }
    }
}

/// Verifier diagnostic: a [`ShardyError`] attached to the piece of IR that caused it. Diagnostics are never repaired
/// locally; the construction or pass that produced them fails outright.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
#[error("{location}: {error}")]
pub struct Diagnostic {
    pub location: DiagnosticLocation,
    #[source]
    pub error: ShardyError,
}

impl Diagnostic {
    /// Creates a new [`Diagnostic`] attached to the module as a whole.
    pub fn module(error: ShardyError) -> Self {
        Self { location: DiagnosticLocation::Module, error }
    }

    /// Creates a new [`Diagnostic`] attached to the mesh declaration named `mesh_name`.
    pub fn mesh<S: Into<String>>(mesh_name: S, error: ShardyError) -> Self {
        Self { location: DiagnosticLocation::Mesh(mesh_name.into()), error }
    }

    /// Creates a new [`Diagnostic`] attached to the operation with the provided id and mnemonic.
    pub fn operation<S: Into<String>>(id: OperationId, mnemonic: S, error: ShardyError) -> Self {
        Self { location: DiagnosticLocation::Operation { id, mnemonic: mnemonic.into() }, error }
    }

    /// Returns the [`ErrorKind`] of the underlying error.
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
