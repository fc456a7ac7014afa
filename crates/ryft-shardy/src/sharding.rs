//! Axis-based tensor sharding representation.
//!
//! A [`TensorSharding`] describes how a tensor of rank `R` is partitioned across a [`Mesh`]: it holds one
//! [`DimensionSharding`] per tensor dimension, listing the axes that shard that dimension from major to minor, plus a
//! set of axes along which the tensor is explicitly replicated. Axes not mentioned anywhere are implicitly replicated.
//!
//! | Rendering | Meaning |
//! |---|---|
//! | `<@mesh, [{"a"}, {}]>` | dimension 0 sharded along `"a"`, dimension 1 closed and replicated |
//! | `<@mesh, [{"a", ?}, {?}]>` | both dimensions open: propagation may append more axes |
//! | `<@mesh, [{"a"}p0, {}]>` | dimension 0 carries the user priority `0` |
//! | `<@mesh, [{"c":(1)2}, {}], replicated={"b"}>` | sub-axis sharding with `"b"` explicitly replicated |
//!
//! Shardings are immutable values compared by structural equality. Every sharding attached to a typed value must be
//! valid for that value's type (see [`TensorSharding::validate`]).

use std::fmt::Display;

use crate::axis::{AxisRef, axes_size, render_axis_list, validate_canonical_axis_set};
use crate::errors::ShardyError;
use crate::mesh::{Mesh, MeshReference, MeshRegistry};

/// Sharding of a single tensor dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DimensionSharding {
    axes: Vec<AxisRef>,
    is_closed: bool,
    priority: Option<usize>,
}

impl DimensionSharding {
    /// Creates a closed dimension sharding along `axes` (major to minor).
    pub fn closed<I: IntoIterator<Item = A>, A: Into<AxisRef>>(axes: I) -> Self {
        Self { axes: axes.into_iter().map(Into::into).collect(), is_closed: true, priority: None }
    }

    /// Creates an open dimension sharding along `axes`, which propagation may extend with further minor axes.
    pub fn open<I: IntoIterator<Item = A>, A: Into<AxisRef>>(axes: I) -> Self {
        Self { axes: axes.into_iter().map(Into::into).collect(), is_closed: false, priority: None }
    }

    /// Creates a closed, replicated dimension sharding (`{}`).
    pub fn replicated() -> Self {
        Self { axes: Vec::new(), is_closed: true, priority: None }
    }

    /// Creates an open, unsharded dimension sharding (`{?}`).
    pub fn unconstrained() -> Self {
        Self { axes: Vec::new(), is_closed: false, priority: None }
    }

    /// Returns a copy of this dimension sharding with the provided `priority`.
    pub fn with_priority(mut self, priority: usize) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Returns a copy of this dimension sharding with the provided `axes` (keeping openness and priority).
    pub fn with_axes(&self, axes: Vec<AxisRef>) -> Self {
        Self { axes, is_closed: self.is_closed, priority: self.priority }
    }

    /// Returns the axes that shard this dimension (major to minor).
    pub fn axes(&self) -> &[AxisRef] {
        self.axes.as_slice()
    }

    /// Returns `true` if this dimension is closed to further sharding.
    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Returns `true` if this dimension is open to further sharding.
    pub fn is_open(&self) -> bool {
        !self.is_closed
    }

    /// Returns the user priority of this dimension sharding, if any.
    pub fn priority(&self) -> Option<usize> {
        self.priority
    }

    /// Returns `true` if no axes shard this dimension.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Returns the number of shards along this dimension.
    pub fn sharded_size(&self, mesh: &Mesh) -> Result<usize, ShardyError> {
        axes_size(self.axes.as_slice(), mesh)
    }
}

impl Display for DimensionSharding {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{{")?;
        for (index, axis) in self.axes.iter().enumerate() {
            if index > 0 {
                write!(formatter, ", ")?;
            }
            write!(formatter, "{axis}")?;
        }
        if self.is_open() {
            if self.axes.is_empty() { write!(formatter, "?")? } else { write!(formatter, ", ?")? }
        }
        write!(formatter, "}}")?;
        if let Some(priority) = self.priority {
            write!(formatter, "p{priority}")?;
        }
        Ok(())
    }
}

/// Sharding of a whole tensor: a mesh reference, one [`DimensionSharding`] per dimension, and explicitly replicated
/// axes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TensorSharding {
    mesh: MeshReference,
    dimensions: Vec<DimensionSharding>,
    replicated_axes: Vec<AxisRef>,
}

impl TensorSharding {
    /// Creates a tensor sharding with no explicitly replicated axes.
    pub fn new<M: Into<MeshReference>>(mesh: M, dimensions: Vec<DimensionSharding>) -> Self {
        Self { mesh: mesh.into(), dimensions, replicated_axes: Vec::new() }
    }

    /// Creates a tensor sharding with explicitly replicated axes.
    pub fn with_replicated_axes<M: Into<MeshReference>>(
        mesh: M,
        dimensions: Vec<DimensionSharding>,
        replicated_axes: Vec<AxisRef>,
    ) -> Self {
        Self { mesh: mesh.into(), dimensions, replicated_axes }
    }

    /// Creates a fully replicated sharding whose dimensions are all closed (`[{}, {}, ...]`).
    pub fn fully_replicated<M: Into<MeshReference>>(mesh: M, rank: usize) -> Self {
        Self::new(mesh, vec![DimensionSharding::replicated(); rank])
    }

    /// Creates an unsharded sharding whose dimensions are all open (`[{?}, {?}, ...]`).
    pub fn fully_open<M: Into<MeshReference>>(mesh: M, rank: usize) -> Self {
        Self::new(mesh, vec![DimensionSharding::unconstrained(); rank])
    }

    /// Returns the mesh that this sharding refers to.
    pub fn mesh(&self) -> &MeshReference {
        &self.mesh
    }

    /// Returns the rank of this sharding.
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Returns the per-dimension shardings.
    pub fn dimensions(&self) -> &[DimensionSharding] {
        self.dimensions.as_slice()
    }

    /// Returns the sharding of `dimension`, if it exists.
    pub fn dimension(&self, dimension: usize) -> Option<&DimensionSharding> {
        self.dimensions.get(dimension)
    }

    /// Returns the explicitly replicated axes.
    pub fn replicated_axes(&self) -> &[AxisRef] {
        self.replicated_axes.as_slice()
    }

    /// Returns the per-dimension axis lists of this sharding.
    pub fn dimension_axes(&self) -> Vec<Vec<AxisRef>> {
        self.dimensions.iter().map(|dimension| dimension.axes.clone()).collect()
    }

    /// Returns an iterator over all axes used by the dimension shardings.
    pub fn sharding_axes(&self) -> impl Iterator<Item = &AxisRef> {
        self.dimensions.iter().flat_map(|dimension| dimension.axes.iter())
    }

    /// Returns `true` if no dimension is sharded along any axis.
    pub fn is_fully_replicated(&self) -> bool {
        self.dimensions.iter().all(DimensionSharding::is_empty)
    }

    /// Returns a copy of this sharding with the dimension shardings replaced by `dimensions`.
    pub fn with_dimensions(&self, dimensions: Vec<DimensionSharding>) -> Self {
        Self { mesh: self.mesh.clone(), dimensions, replicated_axes: self.replicated_axes.clone() }
    }

    /// Returns a copy of this sharding with the replicated axes replaced by `replicated_axes`.
    pub fn with_replicated(&self, replicated_axes: Vec<AxisRef>) -> Self {
        Self { mesh: self.mesh.clone(), dimensions: self.dimensions.clone(), replicated_axes }
    }

    /// Returns `true` if `self` and `other` shard every dimension along the same axes, ignoring openness, priorities,
    /// and explicitly replicated axes.
    pub fn has_equivalent_dimension_axes(&self, other: &Self) -> bool {
        self.dimensions.len() == other.dimensions.len()
            && self.dimensions.iter().zip(other.dimensions.iter()).all(|(lhs, rhs)| lhs.axes == rhs.axes)
    }

    /// Returns the number of shards along each dimension.
    pub fn sharded_sizes(&self, mesh: &Mesh) -> Result<Vec<usize>, ShardyError> {
        self.dimensions.iter().map(|dimension| dimension.sharded_size(mesh)).collect()
    }

    /// Validates this sharding against a tensor of shape `shape`, resolving its mesh in `meshes`.
    pub fn validate(&self, shape: &[usize], meshes: &MeshRegistry) -> Result<(), ShardyError> {
        let mesh = meshes.resolve(&self.mesh)?;
        self.validate_with_mesh(shape, mesh)
    }

    /// Validates this sharding against a tensor of shape `shape` and the already-resolved `mesh`:
    ///
    ///   - the number of dimension shardings must equal the tensor rank,
    ///   - every axis must exist in the mesh and every sub-axis must be well formed,
    ///   - no axis (or overlapping sub-axis) may be used twice across dimensions and the replicated set,
    ///   - no dimension may contain adjacent sub-axes that should have been merged,
    ///   - the replicated axes must be in canonical order,
    ///   - the product of axis sizes of each dimension must divide that dimension's size.
    pub fn validate_with_mesh(&self, shape: &[usize], mesh: &Mesh) -> Result<(), ShardyError> {
        if self.dimensions.len() != shape.len() {
            return Err(ShardyError::RankMismatch { sharding_rank: self.dimensions.len(), tensor_rank: shape.len() });
        }

        let mut used_axes: Vec<&AxisRef> = Vec::new();
        let mut use_axis = |axis: &'_ AxisRef, used_axes: &mut Vec<&'_ AxisRef>| -> Result<(), ShardyError> {
            axis.validate(mesh)?;
            if let Some(other_axis) = used_axes.iter().find(|other| other.overlaps(axis)) {
                return Err(ShardyError::OverlappingAxes { axis: axis.to_string(), other_axis: other_axis.to_string() });
            }
            Ok(())
        };

        for (dimension, (dimension_sharding, dimension_size)) in self.dimensions.iter().zip(shape.iter()).enumerate() {
            for axis in &dimension_sharding.axes {
                use_axis(axis, &mut used_axes)?;
                used_axes.push(axis);
            }
            for window in dimension_sharding.axes.windows(2) {
                if window[0].can_merge(&window[1], mesh) {
                    return Err(ShardyError::UnmergedSubAxes {
                        axis: window[0].to_string(),
                        other_axis: window[1].to_string(),
                    });
                }
            }
            let sharded_size = dimension_sharding.sharded_size(mesh)?;
            if *dimension_size % sharded_size != 0 {
                return Err(ShardyError::IndivisibleDimension {
                    dimension,
                    dimension_size: *dimension_size,
                    sharded_size,
                });
            }
        }

        for axis in &self.replicated_axes {
            use_axis(axis, &mut used_axes)?;
            used_axes.push(axis);
        }
        validate_canonical_axis_set(self.replicated_axes.as_slice(), mesh)
    }

    /// Returns the attribute form of this sharding, which renders as `#sdy.sharding<...>`.
    pub fn as_attribute(&self) -> TensorShardingAttribute<'_> {
        TensorShardingAttribute(self)
    }
}

impl Display for TensorSharding {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "<{}, [", self.mesh)?;
        for (index, dimension) in self.dimensions.iter().enumerate() {
            if index > 0 {
                write!(formatter, ", ")?;
            }
            write!(formatter, "{dimension}")?;
        }
        write!(formatter, "]")?;
        if !self.replicated_axes.is_empty() {
            write!(formatter, ", replicated={}", render_axis_list(self.replicated_axes.as_slice()))?;
        }
        write!(formatter, ">")
    }
}

/// Attribute rendering of a [`TensorSharding`] (i.e., `#sdy.sharding<@mesh, [...]>`).
#[derive(Copy, Clone, Debug)]
pub struct TensorShardingAttribute<'s>(&'s TensorSharding);

impl Display for TensorShardingAttribute<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "#sdy.sharding{}", self.0)
    }
}

/// Immutable list of [`TensorSharding`]s, one per value in a bundle of values (e.g., all results of an operation).
///
/// This is used wherever an operation needs a single attribute that covers many values (e.g., the `in_shardings` and
/// `out_shardings` of region-based operations).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TensorShardingPerValue {
    shardings: Vec<TensorSharding>,
}

impl TensorShardingPerValue {
    /// Creates a new [`TensorShardingPerValue`].
    pub fn new(shardings: Vec<TensorSharding>) -> Self {
        Self { shardings }
    }

    /// Creates a [`TensorShardingPerValue`] with a fully open sharding for each of the provided ranks.
    pub fn fully_open<M: Into<MeshReference>>(mesh: M, ranks: &[usize]) -> Self {
        let mesh = mesh.into();
        Self { shardings: ranks.iter().map(|rank| TensorSharding::fully_open(mesh.clone(), *rank)).collect() }
    }

    /// Returns the underlying shardings.
    pub fn shardings(&self) -> &[TensorSharding] {
        self.shardings.as_slice()
    }

    /// Returns the sharding at `index`, if it exists.
    pub fn get(&self, index: usize) -> Option<&TensorSharding> {
        self.shardings.get(index)
    }

    /// Returns the number of shardings.
    pub fn len(&self) -> usize {
        self.shardings.len()
    }

    /// Returns `true` if there are no shardings.
    pub fn is_empty(&self) -> bool {
        self.shardings.is_empty()
    }

    /// Returns a new [`TensorShardingPerValue`] with the sharding at `index` replaced by `sharding`.
    pub fn replacing(&self, index: usize, sharding: TensorSharding) -> Self {
        let mut shardings = self.shardings.clone();
        shardings[index] = sharding;
        Self { shardings }
    }

    /// Returns the attribute form of this list, which renders as `#sdy.sharding_per_value<[...]>`.
    pub fn as_attribute(&self) -> TensorShardingPerValueAttribute<'_> {
        TensorShardingPerValueAttribute(self)
    }
}

impl Display for TensorShardingPerValue {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "[")?;
        for (index, sharding) in self.shardings.iter().enumerate() {
            if index > 0 {
                write!(formatter, ", ")?;
            }
            write!(formatter, "{sharding}")?;
        }
        write!(formatter, "]")
    }
}

/// Attribute rendering of a [`TensorShardingPerValue`] (i.e., `#sdy.sharding_per_value<[...]>`).
#[derive(Copy, Clone, Debug)]
pub struct TensorShardingPerValueAttribute<'s>(&'s TensorShardingPerValue);

impl Display for TensorShardingPerValueAttribute<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "#sdy.sharding_per_value<{}>", self.0)
    }
}
