//! Sharding-transform algebra of the collective communication operations.
//!
//! None of the collectives in this crate communicate anything. Each one is an IR-level description of a communication
//! primitive, and its only observable effect is on shardings: applying the collective's transform to the operand
//! sharding yields the result sharding. The operation carries that result sharding as its `out_sharding`, and the
//! verifier recomputes it from the operand sharding and rejects any mismatch.
//!
//! The transforms are exposed as free functions (e.g., [`all_gather`]) so that they can also be used to _infer_ the
//! `out_sharding` of a collective before constructing it.

use std::fmt::Display;

use crate::axis::{AxisRef, axes_size, render_axis_list, render_axis_lists, validate_canonical_axis_set};
use crate::errors::ShardyError;
use crate::mesh::Mesh;
use crate::sharding::{DimensionSharding, TensorSharding};

/// Name of the attribute that is used to store the `out_sharding` of every collective.
pub const OUT_SHARDING_ATTRIBUTE: &str = "out_sharding";

fn check_axis_list_count(what: &str, axis_lists: &[Vec<AxisRef>], rank: usize) -> Result<(), ShardyError> {
    if axis_lists.len() != rank {
        return Err(ShardyError::ArityMismatch { what: what.to_string(), expected: rank, actual: axis_lists.len() });
    }
    Ok(())
}

fn is_suffix(axes: &[AxisRef], dimension_axes: &[AxisRef]) -> bool {
    axes.len() <= dimension_axes.len() && dimension_axes[dimension_axes.len() - axes.len()..] == *axes
}

/// Removes `gathering_axes[d]` from the end of the axes of each dimension `d` of `operand`.
///
/// The gathered axes must be a suffix of the corresponding dimension sharding. Openness, priorities, and the
/// explicitly replicated axes of `operand` are preserved.
pub fn all_gather(operand: &TensorSharding, gathering_axes: &[Vec<AxisRef>]) -> Result<TensorSharding, ShardyError> {
    check_axis_list_count("gathering axis lists", gathering_axes, operand.rank())?;
    let dimensions = operand
        .dimensions()
        .iter()
        .zip(gathering_axes.iter())
        .enumerate()
        .map(|(dimension, (dimension_sharding, axes))| {
            let dimension_axes = dimension_sharding.axes();
            if !is_suffix(axes.as_slice(), dimension_axes) {
                return Err(ShardyError::AxesNotSuffix {
                    axes: render_axis_list(axes.as_slice()),
                    dimension_axes: render_axis_list(dimension_axes),
                    dimension,
                });
            }
            Ok(dimension_sharding.with_axes(dimension_axes[..dimension_axes.len() - axes.len()].to_vec()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(operand.with_dimensions(dimensions))
}

/// Appends `slicing_axes[d]` to the axes of each dimension `d` of `operand`.
///
/// The slicing axes must not overlap with any axis that already shards a dimension of `operand`, or with each other.
/// Explicitly replicated axes that overlap with a slicing axis are dropped from the replicated set.
pub fn all_slice(operand: &TensorSharding, slicing_axes: &[Vec<AxisRef>]) -> Result<TensorSharding, ShardyError> {
    check_axis_list_count("slicing axis lists", slicing_axes, operand.rank())?;
    let mut sliced: Vec<&AxisRef> = Vec::new();
    for (dimension, axes) in slicing_axes.iter().enumerate() {
        for axis in axes {
            if operand.sharding_axes().any(|used| used.overlaps(axis)) {
                return Err(ShardyError::AxisAlreadyInUse { axis: axis.to_string(), dimension });
            }
            if let Some(other_axis) = sliced.iter().find(|other| other.overlaps(axis)) {
                return Err(ShardyError::OverlappingAxes { axis: axis.to_string(), other_axis: other_axis.to_string() });
            }
            sliced.push(axis);
        }
    }
    let dimensions = operand
        .dimensions()
        .iter()
        .zip(slicing_axes.iter())
        .map(|(dimension_sharding, axes)| {
            let mut dimension_axes = dimension_sharding.axes().to_vec();
            dimension_axes.extend(axes.iter().cloned());
            dimension_sharding.with_axes(dimension_axes)
        })
        .collect();
    let replicated_axes = operand
        .replicated_axes()
        .iter()
        .filter(|axis| !sliced.iter().any(|sliced_axis| sliced_axis.overlaps(axis)))
        .cloned()
        .collect();
    Ok(operand.with_dimensions(dimensions).with_replicated(replicated_axes))
}

/// Single parameter of an [`AllToAll`]: the `axes` move from the end of `source_dimension` to the end of
/// `target_dimension`. Renders as `{"b"}: 0->2`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllToAllParam {
    pub axes: Vec<AxisRef>,
    pub source_dimension: usize,
    pub target_dimension: usize,
}

impl AllToAllParam {
    /// Creates a new [`AllToAllParam`].
    pub fn new<I: IntoIterator<Item = A>, A: Into<AxisRef>>(
        axes: I,
        source_dimension: usize,
        target_dimension: usize,
    ) -> Self {
        Self { axes: axes.into_iter().map(Into::into).collect(), source_dimension, target_dimension }
    }
}

impl Display for AllToAllParam {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let axes = render_axis_list(self.axes.as_slice());
        write!(formatter, "{axes}: {}->{}", self.source_dimension, self.target_dimension)
    }
}

/// Checks the structural constraints on a list of [`AllToAllParam`]s for an operand of rank `rank`: the list must be
/// non-empty, every dimension must be in range and used at most once across all source and target dimensions, source
/// dimensions must be strictly ascending, and each parameter must move a non-empty list of axes between two distinct
/// dimensions.
pub fn validate_all_to_all_params(params: &[AllToAllParam], rank: usize) -> Result<(), ShardyError> {
    if params.is_empty() {
        return Err(ShardyError::EmptyAllToAllParams);
    }
    let mut used_dimensions = Vec::with_capacity(2 * params.len());
    let mut previous_source_dimension: Option<usize> = None;
    for param in params {
        for dimension in [param.source_dimension, param.target_dimension] {
            if dimension >= rank {
                return Err(ShardyError::DimensionOutOfRange { dimension, rank });
            }
        }
        if param.source_dimension == param.target_dimension {
            return Err(ShardyError::AllToAllSameDimension { dimension: param.source_dimension });
        }
        if param.axes.is_empty() {
            return Err(ShardyError::EmptyAllToAllAxes { dimension: param.source_dimension });
        }
        if let Some(previous) = previous_source_dimension {
            if param.source_dimension <= previous {
                return Err(ShardyError::AllToAllSourceDimensionsNotAscending {
                    previous,
                    current: param.source_dimension,
                });
            }
        }
        previous_source_dimension = Some(param.source_dimension);
        for dimension in [param.source_dimension, param.target_dimension] {
            if used_dimensions.contains(&dimension) {
                return Err(ShardyError::AllToAllDimensionReused { dimension });
            }
            used_dimensions.push(dimension);
        }
    }
    Ok(())
}

/// For each parameter, removes its axes from the end of the source dimension of `operand` and appends them to the end
/// of the target dimension.
pub fn all_to_all(operand: &TensorSharding, params: &[AllToAllParam]) -> Result<TensorSharding, ShardyError> {
    validate_all_to_all_params(params, operand.rank())?;
    let mut dimensions = operand.dimensions().to_vec();
    for param in params {
        let source_axes = dimensions[param.source_dimension].axes();
        if !is_suffix(param.axes.as_slice(), source_axes) {
            return Err(ShardyError::AxesNotSuffix {
                axes: render_axis_list(param.axes.as_slice()),
                dimension_axes: render_axis_list(source_axes),
                dimension: param.source_dimension,
            });
        }
        let remaining = source_axes[..source_axes.len() - param.axes.len()].to_vec();
        dimensions[param.source_dimension] = dimensions[param.source_dimension].with_axes(remaining);
        let mut target_axes = dimensions[param.target_dimension].axes().to_vec();
        target_axes.extend(param.axes.iter().cloned());
        dimensions[param.target_dimension] = dimensions[param.target_dimension].with_axes(target_axes);
    }
    Ok(operand.with_dimensions(dimensions))
}

/// Checks that `out` is a valid `collective_permute` of `operand`: the two meshes must be equal up to their device
/// ordering, and every dimension must be sharded along the same number of devices on both sides.
pub fn check_collective_permute(
    operand: &TensorSharding,
    operand_mesh: &Mesh,
    out: &TensorSharding,
    out_mesh: &Mesh,
) -> Result<(), ShardyError> {
    if !operand_mesh.equals_ignoring_device_ids(out_mesh) {
        return Err(ShardyError::IncompatibleMeshes { lhs: operand_mesh.to_string(), rhs: out_mesh.to_string() });
    }
    if operand.rank() != out.rank() {
        return Err(ShardyError::RankMismatch { sharding_rank: out.rank(), tensor_rank: operand.rank() });
    }
    for (dimension, (operand_dimension, out_dimension)) in
        operand.dimensions().iter().zip(out.dimensions().iter()).enumerate()
    {
        let operand_size = operand_dimension.sharded_size(operand_mesh)?;
        let out_size = out_dimension.sharded_size(out_mesh)?;
        if operand_size != out_size {
            return Err(ShardyError::ShardedSizeMismatch { dimension, operand_size, out_size });
        }
    }
    Ok(())
}

/// Checks that `out` is a valid `all_reduce` of `operand` over `reduction_axes`: both shardings must have identical
/// dimension shardings, and the reduction axes must be in canonical order and must not overlap with any axis used by
/// the operand (in its dimensions or its replicated set) or by the dimensions of `out`.
pub fn check_all_reduce(
    operand: &TensorSharding,
    reduction_axes: &[AxisRef],
    out: &TensorSharding,
    mesh: &Mesh,
) -> Result<(), ShardyError> {
    for axis in reduction_axes {
        axis.validate(mesh)?;
    }
    validate_canonical_axis_set(reduction_axes, mesh)?;
    check_reduction_axes_are_free(operand, reduction_axes.iter())?;
    for axis in reduction_axes {
        if out.sharding_axes().any(|used| used.overlaps(axis)) {
            return Err(ShardyError::ReductionAxisInUse {
                axis: axis.to_string(),
                location: "out_sharding dimension shardings".to_string(),
            });
        }
    }
    if !operand.has_equivalent_dimension_axes(out) {
        return Err(ShardyError::DimensionShardingMismatch {
            operand: render_axis_lists(operand.dimension_axes().as_slice()),
            out: render_axis_lists(out.dimension_axes().as_slice()),
        });
    }
    Ok(())
}

fn check_reduction_axes_are_free<'a, I: IntoIterator<Item = &'a AxisRef>>(
    operand: &TensorSharding,
    reduction_axes: I,
) -> Result<(), ShardyError> {
    for axis in reduction_axes {
        if operand.sharding_axes().any(|used| used.overlaps(axis)) {
            return Err(ShardyError::ReductionAxisInUse {
                axis: axis.to_string(),
                location: "operand dimension shardings".to_string(),
            });
        }
        if operand.replicated_axes().iter().any(|used| used.overlaps(axis)) {
            return Err(ShardyError::ReductionAxisInUse {
                axis: axis.to_string(),
                location: "operand replicated axes".to_string(),
            });
        }
    }
    Ok(())
}

/// Reduces `operand` over `reduce_scatter_axes` and then slices each dimension `d` along `reduce_scatter_axes[d]`.
pub fn reduce_scatter(
    operand: &TensorSharding,
    reduce_scatter_axes: &[Vec<AxisRef>],
) -> Result<TensorSharding, ShardyError> {
    check_axis_list_count("reduce-scatter axis lists", reduce_scatter_axes, operand.rank())?;
    check_reduction_axes_are_free(operand, reduce_scatter_axes.iter().flatten())?;
    all_slice(operand, reduce_scatter_axes)
}

fn check_same_dimension_axes(expected: TensorSharding, out: &TensorSharding) -> Result<(), ShardyError> {
    if !expected.has_equivalent_dimension_axes(out) {
        let expected = TensorSharding::with_replicated_axes(
            out.mesh().clone(),
            expected.dimensions().to_vec(),
            expected.replicated_axes().to_vec(),
        );
        return Err(ShardyError::OutShardingMismatch { expected: expected.to_string(), actual: out.to_string() });
    }
    Ok(())
}

/// Common contract of the collective operations.
///
/// Every collective has a single operand and a single result of the same type, and carries the sharding of its result
/// as an `out_sharding` attribute that must be consistent with the operand sharding.
pub trait CollectiveOp {
    /// Returns the mnemonic of this collective (e.g., `sdy.all_gather`).
    fn mnemonic(&self) -> &'static str;

    /// Returns the declared sharding of the result of this collective.
    fn out_sharding(&self) -> &TensorSharding;

    /// Returns `true` if the operand may have no sharding, in which case it is treated as fully replicated.
    fn allows_missing_input_sharding(&self) -> bool {
        false
    }

    /// Returns `true` if the operand and the result of this collective may refer to different (but compatible)
    /// meshes.
    fn allows_different_meshes(&self) -> bool {
        false
    }

    /// Returns `true` if this collective is a no-op given an operand sharding of `operand`.
    fn is_identity(&self, operand: &TensorSharding) -> bool;

    /// Checks that [`CollectiveOp::out_sharding`] is consistent with `operand`.
    fn verify_out_sharding(
        &self,
        operand: &TensorSharding,
        operand_mesh: &Mesh,
        out_mesh: &Mesh,
    ) -> Result<(), ShardyError>;
}

/// `sdy.all_gather`: gathers the tensor along the listed axes of each dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllGather {
    pub gathering_axes: Vec<Vec<AxisRef>>,
    pub out_sharding: TensorSharding,
}

impl CollectiveOp for AllGather {
    fn mnemonic(&self) -> &'static str {
        "sdy.all_gather"
    }

    fn out_sharding(&self) -> &TensorSharding {
        &self.out_sharding
    }

    fn is_identity(&self, _operand: &TensorSharding) -> bool {
        self.gathering_axes.iter().all(Vec::is_empty)
    }

    fn verify_out_sharding(&self, operand: &TensorSharding, _: &Mesh, _: &Mesh) -> Result<(), ShardyError> {
        check_same_dimension_axes(all_gather(operand, self.gathering_axes.as_slice())?, &self.out_sharding)
    }
}

/// `sdy.all_slice`: slices the tensor along the listed axes of each dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllSlice {
    pub slicing_axes: Vec<Vec<AxisRef>>,
    pub out_sharding: TensorSharding,
}

impl CollectiveOp for AllSlice {
    fn mnemonic(&self) -> &'static str {
        "sdy.all_slice"
    }

    fn out_sharding(&self) -> &TensorSharding {
        &self.out_sharding
    }

    fn allows_missing_input_sharding(&self) -> bool {
        true
    }

    fn is_identity(&self, _operand: &TensorSharding) -> bool {
        self.slicing_axes.iter().all(Vec::is_empty)
    }

    fn verify_out_sharding(&self, operand: &TensorSharding, _: &Mesh, _: &Mesh) -> Result<(), ShardyError> {
        check_same_dimension_axes(all_slice(operand, self.slicing_axes.as_slice())?, &self.out_sharding)
    }
}

/// `sdy.all_to_all`: moves axes between pairs of dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllToAll {
    pub params: Vec<AllToAllParam>,
    pub out_sharding: TensorSharding,
}

impl CollectiveOp for AllToAll {
    fn mnemonic(&self) -> &'static str {
        "sdy.all_to_all"
    }

    fn out_sharding(&self) -> &TensorSharding {
        &self.out_sharding
    }

    fn is_identity(&self, _operand: &TensorSharding) -> bool {
        false
    }

    fn verify_out_sharding(&self, operand: &TensorSharding, _: &Mesh, _: &Mesh) -> Result<(), ShardyError> {
        check_same_dimension_axes(all_to_all(operand, self.params.as_slice())?, &self.out_sharding)
    }
}

/// `sdy.collective_permute`: changes which axes shard each dimension without changing how much it is sharded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CollectivePermute {
    pub out_sharding: TensorSharding,
}

impl CollectiveOp for CollectivePermute {
    fn mnemonic(&self) -> &'static str {
        "sdy.collective_permute"
    }

    fn out_sharding(&self) -> &TensorSharding {
        &self.out_sharding
    }

    fn allows_different_meshes(&self) -> bool {
        true
    }

    fn is_identity(&self, operand: &TensorSharding) -> bool {
        operand.mesh() == self.out_sharding.mesh() && operand.has_equivalent_dimension_axes(&self.out_sharding)
    }

    fn verify_out_sharding(
        &self,
        operand: &TensorSharding,
        operand_mesh: &Mesh,
        out_mesh: &Mesh,
    ) -> Result<(), ShardyError> {
        check_collective_permute(operand, operand_mesh, &self.out_sharding, out_mesh)
    }
}

/// `sdy.all_reduce`: reduces partial values along the reduction axes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllReduce {
    pub reduction_axes: Vec<AxisRef>,
    pub out_sharding: TensorSharding,
}

impl CollectiveOp for AllReduce {
    fn mnemonic(&self) -> &'static str {
        "sdy.all_reduce"
    }

    fn out_sharding(&self) -> &TensorSharding {
        &self.out_sharding
    }

    fn allows_missing_input_sharding(&self) -> bool {
        true
    }

    fn is_identity(&self, _operand: &TensorSharding) -> bool {
        self.reduction_axes.is_empty()
    }

    fn verify_out_sharding(&self, operand: &TensorSharding, operand_mesh: &Mesh, _: &Mesh) -> Result<(), ShardyError> {
        check_all_reduce(operand, self.reduction_axes.as_slice(), &self.out_sharding, operand_mesh)
    }
}

/// `sdy.reduce_scatter`: an `all_reduce` followed by an `all_slice` along the same axes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReduceScatter {
    pub reduce_scatter_axes: Vec<Vec<AxisRef>>,
    pub out_sharding: TensorSharding,
}

impl CollectiveOp for ReduceScatter {
    fn mnemonic(&self) -> &'static str {
        "sdy.reduce_scatter"
    }

    fn out_sharding(&self) -> &TensorSharding {
        &self.out_sharding
    }

    fn allows_missing_input_sharding(&self) -> bool {
        true
    }

    fn is_identity(&self, _operand: &TensorSharding) -> bool {
        self.reduce_scatter_axes.iter().all(Vec::is_empty)
    }

    fn verify_out_sharding(&self, operand: &TensorSharding, _: &Mesh, _: &Mesh) -> Result<(), ShardyError> {
        check_same_dimension_axes(reduce_scatter(operand, self.reduce_scatter_axes.as_slice())?, &self.out_sharding)
    }
}

/// Total number of devices that shard `sharding` (i.e., the product of all dimension sharded sizes).
pub fn total_sharded_size(sharding: &TensorSharding, mesh: &Mesh) -> Result<usize, ShardyError> {
    sharding
        .dimensions()
        .iter()
        .map(DimensionSharding::axes)
        .try_fold(1usize, |size, axes| Ok(size.saturating_mul(axes_size(axes, mesh)?)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::errors::ErrorKind;
    use crate::mesh::MeshAxis;

    use super::*;

    fn mesh_abcdef() -> Mesh {
        Mesh::new(vec![
            MeshAxis::new("a", 2).unwrap(),
            MeshAxis::new("b", 2).unwrap(),
            MeshAxis::new("c", 4).unwrap(),
            MeshAxis::new("d", 2).unwrap(),
            MeshAxis::new("e", 2).unwrap(),
            MeshAxis::new("f", 2).unwrap(),
        ])
        .unwrap()
    }

    fn sharding(dimensions: &[&[&str]]) -> TensorSharding {
        TensorSharding::new(
            "mesh",
            dimensions.iter().map(|axes| DimensionSharding::closed(axes.iter().copied())).collect(),
        )
    }

    fn axis_lists(axis_lists: &[&[&str]]) -> Vec<Vec<AxisRef>> {
        axis_lists.iter().map(|axes| axes.iter().map(|axis| AxisRef::full(*axis)).collect()).collect()
    }

    #[test]
    fn test_all_gather() {
        let operand = sharding(&[&["a", "b", "c"], &[], &["d"]]);
        let out = all_gather(&operand, &axis_lists(&[&["b", "c"], &[], &["d"]])).unwrap();
        assert_eq!(out, sharding(&[&["a"], &[], &[]]));
        assert_eq!(out.to_string(), "<@mesh, [{\"a\"}, {}, {}]>");

        let error = all_gather(&operand, &axis_lists(&[&["b"], &[], &[]])).unwrap_err();
        assert_eq!(
            error,
            ShardyError::AxesNotSuffix {
                axes: "{\"b\"}".to_string(),
                dimension_axes: "{\"a\", \"b\", \"c\"}".to_string(),
                dimension: 0,
            },
        );
        assert!(matches!(
            all_gather(&operand, &axis_lists(&[&[], &[]])),
            Err(ShardyError::ArityMismatch { expected: 3, actual: 2, .. }),
        ));

        let gather = AllGather {
            gathering_axes: axis_lists(&[&["b", "c"], &[], &["d"]]),
            out_sharding: sharding(&[&["a"], &[], &[]]),
        };
        let mesh = mesh_abcdef();
        assert!(gather.verify_out_sharding(&operand, &mesh, &mesh).is_ok());
        let gather = AllGather { out_sharding: sharding(&[&["a"], &[], &["d"]]), ..gather };
        let error = gather.verify_out_sharding(&operand, &mesh, &mesh).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::OutShardingMismatch);
    }

    #[test]
    fn test_all_slice() {
        let operand = TensorSharding::with_replicated_axes(
            "mesh",
            vec![DimensionSharding::closed(["a"]), DimensionSharding::replicated()],
            vec![AxisRef::full("b")],
        );
        let out = all_slice(&operand, &axis_lists(&[&["c"], &["b", "d"]])).unwrap();
        assert_eq!(out, sharding(&[&["a", "c"], &["b", "d"]]));
        assert!(matches!(
            all_slice(&operand, &axis_lists(&[&[], &["a"]])),
            Err(ShardyError::AxisAlreadyInUse { dimension: 1, .. }),
        ));
        assert!(matches!(
            all_slice(&operand, &[vec![AxisRef::full("c")], vec![AxisRef::sub("c", 2, 2)]]),
            Err(ShardyError::OverlappingAxes { .. }),
        ));
        assert!(AllSlice { slicing_axes: axis_lists(&[&[], &[]]), out_sharding: operand.clone() }.is_identity(&operand));
    }

    #[test]
    fn test_all_to_all() {
        let operand = sharding(&[&["a", "b"], &["c"], &[]]);
        let params = vec![AllToAllParam::new(["b"], 0, 2)];
        assert_eq!(params[0].to_string(), "{\"b\"}: 0->2");
        assert_eq!(all_to_all(&operand, &params).unwrap(), sharding(&[&["a"], &["c"], &["b"]]));

        let params = vec![AllToAllParam::new(["a", "b"], 0, 2), AllToAllParam::new(["c"], 1, 3)];
        assert_eq!(
            all_to_all(&sharding(&[&["a", "b"], &["c"], &[], &["d"]]), &params).unwrap(),
            sharding(&[&[], &[], &["a", "b"], &["d", "c"]]),
        );

        assert_eq!(all_to_all(&operand, &[]), Err(ShardyError::EmptyAllToAllParams));
        assert_eq!(
            all_to_all(&operand, &[AllToAllParam::new(["a"], 1, 0), AllToAllParam::new(["c"], 0, 2)]),
            Err(ShardyError::AllToAllSourceDimensionsNotAscending { previous: 1, current: 0 }),
        );
        assert_eq!(
            all_to_all(&operand, &[AllToAllParam::new(["b"], 0, 2), AllToAllParam::new(["c"], 1, 2)]),
            Err(ShardyError::AllToAllDimensionReused { dimension: 2 }),
        );
        assert_eq!(
            all_to_all(&operand, &[AllToAllParam::new(["b"], 0, 3)]),
            Err(ShardyError::DimensionOutOfRange { dimension: 3, rank: 3 }),
        );
        assert_eq!(
            all_to_all(&operand, &[AllToAllParam::new(["b"], 1, 1)]),
            Err(ShardyError::AllToAllSameDimension { dimension: 1 }),
        );
        assert_eq!(
            all_to_all(&operand, &[AllToAllParam::new(Vec::<AxisRef>::new(), 0, 1)]),
            Err(ShardyError::EmptyAllToAllAxes { dimension: 0 }),
        );
        assert!(matches!(
            all_to_all(&operand, &[AllToAllParam::new(["a"], 0, 2)]),
            Err(ShardyError::AxesNotSuffix { dimension: 0, .. }),
        ));
        for error in [ShardyError::EmptyAllToAllParams, ShardyError::AllToAllDimensionReused { dimension: 0 }] {
            assert_eq!(error.kind(), ErrorKind::Ordering);
        }
    }

    #[test]
    fn test_collective_permute() {
        let mesh = mesh_abcdef();
        let operand = sharding(&[&["a", "c"], &["f"], &["d", "e"]]);
        let out = TensorSharding::new(
            "mesh",
            vec![
                DimensionSharding::closed([AxisRef::sub("c", 1, 2), AxisRef::full("b"), AxisRef::full("f")]),
                DimensionSharding::closed(["a"]),
                DimensionSharding::closed(["e", "d"]),
            ],
        );
        assert!(check_collective_permute(&operand, &mesh, &out, &mesh).is_ok());

        let out = sharding(&[&["a"], &["f"], &["d", "e"]]);
        assert_eq!(
            check_collective_permute(&operand, &mesh, &out, &mesh),
            Err(ShardyError::ShardedSizeMismatch { dimension: 0, operand_size: 8, out_size: 2 }),
        );

        let permuted_mesh = Mesh::with_device_ids(vec![MeshAxis::new("x", 2).unwrap()], vec![1, 0]).unwrap();
        let iota_mesh = Mesh::new(vec![MeshAxis::new("x", 2).unwrap()]).unwrap();
        let other_mesh = Mesh::new(vec![MeshAxis::new("y", 2).unwrap()]).unwrap();
        let x = TensorSharding::new("mesh", vec![DimensionSharding::closed(["x"])]);
        assert!(check_collective_permute(&x, &iota_mesh, &x, &permuted_mesh).is_ok());
        assert!(matches!(
            check_collective_permute(&x, &iota_mesh, &x, &other_mesh),
            Err(ShardyError::IncompatibleMeshes { .. }),
        ));
    }

    #[test]
    fn test_all_reduce() {
        let mesh = mesh_abcdef();
        let operand = TensorSharding::with_replicated_axes(
            "mesh",
            vec![DimensionSharding::closed(["a"]), DimensionSharding::replicated()],
            vec![AxisRef::full("f")],
        );
        let out = sharding(&[&["a"], &[]]);
        assert!(check_all_reduce(&operand, &[AxisRef::full("b"), AxisRef::full("c")], &out, &mesh).is_ok());
        assert!(matches!(
            check_all_reduce(&operand, &[AxisRef::full("a")], &out, &mesh),
            Err(ShardyError::ReductionAxisInUse { location, .. }) if location == "operand dimension shardings",
        ));
        assert!(matches!(
            check_all_reduce(&operand, &[AxisRef::full("f")], &out, &mesh),
            Err(ShardyError::ReductionAxisInUse { location, .. }) if location == "operand replicated axes",
        ));
        assert!(matches!(
            check_all_reduce(&operand, &[AxisRef::full("c"), AxisRef::full("b")], &out, &mesh),
            Err(ShardyError::UnsortedAxes { .. }),
        ));
        let mismatched_out = sharding(&[&["a"], &["b"]]);
        assert!(matches!(
            check_all_reduce(&operand, &[AxisRef::full("c")], &mismatched_out, &mesh),
            Err(ShardyError::DimensionShardingMismatch { .. }),
        ));
        assert!(matches!(
            check_all_reduce(&operand, &[AxisRef::full("b")], &mismatched_out, &mesh),
            Err(ShardyError::ReductionAxisInUse { location, .. }) if location == "out_sharding dimension shardings",
        ));
    }

    #[test]
    fn test_reduce_scatter() {
        let mesh = mesh_abcdef();
        let operand = sharding(&[&["a"], &[]]);
        let out = reduce_scatter(&operand, &axis_lists(&[&["b"], &["c"]])).unwrap();
        assert_eq!(out, sharding(&[&["a", "b"], &["c"]]));
        assert_eq!(total_sharded_size(&out, &mesh), Ok(16));
        let replicated = operand.with_replicated(vec![AxisRef::full("b")]);
        assert!(matches!(
            reduce_scatter(&replicated, &axis_lists(&[&["b"], &[]])),
            Err(ShardyError::ReductionAxisInUse { .. }),
        ));
        let op = ReduceScatter { reduce_scatter_axes: axis_lists(&[&["b"], &["c"]]), out_sharding: out };
        assert!(op.verify_out_sharding(&operand, &mesh, &mesh).is_ok());
        assert!(op.allows_missing_input_sharding());
    }
}
