//! Helpers for `sdy.manual_computation`.
//!
//! The body of a manual computation is written per device along its _manual axes_: its block arguments and returned
//! values have _local_ types, whose dimensions are the global dimensions divided by the sizes of the manual axes that
//! shard them. Propagation only sees the _free_ (non-manual) axes inside the body (see [`local_sharding`]).

use crate::axis::{AxisRef, axes_size};
use crate::errors::ShardyError;
use crate::ir::{BlockId, Module, OperationId, OperationKind};
use crate::mesh::Mesh;
use crate::sharding::{DimensionSharding, TensorSharding};
use crate::types::TensorType;

fn is_manual(axis: &AxisRef, manual_axes: &[String]) -> bool {
    manual_axes.iter().any(|manual_axis| manual_axis == axis.name())
}

/// Returns the sharding seen inside the body of a manual computation for a value with global sharding `sharding`,
/// which is `sharding` without any of the `manual_axes`.
pub fn local_sharding(sharding: &TensorSharding, manual_axes: &[String]) -> TensorSharding {
    let dimensions = sharding
        .dimensions()
        .iter()
        .map(|dimension| {
            let axes = dimension.axes().iter().filter(|axis| !is_manual(axis, manual_axes)).cloned().collect();
            dimension.with_axes(axes)
        })
        .collect();
    let replicated_axes =
        sharding.replicated_axes().iter().filter(|axis| !is_manual(axis, manual_axes)).cloned().collect();
    TensorSharding::with_replicated_axes(sharding.mesh().clone(), dimensions, replicated_axes)
}

/// Returns the global sharding that corresponds to the body-local sharding `local` of a value whose global sharding
/// is declared as `global` (i.e., the manual axes of `global` followed by the free axes of `local`).
pub fn global_sharding(global: &TensorSharding, local: &TensorSharding, manual_axes: &[String]) -> TensorSharding {
    let dimensions = global
        .dimensions()
        .iter()
        .zip(local.dimensions())
        .map(|(global_dimension, local_dimension)| {
            let mut axes = global_dimension
                .axes()
                .iter()
                .filter(|axis| is_manual(axis, manual_axes))
                .cloned()
                .collect::<Vec<_>>();
            axes.extend(local_dimension.axes().iter().cloned());
            local_dimension.with_axes(axes)
        })
        .collect::<Vec<DimensionSharding>>();
    let mut replicated_axes =
        global.replicated_axes().iter().filter(|axis| is_manual(axis, manual_axes)).cloned().collect::<Vec<_>>();
    replicated_axes.extend(local.replicated_axes().iter().cloned());
    TensorSharding::with_replicated_axes(global.mesh().clone(), dimensions, replicated_axes)
}

/// Returns the local shape of a tensor of global shape `global_shape` with sharding `sharding` inside a manual
/// computation over `manual_axes`. Manual axes must not require padding.
pub fn local_shape(
    global_shape: &[usize],
    sharding: &TensorSharding,
    manual_axes: &[String],
    mesh: &Mesh,
) -> Result<Vec<usize>, ShardyError> {
    global_shape
        .iter()
        .zip(sharding.dimensions())
        .enumerate()
        .map(|(dimension, (dimension_size, dimension_sharding))| {
            let manual = dimension_sharding
                .axes()
                .iter()
                .filter(|axis| is_manual(axis, manual_axes))
                .cloned()
                .collect::<Vec<_>>();
            let manual_size = axes_size(manual.as_slice(), mesh)?;
            if *dimension_size % manual_size != 0 {
                return Err(ShardyError::ManualAxisPadding {
                    dimension,
                    dimension_size: *dimension_size,
                    manual_size,
                });
            }
            Ok(dimension_size / manual_size)
        })
        .collect()
}

/// Returns the innermost `sdy.manual_computation` whose body (transitively) contains `block`.
pub fn enclosing_manual_computation(module: &Module, block: BlockId) -> Option<OperationId> {
    let mut block = block;
    while let Some(parent) = module.block_parent(block) {
        if matches!(module.operation(parent).kind(), OperationKind::ManualComputation(_)) {
            return Some(parent);
        }
        block = module.operation(parent).block();
    }
    None
}

/// Checks a single boundary sharding of a manual computation against the global type of the boundary value and
/// returns the expected local type.
fn verify_boundary_sharding(
    sharding: &TensorSharding,
    global_type: &TensorType,
    manual_axes: &[String],
    mesh: &Mesh,
) -> Result<TensorType, ShardyError> {
    sharding.validate_with_mesh(global_type.shape(), mesh)?;
    for (dimension, dimension_sharding) in sharding.dimensions().iter().enumerate() {
        let mut free_axis: Option<&AxisRef> = None;
        for axis in dimension_sharding.axes() {
            match (is_manual(axis, manual_axes), free_axis) {
                (true, Some(free_axis)) => {
                    return Err(ShardyError::ManualAxisAfterFreeAxis {
                        axis: axis.to_string(),
                        free_axis: free_axis.to_string(),
                        dimension,
                    });
                }
                (true, None) => {}
                (false, _) => free_axis = Some(axis),
            }
        }
    }
    if let Some(axis) = sharding.sharding_axes().find(|axis| axis.is_sub_axis() && is_manual(axis, manual_axes)) {
        return Err(ShardyError::ManualSubAxis { axis: axis.to_string() });
    }
    Ok(global_type.with_shape(local_shape(global_type.shape(), sharding, manual_axes, mesh)?))
}

fn check_arity(what: &str, expected: usize, actual: usize) -> Result<(), ShardyError> {
    if expected != actual {
        return Err(ShardyError::ArityMismatch { what: what.to_string(), expected, actual });
    }
    Ok(())
}

fn check_type(what: String, expected: &TensorType, actual: &TensorType) -> Result<(), ShardyError> {
    if expected != actual {
        return Err(ShardyError::TypeMismatch { what, expected: expected.to_string(), actual: actual.to_string() });
    }
    Ok(())
}

/// Verifies the `sdy.manual_computation` `operation`:
///
///   - the numbers of in shardings, operands, and block arguments match, as do the numbers of out shardings,
///     results, and returned values,
///   - the manual axes exist in the mesh and are sorted in mesh order without duplicates,
///   - all in and out shardings refer to the same mesh and are valid for the global types,
///   - in every dimension, manual axes precede all free axes, and no manual axis is split into sub-axes,
///   - manual axes divide the dimensions that they shard, and the block argument and returned value types equal the
///     resulting local types.
pub(crate) fn verify_manual_computation(module: &Module, operation: OperationId) -> Result<(), ShardyError> {
    let data = module.operation(operation);
    let OperationKind::ManualComputation(computation) = data.kind() else { return Ok(()) };
    let body = data.regions()[0];
    let arguments = module.block_arguments(body);
    let terminator = module.terminator(body).ok_or(ShardyError::MissingTerminator)?;
    let returned = module.operation(terminator).operands();

    check_arity("in_shardings", data.operands().len(), computation.in_shardings.len())?;
    check_arity("block arguments", data.operands().len(), arguments.len())?;
    check_arity("out_shardings", data.results().len(), computation.out_shardings.len())?;
    check_arity("returned values", data.results().len(), returned.len())?;

    let mut shardings = computation.in_shardings.shardings().iter().chain(computation.out_shardings.shardings());
    let Some(first) = shardings.next() else {
        if computation.manual_axes.is_empty() {
            return Ok(());
        }
        let axes = computation.manual_axes.iter().map(|axis| AxisRef::full(axis.as_str())).collect::<Vec<_>>();
        return Err(ShardyError::ManualAxesWithoutMesh { axes: crate::axis::render_axis_list(axes.as_slice()) });
    };
    let mesh = module.meshes().resolve(first.mesh())?;
    for sharding in shardings {
        let other_mesh = module.meshes().resolve(sharding.mesh())?;
        if other_mesh != mesh {
            return Err(ShardyError::IncompatibleMeshes {
                lhs: first.mesh().to_string(),
                rhs: sharding.mesh().to_string(),
            });
        }
    }

    let mut manual_axis_indices = Vec::with_capacity(computation.manual_axes.len());
    for manual_axis in &computation.manual_axes {
        let index = mesh.axis_index(manual_axis).ok_or_else(|| ShardyError::UnknownMeshAxis {
            axis_name: manual_axis.clone(),
            mesh: first.mesh().to_string(),
        })?;
        manual_axis_indices.push(index);
    }
    if manual_axis_indices.windows(2).any(|window| window[0] >= window[1]) {
        let axes = computation.manual_axes.iter().map(|axis| AxisRef::full(axis.as_str())).collect::<Vec<_>>();
        return Err(ShardyError::UnsortedAxes { axes: crate::axis::render_axis_list(axes.as_slice()) });
    }

    let manual_axes = computation.manual_axes.as_slice();
    for (index, (operand, sharding)) in data.operands().iter().zip(computation.in_shardings.shardings()).enumerate() {
        let local_type = verify_boundary_sharding(sharding, module.r#type(*operand), manual_axes, mesh)?;
        check_type(format!("block argument #{index}"), &local_type, module.r#type(arguments[index]))?;
    }
    for (index, (result, sharding)) in data.results().iter().zip(computation.out_shardings.shardings()).enumerate() {
        let local_type = verify_boundary_sharding(sharding, module.r#type(*result), manual_axes, mesh)?;
        check_type(format!("returned value #{index}"), &local_type, module.r#type(returned[index]))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::errors::ErrorKind;
    use crate::mesh::MeshAxis;
    use crate::sharding::TensorShardingPerValue;
    use crate::types::ElementType;

    use super::*;

    fn mesh() -> Mesh {
        Mesh::new(vec![MeshAxis::new("a", 2).unwrap(), MeshAxis::new("b", 4).unwrap()]).unwrap()
    }

    fn manual_axes() -> Vec<String> {
        vec!["a".to_string()]
    }

    #[test]
    fn test_local_sharding() {
        let sharding = TensorSharding::with_replicated_axes(
            "mesh",
            vec![DimensionSharding::closed(["a", "b"]), DimensionSharding::open(["a"])],
            vec![AxisRef::full("a"), AxisRef::sub("b", 1, 2)],
        );
        let local = local_sharding(&sharding, manual_axes().as_slice());
        assert_eq!(
            local,
            TensorSharding::with_replicated_axes(
                "mesh",
                vec![DimensionSharding::closed(["b"]), DimensionSharding::open(Vec::<AxisRef>::new())],
                vec![AxisRef::sub("b", 1, 2)],
            ),
        );
    }

    #[test]
    fn test_global_sharding() {
        let global = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"]), DimensionSharding::open(["b"])]);
        let local = TensorSharding::new("mesh", vec![DimensionSharding::open(["b"]), DimensionSharding::open(["b"])]);
        assert_eq!(
            global_sharding(&global, &local, manual_axes().as_slice()).to_string(),
            r#"<@mesh, [{"a", "b", ?}, {"b", ?}]>"#,
        );
    }

    #[test]
    fn test_local_shape() {
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a", "b"]), DimensionSharding::replicated()]);
        assert_eq!(local_shape(&[8, 8], &sharding, manual_axes().as_slice(), &mesh()), Ok(vec![4, 8]));
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"])]);
        assert!(matches!(
            local_shape(&[3], &sharding, manual_axes().as_slice(), &mesh()),
            Err(ShardyError::ManualAxisPadding { dimension: 0, dimension_size: 3, manual_size: 2 }),
        ));
    }

    fn manual_module(
        in_sharding: TensorSharding,
        local_type: TensorType,
        manual_axes: Vec<String>,
    ) -> Result<(Module, OperationId), crate::errors::Diagnostic> {
        let mut module = Module::new("main");
        module.declare_mesh("mesh", mesh())?;
        let global_type = TensorType::new([8, 8], ElementType::F32);
        let input = module.add_argument(global_type.clone(), None)?;
        let body = module.region(&[local_type]);
        let argument = module.block_arguments(body)[0];
        module.r#return(body, &[argument])?;
        let operation = module.manual_computation(
            module.body(),
            &[input],
            body,
            TensorShardingPerValue::new(vec![in_sharding.clone()]),
            TensorShardingPerValue::new(vec![in_sharding]),
            manual_axes,
            &[global_type],
        )?;
        Ok((module, operation))
    }

    #[test]
    fn test_manual_computation_verification() {
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a", "b"]), DimensionSharding::replicated()]);
        let local_type = TensorType::new([4, 8], ElementType::F32);
        let (module, operation) = manual_module(sharding.clone(), local_type.clone(), manual_axes()).unwrap();
        let body = module.operation(operation).regions()[0];
        let argument = module.block_arguments(body)[0];
        assert_eq!(
            module.sharding(argument),
            Some(TensorSharding::new("mesh", vec![DimensionSharding::closed(["b"]), DimensionSharding::replicated()])),
        );
        assert_eq!(enclosing_manual_computation(&module, body), Some(operation));
        assert_eq!(enclosing_manual_computation(&module, module.body()), None);

        // Wrong local type.
        let error = manual_module(sharding.clone(), TensorType::new([8, 8], ElementType::F32), manual_axes());
        assert_eq!(error.unwrap_err().kind(), ErrorKind::ShapeMismatch);

        // Manual axis after a free axis.
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["b", "a"]), DimensionSharding::replicated()]);
        let error = manual_module(sharding, local_type.clone(), manual_axes()).unwrap_err();
        assert!(matches!(error.error, ShardyError::ManualAxisAfterFreeAxis { dimension: 0, .. }));
        assert_eq!(error.kind(), ErrorKind::Ordering);

        // Unsorted manual axes.
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a", "b"]), DimensionSharding::replicated()]);
        let manual_axes = vec!["b".to_string(), "a".to_string()];
        let error = manual_module(sharding, TensorType::new([1, 8], ElementType::F32), manual_axes).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Ordering);
    }

    #[test]
    fn test_manual_computation_without_shardings() {
        let build = |manual_axes: Vec<String>| -> Result<OperationId, crate::errors::Diagnostic> {
            let mut module = Module::new("main");
            module.declare_mesh("mesh", mesh())?;
            let body = module.region(&[]);
            module.r#return(body, &[])?;
            let empty = TensorShardingPerValue::new(Vec::new());
            module.manual_computation(module.body(), &[], body, empty.clone(), empty, manual_axes, &[])
        };
        assert!(build(Vec::new()).is_ok());

        let error = build(vec!["c".to_string()]).unwrap_err();
        assert!(matches!(&error.error, ShardyError::ManualAxesWithoutMesh { axes } if axes == r#"{"c"}"#));
        assert_eq!(error.kind(), ErrorKind::SymbolResolution);
    }
}
