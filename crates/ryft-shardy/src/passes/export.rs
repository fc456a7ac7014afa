use tracing::{debug, trace};

use crate::errors::Diagnostic;
use crate::ir::{Module, OperationKind};

use super::{Pass, is_satisfied_by};

/// Removes everything that only exists to guide propagation:
///
///   - every `sdy.data_flow_edge` is sunk, i.e., its sharding is written to its owner and targets (through the
///     target sharding transform of the structural operation) and the edge itself is erased,
///   - every `sdy.sharding_constraint` is erased if its result is unused or its input is already sharded along the
///     same axes, and is turned into a `sdy.reshard` otherwise,
///   - every `sdy.sharding_group` is erased,
///   - every `sdy.propagation_barrier` is erased, unless its result ended up with a different sharding than its
///     input, in which case it is turned into a `sdy.reshard`.
///
/// The result satisfies [`Module::verify_exported`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportPass;

impl Pass for ExportPass {
    fn name(&self) -> &'static str {
        "sdy-export"
    }

    fn run(&self, module: &mut Module) -> Result<bool, Diagnostic> {
        let mut edge_count = 0;
        for operation in module.walk() {
            if matches!(module.operation(operation).kind(), OperationKind::DataFlowEdge { .. }) {
                module.sink_data_flow_edge(operation);
                edge_count += 1;
            }
        }

        let mut reshard_count = 0;
        let mut erased_count = 0;
        for operation in module.walk() {
            let data = module.operation(operation);
            match data.kind() {
                OperationKind::ShardingConstraint { sharding } => {
                    let (input, result) = (data.operands()[0], data.results()[0]);
                    if !module.has_uses(result) || is_satisfied_by(module.sharding(input).as_ref(), sharding) {
                        module.replace_all_uses_with(result, input);
                        module.erase_operation(operation);
                        erased_count += 1;
                    } else {
                        let kind = OperationKind::Reshard { sharding: sharding.clone() };
                        trace!(operation = operation.index(), "replacing sharding constraint with reshard");
                        module.replace_kind(operation, kind);
                        reshard_count += 1;
                    }
                }
                OperationKind::ShardingGroup { .. } => {
                    module.erase_operation(operation);
                    erased_count += 1;
                }
                OperationKind::PropagationBarrier { .. } => {
                    let (input, result) = (data.operands()[0], data.results()[0]);
                    match module.sharding(result) {
                        Some(sharding) if !is_satisfied_by(module.sharding(input).as_ref(), &sharding) => {
                            trace!(operation = operation.index(), "replacing propagation barrier with reshard");
                            module.replace_kind(operation, OperationKind::Reshard { sharding });
                            reshard_count += 1;
                        }
                        _ => {
                            module.replace_all_uses_with(result, input);
                            module.erase_operation(operation);
                            erased_count += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        debug!(edge_count, reshard_count, erased_count, "exported module");
        Ok(edge_count + reshard_count + erased_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use crate::ir::{AllowedDirection, GenericOperation};
    use crate::mesh::{Mesh, MeshAxis};
    use crate::passes::{ImportPass, PropagationPass};
    use crate::sharding::{DimensionSharding, TensorSharding};
    use crate::types::{ElementType, TensorType};

    use super::*;

    fn test_module() -> Module {
        let mut module = Module::new("main");
        let mesh = Mesh::new(vec![MeshAxis::new("a", 2).unwrap(), MeshAxis::new("b", 2).unwrap()]).unwrap();
        module.declare_mesh("mesh", mesh).unwrap();
        module
    }

    fn tensor_8() -> TensorType {
        TensorType::new([8], ElementType::F32)
    }

    #[test]
    fn test_export_constraints_groups_and_barriers() {
        let mut module = test_module();
        let body = module.body();
        let a_sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"])]);
        let b_sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["b"])]);
        let x = module.add_argument(tensor_8(), Some(a_sharding.clone())).unwrap();
        let same = module.sharding_constraint(body, x, a_sharding).unwrap();
        let different = module.sharding_constraint(body, same, b_sharding).unwrap();
        module.sharding_group(body, different, 0).unwrap();
        let barrier = module.propagation_barrier(body, different, AllowedDirection::Forward).unwrap();
        module.r#return(body, &[barrier]).unwrap();

        assert_eq!(ExportPass.run(&mut module), Ok(true));
        assert!(module.verify_exported().is_ok());
        assert_eq!(
            module.to_string(),
            indoc! {r#"
                module {
                  sdy.mesh @mesh = <["a"=2, "b"=2]>
                  func.func @main(%arg0: tensor<8xf32> {sdy.sharding = #sdy.sharding<@mesh, [{"a"}]>}) -> tensor<8xf32> {
                    %0 = sdy.reshard %arg0 <@mesh, [{"b"}]> : tensor<8xf32>
                    return %0 : tensor<8xf32>
                  }
                }
            "#},
        );
        assert_eq!(ExportPass.run(&mut module), Ok(false));
    }

    #[test]
    fn test_export_sinks_data_flow_edges() {
        let mut module = test_module();
        let body = module.body();
        let a_sharding = TensorSharding::new("mesh", vec![DimensionSharding::open(["a"])]);
        let x = module.add_argument(tensor_8(), Some(a_sharding.clone())).unwrap();
        let region = module.region(&[tensor_8()]);
        let argument = module.block_arguments(region)[0];
        module.r#return(region, &[argument]).unwrap();
        let while_op = module
            .generic(body, GenericOperation::new("stablehlo.while"), &[x], &[tensor_8()], &[region])
            .unwrap();
        let result = module.operation(while_op).result(0).unwrap();
        module.r#return(body, &[result]).unwrap();

        ImportPass.run(&mut module).unwrap();
        PropagationPass::default().run(&mut module).unwrap();
        assert_eq!(module.data_flow_edges().len(), 1);
        assert_eq!(ExportPass.run(&mut module), Ok(true));
        assert!(module.data_flow_edges().iter().all(|edge| edge.edge_operation.is_none()));
        assert_eq!(module.sharding(result), Some(a_sharding.clone()));
        assert_eq!(module.sharding(argument), Some(a_sharding));
        assert_eq!(module.block_operations(body).len(), 2);
        assert!(module.verify_exported().is_ok());
    }
}
