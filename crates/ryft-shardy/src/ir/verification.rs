use std::collections::HashSet;

use crate::errors::{Diagnostic, ShardyError};
use crate::groups::ShardingGroups;
use crate::manual::verify_manual_computation;
use crate::sharding::{TensorSharding, TensorShardingPerValue};
use crate::types::TensorType;

use super::{BlockId, Module, Operation, OperationId, OperationKind, ValueDefinition, ValueId};

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

impl Module {
    /// Checks the invariants of a single operation that do not depend on the rest of the module (beyond the types and
    /// shardings of its operands).
    pub(crate) fn verify_operation(&self, operation: OperationId) -> Result<(), ShardyError> {
        let data = &self.operations[operation.0];
        match &data.kind {
            OperationKind::ShardingConstraint { sharding } | OperationKind::Reshard { sharding } => {
                let r#type = self.verify_unary(data)?;
                sharding.validate(r#type.shape(), &self.meshes)
            }
            OperationKind::ShardingGroup { .. } => {
                check_arity("operands", 1, data.operands.len())?;
                check_arity("results", 0, data.results.len())
            }
            OperationKind::DataFlowEdge { sharding } => {
                let r#type = self.verify_unary(data)?;
                let owner = data.operands[0];
                let owner_operation = self.defining_operation(owner);
                let is_valid_owner = owner_operation.is_some_and(|owner_operation| {
                    let owner_operation = &self.operations[owner_operation.0];
                    matches!(owner_operation.kind, OperationKind::Generic(_)) && !owner_operation.regions.is_empty()
                });
                if !is_valid_owner {
                    let owner = match owner_operation {
                        Some(owner_operation) => format!("a result of '{}'", self.operations[owner_operation.0].mnemonic()),
                        None => "a block argument".to_string(),
                    };
                    return Err(ShardyError::InvalidDataFlowEdgeOwner { owner });
                }
                match sharding {
                    Some(sharding) => sharding.validate(r#type.shape(), &self.meshes),
                    None => Ok(()),
                }
            }
            OperationKind::PropagationBarrier { allowed_direction } => {
                self.verify_unary(data)?;
                if allowed_direction.allows_forward() && allowed_direction.allows_backward() {
                    return Err(ShardyError::BothDirectionBarrier);
                }
                Ok(())
            }
            OperationKind::Constant { .. } => {
                check_arity("operands", 0, data.operands.len())?;
                check_arity("results", 1, data.results.len())
            }
            OperationKind::Return => check_arity("results", 0, data.results.len()),
            OperationKind::Generic(generic) => {
                if generic.elementwise {
                    let mut types = data.operands.iter().chain(data.results.iter()).map(|value| self.r#type(*value));
                    if let Some(first) = types.next() {
                        for (index, r#type) in types.enumerate() {
                            if r#type.shape() != first.shape() {
                                let what = format!("element-wise value #{}", index + 1);
                                return Err(ShardyError::TypeMismatch {
                                    what,
                                    expected: first.to_string(),
                                    actual: r#type.to_string(),
                                });
                            }
                        }
                    }
                }
                Ok(())
            }
            OperationKind::ManualComputation(_) => verify_manual_computation(self, operation),
            OperationKind::NamedComputation(computation) => {
                check_arity("regions", 1, data.regions.len())?;
                let body = data.regions[0];
                let arguments = self.block_arguments(body);
                check_arity("block arguments", data.operands.len(), arguments.len())?;
                for (index, (operand, argument)) in data.operands.iter().zip(arguments).enumerate() {
                    check_type(format!("block argument #{index}"), self.r#type(*operand), self.r#type(*argument))?;
                }
                let terminator = self.terminator(body).ok_or(ShardyError::MissingTerminator)?;
                let returned = self.operations[terminator.0].operands.as_slice();
                check_arity("returned values", data.results.len(), returned.len())?;
                for (index, (result, value)) in data.results.iter().zip(returned).enumerate() {
                    check_type(format!("returned value #{index}"), self.r#type(*result), self.r#type(*value))?;
                }
                self.verify_sharding_per_value("in_shardings", computation.in_shardings.as_ref(), arguments)?;
                self.verify_sharding_per_value("out_shardings", computation.out_shardings.as_ref(), &data.results)
            }
            kind => match kind.as_collective() {
                Some(collective) => {
                    let r#type = self.verify_unary(data)?;
                    let out = collective.out_sharding();
                    out.validate(r#type.shape(), &self.meshes)?;
                    let operand = match self.sharding(data.operands[0]) {
                        Some(operand) => operand,
                        None if collective.allows_missing_input_sharding() => {
                            TensorSharding::fully_replicated(out.mesh().clone(), r#type.rank())
                        }
                        None => return Err(ShardyError::MissingOperandSharding),
                    };
                    let operand_mesh = self.meshes.resolve(operand.mesh())?;
                    let out_mesh = self.meshes.resolve(out.mesh())?;
                    if !collective.allows_different_meshes() && operand_mesh != out_mesh {
                        return Err(ShardyError::IncompatibleMeshes {
                            lhs: operand.mesh().to_string(),
                            rhs: out.mesh().to_string(),
                        });
                    }
                    collective.verify_out_sharding(&operand, operand_mesh, out_mesh)
                }
                None => Ok(()),
            },
        }
    }

    /// Checks that `operation` has a single operand and a single result of the same type, and returns that type.
    fn verify_unary<'m>(&'m self, operation: &Operation) -> Result<&'m TensorType, ShardyError> {
        check_arity("operands", 1, operation.operands.len())?;
        check_arity("results", 1, operation.results.len())?;
        let input_type = self.r#type(operation.operands[0]);
        check_type("result".to_string(), input_type, self.r#type(operation.results[0]))?;
        Ok(input_type)
    }

    fn verify_sharding_per_value(
        &self,
        what: &str,
        shardings: Option<&TensorShardingPerValue>,
        values: &[ValueId],
    ) -> Result<(), ShardyError> {
        let Some(shardings) = shardings else { return Ok(()) };
        check_arity(what, values.len(), shardings.len())?;
        for (value, sharding) in values.iter().zip(shardings.shardings()) {
            sharding.validate(self.r#type(*value).shape(), &self.meshes)?;
        }
        Ok(())
    }

    /// Verifies the whole module:
    ///
    ///   - every block (including the entry body) ends with its terminator, and returns appear nowhere else,
    ///   - every live operation satisfies its local invariants,
    ///   - every operand is defined before its use in the same block or in an enclosing one, where operations whose
    ///     regions are isolated from above (i.e., manual and named computations) only see their block arguments,
    ///   - every data-flow edge is the only user of its owner,
    ///   - sharding groups do not cross manual computation boundaries,
    ///   - every sharding attached directly to a value is valid for its type.
    pub fn verify(&self) -> Result<(), Diagnostic> {
        if self.terminator(self.body).is_none() {
            return Err(Diagnostic::module(ShardyError::MissingTerminator));
        }
        self.verify_block(self.body, &HashSet::new())?;
        for operation in self.walk() {
            if let OperationKind::DataFlowEdge { .. } = self.operations[operation.0].kind {
                let owner = self.operations[operation.0].operands[0];
                if self.uses(owner) != vec![(operation, 0)] {
                    let error = ShardyError::DataFlowEdgeOwnerHasOtherUsers { owner: owner.to_string() };
                    return Err(self.operation_diagnostic(operation, error));
                }
            }
        }
        ShardingGroups::build(self)?;
        for (index, value) in self.values.iter().enumerate() {
            let Some(sharding) = &value.sharding else { continue };
            if let ValueDefinition::OperationResult { operation, .. } = value.definition {
                if self.operations[operation.0].erased {
                    continue;
                }
            }
            sharding
                .validate(value.r#type.shape(), &self.meshes)
                .map_err(|error| self.value_diagnostic(ValueId::new(index), error))?;
        }
        Ok(())
    }

    fn verify_block(&self, block: BlockId, outer: &HashSet<ValueId>) -> Result<(), Diagnostic> {
        let mut visible = outer.clone();
        visible.extend(self.blocks[block.0].arguments.iter().copied());
        let operations = self.blocks[block.0].operations.as_slice();
        for (position, operation) in operations.iter().enumerate() {
            let data = &self.operations[operation.0];
            if matches!(data.kind, OperationKind::Return) != (position + 1 == operations.len()) {
                return Err(self.operation_diagnostic(*operation, ShardyError::MissingTerminator));
            }
            if let Some(operand) = data.operands.iter().find(|operand| !visible.contains(operand)) {
                let error = ShardyError::ValueNotInScope { value: operand.to_string() };
                return Err(self.operation_diagnostic(*operation, error));
            }
            self.verify_operation(*operation).map_err(|error| self.operation_diagnostic(*operation, error))?;
            let region_outer = if data.kind.is_isolated_from_above() { HashSet::new() } else { visible.clone() };
            for region in &data.regions {
                self.verify_block(*region, &region_outer)?;
            }
            visible.extend(data.results.iter().copied());
        }
        Ok(())
    }

    /// Verifies the module like [`Module::verify`] and additionally checks that it no longer contains any of the
    /// operations that only exist to guide propagation (i.e., sharding constraints and sharding groups).
    pub fn verify_exported(&self) -> Result<(), Diagnostic> {
        self.verify()?;
        for operation in self.walk() {
            if matches!(
                self.operations[operation.0].kind,
                OperationKind::ShardingConstraint { .. } | OperationKind::ShardingGroup { .. },
            ) {
                return Err(self.operation_diagnostic(operation, ShardyError::UnexpectedShardingConstraint));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::axis::AxisRef;
    use crate::collectives::AllToAllParam;
    use crate::errors::ErrorKind;
    use crate::ir::{AllowedDirection, GenericOperation};
    use crate::mesh::{Mesh, MeshAxis};
    use crate::sharding::DimensionSharding;
    use crate::types::ElementType;

    use super::*;

    fn test_module() -> Module {
        let mut module = Module::new("main");
        let mesh = Mesh::new(vec![
            MeshAxis::new("a", 2).unwrap(),
            MeshAxis::new("b", 2).unwrap(),
            MeshAxis::new("c", 2).unwrap(),
        ])
        .unwrap();
        module.declare_mesh("mesh", mesh).unwrap();
        module
    }

    fn tensor_8x8() -> TensorType {
        TensorType::new([8, 8], ElementType::F32)
    }

    fn sharding(dimensions: Vec<DimensionSharding>) -> TensorSharding {
        TensorSharding::new("mesh", dimensions)
    }

    #[test]
    fn test_collective_verification() {
        let mut module = test_module();
        let body = module.body();
        let operand_sharding = sharding(vec![DimensionSharding::closed(["a", "b"]), DimensionSharding::closed(["c"])]);
        let input = module.add_argument(tensor_8x8(), Some(operand_sharding)).unwrap();

        let gathered = sharding(vec![DimensionSharding::closed(["a"]), DimensionSharding::closed(["c"])]);
        let axes = vec![vec![AxisRef::full("b")], Vec::new()];
        assert!(module.all_gather(body, input, axes.clone(), gathered.clone()).is_ok());

        let error = module.all_gather(body, input, axes, sharding(vec![
            DimensionSharding::closed(["a", "b"]),
            DimensionSharding::closed(["c"]),
        ]));
        assert_eq!(error.unwrap_err().kind(), ErrorKind::OutShardingMismatch);

        let error = module.all_gather(body, input, vec![vec![AxisRef::full("a")], Vec::new()], gathered);
        assert_eq!(error.unwrap_err().kind(), ErrorKind::Ordering);

        let params = vec![AllToAllParam::new(["b"], 0, 1)];
        let out = sharding(vec![DimensionSharding::closed(["a"]), DimensionSharding::closed(["c", "b"])]);
        assert!(module.all_to_all(body, input, params, out).is_ok());

        // Missing operand shardings are only accepted by some collectives.
        let unsharded = module.add_argument(tensor_8x8(), None).unwrap();
        let sliced = sharding(vec![DimensionSharding::closed(["a"]), DimensionSharding::replicated()]);
        let slicing_axes = vec![vec![AxisRef::full("a")], Vec::new()];
        assert!(module.all_slice(body, unsharded, slicing_axes, sliced).is_ok());
        let replicated = TensorSharding::fully_replicated("mesh", 2);
        let error = module.all_gather(body, unsharded, vec![Vec::new(), Vec::new()], replicated.clone()).unwrap_err();
        assert!(matches!(error.error, ShardyError::MissingOperandSharding));
        assert!(module.all_reduce(body, unsharded, vec![AxisRef::full("b")], replicated).is_ok());
    }

    #[test]
    fn test_all_reduce_verification() {
        let mut module = test_module();
        let body = module.body();
        let operand_sharding = sharding(vec![DimensionSharding::closed(["a"]), DimensionSharding::replicated()]);
        let input = module.add_argument(tensor_8x8(), Some(operand_sharding.clone())).unwrap();
        assert!(module.all_reduce(body, input, vec![AxisRef::full("b")], operand_sharding.clone()).is_ok());
        let error = module.all_reduce(body, input, vec![AxisRef::full("a")], operand_sharding.clone()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AxisOverlap);
        let error = module
            .all_reduce(body, input, vec![AxisRef::full("c"), AxisRef::full("b")], operand_sharding)
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Ordering);
    }

    #[test]
    fn test_barrier_and_edge_verification() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();
        assert!(module.propagation_barrier(body, input, AllowedDirection::Forward).is_ok());
        let error = module.propagation_barrier(body, input, AllowedDirection::Both).unwrap_err();
        assert!(matches!(error.error, ShardyError::BothDirectionBarrier));

        let add = module
            .generic(body, GenericOperation::elementwise("stablehlo.add"), &[input, input], &[tensor_8x8()], &[])
            .unwrap();
        let sum = module.operation(add).result(0).unwrap();
        let error = module.data_flow_edge(body, sum, None).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidOperation);
        assert_eq!(
            error.to_string(),
            "'sdy.data_flow_edge' op #2: data_flow_edge input must be a result of a structural operation from another \
             dialect, got a result of 'stablehlo.add'",
        );
    }

    #[test]
    fn test_data_flow_edge_must_be_only_user() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();
        let region = module.region(&[tensor_8x8()]);
        let argument = module.block_arguments(region)[0];
        module.r#return(region, &[argument]).unwrap();
        let while_op = module
            .generic(body, GenericOperation::new("stablehlo.while"), &[input], &[tensor_8x8()], &[region])
            .unwrap();
        let result = module.operation(while_op).result(0).unwrap();
        let edge = module.data_flow_edge(body, result, None).unwrap();
        module.r#return(body, &[result, edge]).unwrap();
        let error = module.verify().unwrap_err();
        assert!(matches!(error.error, ShardyError::DataFlowEdgeOwnerHasOtherUsers { .. }));
    }

    #[test]
    fn test_scope_verification() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();

        // Named computations are isolated from above.
        let region = module.region(&[tensor_8x8()]);
        module.r#return(region, &[input]).unwrap();
        let named = module.named_computation(body, "foo", &[input], region, None, None).unwrap();
        let result = module.operation(named).result(0).unwrap();
        module.r#return(body, &[result]).unwrap();
        let error = module.verify().unwrap_err();
        assert!(matches!(error.error, ShardyError::ValueNotInScope { .. }));

        // Regions of other operations can see values from the enclosing block.
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();
        let region = module.region(&[]);
        module.r#return(region, &[input]).unwrap();
        let case = module
            .generic(body, GenericOperation::new("stablehlo.case"), &[], &[tensor_8x8()], &[region])
            .unwrap();
        let result = module.operation(case).result(0).unwrap();
        module.r#return(body, &[result]).unwrap();
        assert!(module.verify().is_ok());
    }

    #[test]
    fn test_missing_entry_terminator() {
        let mut module = test_module();
        module.add_argument(tensor_8x8(), None).unwrap();
        assert!(matches!(module.verify().unwrap_err().error, ShardyError::MissingTerminator));
    }

    #[test]
    fn test_named_computation_verification() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();
        let region = module.region(&[TensorType::new([8, 4], ElementType::F32)]);
        let argument = module.block_arguments(region)[0];
        module.r#return(region, &[argument]).unwrap();
        let error = module.named_computation(body, "foo", &[input], region, None, None).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ShapeMismatch);

        let region = module.region(&[tensor_8x8()]);
        let argument = module.block_arguments(region)[0];
        module.r#return(region, &[argument]).unwrap();
        let in_shardings = TensorShardingPerValue::new(vec![
            sharding(vec![DimensionSharding::closed(["a"]), DimensionSharding::replicated()]),
            sharding(vec![DimensionSharding::closed(["b"]), DimensionSharding::replicated()]),
        ]);
        let error = module.named_computation(body, "foo", &[input], region, Some(in_shardings), None).unwrap_err();
        assert!(matches!(error.error, ShardyError::ArityMismatch { expected: 1, actual: 2, .. }));
        assert!(module.named_computation(body, "foo", &[input], region, None, None).is_ok());
    }

    #[test]
    fn test_verify_exported() {
        let mut module = test_module();
        let body = module.body();
        let input = module.add_argument(tensor_8x8(), None).unwrap();
        module.sharding_group(body, input, 0).unwrap();
        module.r#return(body, &[input]).unwrap();
        assert!(module.verify().is_ok());
        let error = module.verify_exported().unwrap_err();
        assert!(matches!(error.error, ShardyError::UnexpectedShardingConstraint));
    }
}
