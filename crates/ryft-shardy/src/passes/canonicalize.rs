use tracing::{debug, trace};

use crate::errors::Diagnostic;
use crate::ir::{Module, OperationId, OperationKind, ValueId};
use crate::sharding::TensorSharding;

use super::{Pass, is_satisfied_by};

/// Simplifies a [`Module`] until nothing changes anymore:
///
///   - collectives that are no-ops for the sharding of their operand are replaced by their operand,
///   - reshards whose input is already sharded along the target axes are replaced by their input,
///   - a reshard of a reshard reads directly from the inner input,
///   - reshards without uses are erased.
///
/// Constants are never merged since their shardings may differ.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CanonicalizePass;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Rewrite {
    ReplaceWithInput,
    Erase,
    BypassInnerReshard,
}

fn rewrite_for(module: &Module, operation: OperationId) -> Option<Rewrite> {
    let data = module.operation(operation);
    let kind = data.kind();
    if let Some(collective) = kind.as_collective() {
        let (input, result) = (data.operands()[0], data.results()[0]);
        let operand_sharding = match module.sharding(input) {
            Some(sharding) => sharding,
            // An unsharded input can only be forwarded to users that accept an unsharded operand.
            None if collective.allows_missing_input_sharding() && users_accept_missing_sharding(module, result) => {
                TensorSharding::fully_replicated(collective.out_sharding().mesh().clone(), module.r#type(input).rank())
            }
            None => return None,
        };
        return collective.is_identity(&operand_sharding).then_some(Rewrite::ReplaceWithInput);
    }
    let OperationKind::Reshard { sharding } = kind else { return None };
    let (input, result) = (data.operands()[0], data.results()[0]);
    if is_satisfied_by(module.sharding(input).as_ref(), sharding) {
        return Some(Rewrite::ReplaceWithInput);
    }
    if !module.has_uses(result) {
        return Some(Rewrite::Erase);
    }
    let inner = module.defining_operation(input)?;
    matches!(module.operation(inner).kind(), OperationKind::Reshard { .. }).then_some(Rewrite::BypassInnerReshard)
}

fn users_accept_missing_sharding(module: &Module, value: ValueId) -> bool {
    module.uses(value).into_iter().all(|(user, _)| {
        module
            .operation(user)
            .kind()
            .as_collective()
            .is_none_or(|collective| collective.allows_missing_input_sharding())
    })
}

impl Pass for CanonicalizePass {
    fn name(&self) -> &'static str {
        "sdy-canonicalize"
    }

    fn run(&self, module: &mut Module) -> Result<bool, Diagnostic> {
        let mut rewrite_count = 0;
        loop {
            let mut changed = false;
            for operation in module.walk() {
                if module.operation(operation).is_erased() {
                    continue;
                }
                let Some(rewrite) = rewrite_for(module, operation) else { continue };
                trace!(operation = operation.index(), ?rewrite, "canonicalizing operation");
                let input = module.operation(operation).operands()[0];
                let result = module.operation(operation).results()[0];
                match rewrite {
                    Rewrite::ReplaceWithInput => {
                        module.replace_all_uses_with(result, input);
                        module.erase_operation(operation);
                    }
                    Rewrite::Erase => module.erase_operation(operation),
                    Rewrite::BypassInnerReshard => {
                        if let Some(inner) = module.defining_operation(input) {
                            let inner_input = module.operation(inner).operands()[0];
                            module.set_operand(operation, 0, inner_input);
                        }
                    }
                }
                rewrite_count += 1;
                changed = true;
            }
            if !changed {
                break;
            }
        }
        debug!(rewrite_count, "canonicalized module");
        Ok(rewrite_count > 0)
    }
}
