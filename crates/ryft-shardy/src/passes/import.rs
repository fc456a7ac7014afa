use tracing::{debug, trace, warn};

use crate::errors::Diagnostic;
use crate::groups::ShardingGroups;
use crate::ir::{Module, OperationKind};

use super::Pass;

/// Prepares a [`Module`] for propagation:
///
///   - checks that the shardings that members of each sharding group already have agree with each other,
///   - moves the sharding of every dangling `sdy.sharding_constraint` (i.e., one whose result is unused) onto its
///     input (replacing any sharding that the input had) and erases the constraint,
///   - attaches a `sdy.data_flow_edge` to every edge owner of every structural operation from another dialect.
///
/// Dangling constraints whose input sharding cannot be replaced (e.g., because it is the result of a collective) are
/// left in place for [`ExportPass`](super::ExportPass) to deal with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportPass;

impl Pass for ImportPass {
    fn name(&self) -> &'static str {
        "sdy-import"
    }

    fn run(&self, module: &mut Module) -> Result<bool, Diagnostic> {
        ShardingGroups::build(module)?.check_consistent(module)?;

        let mut changed = false;
        for operation in module.walk() {
            let OperationKind::ShardingConstraint { sharding } = module.operation(operation).kind() else { continue };
            let result = module.operation(operation).results()[0];
            let input = module.operation(operation).operands()[0];
            if module.has_uses(result) {
                continue;
            }
            if !module.is_sharding_settable(input) {
                warn!(input = input.index(), "cannot move dangling sharding constraint onto its input");
                continue;
            }
            let sharding = sharding.clone();
            trace!(input = input.index(), sharding = %sharding, "moving dangling sharding constraint onto its input");
            module.set_sharding(input, sharding)?;
            module.erase_operation(operation);
            changed = true;
        }

        let edge_count = module.insert_data_flow_edges()?;
        debug!(edge_count, "inserted data-flow edges");
        Ok(changed || edge_count > 0)
    }
}
