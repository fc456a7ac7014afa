//! Module-wide registry of sharding groups.
//!
//! Every `sdy.sharding_group` operation adds its input to the group with its `group_id`. Values that end up in more
//! than one group transitively merge those groups, so the registry is built with a union-find over group ids. All
//! members of a group must have the same sharding once propagation is done.

use std::collections::HashMap;

use crate::errors::{Diagnostic, ShardyError};
use crate::ir::{Module, OperationId, OperationKind, ValueId};
use crate::manual::enclosing_manual_computation;

/// Sharding group after transitive merging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardingGroup {
    /// Smallest `group_id` among the merged groups.
    pub id: i64,

    /// Members of the group, in order of their first `sdy.sharding_group` operation.
    pub members: Vec<ValueId>,

    /// `sdy.sharding_group` operations that contributed to this group.
    pub operations: Vec<OperationId>,
}

/// Registry of the [`ShardingGroup`]s of a [`Module`]. This is a derived index that must be rebuilt whenever the
/// `sdy.sharding_group` operations of the module change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardingGroups {
    groups: Vec<ShardingGroup>,
    group_index_by_value: HashMap<ValueId, usize>,
}

fn find(parents: &mut HashMap<i64, i64>, group_id: i64) -> i64 {
    let parent = *parents.entry(group_id).or_insert(group_id);
    if parent == group_id {
        return group_id;
    }
    let root = find(parents, parent);
    parents.insert(group_id, root);
    root
}

fn union(parents: &mut HashMap<i64, i64>, lhs: i64, rhs: i64) {
    let lhs = find(parents, lhs);
    let rhs = find(parents, rhs);
    if lhs < rhs {
        parents.insert(rhs, lhs);
    } else if rhs < lhs {
        parents.insert(lhs, rhs);
    }
}

impl ShardingGroups {
    /// Builds the sharding groups of `module`, rejecting groups whose members are not all enclosed by the same
    /// `sdy.manual_computation` body (or all outside of any).
    pub fn build(module: &Module) -> Result<Self, Diagnostic> {
        let mut entries = Vec::new();
        for operation in module.walk() {
            if let OperationKind::ShardingGroup { group_id } = module.operation(operation).kind() {
                entries.push((operation, module.operation(operation).operands()[0], *group_id));
            }
        }

        let mut parents = HashMap::new();
        let mut first_group_id_by_value = HashMap::new();
        for (_, value, group_id) in &entries {
            find(&mut parents, *group_id);
            match first_group_id_by_value.get(value) {
                Some(first_group_id) => union(&mut parents, *first_group_id, *group_id),
                None => {
                    first_group_id_by_value.insert(*value, *group_id);
                }
            }
        }

        let mut groups: Vec<ShardingGroup> = Vec::new();
        let mut group_index_by_root = HashMap::new();
        let mut group_index_by_value = HashMap::new();
        for (operation, value, group_id) in entries {
            let root = find(&mut parents, group_id);
            let group_index = *group_index_by_root.entry(root).or_insert_with(|| {
                groups.push(ShardingGroup { id: root, members: Vec::new(), operations: Vec::new() });
                groups.len() - 1
            });
            let group = &mut groups[group_index];
            group.operations.push(operation);
            if !group.members.contains(&value) {
                group.members.push(value);
                group_index_by_value.insert(value, group_index);
            }
        }

        for group in &groups {
            let enclosing = |member: ValueId| enclosing_manual_computation(module, module.defining_block(member));
            let first = enclosing(group.members[0]);
            if let Some(member) = group.members.iter().find(|member| enclosing(**member) != first) {
                let operation = group
                    .operations
                    .iter()
                    .find(|operation| module.operation(**operation).operands()[0] == *member)
                    .copied()
                    .unwrap_or(group.operations[0]);
                let error = ShardyError::ShardingGroupCrossesManualComputation { group_id: group.id };
                return Err(module.operation_diagnostic(operation, error));
            }
        }

        Ok(Self { groups, group_index_by_value })
    }

    /// Returns all groups, ordered by their first `sdy.sharding_group` operation.
    pub fn groups(&self) -> &[ShardingGroup] {
        self.groups.as_slice()
    }

    /// Returns the group that `value` belongs to, if any.
    pub fn group_of(&self, value: ValueId) -> Option<&ShardingGroup> {
        self.group_index_by_value.get(&value).map(|index| &self.groups[*index])
    }

    /// Returns the number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns `true` if there are no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Checks that all members of each group that currently have a sharding agree on it.
    pub fn check_consistent(&self, module: &Module) -> Result<(), Diagnostic> {
        for group in &self.groups {
            let mut shardings = group.members.iter().filter_map(|member| module.sharding(*member));
            let Some(first) = shardings.next() else { continue };
            if let Some(other) = shardings.find(|other| *other != first) {
                let error = ShardyError::ShardingGroupConflict {
                    group_id: group.id,
                    sharding: first.to_string(),
                    other_sharding: other.to_string(),
                };
                return Err(module.operation_diagnostic(group.operations[0], error));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::errors::ErrorKind;
    use crate::mesh::{Mesh, MeshAxis};
    use crate::sharding::{DimensionSharding, TensorSharding, TensorShardingPerValue};
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
    fn test_transitive_group_merging() {
        let mut module = test_module();
        let body = module.body();
        let x = module.add_argument(tensor_8(), None).unwrap();
        let y = module.add_argument(tensor_8(), None).unwrap();
        let z = module.add_argument(tensor_8(), None).unwrap();
        let w = module.add_argument(tensor_8(), None).unwrap();
        module.sharding_group(body, x, 3).unwrap();
        module.sharding_group(body, y, 1).unwrap();
        module.sharding_group(body, x, 1).unwrap();
        module.sharding_group(body, z, 3).unwrap();
        module.sharding_group(body, w, 7).unwrap();
        let groups = ShardingGroups::build(&module).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.groups()[0].id, 1);
        assert_eq!(groups.groups()[0].members, vec![x, y, z]);
        assert_eq!(groups.group_of(z).map(|group| group.id), Some(1));
        assert_eq!(groups.group_of(w).map(|group| group.members.clone()), Some(vec![w]));
    }

    #[test]
    fn test_group_conflicts() {
        let mut module = test_module();
        let body = module.body();
        let x_sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"])]);
        let y_sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["b"])]);
        let x = module.add_argument(tensor_8(), Some(x_sharding)).unwrap();
        let y = module.add_argument(tensor_8(), Some(y_sharding)).unwrap();
        module.sharding_group(body, x, 0).unwrap();
        module.sharding_group(body, y, 0).unwrap();
        let groups = ShardingGroups::build(&module).unwrap();
        let error = groups.check_consistent(&module).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Propagation);
        assert_eq!(
            error.error.to_string(),
            r#"sharding group 0 contains values with different shardings: <@mesh, [{"a"}]> and <@mesh, [{"b"}]>"#,
        );
    }

    #[test]
    fn test_groups_cannot_cross_manual_computations() {
        let mut module = test_module();
        let body = module.body();
        let x = module.add_argument(tensor_8(), None).unwrap();
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(["a"])]);
        let region = module.region(&[TensorType::new([4], ElementType::F32)]);
        let argument = module.block_arguments(region)[0];
        module.sharding_group(region, argument, 0).unwrap();
        module.r#return(region, &[argument]).unwrap();
        module
            .manual_computation(
                body,
                &[x],
                region,
                TensorShardingPerValue::new(vec![sharding.clone()]),
                TensorShardingPerValue::new(vec![sharding]),
                vec!["a".to_string()],
                &[tensor_8()],
            )
            .unwrap();
        assert!(ShardingGroups::build(&module).is_ok());
        module.sharding_group(body, x, 0).unwrap();
        let error = ShardingGroups::build(&module).unwrap_err();
        assert!(matches!(error.error, ShardyError::ShardingGroupCrossesManualComputation { group_id: 0 }));
    }
}
