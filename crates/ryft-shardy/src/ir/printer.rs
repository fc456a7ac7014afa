use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};

use crate::axis::{AxisRef, render_axis_list, render_axis_lists};
use crate::mesh::escape_shardy_string;
use crate::sharding::{TensorSharding, TensorShardingPerValue};

use super::{BlockId, Module, OperationId, OperationKind, SHARDING_ATTRIBUTE, ValueId};

/// Printed names of the values of a [`Module`], assigned the way MLIR numbers SSA values: block arguments are named
/// `%argN` and operation results `%N` (one number per operation, with `%N#i` for the `i`-th result of multi-result
/// operations). The numbering of each nested region continues from the counters at the end of its enclosing region,
/// and sibling regions start from the same counters.
struct ValueNames {
    names: HashMap<ValueId, String>,
    definitions: HashMap<OperationId, String>,
}

impl ValueNames {
    fn new(module: &Module) -> Self {
        let mut names = Self { names: HashMap::new(), definitions: HashMap::new() };
        names.number_block(module, module.body, 0, 0);
        names
    }

    fn number_block(&mut self, module: &Module, block: BlockId, next_argument: usize, next_result: usize) {
        let mut next_argument = next_argument;
        let mut next_result = next_result;
        for argument in module.block_arguments(block) {
            self.names.insert(*argument, format!("%arg{next_argument}"));
            next_argument += 1;
        }
        for operation in module.block_operations(block) {
            let results = module.operation(*operation).results();
            match results.len() {
                0 => {}
                1 => {
                    self.names.insert(results[0], format!("%{next_result}"));
                    self.definitions.insert(*operation, format!("%{next_result}"));
                    next_result += 1;
                }
                count => {
                    for (index, result) in results.iter().enumerate() {
                        self.names.insert(*result, format!("%{next_result}#{index}"));
                    }
                    self.definitions.insert(*operation, format!("%{next_result}:{count}"));
                    next_result += 1;
                }
            }
        }
        for operation in module.block_operations(block) {
            for region in module.operation(*operation).regions() {
                self.number_block(module, *region, next_argument, next_result);
            }
        }
    }

    fn name(&self, value: ValueId) -> &str {
        self.names.get(&value).map(String::as_str).unwrap_or("%<unknown>")
    }

    fn list(&self, values: &[ValueId]) -> String {
        values.iter().map(|value| self.name(*value)).collect::<Vec<_>>().join(", ")
    }
}

fn type_list(module: &Module, values: &[ValueId]) -> String {
    values.iter().map(|value| module.r#type(*value).to_string()).collect::<Vec<_>>().join(", ")
}

/// Renders result types the way MLIR function types do: a single type is printed bare and any other number of types
/// is parenthesized.
fn result_types(module: &Module, values: &[ValueId]) -> String {
    match values {
        [value] => module.r#type(*value).to_string(),
        values => format!("({})", type_list(module, values)),
    }
}

fn function_type(module: &Module, operands: &[ValueId], results: &[ValueId]) -> String {
    format!("({}) -> {}", type_list(module, operands), result_types(module, results))
}

fn argument_list(module: &Module, names: &ValueNames, arguments: &[ValueId]) -> String {
    arguments
        .iter()
        .map(|argument| format!("{}: {}", names.name(*argument), module.r#type(*argument)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Returns the ` {sdy.sharding = #sdy.sharding_per_value<[...]>}` attribute dictionary for values that store their
/// shardings, or an empty string if none of them has one. Values without a sharding are printed as fully open on the
/// mesh of the first value that has one.
fn sharding_attribute(module: &Module, values: &[ValueId]) -> String {
    let shardings = values.iter().map(|value| module.values[value.0].sharding.as_ref()).collect::<Vec<_>>();
    let Some(mesh) = shardings.iter().flatten().next().map(|sharding| sharding.mesh().clone()) else {
        return String::new();
    };
    let shardings = shardings
        .into_iter()
        .zip(values)
        .map(|(sharding, value)| match sharding {
            Some(sharding) => sharding.clone(),
            None => TensorSharding::fully_open(mesh.clone(), module.r#type(*value).rank()),
        })
        .collect::<Vec<_>>();
    format!(" {{{SHARDING_ATTRIBUTE} = {}}}", TensorShardingPerValue::new(shardings).as_attribute())
}

fn manual_axes(axes: &[String]) -> String {
    render_axis_list(axes.iter().map(|axis| AxisRef::full(axis.as_str())).collect::<Vec<_>>().as_slice())
}

struct Printer<'m> {
    module: &'m Module,
    names: ValueNames,
}

impl Printer<'_> {
    fn print_block(&self, output: &mut String, block: BlockId, indent: usize) -> std::fmt::Result {
        for operation in self.module.block_operations(block) {
            self.print_operation(output, *operation, indent)?;
        }
        Ok(())
    }

    /// Prints a region body of a `sdy` region operation (i.e., `(%arg1: ...) {` followed by its operations and `}`).
    fn print_sdy_region(&self, output: &mut String, region: BlockId, indent: usize) -> std::fmt::Result {
        let arguments = argument_list(self.module, &self.names, self.module.block_arguments(region));
        writeln!(output, " ({arguments}) {{")?;
        self.print_block(output, region, indent + 2)?;
        write!(output, "{:indent$}}}", "")
    }

    /// Prints the regions of an operation from another dialect in generic form (i.e., `({ ^bb0(...): ... }, ...)`).
    fn print_generic_regions(&self, output: &mut String, regions: &[BlockId], indent: usize) -> std::fmt::Result {
        write!(output, " (")?;
        for (index, region) in regions.iter().enumerate() {
            if index > 0 {
                write!(output, ", ")?;
            }
            writeln!(output, "{{")?;
            let arguments = self.module.block_arguments(*region);
            if !arguments.is_empty() {
                writeln!(output, "{:indent$}^bb0({}):", "", argument_list(self.module, &self.names, arguments))?;
            }
            self.print_block(output, *region, indent + 2)?;
            write!(output, "{:indent$}}}", "")?;
        }
        write!(output, ")")
    }

    fn print_operation(&self, output: &mut String, operation: OperationId, indent: usize) -> std::fmt::Result {
        let module = self.module;
        let data = module.operation(operation);
        let operands = data.operands();
        let results = data.results();
        write!(output, "{:indent$}", "")?;
        if let Some(definition) = self.names.definitions.get(&operation) {
            write!(output, "{definition} = ")?;
        }
        let input = || self.names.name(operands[0]);
        let input_type = || module.r#type(operands[0]);
        match data.kind() {
            OperationKind::ShardingConstraint { sharding } | OperationKind::Reshard { sharding } => {
                write!(output, "{} {} {sharding} : {}", data.mnemonic(), input(), input_type())?;
            }
            OperationKind::ShardingGroup { group_id } => {
                write!(output, "sdy.sharding_group {} group_id={group_id} : {}", input(), input_type())?;
            }
            OperationKind::AllGather(all_gather) => {
                let axes = render_axis_lists(all_gather.gathering_axes.as_slice());
                let out = &all_gather.out_sharding;
                write!(output, "sdy.all_gather {axes} {} out_sharding={out} : {}", input(), input_type())?;
            }
            OperationKind::AllSlice(all_slice) => {
                let axes = render_axis_lists(all_slice.slicing_axes.as_slice());
                let out = &all_slice.out_sharding;
                write!(output, "sdy.all_slice {axes} {} out_sharding={out} : {}", input(), input_type())?;
            }
            OperationKind::AllToAll(all_to_all) => {
                let params = all_to_all.params.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                let out = &all_to_all.out_sharding;
                write!(output, "sdy.all_to_all [{params}] {} out_sharding={out} : {}", input(), input_type())?;
            }
            OperationKind::CollectivePermute(permute) => {
                let out = &permute.out_sharding;
                write!(output, "sdy.collective_permute {} out_sharding={out} : {}", input(), input_type())?;
            }
            OperationKind::AllReduce(all_reduce) => {
                let axes = render_axis_list(all_reduce.reduction_axes.as_slice());
                let out = &all_reduce.out_sharding;
                write!(output, "sdy.all_reduce {axes} {} out_sharding={out} : {}", input(), input_type())?;
            }
            OperationKind::ReduceScatter(reduce_scatter) => {
                let axes = render_axis_lists(reduce_scatter.reduce_scatter_axes.as_slice());
                let out = &reduce_scatter.out_sharding;
                write!(output, "sdy.reduce_scatter {axes} {} out_sharding={out} : {}", input(), input_type())?;
            }
            OperationKind::DataFlowEdge { sharding } => {
                write!(output, "sdy.data_flow_edge {}", input())?;
                if let Some(sharding) = sharding {
                    write!(output, " sharding={sharding}")?;
                }
                write!(output, " : {}", input_type())?;
            }
            OperationKind::PropagationBarrier { allowed_direction } => {
                let attribute = sharding_attribute(module, results);
                write!(
                    output,
                    "sdy.propagation_barrier {} allowed_direction={allowed_direction}{attribute} : {}",
                    input(),
                    input_type(),
                )?;
            }
            OperationKind::Constant { value } => {
                let attribute = sharding_attribute(module, results);
                write!(output, "sdy.constant{attribute} {value} : {}", module.r#type(results[0]))?;
            }
            OperationKind::Return => {
                let parent = module.block_parent(data.block());
                match parent.map(|parent| module.operation(parent).kind()) {
                    None => {
                        write!(output, "return")?;
                        if !operands.is_empty() {
                            write!(output, " {} : {}", self.names.list(operands), type_list(module, operands))?;
                        }
                    }
                    Some(OperationKind::Generic(generic)) => {
                        write!(
                            output,
                            "\"{}.return\"({}) : ({}) -> ()",
                            generic.dialect(),
                            self.names.list(operands),
                            type_list(module, operands),
                        )?;
                    }
                    Some(_) => {
                        write!(output, "sdy.return")?;
                        if !operands.is_empty() {
                            write!(output, " {} : {}", self.names.list(operands), type_list(module, operands))?;
                        }
                    }
                }
            }
            OperationKind::ManualComputation(computation) => {
                write!(
                    output,
                    "sdy.manual_computation({}) in_shardings={} out_shardings={} manual_axes={}",
                    self.names.list(operands),
                    computation.in_shardings,
                    computation.out_shardings,
                    manual_axes(computation.manual_axes.as_slice()),
                )?;
                self.print_sdy_region(output, data.regions()[0], indent)?;
                write!(output, " : {}", function_type(module, operands, results))?;
            }
            OperationKind::NamedComputation(computation) => {
                let name = escape_shardy_string(computation.name.as_str());
                write!(output, "sdy.named_computation<\"{name}\">({})", self.names.list(operands))?;
                if let Some(in_shardings) = &computation.in_shardings {
                    write!(output, " in_shardings={in_shardings}")?;
                }
                if let Some(out_shardings) = &computation.out_shardings {
                    write!(output, " out_shardings={out_shardings}")?;
                }
                self.print_sdy_region(output, data.regions()[0], indent)?;
                write!(output, " : {}", function_type(module, operands, results))?;
            }
            OperationKind::Generic(generic) => {
                write!(output, "\"{}\"({})", generic.name, self.names.list(operands))?;
                if !data.regions().is_empty() {
                    self.print_generic_regions(output, data.regions(), indent)?;
                }
                let attribute = sharding_attribute(module, results);
                write!(output, "{attribute} : {}", function_type(module, operands, results))?;
            }
        }
        writeln!(output)
    }
}

impl Display for Module {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        let printer = Printer { module: self, names: ValueNames::new(self) };
        let mut output = String::new();
        writeln!(output, "module {{")?;
        for (mesh_name, mesh) in self.meshes.iter() {
            writeln!(output, "  sdy.mesh @{mesh_name} = {mesh}")?;
        }
        let arguments = self
            .block_arguments(self.body)
            .iter()
            .map(|argument| {
                let mut rendered = format!("{}: {}", printer.names.name(*argument), self.r#type(*argument));
                if let Some(sharding) = &self.values[argument.0].sharding {
                    rendered.push_str(format!(" {{{SHARDING_ATTRIBUTE} = {}}}", sharding.as_attribute()).as_str());
                }
                rendered
            })
            .collect::<Vec<_>>()
            .join(", ");
        write!(output, "  func.func @{}({arguments})", self.function_name)?;
        let returned = self.terminator(self.body).map(|terminator| self.operation(terminator).operands()).unwrap_or(&[]);
        if !returned.is_empty() {
            write!(output, " -> {}", result_types(self, returned))?;
        }
        writeln!(output, " {{")?;
        printer.print_block(&mut output, self.body, 4)?;
        writeln!(output, "  }}")?;
        writeln!(output, "}}")?;
        formatter.write_str(output.as_str())
    }
}
