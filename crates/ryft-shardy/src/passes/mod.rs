//! Pass infrastructure and the sharding propagation pipeline.
//!
//! The pipeline that [`PassManager::with_options`] builds mirrors the usual `sdy` flow:
//!
//!   1. [`ImportPass`] (`sdy-import`): checks sharding groups, moves dangling sharding constraints onto their inputs,
//!      and attaches `sdy.data_flow_edge` operations to the edge owners of structural operations.
//!   2. [`PropagationPass`] (`sdy-propagate`): runs the worklist propagation to a fixpoint.
//!   3. [`ExportPass`] (`sdy-export`): sinks data-flow edge shardings onto their targets and removes the operations
//!      that only exist to guide propagation.
//!   4. [`CanonicalizePass`] (`sdy-canonicalize`, optional): removes identity collectives and redundant reshards.
//!
//! Refer to the [MLIR documentation](https://mlir.llvm.org/docs/PassManagement) for more information on the pass
//! manager design that this follows.

use std::fmt::{Debug, Display};

use tracing::{debug, info};

use crate::errors::Diagnostic;
use crate::ir::Module;
use crate::sharding::TensorSharding;

mod canonicalize;
mod export;
mod import;
mod propagation;

pub use canonicalize::CanonicalizePass;
pub use export::ExportPass;
pub use import::ImportPass;
pub use propagation::{PropagationOptions, PropagationPass};

/// Transformation over a [`Module`].
pub trait Pass: Debug {
    /// Returns the pipeline name of this [`Pass`] (e.g., `sdy-propagate`).
    fn name(&self) -> &'static str;

    /// Runs this [`Pass`] on `module`. Returns `true` if the module was changed.
    fn run(&self, module: &mut Module) -> Result<bool, Diagnostic>;
}

/// Configuration of the pipeline built by [`PassManager::with_options`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineOptions {
    /// [`PropagationOptions`] used by the [`PropagationPass`].
    pub propagation: PropagationOptions,

    /// If `true`, a [`CanonicalizePass`] runs at the end of the pipeline.
    pub canonicalize: bool,

    /// If `true`, the module is verified after every pass.
    pub verify_after_each_pass: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self { propagation: PropagationOptions::default(), canonicalize: true, verify_after_each_pass: true }
    }
}

/// Schedules a sequence of [`Pass`]es over a [`Module`].
#[derive(Debug)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    verify_after_each_pass: bool,
}

impl PassManager {
    /// Creates a new empty [`PassManager`] that verifies the module after each pass.
    pub fn new() -> Self {
        Self { passes: Vec::new(), verify_after_each_pass: true }
    }

    /// Creates a [`PassManager`] for the full propagation pipeline configured by `options`.
    pub fn with_options(options: &PipelineOptions) -> Self {
        let mut pass_manager = Self::new();
        pass_manager.verify_after_each_pass = options.verify_after_each_pass;
        pass_manager.add_pass(ImportPass);
        pass_manager.add_pass(PropagationPass::new(options.propagation.clone()));
        pass_manager.add_pass(ExportPass);
        if options.canonicalize {
            pass_manager.add_pass(CanonicalizePass);
        }
        pass_manager
    }

    /// Adds `pass` to the end of the pipeline of this [`PassManager`].
    pub fn add_pass<P: Pass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    /// Enables or disables verification of the module after each [`Pass`].
    pub fn enable_verification(&mut self, enabled: bool) {
        self.verify_after_each_pass = enabled;
    }

    /// Returns the [`Pass`]es of this [`PassManager`], in order.
    pub fn passes(&self) -> &[Box<dyn Pass>] {
        self.passes.as_slice()
    }

    /// Runs all passes on `module`, in order. Stops at the first failing pass (or failing verification) and returns
    /// its [`Diagnostic`]. Returns `true` if any pass changed the module.
    pub fn run(&self, module: &mut Module) -> Result<bool, Diagnostic> {
        let mut changed = false;
        for pass in &self.passes {
            debug!(pass = pass.name(), "running pass");
            let pass_changed = pass.run(module)?;
            if self.verify_after_each_pass {
                module.verify()?;
            }
            info!(pass = pass.name(), changed = pass_changed, "finished pass");
            changed |= pass_changed;
        }
        Ok(changed)
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PassManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "builtin.module(")?;
        for (index, pass) in self.passes.iter().enumerate() {
            if index > 0 {
                write!(formatter, ", ")?;
            }
            write!(formatter, "{}", pass.name())?;
        }
        write!(formatter, ")")
    }
}

/// Returns `true` if a value whose sharding is `current` is already sharded as `sharding` requires (i.e., on the same
/// mesh and along the same dimension axes).
pub(crate) fn is_satisfied_by(current: Option<&TensorSharding>, sharding: &TensorSharding) -> bool {
    current.is_some_and(|current| current.mesh() == sharding.mesh() && current.has_equivalent_dimension_axes(sharding))
}

/// Runs the full propagation pipeline configured by `options` on `module`.
pub fn propagate_shardings(module: &mut Module, options: &PipelineOptions) -> Result<bool, Diagnostic> {
    PassManager::with_options(options).run(module)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::errors::ShardyError;

    use super::*;

    #[derive(Debug)]
    struct FailingPass;

    impl Pass for FailingPass {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&self, _module: &mut Module) -> Result<bool, Diagnostic> {
            Err(Diagnostic::module(ShardyError::MissingTerminator))
        }
    }

    #[test]
    fn test_pass_manager_display() {
        let pass_manager = PassManager::with_options(&PipelineOptions::default());
        assert_eq!(pass_manager.to_string(), "builtin.module(sdy-import, sdy-propagate, sdy-export, sdy-canonicalize)");
        let options = PipelineOptions { canonicalize: false, ..PipelineOptions::default() };
        assert_eq!(PassManager::with_options(&options).passes().len(), 3);
        assert_eq!(PassManager::new().to_string(), "builtin.module()");
    }

    #[test]
    fn test_pass_manager_stops_at_first_failure() {
        let mut pass_manager = PassManager::new();
        pass_manager.add_pass(FailingPass);
        pass_manager.add_pass(CanonicalizePass);
        let mut module = Module::new("main");
        let error = pass_manager.run(&mut module).unwrap_err();
        assert!(matches!(error.error, ShardyError::MissingTerminator));
    }

    #[test]
    fn test_pass_manager_verifies_after_each_pass() {
        // The entry body has no terminator, so verification fails after the first pass.
        let mut module = Module::new("main");
        let mut pass_manager = PassManager::new();
        pass_manager.add_pass(CanonicalizePass);
        assert!(pass_manager.run(&mut module).is_err());
        pass_manager.enable_verification(false);
        assert_eq!(pass_manager.run(&mut module), Ok(false));
    }
}
