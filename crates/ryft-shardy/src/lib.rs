//! Sharding representation and propagation for the Shardy (`sdy`) dialect.
//!
//! The crate is organized bottom-up:
//!
//!   - [`mesh`], [`axis`], and [`sharding`] model device meshes, axis references, and tensor shardings, along with
//!     their validation rules.
//!   - [`collectives`] implements the sharding algebra of the `sdy` collectives (e.g., what sharding an `all_gather`
//!     produces given the sharding of its operand).
//!   - [`ir`] contains a small arena-based [`Module`](ir::Module) with the `sdy` operations, a verifier, and an
//!     MLIR-style printer. [`data_flow`], [`manual`], and [`groups`] add the module-wide views that propagation needs.
//!   - [`passes`] contains the import, propagation, export, and canonicalization passes and a
//!     [`PassManager`](passes::PassManager) that chains them.

pub mod axis;
pub mod collectives;
pub mod data_flow;
pub mod errors;
pub mod groups;
pub mod ir;
pub mod manual;
pub mod mesh;
pub mod passes;
pub mod sharding;
pub mod types;

pub use errors::{Diagnostic, ErrorKind, ShardyError};
pub use ir::Module;
pub use passes::{PipelineOptions, propagate_shardings};
