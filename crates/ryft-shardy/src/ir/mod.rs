//! Minimal, arena-based IR container for the `sdy` dialect.
//!
//! A [`Module`] owns a [`MeshRegistry`](crate::mesh::MeshRegistry), one function-like entry body, and arenas of
//! values, operations, and blocks that are addressed through the copyable handles [`ValueId`], [`OperationId`], and
//! [`BlockId`]. Handles are only meaningful for the module that produced them.
//!
//! Regions are single blocks. They are built detached (see [`Module::region`]), terminated with [`Module::r#return`],
//! and then attached to the region-bearing operation that is constructed with them. Every builder verifies the new
//! operation before returning it, so a [`Module`] that was only built through its builders is always locally valid;
//! [`Module::verify`] additionally checks the module-wide invariants (e.g., scoping, data-flow edge ownership, and
//! sharding groups).

use std::fmt::Display;

mod module;
mod operations;
mod printer;
mod verification;

pub use module::*;
pub use operations::*;

/// Handle to a value (i.e., an operation result or a block argument) in a [`Module`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueId(usize);

impl ValueId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the index of this value in the value arena of its [`Module`].
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for ValueId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "value #{}", self.0)
    }
}

/// Handle to an operation in a [`Module`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperationId(usize);

impl OperationId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the index of this operation in the operation arena of its [`Module`].
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for OperationId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "operation #{}", self.0)
    }
}

/// Handle to a block in a [`Module`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockId(usize);

impl BlockId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the index of this block in the block arena of its [`Module`].
    pub fn index(&self) -> usize {
        self.0
    }
}
