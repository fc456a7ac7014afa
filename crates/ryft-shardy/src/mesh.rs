//! Logical device meshes and the module-level registry of named meshes.
//!
//! A [`Mesh`] organizes devices into a named, multi-dimensional logical grid. Each axis has a human-readable name and
//! a size, and the mesh optionally carries an explicit device ordering. Meshes are declared at module scope under a
//! symbol name (rendered as `sdy.mesh @name = <["a"=2, "b"=4]>`) and are referenced by name from shardings.
//!
//! | Mesh literal | Meaning |
//! |---|---|
//! | `<["data"=4, "model"=2]>` | 8 devices in row-major (iota) order |
//! | `<["data"=2], device_ids=[1, 0]>` | 2 devices with an explicit, non-iota ordering |
//! | `<[], device_ids=[3]>` | _maximal_ mesh: a single specific device |
//! | `<[]>` | empty mesh: one (unspecified) device |

use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use crate::errors::ShardyError;

/// A named axis in a logical device [`Mesh`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    /// Creates a mesh axis.
    pub fn new<N: Into<String>>(name: N, size: usize) -> Result<Self, ShardyError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ShardyError::EmptyMeshAxisName);
        }
        if size == 0 {
            return Err(ShardyError::InvalidMeshAxisSize { axis_name: name });
        }
        Ok(Self { name, size })
    }

    /// Name of this axis.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Size of this axis.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Display for MeshAxis {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "\"{}\"={}", escape_shardy_string(self.name()), self.size)
    }
}

/// Logical mesh of devices: an ordered list of [`MeshAxis`]es plus an optional explicit device ordering.
///
/// Meshes are immutable values that are compared structurally. When `device_ids` is empty, devices follow the
/// implicit iota ordering `[0, 1, 2, ...]`. Explicit device ids must be a non-iota permutation of `0..N`, where `N` is
/// the product of all axis sizes, except for the _maximal_ mesh which has no axes and exactly one (arbitrary) device id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mesh {
    axes: Vec<MeshAxis>,
    device_ids: Vec<usize>,
}

impl Mesh {
    /// Creates a mesh from named axes with the implicit iota device ordering.
    pub fn new(axes: Vec<MeshAxis>) -> Result<Self, ShardyError> {
        Self::with_device_ids(axes, Vec::new())
    }

    /// Creates a mesh from named axes and an explicit device ordering.
    pub fn with_device_ids(axes: Vec<MeshAxis>, device_ids: Vec<usize>) -> Result<Self, ShardyError> {
        let mut axis_names = HashSet::with_capacity(axes.len());
        let mut device_count = 1usize;
        for axis in &axes {
            if axis.name.is_empty() {
                return Err(ShardyError::EmptyMeshAxisName);
            }
            if axis.size == 0 {
                return Err(ShardyError::InvalidMeshAxisSize { axis_name: axis.name.clone() });
            }
            if !axis_names.insert(axis.name.as_str()) {
                return Err(ShardyError::DuplicateMeshAxisName { axis_name: axis.name.clone() });
            }
            device_count = device_count
                .checked_mul(axis.size)
                .ok_or_else(|| ShardyError::InvalidMeshAxisSize { axis_name: axis.name.clone() })?;
        }

        // A single device id without any axes denotes a maximal mesh and can refer to any device.
        if axes.is_empty() && device_ids.len() == 1 {
            return Ok(Self { axes, device_ids });
        }

        if !device_ids.is_empty() {
            if device_ids.len() != device_count {
                let actual_count = device_ids.len();
                return Err(ShardyError::MeshDeviceIdCountMismatch { expected_count: device_count, actual_count });
            }
            let mut seen = HashSet::with_capacity(device_ids.len());
            for device_id in device_ids.iter().copied() {
                if device_id >= device_count {
                    return Err(ShardyError::MeshDeviceIdOutOfRange { device_id, device_count });
                }
                if !seen.insert(device_id) {
                    return Err(ShardyError::DuplicateMeshDeviceId { device_id });
                }
            }
            if device_ids.iter().copied().enumerate().all(|(index, device_id)| index == device_id) {
                return Err(ShardyError::IotaMeshDeviceIds);
            }
        }

        Ok(Self { axes, device_ids })
    }

    /// Creates a maximal mesh, which places a tensor on the single device `device_id`.
    pub fn maximal(device_id: usize) -> Self {
        Self { axes: Vec::new(), device_ids: vec![device_id] }
    }

    /// Returns the axes of this mesh.
    pub fn axes(&self) -> &[MeshAxis] {
        self.axes.as_slice()
    }

    /// Returns the explicit device ids of this mesh (empty when the ordering is implicit).
    pub fn device_ids(&self) -> &[usize] {
        self.device_ids.as_slice()
    }

    /// Returns `true` if this is a maximal mesh.
    pub fn is_maximal(&self) -> bool {
        self.axes.is_empty() && self.device_ids.len() == 1
    }

    /// Returns the total number of devices in this mesh (saturating at [`usize::MAX`] for meshes that were not built
    /// through [`Mesh::with_device_ids`]).
    pub fn device_count(&self) -> usize {
        self.axes.iter().fold(1usize, |count, axis| count.saturating_mul(axis.size))
    }

    /// Returns the index of `axis_name` in this mesh, if present.
    pub fn axis_index<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.axes.iter().position(|axis| axis.name() == axis_name.as_ref())
    }

    /// Returns the size of `axis_name` in this mesh, if present.
    pub fn axis_size<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.axis_index(axis_name).map(|axis_index| self.axes[axis_index].size)
    }

    /// Like [`Mesh::axis_size`], but returns a [`ShardyError::UnknownMeshAxis`] for unknown axes.
    pub fn require_axis_size<S: AsRef<str>>(&self, axis_name: S) -> Result<usize, ShardyError> {
        let axis_name = axis_name.as_ref();
        self.axis_size(axis_name)
            .ok_or_else(|| ShardyError::UnknownMeshAxis { axis_name: axis_name.to_string(), mesh: self.to_string() })
    }

    /// Returns `true` if `self` and `other` have the same axes and differ at most in their device ordering.
    pub fn equals_ignoring_device_ids(&self, other: &Self) -> bool {
        self.axes == other.axes
    }
}

impl Display for Mesh {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "<[")?;
        for (axis_index, axis) in self.axes.iter().enumerate() {
            if axis_index > 0 {
                write!(formatter, ", ")?;
            }
            write!(formatter, "{axis}")?;
        }
        write!(formatter, "]")?;
        if !self.device_ids.is_empty() {
            write!(formatter, ", device_ids=[")?;
            for (index, device_id) in self.device_ids.iter().enumerate() {
                if index > 0 {
                    write!(formatter, ", ")?;
                }
                write!(formatter, "{device_id}")?;
            }
            write!(formatter, "]")?;
        }
        write!(formatter, ">")
    }
}

/// Mesh that a sharding refers to: either a symbol declared in a [`MeshRegistry`] or an inline mesh literal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MeshReference {
    /// Reference to a mesh declared under the provided symbol name (rendered as `@name`).
    Symbol(String),

    /// Inline mesh literal (rendered as `mesh<["a"=2]>`).
    Inline(Mesh),
}

impl MeshReference {
    /// Creates a [`MeshReference::Symbol`], accepting names with or without a leading `'@'`.
    pub fn symbol<S: AsRef<str>>(mesh_name: S) -> Self {
        let mesh_name = mesh_name.as_ref();
        Self::Symbol(mesh_name.strip_prefix('@').unwrap_or(mesh_name).to_string())
    }
}

impl From<&str> for MeshReference {
    fn from(value: &str) -> Self {
        Self::symbol(value)
    }
}

impl From<Mesh> for MeshReference {
    fn from(value: Mesh) -> Self {
        Self::Inline(value)
    }
}

impl Display for MeshReference {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Symbol(mesh_name) => write!(formatter, "@{mesh_name}"),
            Self::Inline(mesh) => write!(formatter, "mesh{mesh}"),
        }
    }
}

/// Explicit registry of the named meshes declared in a module (replacing symbol-table lookups).
///
/// Declaration order is preserved for printing. The registry enforces the module-wide invariant that all declared
/// meshes have the same device count, except for meshes with exactly one device, which are compatible with anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshRegistry {
    meshes: Vec<(String, Mesh)>,
    mesh_index_by_name: HashMap<String, usize>,
}

impl MeshRegistry {
    /// Creates a new empty [`MeshRegistry`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `mesh` under `mesh_name` (without or with a leading `'@'`).
    pub fn declare<S: AsRef<str>>(&mut self, mesh_name: S, mesh: Mesh) -> Result<(), ShardyError> {
        let mesh_name = normalize_mesh_symbol_name(mesh_name)?;
        if self.mesh_index_by_name.contains_key(&mesh_name) {
            return Err(ShardyError::DuplicateMeshSymbol { mesh_name });
        }
        let device_count = mesh.device_count();
        if device_count != 1 {
            let conflict = self
                .meshes
                .iter()
                .find(|(_, other)| other.device_count() != 1 && other.device_count() != device_count);
            if let Some((other_mesh_name, other)) = conflict {
                return Err(ShardyError::MeshDeviceCountConflict {
                    mesh_name,
                    device_count,
                    other_mesh_name: other_mesh_name.clone(),
                    other_device_count: other.device_count(),
                });
            }
        }
        self.mesh_index_by_name.insert(mesh_name.clone(), self.meshes.len());
        self.meshes.push((mesh_name, mesh));
        Ok(())
    }

    /// Returns the mesh declared under `mesh_name`, if any.
    pub fn get<S: AsRef<str>>(&self, mesh_name: S) -> Option<&Mesh> {
        self.mesh_index_by_name.get(mesh_name.as_ref()).map(|index| &self.meshes[*index].1)
    }

    /// Resolves a [`MeshReference`] to the [`Mesh`] that it denotes.
    pub fn resolve<'r>(&'r self, mesh: &'r MeshReference) -> Result<&'r Mesh, ShardyError> {
        match mesh {
            MeshReference::Symbol(mesh_name) => {
                self.get(mesh_name).ok_or_else(|| ShardyError::UnknownMesh { mesh_name: mesh_name.clone() })
            }
            MeshReference::Inline(mesh) => Ok(mesh),
        }
    }

    /// Returns an iterator over `(name, mesh)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Mesh)> {
        self.meshes.iter().map(|(mesh_name, mesh)| (mesh_name.as_str(), mesh))
    }

    /// Returns the number of declared meshes.
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    /// Returns `true` if no meshes have been declared.
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

pub(crate) fn normalize_mesh_symbol_name<S: AsRef<str>>(mesh_name: S) -> Result<String, ShardyError> {
    let mesh_name = mesh_name.as_ref().trim();
    let mesh_name = mesh_name.strip_prefix('@').unwrap_or(mesh_name);
    if mesh_name.is_empty() || mesh_name.chars().any(char::is_whitespace) {
        return Err(ShardyError::InvalidMeshSymbolName { mesh_name: mesh_name.to_string() });
    }
    Ok(mesh_name.to_string())
}

pub(crate) fn escape_shardy_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
