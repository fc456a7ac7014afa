//! References to mesh axes and strided sub-axes.
//!
//! An [`AxisRef`] refers either to a full mesh axis (`"a"`) or to a _sub-axis_ (`"a":(pre_size)size`). A mesh axis of
//! size `n` can be viewed as a row-major grid of factors; the sub-axis `"a":(k)m` is the factor of size `m` that has
//! `k` devices "before" it. For example, for an axis `"c"` of size 4, `"c":(1)2` is its major half and `"c":(2)2` is
//! its minor half. Two sub-axes of the same axis can be used together as long as their ranges do not overlap.

use std::cmp::Ordering;
use std::fmt::Display;

use crate::errors::ShardyError;
use crate::mesh::{Mesh, escape_shardy_string};

/// Split metadata for a sub-axis: the product of the sizes of the sub-axes to its left (`pre_size`) and its own size.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubAxisInfo {
    pub pre_size: usize,
    pub size: usize,
}

impl SubAxisInfo {
    /// Creates a new [`SubAxisInfo`].
    pub fn new(pre_size: usize, size: usize) -> Self {
        Self { pre_size, size }
    }

    /// Returns the pre-size of the sub-axis that immediately follows this one, saturating at [`usize::MAX`].
    pub fn next_pre_size(&self) -> usize {
        self.pre_size.saturating_mul(self.size)
    }
}

impl Display for SubAxisInfo {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "({}){}", self.pre_size, self.size)
    }
}

/// Reference to a full mesh axis or to a sub-axis of one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AxisRef {
    name: String,
    sub_axis_info: Option<SubAxisInfo>,
}

impl AxisRef {
    /// Creates a reference to the full axis named `name`.
    pub fn full<N: Into<String>>(name: N) -> Self {
        Self { name: name.into(), sub_axis_info: None }
    }

    /// Creates a reference to the sub-axis `name:(pre_size)size`. Validity is checked against a [`Mesh`] by
    /// [`AxisRef::validate`].
    pub fn sub<N: Into<String>>(name: N, pre_size: usize, size: usize) -> Self {
        Self { name: name.into(), sub_axis_info: Some(SubAxisInfo::new(pre_size, size)) }
    }

    /// Returns the referenced axis name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns split metadata when this references a sub-axis.
    pub fn sub_axis_info(&self) -> Option<SubAxisInfo> {
        self.sub_axis_info
    }

    /// Returns `true` if this references a sub-axis.
    pub fn is_sub_axis(&self) -> bool {
        self.sub_axis_info.is_some()
    }

    /// Returns the pre-size of this reference (`1` for full axes).
    pub fn pre_size(&self) -> usize {
        self.sub_axis_info.map(|info| info.pre_size).unwrap_or(1)
    }

    /// Returns the number of devices along this axis reference.
    pub fn size(&self, mesh: &Mesh) -> Result<usize, ShardyError> {
        match self.sub_axis_info {
            Some(info) => Ok(info.size),
            None => mesh.require_axis_size(self.name()),
        }
    }

    /// Returns the pre-size of the sub-axis that would immediately follow this reference.
    pub fn next_pre_size(&self, mesh: &Mesh) -> Result<usize, ShardyError> {
        self.pre_size().checked_mul(self.size(mesh)?).ok_or_else(|| ShardyError::InvalidSubAxis {
            axis: self.to_string(),
            reason: "pre-size times size overflows".into(),
        })
    }

    /// Checks that this reference resolves in `mesh` and, for sub-axes, that the split is well formed: the sub-axis
    /// must have size greater than 1, its `pre_size * size` must divide the full axis size, and it must not span the
    /// full axis (in which case the full axis must be referenced instead).
    pub fn validate(&self, mesh: &Mesh) -> Result<(), ShardyError> {
        let axis_size = mesh.require_axis_size(self.name())?;
        if let Some(info) = self.sub_axis_info {
            let invalid = |reason: &str| ShardyError::InvalidSubAxis { axis: self.to_string(), reason: reason.into() };
            if info.pre_size == 0 {
                return Err(invalid("pre-size must be at least 1"));
            }
            if info.size <= 1 {
                return Err(invalid("size must be greater than 1"));
            }
            let Some(next_pre_size) = info.pre_size.checked_mul(info.size) else {
                return Err(invalid("pre-size times size overflows"));
            };
            if axis_size % next_pre_size != 0 {
                return Err(invalid("pre-size times size must divide the full axis size"));
            }
            if next_pre_size == axis_size && info.pre_size == 1 {
                return Err(invalid("sub-axis spans the full axis"));
            }
        }
        Ok(())
    }

    /// Returns `true` if `self` and `other` share at least one device factor of the same axis.
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.name != other.name {
            return false;
        }
        match (self.sub_axis_info, other.sub_axis_info) {
            (Some(lhs), Some(rhs)) => lhs.pre_size < rhs.next_pre_size() && rhs.pre_size < lhs.next_pre_size(),
            _ => true,
        }
    }

    /// Returns `true` if every device factor of `other` is also part of `self`.
    pub fn contains(&self, other: &Self) -> bool {
        if self.name != other.name {
            return false;
        }
        match (self.sub_axis_info, other.sub_axis_info) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(lhs), Some(rhs)) => lhs.pre_size <= rhs.pre_size && rhs.next_pre_size() <= lhs.next_pre_size(),
        }
    }

    /// Returns `true` if `other` immediately follows `self` within the same axis, so that the two can be merged into
    /// a single (sub-)axis.
    pub fn can_merge(&self, other: &Self, mesh: &Mesh) -> bool {
        self.name == other.name
            && self.is_sub_axis()
            && other.is_sub_axis()
            && self.next_pre_size(mesh).is_ok_and(|next_pre_size| next_pre_size == other.pre_size())
    }

    /// Merges `self` with the sub-axis `other` that immediately follows it, returning the full axis when the merged
    /// reference spans it. Returns [`None`] if the two cannot be merged.
    pub fn merge(&self, other: &Self, mesh: &Mesh) -> Option<Self> {
        if !self.can_merge(other, mesh) {
            return None;
        }
        let axis_size = mesh.axis_size(self.name())?;
        let pre_size = self.pre_size();
        let size = self.size(mesh).ok()? * other.size(mesh).ok()?;
        if pre_size == 1 && size == axis_size {
            Some(Self::full(self.name.clone()))
        } else {
            Some(Self::sub(self.name.clone(), pre_size, size))
        }
    }

    /// Compares two axis references following the canonical ordering: first by the position of the axis in `mesh`,
    /// then by pre-size, and finally by size (full axes order before their sub-axes with the same pre-size).
    pub fn compare(&self, other: &Self, mesh: &Mesh) -> Ordering {
        let lhs_index = mesh.axis_index(self.name()).unwrap_or(usize::MAX);
        let rhs_index = mesh.axis_index(other.name()).unwrap_or(usize::MAX);
        lhs_index
            .cmp(&rhs_index)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.pre_size().cmp(&other.pre_size()))
            .then_with(|| match (self.sub_axis_info, other.sub_axis_info) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(lhs), Some(rhs)) => lhs.size.cmp(&rhs.size),
            })
    }
}

impl From<&str> for AxisRef {
    fn from(value: &str) -> Self {
        Self::full(value)
    }
}

impl Display for AxisRef {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "\"{}\"", escape_shardy_string(self.name()))?;
        if let Some(info) = self.sub_axis_info {
            write!(formatter, ":{info}")?;
        }
        Ok(())
    }
}

/// Returns the product of the sizes of `axes` in `mesh`.
pub fn axes_size(axes: &[AxisRef], mesh: &Mesh) -> Result<usize, ShardyError> {
    axes.iter().try_fold(1usize, |size, axis| Ok(size.saturating_mul(axis.size(mesh)?)))
}

/// Returns `true` if any axis in `axes` overlaps with `axis`.
pub fn any_overlaps<'a, I: IntoIterator<Item = &'a AxisRef>>(axes: I, axis: &AxisRef) -> bool {
    axes.into_iter().any(|other| other.overlaps(axis))
}

/// Checks that `axes` are sorted in canonical mesh order, are pairwise non-overlapping, and that no two adjacent
/// sub-axes can be merged. This is the canonical form required for unordered axis sets such as replicated, reduction,
/// and manual axes.
pub fn validate_canonical_axis_set(axes: &[AxisRef], mesh: &Mesh) -> Result<(), ShardyError> {
    for window in axes.windows(2) {
        let (lhs, rhs) = (&window[0], &window[1]);
        if lhs.compare(rhs, mesh) != Ordering::Less || lhs.overlaps(rhs) {
            return Err(ShardyError::UnsortedAxes { axes: render_axis_list(axes) });
        }
        if lhs.can_merge(rhs, mesh) {
            return Err(ShardyError::UnmergedSubAxes { axis: lhs.to_string(), other_axis: rhs.to_string() });
        }
    }
    Ok(())
}

/// Sorts `axes` in canonical mesh order and merges adjacent mergeable sub-axes.
pub fn canonicalize_axis_set(mut axes: Vec<AxisRef>, mesh: &Mesh) -> Vec<AxisRef> {
    axes.sort_by(|lhs, rhs| lhs.compare(rhs, mesh));
    let mut canonical: Vec<AxisRef> = Vec::with_capacity(axes.len());
    for axis in axes {
        if let Some(merged) = canonical.last().and_then(|last| last.merge(&axis, mesh)) {
            canonical.pop();
            canonical.push(merged);
        } else {
            canonical.push(axis);
        }
    }
    canonical
}

/// Renders an axis list as `{"a", "b":(1)2}`.
pub fn render_axis_list(axes: &[AxisRef]) -> String {
    let mut rendered = String::from("{");
    for (index, axis) in axes.iter().enumerate() {
        if index > 0 {
            rendered.push_str(", ");
        }
        rendered.push_str(axis.to_string().as_str());
    }
    rendered.push('}');
    rendered
}

/// Renders a list of axis lists (one per tensor dimension) as `[{"a"}, {}, {"b"}]`.
pub fn render_axis_lists(axis_lists: &[Vec<AxisRef>]) -> String {
    let mut rendered = String::from("[");
    for (index, axes) in axis_lists.iter().enumerate() {
        if index > 0 {
            rendered.push_str(", ");
        }
        rendered.push_str(render_axis_list(axes).as_str());
    }
    rendered.push(']');
    rendered
}
