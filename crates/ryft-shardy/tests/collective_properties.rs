//! Property-based tests for the sharding algebra of the `sdy` collectives.

use proptest::prelude::*;
use ryft_shardy::axis::{AxisRef, axes_size};
use ryft_shardy::collectives::{all_gather, all_slice, total_sharded_size};
use ryft_shardy::mesh::{Mesh, MeshAxis};
use ryft_shardy::sharding::{DimensionSharding, TensorSharding};

const AXES: [(&str, usize); 6] = [("a", 2), ("b", 2), ("c", 4), ("d", 2), ("e", 2), ("f", 2)];

fn mesh() -> Mesh {
    Mesh::new(AXES.iter().map(|(name, size)| MeshAxis::new(*name, *size).unwrap()).collect()).unwrap()
}

// ── Strategies ──────────────────────────────────────────────────────────────

/// Rank-3 sharding along with per-dimension axis lists that are disjoint from it (and from each other). Every mesh
/// axis either shards a dimension, is moved by the collective, or is unused.
fn arb_sharding_and_axes() -> impl Strategy<Value = (TensorSharding, Vec<Vec<AxisRef>>)> {
    let assignments = prop::collection::vec((0usize..4, any::<bool>()), AXES.len());
    let openness = prop::collection::vec(any::<bool>(), 3);
    (assignments, openness).prop_map(|(assignments, openness)| {
        let mut kept = vec![Vec::new(); 3];
        let mut moved = vec![Vec::new(); 3];
        for ((name, _), (dimension, is_moved)) in AXES.iter().zip(assignments) {
            if dimension == 3 {
                continue;
            }
            let lists = if is_moved { &mut moved } else { &mut kept };
            lists[dimension].push(AxisRef::full(*name));
        }
        let dimensions = kept
            .into_iter()
            .zip(openness)
            .map(|(axes, is_open)| if is_open { DimensionSharding::open(axes) } else { DimensionSharding::closed(axes) })
            .collect();
        (TensorSharding::new("mesh", dimensions), moved)
    })
}

// ── Property tests ───────────────────────────────────────────────────────────

proptest! {
    /// Gathering the axes that were just sliced restores the original sharding, and vice versa.
    #[test]
    fn gather_and_slice_are_inverses((sharding, axes) in arb_sharding_and_axes()) {
        let sliced = all_slice(&sharding, axes.as_slice()).unwrap();
        prop_assert_eq!(&all_gather(&sliced, axes.as_slice()).unwrap(), &sharding);
        let gathered = all_gather(&sliced, axes.as_slice()).unwrap();
        prop_assert_eq!(all_slice(&gathered, axes.as_slice()).unwrap(), sliced);
    }

    /// Slicing multiplies the number of shards by the size of the sliced axes.
    #[test]
    fn slicing_scales_sharded_size((sharding, axes) in arb_sharding_and_axes()) {
        let mesh = mesh();
        let sliced = all_slice(&sharding, axes.as_slice()).unwrap();
        let factor = axes.iter().map(|axes| axes_size(axes.as_slice(), &mesh).unwrap()).product::<usize>();
        prop_assert_eq!(
            total_sharded_size(&sliced, &mesh).unwrap(),
            total_sharded_size(&sharding, &mesh).unwrap() * factor,
        );
    }

    /// Slicing along an axis that already shards the operand is always rejected.
    #[test]
    fn slicing_used_axes_is_rejected((sharding, mut axes) in arb_sharding_and_axes(), dimension in 0usize..3) {
        let Some(used) = sharding.sharding_axes().next().cloned() else { return Ok(()) };
        axes[dimension].push(used);
        prop_assert!(all_slice(&sharding, axes.as_slice()).is_err());
    }
}
