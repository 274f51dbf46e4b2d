//! OME/NGFF multiscale metadata and Zarr group metadata documents (§6.4).
//!
//! Kept separate from [`crate::group`]'s writer state so the JSON shape can
//! be unit-tested without constructing sinks or a thread pool.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::dimension::{ArrayDimensions, DimensionKind};
use crate::downsample::DownsampleMethod;

/// The nearest power-of-two ratio between a base extent and a derived
/// level's extent, per §4.11.1's `bit_ceil`-based computation (not a literal
/// float division, so odd ceil-rounded extents still report the nominal
/// `2^level` factor).
#[must_use]
pub fn power_of_two_ratio(base_extent: u64, level_extent: u64) -> u64 {
    if level_extent == 0 {
        return 1;
    }
    let ratio = (base_extent + level_extent - 1) / level_extent;
    ratio.next_power_of_two().max(1)
}

/// The `coordinateTransformations[0].scale` vector for one level: the base
/// array's per-axis `scale`, multiplied by [`power_of_two_ratio`] on spatial
/// axes only.
#[must_use]
pub fn level_scale(base: &ArrayDimensions, level: &ArrayDimensions) -> Vec<f64> {
    base.dims()
        .iter()
        .zip(level.dims())
        .map(|(b, l)| {
            if b.kind == DimensionKind::Space {
                b.scale * power_of_two_ratio(b.array_size_px, l.array_size_px) as f64
            } else {
                b.scale
            }
        })
        .collect()
}

/// One `axes` entry per dimension: `name`, `type`, and `unit` when set.
#[must_use]
pub fn axes_json(dims: &ArrayDimensions) -> Vec<Value> {
    dims.dims()
        .iter()
        .map(|d| {
            let mut entry = json!({"name": d.name, "type": d.kind.ome_type()});
            if let Some(unit) = &d.unit {
                entry["unit"] = json!(unit);
            }
            entry
        })
        .collect()
}

/// One `datasets` entry per level (base at `"0"`, then one per derived
/// level), each carrying its `scale` coordinate transformation; derived
/// levels additionally carry a `metadata.method` description per OME/NGFF
/// convention for derived resolutions.
#[must_use]
pub fn datasets_json(
    base: &ArrayDimensions,
    levels: &[Arc<ArrayDimensions>],
    method: DownsampleMethod,
) -> Vec<Value> {
    let base_scale: Vec<f64> = base.dims().iter().map(|d| d.scale).collect();
    let mut out = vec![json!({
        "path": "0",
        "coordinateTransformations": [{"type": "scale", "scale": base_scale}],
    })];
    for (i, level) in levels.iter().enumerate() {
        let level_of_detail = i + 1;
        out.push(json!({
            "path": level_of_detail.to_string(),
            "coordinateTransformations": [{"type": "scale", "scale": level_scale(base, level)}],
            "metadata": {"method": method.ome_identifier()},
        }));
    }
    out
}

/// The multiscales object itself (goes inside a `"multiscales": [...]` array
/// at either the v2 `.zattrs` root or the v3 `attributes.ome` object).
#[must_use]
pub fn multiscales_json(
    base: &ArrayDimensions,
    levels: &[Arc<ArrayDimensions>],
    method: DownsampleMethod,
    version: &str,
) -> Value {
    json!({
        "version": version,
        "name": "/",
        "axes": axes_json(base),
        "datasets": datasets_json(base, levels, method),
    })
}

/// `.zgroup`: `{"zarr_format": 2}`, identical for every v2 group.
#[must_use]
pub fn v2_group_json() -> Value {
    json!({"zarr_format": 2})
}

/// `.zattrs`: `{"multiscales": [<multiscales object>]}`.
#[must_use]
pub fn v2_attrs_json(base: &ArrayDimensions, levels: &[Arc<ArrayDimensions>], method: DownsampleMethod) -> Value {
    json!({"multiscales": [multiscales_json(base, levels, method, "0.4")]})
}

/// `zarr.json` for a v3 group. `base` is `None` for an intermediate group
/// with no dimensions configured (a nested path prefix), which emits bare
/// `attributes: {}` rather than an empty `ome` object.
#[must_use]
pub fn v3_group_json(
    base: Option<&ArrayDimensions>,
    levels: &[Arc<ArrayDimensions>],
    method: DownsampleMethod,
) -> Value {
    let attributes = match base {
        Some(base) => json!({"ome": {"multiscales": [multiscales_json(base, levels, method, "0.5")]}}),
        None => json!({}),
    };
    json!({
        "zarr_format": 3,
        "node_type": "group",
        "consolidated_metadata": null,
        "attributes": attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{DataType, Dimension};

    fn base_dims() -> ArrayDimensions {
        ArrayDimensions::new(
            vec![
                Dimension::new("t", DimensionKind::Time, 10, 5),
                Dimension::new("c", DimensionKind::Channel, 8, 4),
                Dimension::new("y", DimensionKind::Space, 48, 16).with_scale(0.9),
                Dimension::new("x", DimensionKind::Space, 64, 16).with_scale(0.9),
            ],
            DataType::UInt16,
            None,
        )
        .unwrap()
    }

    #[test]
    fn power_of_two_ratio_is_exact_for_even_halving() {
        assert_eq!(power_of_two_ratio(48, 24), 2);
        assert_eq!(power_of_two_ratio(48, 12), 4);
        assert_eq!(power_of_two_ratio(48, 48), 1);
    }

    #[test]
    fn level_scale_multiplies_only_spatial_axes() {
        let base = base_dims();
        let levels = crate::downsample::build_pyramid(&base).unwrap();
        let level1 = &levels[0];
        let scale = level_scale(&base, level1);
        assert_eq!(scale[0], 1.0); // t, untouched
        assert_eq!(scale[1], 1.0); // c, untouched
        assert!((scale[2] - 1.8).abs() < 1e-9); // y: 0.9 * 2
        assert!((scale[3] - 1.8).abs() < 1e-9); // x: 0.9 * 2
    }

    #[test]
    fn derived_datasets_carry_a_method_description() {
        let base = base_dims();
        let levels = crate::downsample::build_pyramid(&base).unwrap();
        let datasets = datasets_json(&base, &levels, DownsampleMethod::Decimate);
        assert_eq!(datasets[0]["path"], "0");
        assert!(datasets[0].get("metadata").is_none());
        assert_eq!(datasets[1]["path"], "1");
        assert_eq!(datasets[1]["metadata"]["method"], "nearest");
    }

    #[test]
    fn intermediate_group_with_no_dims_emits_bare_attributes() {
        let v = v3_group_json(None, &[], DownsampleMethod::Mean);
        assert_eq!(v["attributes"], json!({}));
    }
}
