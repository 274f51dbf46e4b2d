//! The multiscale downsampler (C10): derives a pyramid of lower-resolution
//! per-level dimension models from a base array's dimensions, and reduces
//! incoming frames into per-level downsampled frames by 2×2 (2D) or 2×2×2
//! (3D) spatial reduction.
//!
//! The scalar reduction function is chosen once per `(dtype, method)` pair
//! at construction — see [`reduce2d_dispatch`]/[`reduce1d_dispatch`] — so the
//! hot per-pixel loop never dispatches on type or method.

use std::sync::Arc;

use crate::dimension::{ArrayDimensions, DataType, Dimension, DimensionKind};
use crate::error::Result;

/// The four supported downsampling operators (§6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownsampleMethod {
    Decimate,
    Mean,
    Min,
    Max,
}

impl DownsampleMethod {
    /// The OME/NGFF `"metadata".method` identifier recorded against each
    /// derived dataset entry in multiscale metadata.
    #[must_use]
    pub const fn ome_identifier(self) -> &'static str {
        match self {
            Self::Decimate => "nearest",
            Self::Mean => "local_mean",
            Self::Min => "local_min",
            Self::Max => "local_max",
        }
    }
}

/// `true` when the third-from-last axis is itself spatial with more than one
/// pixel, meaning downsampling must also reduce along it (3D mode) rather
/// than treating every frame as an independent 2D plane.
#[must_use]
pub fn needs_3d_downsample(dims: &ArrayDimensions) -> bool {
    let n = dims.ndims();
    n >= 3 && dims.at(n - 3).kind == DimensionKind::Space && dims.at(n - 3).array_size_px > 1
}

fn halving_axes(dims: &ArrayDimensions) -> Vec<usize> {
    let n = dims.ndims();
    let mut axes = vec![n - 2, n - 1];
    if needs_3d_downsample(dims) {
        axes.push(n - 3);
    }
    axes
}

/// Derive the next pyramid level's dimensions from `dims` by halving
/// (rounded up) every axis in `halving`, clamping `chunk_size_px` and
/// `shard_size_chunks` to the new extent. Returns `None` once halving stops
/// changing any halving axis's chunk count (the pyramid has bottomed out).
fn derive_next_level(dims: &ArrayDimensions, halving: &[usize]) -> Result<Option<ArrayDimensions>> {
    let mut new_dims: Vec<Dimension> = dims.dims().to_vec();
    let mut any_chunk_count_changed = false;

    for &axis in halving {
        let old_chunks_along = new_dims[axis].chunks_for_size(new_dims[axis].array_size_px);
        let new_size = (new_dims[axis].array_size_px + 1) / 2;
        let d = &mut new_dims[axis];
        d.array_size_px = new_size.max(1);
        d.chunk_size_px = d.chunk_size_px.min(d.array_size_px as u32).max(1);
        let new_chunks_along = d.chunks_for_size(d.array_size_px);
        d.shard_size_chunks = d.shard_size_chunks.min(new_chunks_along as u32).max(1);
        if new_chunks_along != old_chunks_along {
            any_chunk_count_changed = true;
        }
    }

    if !any_chunk_count_changed {
        return Ok(None);
    }
    let storage_order = dims.storage_order().map(<[usize]>::to_vec);
    Ok(Some(ArrayDimensions::new(new_dims, dims.data_type(), storage_order)?))
}

/// Build the full pyramid of derived per-level dimension models (level 1
/// upward; the caller already has the base array's dims as level 0).
///
/// # Errors
/// Propagates [`crate::error::StreamingError::InvalidSettings`] if a derived
/// level's dimensions are somehow invalid (should not happen for a valid
/// base array, since halving only ever shrinks extents).
pub fn build_pyramid(base: &ArrayDimensions) -> Result<Vec<Arc<ArrayDimensions>>> {
    let halving = halving_axes(base);
    let mut levels = Vec::new();
    let mut current = base.clone();
    loop {
        match derive_next_level(&current, &halving)? {
            Some(next) => {
                levels.push(Arc::new(next.clone()));
                current = next;
            }
            None => break,
        }
    }
    Ok(levels)
}

trait ReduceInt: bytemuck::Pod + Ord {
    fn int_mean2(a: Self, b: Self) -> Self;
    fn int_mean4(a: Self, b: Self, c: Self, d: Self) -> Self;
}

macro_rules! impl_reduce_int {
    ($t:ty) => {
        impl ReduceInt for $t {
            fn int_mean2(a: Self, b: Self) -> Self {
                let n: Self = 2;
                (a / n) + (b / n) + ((a % n + b % n) / n)
            }
            fn int_mean4(a: Self, b: Self, c: Self, d: Self) -> Self {
                let n: Self = 4;
                (a / n) + (b / n) + (c / n) + (d / n) + ((a % n + b % n + c % n + d % n) / n)
            }
        }
    };
}
impl_reduce_int!(i8);
impl_reduce_int!(i16);
impl_reduce_int!(i32);
impl_reduce_int!(i64);
impl_reduce_int!(u8);
impl_reduce_int!(u16);
impl_reduce_int!(u32);
impl_reduce_int!(u64);

trait ReduceFloat: bytemuck::Pod + Copy {
    fn fmin(self, other: Self) -> Self;
    fn fmax(self, other: Self) -> Self;
    fn fmean2(a: Self, b: Self) -> Self;
    fn fmean4(a: Self, b: Self, c: Self, d: Self) -> Self;
}

macro_rules! impl_reduce_float {
    ($t:ty) => {
        impl ReduceFloat for $t {
            fn fmin(self, other: Self) -> Self {
                <$t>::min(self, other)
            }
            fn fmax(self, other: Self) -> Self {
                <$t>::max(self, other)
            }
            fn fmean2(a: Self, b: Self) -> Self {
                (a + b) / 2.0
            }
            fn fmean4(a: Self, b: Self, c: Self, d: Self) -> Self {
                (a + b + c + d) / 4.0
            }
        }
    };
}
impl_reduce_float!(f32);
impl_reduce_float!(f64);

fn reduce2d_int<T: ReduceInt>(src: &[u8], width: u64, height: u64, method: DownsampleMethod) -> Vec<u8> {
    let src: &[T] = bytemuck::cast_slice(src);
    let new_w = width.div_ceil(2);
    let new_h = height.div_ceil(2);
    let get = |x: u64, y: u64| -> T {
        let xx = x.min(width.saturating_sub(1));
        let yy = y.min(height.saturating_sub(1));
        src[(yy * width + xx) as usize]
    };
    let mut out = Vec::with_capacity((new_w * new_h) as usize);
    for oy in 0..new_h {
        for ox in 0..new_w {
            let a = get(2 * ox, 2 * oy);
            let b = get(2 * ox + 1, 2 * oy);
            let c = get(2 * ox, 2 * oy + 1);
            let d = get(2 * ox + 1, 2 * oy + 1);
            out.push(match method {
                DownsampleMethod::Decimate => a,
                DownsampleMethod::Mean => T::int_mean4(a, b, c, d),
                DownsampleMethod::Min => a.min(b).min(c).min(d),
                DownsampleMethod::Max => a.max(b).max(c).max(d),
            });
        }
    }
    bytemuck::cast_slice(&out).to_vec()
}

fn reduce2d_float<T: ReduceFloat>(src: &[u8], width: u64, height: u64, method: DownsampleMethod) -> Vec<u8> {
    let src: &[T] = bytemuck::cast_slice(src);
    let new_w = width.div_ceil(2);
    let new_h = height.div_ceil(2);
    let get = |x: u64, y: u64| -> T {
        let xx = x.min(width.saturating_sub(1));
        let yy = y.min(height.saturating_sub(1));
        src[(yy * width + xx) as usize]
    };
    let mut out = Vec::with_capacity((new_w * new_h) as usize);
    for oy in 0..new_h {
        for ox in 0..new_w {
            let a = get(2 * ox, 2 * oy);
            let b = get(2 * ox + 1, 2 * oy);
            let c = get(2 * ox, 2 * oy + 1);
            let d = get(2 * ox + 1, 2 * oy + 1);
            out.push(match method {
                DownsampleMethod::Decimate => a,
                DownsampleMethod::Mean => T::fmean4(a, b, c, d),
                DownsampleMethod::Min => a.fmin(b).fmin(c).fmin(d),
                DownsampleMethod::Max => a.fmax(b).fmax(c).fmax(d),
            });
        }
    }
    bytemuck::cast_slice(&out).to_vec()
}

fn reduce1d_int<T: ReduceInt>(a: &[u8], b: &[u8], method: DownsampleMethod) -> Vec<u8> {
    let a: &[T] = bytemuck::cast_slice(a);
    let b: &[T] = bytemuck::cast_slice(b);
    let mut out = Vec::with_capacity(a.len());
    for i in 0..a.len() {
        out.push(match method {
            DownsampleMethod::Decimate => a[i],
            DownsampleMethod::Mean => T::int_mean2(a[i], b[i]),
            DownsampleMethod::Min => a[i].min(b[i]),
            DownsampleMethod::Max => a[i].max(b[i]),
        });
    }
    bytemuck::cast_slice(&out).to_vec()
}

fn reduce1d_float<T: ReduceFloat>(a: &[u8], b: &[u8], method: DownsampleMethod) -> Vec<u8> {
    let a: &[T] = bytemuck::cast_slice(a);
    let b: &[T] = bytemuck::cast_slice(b);
    let mut out = Vec::with_capacity(a.len());
    for i in 0..a.len() {
        out.push(match method {
            DownsampleMethod::Decimate => a[i],
            DownsampleMethod::Mean => T::fmean2(a[i], b[i]),
            DownsampleMethod::Min => a[i].fmin(b[i]),
            DownsampleMethod::Max => a[i].fmax(b[i]),
        });
    }
    bytemuck::cast_slice(&out).to_vec()
}

type Reduce2dFn = fn(&[u8], u64, u64, DownsampleMethod) -> Vec<u8>;
type Reduce1dFn = fn(&[u8], &[u8], DownsampleMethod) -> Vec<u8>;

fn reduce2d_dispatch(dtype: DataType) -> Reduce2dFn {
    match dtype {
        DataType::Int8 => reduce2d_int::<i8>,
        DataType::Int16 => reduce2d_int::<i16>,
        DataType::Int32 => reduce2d_int::<i32>,
        DataType::Int64 => reduce2d_int::<i64>,
        DataType::UInt8 => reduce2d_int::<u8>,
        DataType::UInt16 => reduce2d_int::<u16>,
        DataType::UInt32 => reduce2d_int::<u32>,
        DataType::UInt64 => reduce2d_int::<u64>,
        DataType::Float32 => reduce2d_float::<f32>,
        DataType::Float64 => reduce2d_float::<f64>,
    }
}

fn reduce1d_dispatch(dtype: DataType) -> Reduce1dFn {
    match dtype {
        DataType::Int8 => reduce1d_int::<i8>,
        DataType::Int16 => reduce1d_int::<i16>,
        DataType::Int32 => reduce1d_int::<i32>,
        DataType::Int64 => reduce1d_int::<i64>,
        DataType::UInt8 => reduce1d_int::<u8>,
        DataType::UInt16 => reduce1d_int::<u16>,
        DataType::UInt32 => reduce1d_int::<u32>,
        DataType::UInt64 => reduce1d_int::<u64>,
        DataType::Float32 => reduce1d_float::<f32>,
        DataType::Float64 => reduce1d_float::<f64>,
    }
}

/// Drives the reduction pipeline feeding a group's non-base array levels.
///
/// `add_frame` is called once per level-0 frame; it returns the set of
/// levels that became ready as a result (usually 0 or 1 level per call in 2D
/// mode, and at most 1 in 3D mode since every other frame only updates the
/// partial cache). [`Self::take`] drains a ready level's frame exactly once.
pub struct Downsampler {
    method: DownsampleMethod,
    needs_3d: bool,
    reduce2d: Reduce2dFn,
    reduce1d: Reduce1dFn,
    level_dims: Vec<Arc<ArrayDimensions>>,
    /// 3D mode only: the first frame of the current pair, per level's input.
    partial: Vec<Option<Vec<u8>>>,
    /// The most recently produced frame for each level, not yet taken.
    ready: Vec<Option<Vec<u8>>>,
}

impl Downsampler {
    /// # Errors
    /// Propagates pyramid construction failures from [`build_pyramid`].
    pub fn new(base: &ArrayDimensions, method: DownsampleMethod) -> Result<Self> {
        let level_dims = build_pyramid(base)?;
        let n = level_dims.len();
        Ok(Self {
            method,
            needs_3d: needs_3d_downsample(base),
            reduce2d: reduce2d_dispatch(base.data_type()),
            reduce1d: reduce1d_dispatch(base.data_type()),
            level_dims,
            partial: vec![None; n],
            ready: vec![None; n],
        })
    }

    /// Number of derived levels (not counting the base array at level 0).
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.level_dims.len()
    }

    /// The dimension model for derived level `level_of_detail` (1-indexed
    /// against the base array's level 0).
    #[must_use]
    pub fn level_dims(&self, level_of_detail: usize) -> &Arc<ArrayDimensions> {
        &self.level_dims[level_of_detail - 1]
    }

    /// Feed one level-0 frame (a full 2D plane at the base array's spatial
    /// resolution) through the pyramid, updating every level's ready cache.
    ///
    /// In 2D mode every call produces one output per level, each level's
    /// output feeding the next as its input. In 3D mode, frames arrive in
    /// pairs per level: the first is stashed in that level's partial cache
    /// and produces nothing; the second triggers a 1D pairwise reduction
    /// followed by the spatial 2×2 reduction, clearing the partial.
    pub fn add_frame(&mut self, width: u64, height: u64, frame: &[u8]) {
        let mut current = frame.to_vec();
        let mut cur_w = width;
        let mut cur_h = height;
        for level in 0..self.level_dims.len() {
            let to_reduce = if self.needs_3d {
                match self.partial[level].take() {
                    None => {
                        self.partial[level] = Some(current.clone());
                        return;
                    }
                    Some(first) => (self.reduce1d)(&first, &current, self.method),
                }
            } else {
                current.clone()
            };
            let reduced = (self.reduce2d)(&to_reduce, cur_w, cur_h, self.method);
            self.ready[level] = Some(reduced.clone());
            current = reduced;
            cur_w = cur_w.div_ceil(2);
            cur_h = cur_h.div_ceil(2);
        }
    }

    /// Take the ready frame for derived level `level_of_detail`, if one was
    /// produced since the last call. Non-idempotent: returns `None` the
    /// second time for the same produced frame.
    pub fn take(&mut self, level_of_detail: usize) -> Option<Vec<u8>> {
        self.ready[level_of_detail - 1].take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKind;

    fn dims_2d(y: u64, x: u64) -> ArrayDimensions {
        ArrayDimensions::new(
            vec![
                Dimension::new("t", DimensionKind::Time, 0, 1),
                Dimension::new("y", DimensionKind::Space, y, 4),
                Dimension::new("x", DimensionKind::Space, x, 4),
            ],
            DataType::UInt16,
            None,
        )
        .unwrap()
    }

    #[test]
    fn pyramid_halves_spatial_extents_until_it_bottoms_out() {
        let base = dims_2d(48, 64);
        let levels = build_pyramid(&base).unwrap();
        assert_eq!(levels[0].at(1).array_size_px, 24);
        assert_eq!(levels[0].at(2).array_size_px, 32);
        let last = levels.last().unwrap();
        assert_eq!(last.at(1).chunks_for_size(last.at(1).array_size_px), 1);
        assert_eq!(last.at(2).chunks_for_size(last.at(2).array_size_px), 1);
    }

    #[test]
    fn decimate_picks_the_top_left_sample_of_each_2x2_block() {
        let base = dims_2d(4, 4);
        let mut ds = Downsampler::new(&base, DownsampleMethod::Decimate).unwrap();
        let frame: Vec<u16> = (0..16).collect();
        let bytes = bytemuck::cast_slice(&frame);
        ds.add_frame(4, 4, bytes);
        let out = ds.take(1).unwrap();
        let out: &[u16] = bytemuck::cast_slice(&out);
        assert_eq!(out, &[0, 2, 8, 10]);
    }

    #[test]
    fn integer_safe_mean_matches_exact_average_for_boundary_values() {
        let a = u8::MAX;
        let b = u8::MAX;
        let c = 0u8;
        let d = 0u8;
        assert_eq!(u8::int_mean4(a, b, c, d), 127);
        assert_eq!(u8::int_mean2(u8::MAX, u8::MAX), u8::MAX);
        assert_eq!(u8::int_mean2(0, 1), 0);
    }

    #[test]
    fn take_is_not_idempotent() {
        let base = dims_2d(4, 4);
        let mut ds = Downsampler::new(&base, DownsampleMethod::Mean).unwrap();
        let frame = vec![1u16; 16];
        ds.add_frame(4, 4, bytemuck::cast_slice(&frame));
        assert!(ds.take(1).is_some());
        assert!(ds.take(1).is_none());
    }

    #[test]
    fn three_d_mode_only_emits_on_the_second_frame_of_a_pair() {
        // z is spatial with extent > 1, so the third-from-last axis triggers 3D mode.
        let base = ArrayDimensions::new(
            vec![
                Dimension::new("t", DimensionKind::Time, 0, 1),
                Dimension::new("z", DimensionKind::Space, 4, 4),
                Dimension::new("y", DimensionKind::Space, 4, 4),
                Dimension::new("x", DimensionKind::Space, 4, 4),
            ],
            DataType::UInt8,
            None,
        )
        .unwrap();
        assert!(needs_3d_downsample(&base));
        let mut ds = Downsampler::new(&base, DownsampleMethod::Mean).unwrap();
        let frame = vec![4u8; 16];
        ds.add_frame(4, 4, &frame);
        assert!(ds.take(1).is_none());
        ds.add_frame(4, 4, &frame);
        assert!(ds.take(1).is_some());
    }
}
