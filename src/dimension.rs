//! The dimension model: canonical axis order, chunk/shard counts, and the
//! frame-id → chunk/shard index algebra that the array writers scatter tiles
//! and pack shards with.
//!
//! An [`ArrayDimensions`] is built once from an ordered [`Dimension`] list and
//! never mutates afterwards; every derived quantity used on the hot path
//! (chunk counts, shard tables, byte strides) is computed at construction time.

use crate::error::{Result, StreamingError};

/// The element type stored by an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Size in bytes of one element.
    #[must_use]
    pub const fn bytes_of_type(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// The two-character numpy-style type code (no endian prefix), used by
    /// both the v2 `dtype` string and the v3 codec dispatch in [`crate::downsample`].
    #[must_use]
    pub const fn short_code(self) -> &'static str {
        match self {
            Self::Int8 => "i1",
            Self::Int16 => "i2",
            Self::Int32 => "i4",
            Self::Int64 => "i8",
            Self::UInt8 => "u1",
            Self::UInt16 => "u2",
            Self::UInt32 => "u4",
            Self::UInt64 => "u8",
            Self::Float32 => "f4",
            Self::Float64 => "f8",
        }
    }

    /// The v2 `.zarray` `dtype` string: an endian prefix (native byte order)
    /// followed by [`Self::short_code`].
    #[must_use]
    pub fn v2_dtype_string(self) -> String {
        let prefix = if cfg!(target_endian = "big") {
            ">"
        } else {
            "<"
        };
        format!("{prefix}{}", self.short_code())
    }

    /// The v3 `zarr.json` `data_type` string, a bare name with no endian marker.
    #[must_use]
    pub const fn v3_data_type_name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

/// The role an axis plays, carried through to OME/NGFF `axes` metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionKind {
    Time,
    Channel,
    Space,
    Other,
}

impl DimensionKind {
    #[must_use]
    pub const fn ome_type(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Channel => "channel",
            Self::Space => "space",
            Self::Other => "other",
        }
    }
}

/// A single named axis of an array.
#[derive(Debug, Clone)]
pub struct Dimension {
    pub name: String,
    pub kind: DimensionKind,
    /// `0` means unlimited (append axis); legal only on the first axis.
    pub array_size_px: u64,
    pub chunk_size_px: u32,
    /// v3 only; ignored for v2 arrays. Must be `>= 1`.
    pub shard_size_chunks: u32,
    pub unit: Option<String>,
    pub scale: f64,
}

impl Dimension {
    /// Construct a dimension with `shard_size_chunks = 1` (i.e. one chunk per
    /// shard along this axis), the sensible default for arrays that do not
    /// shard along every axis.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: DimensionKind,
        array_size_px: u64,
        chunk_size_px: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            array_size_px,
            chunk_size_px,
            shard_size_chunks: 1,
            unit: None,
            scale: 1.0,
        }
    }

    #[must_use]
    pub fn with_shard_size_chunks(mut self, shard_size_chunks: u32) -> Self {
        self.shard_size_chunks = shard_size_chunks;
        self
    }

    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    #[must_use]
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Number of chunks along this axis given its *current* array size. The
    /// caller is responsible for passing a dynamic size for the append axis.
    #[must_use]
    pub const fn chunks_for_size(&self, array_size_px: u64) -> u64 {
        let chunk = self.chunk_size_px as u64;
        (array_size_px + chunk - 1) / chunk
    }
}

/// Free function matching the original helper of the same name: chunk count
/// along a dimension given its *static* `array_size_px` (not meaningful for
/// the append axis, whose size grows with frames written).
#[must_use]
pub fn chunks_along_dimension(dim: &Dimension) -> u32 {
    debug_assert!(dim.chunk_size_px > 0);
    u32::try_from(dim.chunks_for_size(dim.array_size_px)).unwrap_or(u32::MAX)
}

/// Free function matching the original helper of the same name: shard count
/// along a dimension given its static chunk count.
#[must_use]
pub fn shards_along_dimension(dim: &Dimension) -> u32 {
    if dim.shard_size_chunks == 0 {
        return 0;
    }
    let n_chunks = u64::from(chunks_along_dimension(dim));
    let shard = u64::from(dim.shard_size_chunks);
    u32::try_from((n_chunks + shard - 1) / shard).unwrap_or(u32::MAX)
}

/// Sentinel for an absent chunk in a v3 shard index table.
pub const SHARD_SENTINEL: u64 = u64::MAX;

/// The fully precomputed dimension model for one array.
///
/// `dims` is stored in canonical *storage* order: axis 0 is the append axis,
/// axes `1..ndims-2` are the "middle" non-spatial axes, and the final two
/// axes are the spatial Y then X axes.
#[derive(Debug, Clone)]
pub struct ArrayDimensions {
    dims: Vec<Dimension>,
    data_type: DataType,
    /// Forward permutation from acquisition order to storage order; `None` if
    /// the caller did not request transposition (the common case).
    storage_order: Option<Vec<usize>>,
    inverse_order: Option<Vec<usize>>,

    bytes_per_chunk: u64,
    /// `chunks_along` for the middle + spatial axes (static; excludes axis 0).
    inner_chunks_along: Vec<u64>,
    /// `array_size_px` for the middle axes only (excludes append and spatial).
    middle_sizes: Vec<u64>,
    middle_strides: Vec<u64>,
    chunks_in_memory: u64,

    // v3 sharding tables, all indexed by the inner (middle+spatial) chunk
    // lattice linear index, i.e. independent of the append axis.
    inner_shards_along: Vec<u64>,
    chunks_per_shard_layer: u64,
    chunks_per_shard: u64,
    shard_index_for_chunk: Vec<u64>,
    shard_internal_index: Vec<u64>,
    chunk_indices_for_shard: Vec<Vec<u64>>,
}

impl ArrayDimensions {
    /// Build the dimension model from an ordered dimension list.
    ///
    /// `storage_order`, if given, is a permutation of `0..dims.len()` mapping
    /// acquisition-order axis index to storage-order axis index; frame ids are
    /// then understood to be encoded in acquisition order and remapped via
    /// [`Self::transpose_frame_id`] before any other method is called.
    ///
    /// # Errors
    /// Returns [`StreamingError::InvalidSettings`] if the dimension list
    /// violates any of the invariants in the data model (wrong axis count,
    /// non-spatial trailing axes, unlimited axis not first, zero chunk size,
    /// or `chunk_size_px > array_size_px` on a bounded axis).
    pub fn new(
        dims: Vec<Dimension>,
        data_type: DataType,
        storage_order: Option<Vec<usize>>,
    ) -> Result<Self> {
        let n = dims.len();
        if n < 3 {
            return Err(StreamingError::InvalidSettings(format!(
                "array must have at least 3 dimensions, got {n}"
            )));
        }

        // Exactly 2 spatial axes (Y, X) is the common case. A 3rd spatial axis
        // immediately preceding them (a depth/Z axis) is also admitted, since
        // it drives the downsampler's 3D mode (`needs_3d_downsample`,
        // `crate::downsample`) without otherwise changing how frame ids are
        // decoded: that axis is still folded into the "middle" axes below,
        // exactly like a channel or time axis, and is distinguished only by
        // its `kind` for OME axis metadata and the downsampler's trigger.
        let spatial_count = dims
            .iter()
            .filter(|d| d.kind == DimensionKind::Space)
            .count();
        if spatial_count != 2 && spatial_count != 3 {
            return Err(StreamingError::InvalidSettings(format!(
                "expected 2 or 3 spatial dimensions (Y, X, optionally preceded by a depth axis), got {spatial_count}"
            )));
        }
        if dims[n - 1].kind != DimensionKind::Space || dims[n - 2].kind != DimensionKind::Space {
            return Err(StreamingError::InvalidSettings(
                "the final two dimensions must be spatial (Y then X)".to_string(),
            ));
        }
        for (i, dim) in dims.iter().enumerate() {
            if dim.kind == DimensionKind::Space && i < n - spatial_count {
                return Err(StreamingError::InvalidSettings(format!(
                    "dimension {i} ({}) is spatial but not among the trailing spatial axes",
                    dim.name
                )));
            }
        }

        for (i, dim) in dims.iter().enumerate() {
            if dim.chunk_size_px == 0 {
                return Err(StreamingError::InvalidSettings(format!(
                    "dimension {i} ({}) has zero chunk_size_px",
                    dim.name
                )));
            }
            if dim.array_size_px == 0 && i != 0 {
                return Err(StreamingError::InvalidSettings(format!(
                    "dimension {i} ({}) is unlimited but is not the first axis",
                    dim.name
                )));
            }
            if dim.array_size_px != 0 && u64::from(dim.chunk_size_px) > dim.array_size_px {
                return Err(StreamingError::InvalidSettings(format!(
                    "dimension {i} ({}) has chunk_size_px > array_size_px",
                    dim.name
                )));
            }
        }

        let inverse_order = storage_order.as_ref().map(|fwd| {
            let mut inv = vec![0usize; fwd.len()];
            for (from, &to) in fwd.iter().enumerate() {
                inv[to] = from;
            }
            inv
        });

        let bytes_per_chunk: u64 = dims
            .iter()
            .map(|d| u64::from(d.chunk_size_px))
            .product::<u64>()
            * data_type.bytes_of_type() as u64;

        // Inner axes: everything but the append axis (index 0).
        let inner_chunks_along: Vec<u64> = dims[1..]
            .iter()
            .map(|d| u64::from(chunks_along_dimension(d)))
            .collect();
        let chunks_in_memory: u64 = inner_chunks_along.iter().product();

        // Middle axes: non-spatial, non-append (i.e. dims[1..n-2]).
        let middle_sizes: Vec<u64> = dims[1..n - 2].iter().map(|d| d.array_size_px).collect();
        let mut middle_strides = vec![1u64; middle_sizes.len()];
        for i in (0..middle_sizes.len().saturating_sub(1)).rev() {
            middle_strides[i] = middle_strides[i + 1] * middle_sizes[i + 1];
        }

        let inner_shards_along: Vec<u64> = dims[1..]
            .iter()
            .map(|d| u64::from(shards_along_dimension(d)))
            .collect();
        let chunks_per_shard_layer: u64 = dims[1..]
            .iter()
            .map(|d| u64::from(d.shard_size_chunks))
            .product();
        let chunks_per_shard = chunks_per_shard_layer * u64::from(dims[0].shard_size_chunks);

        let (shard_index_for_chunk, shard_internal_index, chunk_indices_for_shard) =
            build_shard_tables(&inner_chunks_along, &dims[1..]);

        Ok(Self {
            dims,
            data_type,
            storage_order,
            inverse_order,
            bytes_per_chunk,
            inner_chunks_along,
            middle_sizes,
            middle_strides,
            chunks_in_memory,
            inner_shards_along,
            chunks_per_shard_layer,
            chunks_per_shard,
            shard_index_for_chunk,
            shard_internal_index,
            chunk_indices_for_shard,
        })
    }

    #[must_use]
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn at(&self, axis: usize) -> &Dimension {
        &self.dims[axis]
    }

    #[must_use]
    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The acquisition-to-storage axis permutation this array was built with,
    /// if any — needed by [`crate::downsample`] to rebuild derived per-level
    /// dimension models with the same transposition as the base array.
    #[must_use]
    pub fn storage_order(&self) -> Option<&[usize]> {
        self.storage_order.as_deref()
    }

    #[must_use]
    pub fn append_dim(&self) -> &Dimension {
        &self.dims[0]
    }

    #[must_use]
    pub fn height_dim(&self) -> &Dimension {
        &self.dims[self.ndims() - 2]
    }

    #[must_use]
    pub fn width_dim(&self) -> &Dimension {
        &self.dims[self.ndims() - 1]
    }

    #[must_use]
    pub fn needs_transposition(&self) -> bool {
        match &self.storage_order {
            Some(order) => order.iter().enumerate().any(|(i, &o)| i != o),
            None => false,
        }
    }

    /// Total bytes of one chunk buffer (uncompressed), across every axis.
    #[must_use]
    pub fn bytes_per_chunk(&self) -> u64 {
        self.bytes_per_chunk
    }

    /// Bytes of one whole frame (the two trailing spatial axes only).
    #[must_use]
    pub fn bytes_per_frame(&self) -> u64 {
        self.height_dim().array_size_px * self.width_dim().array_size_px
            * self.data_type.bytes_of_type() as u64
    }

    /// Number of chunks that coexist in memory during one flush cycle: the
    /// product of `chunks_along` over every axis but the append axis.
    #[must_use]
    pub fn chunks_in_memory(&self) -> u64 {
        self.chunks_in_memory
    }

    /// Chunk counts along every axis but the append axis, in storage order.
    #[must_use]
    pub fn inner_chunks_along(&self) -> &[u64] {
        &self.inner_chunks_along
    }

    /// Total frames that must be written to fill every chunk in the
    /// in-memory lattice once: `chunk_size_px` of the append axis times the
    /// product of the *array sizes* (not chunk counts) of the middle axes.
    #[must_use]
    pub fn frames_per_flush(&self) -> u64 {
        let total_middle: u64 = self.middle_sizes.iter().product::<u64>().max(1);
        u64::from(self.dims[0].chunk_size_px) * total_middle
    }

    /// Total frames that must be written to fill (and roll over) one shard
    /// layer stack along the append axis: [`Self::frames_per_flush`] times
    /// the append axis's `shard_size_chunks`.
    #[must_use]
    pub fn frames_per_rollover(&self) -> u64 {
        self.frames_per_flush() * u64::from(self.dims[0].shard_size_chunks)
    }

    /// The number of whole "outer slices" completed along the append axis
    /// after `frames_written` frames: frames are folded through every middle
    /// axis's array size, each division rounding up, so a partially-filled
    /// slice still counts as one more unit of `shape[0]`.
    #[must_use]
    pub fn append_extent_for_frames(&self, frames_written: u64) -> u64 {
        let total_middle: u64 = self.middle_sizes.iter().product::<u64>().max(1);
        (frames_written + total_middle - 1) / total_middle
    }

    /// The full logical `shape` of the array given the frames written so far
    /// (the append axis is dynamic; every other axis is its static
    /// `array_size_px`), in storage order.
    #[must_use]
    pub fn shape_for_frames(&self, frames_written: u64) -> Vec<u64> {
        let mut shape = vec![self.append_extent_for_frames(frames_written)];
        shape.extend(self.dims[1..].iter().map(|d| d.array_size_px));
        shape
    }

    /// Number of chunk-tiles one shard nominally holds along the append axis
    /// (i.e. the number of flush "layers" packed into one shard before
    /// rollover).
    #[must_use]
    pub fn shard_size_chunks_append(&self) -> u32 {
        self.dims[0].shard_size_chunks
    }

    /// Total chunk slots in one shard's index table (`2 * this` 64-bit words).
    #[must_use]
    pub fn chunks_per_shard(&self) -> u64 {
        self.chunks_per_shard
    }

    /// Chunk slots in one shard's table contributed by a single append-axis
    /// layer (i.e. the inner, non-append chunk lattice restricted to one
    /// shard).
    #[must_use]
    pub fn chunks_per_shard_layer(&self) -> u64 {
        self.chunks_per_shard_layer
    }

    /// For a chunk at inner lattice index `inner_chunk_index` (ravelled over
    /// every axis but the append axis, in storage order), the linear index of
    /// the shard it belongs to (ravelled over the inner shard lattice).
    #[must_use]
    pub fn shard_index_for_chunk(&self, inner_chunk_index: u64) -> u64 {
        self.shard_index_for_chunk[inner_chunk_index as usize]
    }

    /// Position of a chunk within its shard's per-layer ordering.
    #[must_use]
    pub fn shard_internal_index(&self, inner_chunk_index: u64) -> u64 {
        self.shard_internal_index[inner_chunk_index as usize]
    }

    /// The list of inner chunk indices held by shard `shard_index`.
    #[must_use]
    pub fn chunk_indices_for_shard(&self, shard_index: u64) -> &[u64] {
        &self.chunk_indices_for_shard[shard_index as usize]
    }

    /// Number of shards along each axis but the append axis.
    #[must_use]
    pub fn inner_shards_along(&self) -> &[u64] {
        &self.inner_shards_along
    }

    /// Remap a frame id from acquisition-stride coordinates into storage
    /// strides. Identity when [`Self::needs_transposition`] is `false`.
    #[must_use]
    pub fn transpose_frame_id(&self, frame_id: u64) -> u64 {
        let Some(order) = &self.storage_order else {
            return frame_id;
        };
        if !self.needs_transposition() {
            return frame_id;
        }
        // Decode in acquisition order (spatial axes contribute a zero digit),
        // permute, re-encode in storage order.
        let sizes: Vec<Option<u64>> = (0..self.ndims())
            .map(|axis| {
                if axis == 0 {
                    None // append axis: unbounded digit
                } else if self.dims[axis].kind == DimensionKind::Space {
                    Some(1) // spatial axes always contribute a zero digit
                } else {
                    Some(self.dims[axis].array_size_px)
                }
            })
            .collect();
        let coords = decode_mixed_radix(frame_id, &sizes);
        let mut permuted = vec![0u64; coords.len()];
        for (from, &to) in order.iter().enumerate() {
            permuted[to] = coords[from];
        }
        encode_mixed_radix(&permuted, &sizes)
    }

    fn middle_coords(&self, frame_id: u64) -> Vec<u64> {
        if self.middle_sizes.is_empty() {
            return Vec::new();
        }
        let total_inner: u64 = self.middle_sizes.iter().product();
        let remainder = frame_id % total_inner.max(1);
        self.middle_strides
            .iter()
            .zip(self.middle_sizes.iter())
            .map(|(&stride, &size)| (remainder / stride) % size.max(1))
            .collect()
    }

    /// `chunk_lattice_index(frame_id, axis)` for `axis` in `[0, ndims-2)` —
    /// the append axis and every middle (non-spatial, non-append) axis. Not
    /// defined for the two trailing spatial axes.
    #[must_use]
    pub fn chunk_lattice_index(&self, frame_id: u64, axis: usize) -> u64 {
        debug_assert!(axis < self.ndims() - 2);
        if axis == 0 {
            let total_inner: u64 = self.middle_sizes.iter().product::<u64>().max(1);
            let append_idx = frame_id / total_inner;
            append_idx / u64::from(self.dims[0].chunk_size_px)
        } else {
            let coords = self.middle_coords(frame_id);
            coords[axis - 1] / u64::from(self.dims[axis].chunk_size_px)
        }
    }

    /// Which chunk-in-memory slot (over the inner, non-append lattice) this
    /// frame's tiles target, pre-multiplied by the spatial chunk grid so that
    /// adding `tile_y * n_tiles_x + tile_x` lands on a specific chunk.
    #[must_use]
    pub fn tile_group_offset(&self, frame_id: u64) -> u64 {
        if self.middle_sizes.is_empty() {
            return 0;
        }
        let coords = self.middle_coords(frame_id);
        let mut linear = 0u64;
        for (axis_offset, &coord) in coords.iter().enumerate() {
            let axis = axis_offset + 1;
            let chunk_idx = coord / u64::from(self.dims[axis].chunk_size_px);
            let stride: u64 = self.inner_chunks_along[axis..self.ndims() - 2]
                .iter()
                .product();
            linear += chunk_idx * stride;
        }
        let n_tiles_y = self.inner_chunks_along[self.ndims() - 2 - 1];
        let n_tiles_x = self.inner_chunks_along[self.ndims() - 1 - 1];
        linear * n_tiles_y * n_tiles_x
    }

    /// Byte offset within each targeted chunk where this frame's tile row
    /// runs begin (before adding the per-row, per-tile offsets `write_frame`
    /// computes itself).
    #[must_use]
    pub fn chunk_internal_offset(&self, frame_id: u64) -> u64 {
        if self.middle_sizes.is_empty() {
            return 0;
        }
        let coords = self.middle_coords(frame_id);
        let mut linear = 0u64;
        for (axis_offset, &coord) in coords.iter().enumerate() {
            let axis = axis_offset + 1;
            let chunk_size = u64::from(self.dims[axis].chunk_size_px);
            let within_chunk = coord % chunk_size;
            let stride: u64 = (axis + 1..self.ndims() - 2)
                .map(|a| u64::from(self.dims[a].chunk_size_px))
                .product();
            linear += within_chunk * stride;
        }
        let tile_bytes = u64::from(self.height_dim().chunk_size_px)
            * u64::from(self.width_dim().chunk_size_px)
            * self.data_type.bytes_of_type() as u64;
        linear * tile_bytes
    }
}

fn build_shard_tables(
    inner_chunks_along: &[u64],
    inner_dims: &[Dimension],
) -> (Vec<u64>, Vec<u64>, Vec<Vec<u64>>) {
    let n = inner_chunks_along.len();
    let total_chunks: u64 = inner_chunks_along.iter().product();
    let inner_shards_along: Vec<u64> = inner_dims
        .iter()
        .map(|d| u64::from(shards_along_dimension(d)))
        .collect();
    let total_shards: u64 = inner_shards_along.iter().product();

    let mut shard_index_for_chunk = vec![0u64; total_chunks as usize];
    let mut shard_internal_index = vec![0u64; total_chunks as usize];
    let mut chunk_indices_for_shard: Vec<Vec<u64>> = vec![Vec::new(); total_shards as usize];

    let chunk_sizes: Vec<Option<u64>> = inner_chunks_along.iter().map(|&c| Some(c)).collect();
    let shard_sizes: Vec<u64> = inner_dims.iter().map(|d| u64::from(d.shard_size_chunks)).collect();

    for chunk_linear in 0..total_chunks {
        let chunk_coords = decode_mixed_radix(chunk_linear, &chunk_sizes);
        let mut shard_coords = vec![0u64; n];
        let mut internal_coords = vec![0u64; n];
        for i in 0..n {
            shard_coords[i] = chunk_coords[i] / shard_sizes[i];
            internal_coords[i] = chunk_coords[i] % shard_sizes[i];
        }
        let shard_sizes_opt: Vec<Option<u64>> = inner_shards_along.iter().map(|&s| Some(s)).collect();
        let shard_linear = encode_mixed_radix(&shard_coords, &shard_sizes_opt);
        let internal_sizes_opt: Vec<Option<u64>> = shard_sizes.iter().map(|&s| Some(s)).collect();
        let internal_linear = encode_mixed_radix(&internal_coords, &internal_sizes_opt);

        shard_index_for_chunk[chunk_linear as usize] = shard_linear;
        shard_internal_index[chunk_linear as usize] = internal_linear;
        let shard_slot = &mut chunk_indices_for_shard[shard_linear as usize];
        if shard_slot.len() <= internal_linear as usize {
            shard_slot.resize(internal_linear as usize + 1, SHARD_SENTINEL);
        }
        shard_slot[internal_linear as usize] = chunk_linear;
    }

    (shard_index_for_chunk, shard_internal_index, chunk_indices_for_shard)
}

/// Decode a linear index into mixed-radix coordinates. `sizes[0] = None`
/// means that digit is unbounded (used only for the append axis); every
/// other entry must be `Some`.
fn decode_mixed_radix(mut value: u64, sizes: &[Option<u64>]) -> Vec<u64> {
    let mut strides = vec![1u64; sizes.len()];
    for i in (0..sizes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * sizes[i + 1].unwrap_or(1);
    }
    let mut coords = vec![0u64; sizes.len()];
    for i in 0..sizes.len() {
        coords[i] = match sizes[i] {
            Some(size) if i != 0 => (value / strides[i]) % size.max(1),
            _ => value / strides[i],
        };
    }
    // Second pass is unnecessary since strides already account for position;
    // but keep `value` untouched to satisfy the borrow checker trivially.
    let _ = &mut value;
    coords
}

/// Inverse of [`decode_mixed_radix`].
fn encode_mixed_radix(coords: &[u64], sizes: &[Option<u64>]) -> u64 {
    let mut strides = vec![1u64; sizes.len()];
    for i in (0..sizes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * sizes[i + 1].unwrap_or(1);
    }
    coords.iter().zip(strides.iter()).map(|(&c, &s)| c * s).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1_dims() -> Vec<Dimension> {
        vec![
            Dimension::new("t", DimensionKind::Time, 10, 5),
            Dimension::new("c", DimensionKind::Channel, 8, 4),
            Dimension::new("z", DimensionKind::Space, 6, 2),
            Dimension::new("y", DimensionKind::Space, 48, 16),
            Dimension::new("x", DimensionKind::Space, 64, 16),
        ]
    }

    #[test]
    fn rejects_too_few_dims() {
        let dims = vec![
            Dimension::new("y", DimensionKind::Space, 8, 4),
            Dimension::new("x", DimensionKind::Space, 8, 4),
        ];
        assert!(ArrayDimensions::new(dims, DataType::UInt8, None).is_err());
    }

    #[test]
    fn rejects_non_spatial_trailing_axes() {
        let dims = vec![
            Dimension::new("t", DimensionKind::Time, 0, 1),
            Dimension::new("y", DimensionKind::Space, 8, 4),
            Dimension::new("c", DimensionKind::Channel, 8, 4),
        ];
        assert!(ArrayDimensions::new(dims, DataType::UInt8, None).is_err());
    }

    #[test]
    fn s1_chunks_in_memory_matches_expected_grid() {
        let dims = ArrayDimensions::new(s1_dims(), DataType::Int32, None).unwrap();
        // c: 8/4=2, z: 6/2=3, y: 48/16=3, x: 64/16=4 -> 2*3*3*4 = 72
        assert_eq!(dims.chunks_in_memory(), 72);
        assert_eq!(dims.bytes_per_chunk(), 5 * 4 * 2 * 16 * 16 * 4);
    }

    #[test]
    fn tile_group_offset_stays_within_chunks_in_memory() {
        let dims = ArrayDimensions::new(s1_dims(), DataType::Int32, None).unwrap();
        // 480 frames total (10 * 8 * 6)
        for frame_id in 0..480u64 {
            let offset = dims.tile_group_offset(frame_id);
            assert!(offset < dims.chunks_in_memory());
        }
    }

    #[test]
    fn chunk_internal_offset_bounded_by_bytes_per_chunk() {
        let dims = ArrayDimensions::new(s1_dims(), DataType::Int32, None).unwrap();
        let bytes_per_frame_in_chunk =
            u64::from(dims.height_dim().chunk_size_px) * u64::from(dims.width_dim().chunk_size_px)
                * dims.data_type().bytes_of_type() as u64;
        for frame_id in 0..480u64 {
            let offset = dims.chunk_internal_offset(frame_id);
            assert!(offset + bytes_per_frame_in_chunk <= dims.bytes_per_chunk());
        }
    }

    #[test]
    fn shard_tables_are_mutually_consistent() {
        let dims = vec![
            Dimension::new("t", DimensionKind::Time, 10, 5).with_shard_size_chunks(2),
            Dimension::new("c", DimensionKind::Channel, 8, 4).with_shard_size_chunks(2),
            Dimension::new("z", DimensionKind::Space, 6, 2).with_shard_size_chunks(1),
            Dimension::new("y", DimensionKind::Space, 48, 16).with_shard_size_chunks(1),
            Dimension::new("x", DimensionKind::Space, 64, 16).with_shard_size_chunks(2),
        ];
        let dims = ArrayDimensions::new(dims, DataType::UInt16, None).unwrap();
        for chunk_index in 0..dims.chunks_in_memory() {
            let shard = dims.shard_index_for_chunk(chunk_index);
            let internal = dims.shard_internal_index(chunk_index);
            let members = dims.chunk_indices_for_shard(shard);
            assert!(members.contains(&chunk_index));
            assert_eq!(members[internal as usize], chunk_index);
        }
    }

    #[test]
    fn frames_per_flush_matches_s1_scenario() {
        let dims = ArrayDimensions::new(s1_dims(), DataType::Int32, None).unwrap();
        // chunk_size_append=5, middle sizes c=8, z=6 -> 5*8*6=240
        assert_eq!(dims.frames_per_flush(), 240);
        assert_eq!(dims.shape_for_frames(480), vec![10, 8, 6, 48, 64]);
    }

    #[test]
    fn no_transposition_is_identity() {
        let dims = ArrayDimensions::new(s1_dims(), DataType::Int32, None).unwrap();
        assert!(!dims.needs_transposition());
        for id in [0u64, 1, 42, 479] {
            assert_eq!(dims.transpose_frame_id(id), id);
        }
    }

    #[test]
    fn explicit_identity_order_reports_no_transposition() {
        let order = vec![0, 1, 2, 3, 4];
        let dims = ArrayDimensions::new(s1_dims(), DataType::Int32, Some(order)).unwrap();
        assert!(!dims.needs_transposition());
    }

    #[test]
    fn non_identity_order_permutes_frame_ids() {
        // swap the two middle (non-spatial) axes: c and z
        let order = vec![0, 2, 1, 3, 4];
        let dims = ArrayDimensions::new(s1_dims(), DataType::Int32, Some(order)).unwrap();
        assert!(dims.needs_transposition());
        // frame_id 0 always maps to frame_id 0 regardless of permutation
        assert_eq!(dims.transpose_frame_id(0), 0);
    }
}
