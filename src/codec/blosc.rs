//! A safe wrapper over the Blosc1 C library vendored by `blosc-sys`.
//!
//! `blosc-sys` (crates.io package `blosc-src`) only builds and links the C
//! library; it exposes no Rust bindings, so this module declares the handful
//! of `blosc1.h` entry points the writer needs and wraps them in a safe,
//! allocation-owning API.

use crate::error::{Result, StreamingError};

/// `BLOSC_MAX_OVERHEAD` from `blosc1.h`: the worst-case header size Blosc1
/// adds to a compressed buffer.
pub const MAX_OVERHEAD: usize = 16;

/// The inner compressor Blosc1 shuffles and frames for you.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compressor {
    #[default]
    Lz4,
    Zstd,
    Zlib,
}

impl Compressor {
    const fn c_name(self) -> &'static [u8] {
        match self {
            Self::Lz4 => b"lz4\0",
            Self::Zstd => b"zstd\0",
            Self::Zlib => b"zlib\0",
        }
    }
}

/// Byte-level shuffle applied before compression; improves ratio for
/// typed numeric data at the cost of a pre/post pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shuffle {
    #[default]
    None,
    Byte,
    Bit,
}

impl Shuffle {
    const fn as_c_int(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Byte => 1,
            Self::Bit => 2,
        }
    }
}

/// Parameters for one Blosc1 compression call.
#[derive(Debug, Clone, Copy)]
pub struct BloscParams {
    pub compressor: Compressor,
    /// Compression level, `0..=9`. `0` disables compression (store only).
    pub clevel: u8,
    pub shuffle: Shuffle,
    /// Size in bytes of the type being shuffled (e.g. 4 for `f32`). Required
    /// for shuffle to be meaningful; ignored when `shuffle` is `None`.
    pub type_size: usize,
}

impl BloscParams {
    /// Validate clevel is in Blosc1's accepted range.
    ///
    /// # Errors
    /// Returns [`StreamingError::InvalidSettings`] if `clevel > 9`.
    pub fn validate(&self) -> Result<()> {
        if self.clevel > 9 {
            return Err(StreamingError::InvalidSettings(format!(
                "blosc clevel must be 0..=9, got {}",
                self.clevel
            )));
        }
        Ok(())
    }
}

#[allow(non_camel_case_types)]
mod ffi {
    use std::os::raw::{c_char, c_int, c_void};

    extern "C" {
        pub fn blosc_init();
        pub fn blosc_destroy();
        pub fn blosc_compress_ctx(
            clevel: c_int,
            doshuffle: c_int,
            typesize: usize,
            nbytes: usize,
            src: *const c_void,
            dest: *mut c_void,
            destsize: usize,
            compressor: *const c_char,
            blocksize: usize,
            numinternalthreads: c_int,
        ) -> c_int;
        pub fn blosc_decompress_ctx(
            src: *const c_void,
            dest: *mut c_void,
            destsize: usize,
            numinternalthreads: c_int,
        ) -> c_int;
        pub fn blosc_cbuffer_sizes(
            cbuffer: *const c_void,
            nbytes: *mut usize,
            cbytes: *mut usize,
            blocksize: *mut usize,
        );
    }
}

/// Compress `src` with the given parameters, returning an owned buffer sized
/// to the actual compressed length.
///
/// # Errors
/// Returns [`StreamingError::Compression`] if the underlying Blosc1 call
/// reports failure (a negative or zero return code when `src` is non-empty).
pub fn compress(params: &BloscParams, src: &[u8]) -> Result<Vec<u8>> {
    params.validate()?;
    if src.is_empty() {
        return Ok(Vec::new());
    }
    let dest_capacity = src.len() + MAX_OVERHEAD;
    let mut dest = vec![0u8; dest_capacity];
    let name = params.compressor.c_name();

    // SAFETY: `dest` is sized `src.len() + MAX_OVERHEAD` per the Blosc1
    // contract; `name` is a NUL-terminated static byte string.
    let written = unsafe {
        ffi::blosc_compress_ctx(
            i32::from(params.clevel),
            params.shuffle.as_c_int(),
            params.type_size,
            src.len(),
            src.as_ptr().cast(),
            dest.as_mut_ptr().cast(),
            dest_capacity,
            name.as_ptr().cast(),
            0,
            1,
        )
    };

    if written <= 0 {
        return Err(StreamingError::Compression(format!(
            "blosc_compress_ctx returned {written}"
        )));
    }
    dest.truncate(written as usize);
    Ok(dest)
}

/// Decompress a Blosc1 frame previously produced by [`compress`].
///
/// # Errors
/// Returns [`StreamingError::Compression`] if the frame header cannot be
/// read or the decompress call reports failure.
pub fn decompress(src: &[u8]) -> Result<Vec<u8>> {
    if src.is_empty() {
        return Ok(Vec::new());
    }
    let mut nbytes: usize = 0;
    let mut cbytes: usize = 0;
    let mut blocksize: usize = 0;
    // SAFETY: `src` is a valid Blosc1 frame with at least a header's worth of
    // bytes; the out-pointers are stack locals sized for `usize`.
    unsafe {
        ffi::blosc_cbuffer_sizes(
            src.as_ptr().cast(),
            std::ptr::addr_of_mut!(nbytes),
            std::ptr::addr_of_mut!(cbytes),
            std::ptr::addr_of_mut!(blocksize),
        );
    }
    if nbytes == 0 {
        return Err(StreamingError::Compression(
            "blosc frame header reports zero decompressed size".to_string(),
        ));
    }
    let mut dest = vec![0u8; nbytes];
    // SAFETY: `dest` is sized to the frame's reported decompressed length.
    let written = unsafe { ffi::blosc_decompress_ctx(src.as_ptr().cast(), dest.as_mut_ptr().cast(), nbytes, 1) };
    if written <= 0 {
        return Err(StreamingError::Compression(format!(
            "blosc_decompress_ctx returned {written}"
        )));
    }
    dest.truncate(written as usize);
    Ok(dest)
}

/// Must be called once before any other function in this module; safe to
/// call more than once. Mirrors `blosc_init`/`blosc_destroy` reference
/// counting in the C library.
pub fn init() {
    // SAFETY: blosc_init/destroy are reference-counted and safe to call
    // repeatedly from any thread.
    unsafe { ffi::blosc_init() };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_out_of_range_clevel() {
        let params = BloscParams {
            compressor: Compressor::Lz4,
            clevel: 10,
            shuffle: Shuffle::None,
            type_size: 4,
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn empty_input_round_trips_to_empty_output() {
        let params = BloscParams {
            compressor: Compressor::Zstd,
            clevel: 5,
            shuffle: Shuffle::Byte,
            type_size: 2,
        };
        assert_eq!(compress(&params, &[]).unwrap(), Vec::<u8>::new());
        assert_eq!(decompress(&[]).unwrap(), Vec::<u8>::new());
    }
}
