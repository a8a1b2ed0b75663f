//! Fixed-size file chunking.
//!
//! Files are split into `chunk_size` slices; the last chunk carries the
//! remainder. An empty file has zero chunks and travels as a bare
//! file_start/file_complete pair.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::crypto::hashing::ContentHash;

/// Number of chunks a file of `size` bytes splits into.
pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
    if size == 0 {
        0
    } else {
        size.div_ceil(chunk_size as u64) as u32
    }
}

/// Byte length of chunk `index` within a file of `size` bytes.
pub fn chunk_len(size: u64, chunk_size: u32, index: u32) -> u32 {
    let offset = index as u64 * chunk_size as u64;
    (size.saturating_sub(offset)).min(chunk_size as u64) as u32
}

/// Read chunk `index` of the file at `path`.
pub fn read_chunk(
    path: &Path,
    size: u64,
    chunk_size: u32,
    index: u32,
) -> std::io::Result<Vec<u8>> {
    let len = chunk_len(size, chunk_size, index) as usize;
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(index as u64 * chunk_size as u64))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Hash every chunk of a file, in order.
pub fn chunk_hashes(path: &Path, size: u64, chunk_size: u32) -> std::io::Result<Vec<String>> {
    let count = chunk_count(size, chunk_size);
    let mut hashes = Vec::with_capacity(count as usize);
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; chunk_size as usize];
    for index in 0..count {
        let len = chunk_len(size, chunk_size, index) as usize;
        file.read_exact(&mut buf[..len])?;
        hashes.push(ContentHash::from_data(&buf[..len]).to_hex());
    }
    Ok(hashes)
}
