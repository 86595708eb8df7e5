use std::sync::OnceLock;

use rayon::prelude::*;

use crate::env_config::define_env_flag;
use crate::error::{CaptureError, CaptureResult};

/// Below this many bytes a single-threaded copy wins over pool dispatch.
const PARALLEL_MIN_BYTES: usize = 2 * 1024 * 1024;
const PARALLEL_MIN_ROWS: usize = 64;
const MAX_COPY_WORKERS: usize = 8;

define_env_flag!(enabled_unless(parallel_copy_enabled, "DUPL_CAPTURE_DISABLE_PARALLEL_COPY"));

/// Pre-initialize the copy pool so the first large capture doesn't pay the
/// pool creation cost.
pub fn warmup_pool() {
    install_copy_pool(|| {});
}

#[inline]
fn copy_workers() -> usize {
    static WORKERS: OnceLock<usize> = OnceLock::new();
    (*WORKERS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }))
    .min(MAX_COPY_WORKERS)
}

fn install_copy_pool<F>(job: F)
where
    F: FnOnce() + Send,
{
    static POOL: OnceLock<Option<rayon::ThreadPool>> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        let workers = copy_workers();
        if workers <= 1 {
            return None;
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("dupl-capture-copy-{index}"))
            .build()
            .ok()
    });
    match pool {
        Some(pool) => pool.install(job),
        None => job(),
    }
}

#[inline]
fn should_parallelize(row_bytes: usize, rows: usize) -> bool {
    rows >= PARALLEL_MIN_ROWS
        && row_bytes.saturating_mul(rows) >= PARALLEL_MIN_BYTES
        && copy_workers() > 1
        && parallel_copy_enabled()
}

/// Bytes a pitched image of `rows` rows occupies when the last row carries
/// no padding.
#[inline]
pub(crate) fn pitched_len(pitch: usize, row_bytes: usize, rows: usize) -> CaptureResult<usize> {
    if rows == 0 {
        return Ok(0);
    }
    pitch
        .checked_mul(rows - 1)
        .and_then(|base| base.checked_add(row_bytes))
        .ok_or(CaptureError::BufferOverflow)
}

/// Copy `rows` rows of `row_bytes` each between buffers with independent
/// pitches.
pub fn copy_rows(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    dst_pitch: usize,
    row_bytes: usize,
    rows: usize,
) -> CaptureResult<()> {
    if rows == 0 || row_bytes == 0 {
        return Ok(());
    }
    if row_bytes > src_pitch || row_bytes > dst_pitch {
        return Err(CaptureError::BufferOverflow);
    }
    if src.len() < pitched_len(src_pitch, row_bytes, rows)?
        || dst.len() < pitched_len(dst_pitch, row_bytes, rows)?
    {
        return Err(CaptureError::BufferOverflow);
    }

    let copy_row = |(y, dst_row): (usize, &mut [u8])| {
        let start = y * src_pitch;
        dst_row[..row_bytes].copy_from_slice(&src[start..start + row_bytes]);
    };

    if should_parallelize(row_bytes, rows) {
        install_copy_pool(|| {
            dst.par_chunks_mut(dst_pitch)
                .take(rows)
                .enumerate()
                .for_each(copy_row);
        });
    } else {
        dst.chunks_mut(dst_pitch)
            .take(rows)
            .enumerate()
            .for_each(copy_row);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_between_different_pitches() -> CaptureResult<()> {
        let src: Vec<u8> = (0..3 * 10).map(|v| v as u8).collect();
        let mut dst = vec![0u8; 3 * 4];
        copy_rows(&src, 10, &mut dst, 4, 4, 3)?;
        assert_eq!(dst, vec![0, 1, 2, 3, 10, 11, 12, 13, 20, 21, 22, 23]);
        Ok(())
    }

    #[test]
    fn unpadded_last_row_is_accepted() -> CaptureResult<()> {
        let src = vec![7u8; 10 + 4];
        let mut dst = vec![0u8; 8];
        copy_rows(&src, 10, &mut dst, 4, 4, 2)?;
        assert!(dst.iter().all(|byte| *byte == 7));
        Ok(())
    }

    #[test]
    fn short_source_is_rejected() {
        let src = vec![0u8; 12];
        let mut dst = vec![0u8; 64];
        assert!(matches!(
            copy_rows(&src, 8, &mut dst, 8, 8, 2),
            Err(CaptureError::BufferOverflow)
        ));
    }

    #[test]
    fn large_copy_matches_serial_result() -> CaptureResult<()> {
        let row_bytes = 4096 * 4;
        let rows = 160;
        let src_pitch = row_bytes + 64;
        let src: Vec<u8> = (0..src_pitch * rows).map(|v| (v % 251) as u8).collect();
        let mut dst = vec![0u8; row_bytes * rows];
        copy_rows(&src, src_pitch, &mut dst, row_bytes, row_bytes, rows)?;
        for y in [0, 77, rows - 1] {
            assert_eq!(
                &dst[y * row_bytes..(y + 1) * row_bytes],
                &src[y * src_pitch..y * src_pitch + row_bytes]
            );
        }
        Ok(())
    }
}
