// src/core/storage/range.rs

//! RFC 7233 range parsing and the arithmetic mapping ranges onto chunk intervals.

use super::manifest::ArtifactManifest;

/// Absolute tolerance for stored-vs-manifest chunk size drift, in bytes.
pub const SIZE_TOLERANCE_BYTES: u64 = 2048;
/// Relative tolerance for chunk size drift, as a fraction of the expected size.
pub const SIZE_TOLERANCE_RATIO: f64 = 0.001;

/// The outcome of resolving a `Range` header against a known total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedRange {
    /// A satisfiable closed interval `[start, end]`, both inclusive.
    Satisfiable { start: u64, end: u64 },
    /// The range lies entirely past the artifact.
    Unsatisfiable,
}

/// Parses a single-range `Range` header per RFC 7233 and resolves it against
/// `total`. Returns `None` for malformed or multipart ranges, which callers
/// answer with the full 200 representation.
pub fn resolve_range(header: &str, total: u64) -> Option<ResolvedRange> {
    let spec = header.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        // Multipart ranges are not served; the full representation is returned.
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let first = first.trim();
    let last = last.trim();

    if first.is_empty() {
        // Suffix form `bytes=-N`: the final N bytes.
        let suffix_len: u64 = last.parse().ok()?;
        if suffix_len == 0 {
            return Some(ResolvedRange::Unsatisfiable);
        }
        if total == 0 {
            return Some(ResolvedRange::Unsatisfiable);
        }
        let start = total.saturating_sub(suffix_len);
        return Some(ResolvedRange::Satisfiable {
            start,
            end: total - 1,
        });
    }

    let start: u64 = first.parse().ok()?;
    if start >= total {
        return Some(ResolvedRange::Unsatisfiable);
    }
    let end = if last.is_empty() {
        total - 1
    } else {
        let parsed: u64 = last.parse().ok()?;
        if parsed < start {
            return None;
        }
        parsed.min(total - 1)
    };
    Some(ResolvedRange::Satisfiable { start, end })
}

/// The contiguous chunk interval `[first, last]` (inclusive) intersecting a
/// byte range, computed from the manifest's expected sizes.
pub fn chunk_interval(manifest: &ArtifactManifest, start: u64, end: u64) -> Option<(u32, u32)> {
    let mut offset = 0u64;
    let mut first = None;
    let mut last = None;
    for chunk in &manifest.chunks {
        let chunk_start = offset;
        let chunk_end = offset + chunk.size;
        if chunk_end > start && chunk_start <= end {
            first.get_or_insert(chunk.index);
            last = Some(chunk.index);
        }
        offset = chunk_end;
        if chunk_start > end {
            break;
        }
    }
    match (first, last) {
        (Some(first), Some(last)) => Some((first, last)),
        _ => None,
    }
}

/// Whether a stored chunk's actual size is acceptable against the manifest.
/// Acceptance is absolute (< 2048 bytes) or relative (< 0.1 %) drift.
pub fn within_tolerance(expected: u64, actual: u64) -> bool {
    let diff = expected.abs_diff(actual);
    if diff == 0 {
        return true;
    }
    if diff < SIZE_TOLERANCE_BYTES {
        return true;
    }
    (diff as f64) < (expected as f64) * SIZE_TOLERANCE_RATIO
}

/// The sub-slice of a chunk that falls inside `[start, end]`, given the byte
/// offset where the chunk actually begins. Returns `None` when the chunk lies
/// entirely outside the range.
pub fn slice_within(
    chunk_offset: u64,
    chunk_len: u64,
    start: u64,
    end: u64,
) -> Option<(usize, usize)> {
    let chunk_end = chunk_offset + chunk_len;
    if chunk_end <= start || chunk_offset > end {
        return None;
    }
    let from = start.saturating_sub(chunk_offset) as usize;
    let to = ((end + 1).min(chunk_end) - chunk_offset) as usize;
    Some((from, to))
}
