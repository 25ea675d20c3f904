//! Chunking decision, splitting and recombination.
//!
//! An operation is chunked when its input is large, when memory is already
//! under pressure, or when the target format is expensive to produce.
//! [`PageRangeSplitter`] then cuts the source into ordered, non-overlapping
//! segments sized so each one's resource estimate, inflated by
//! `warning_safety_factor`, stays under `chunk_memory_ceiling_bytes`.
//! [`ConcatCombiner`] joins chunk outputs in index order.

use crate::config::{ChunkSeparator, SchedulerConfig};
use crate::memory::MemoryBand;
use crate::model::{Operation, Segment};
use std::fmt;
use thiserror::Error;

// ── Decision ────────────────────────────────────────────────────────────────

/// Why an operation is chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReason {
    InputSize,
    MemoryPressure,
    Complexity,
}

impl fmt::Display for ChunkReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkReason::InputSize => "input size",
            ChunkReason::MemoryPressure => "memory pressure",
            ChunkReason::Complexity => "target complexity",
        })
    }
}

/// Estimated peak memory to convert `bytes` of input into `target_format`.
pub fn resource_estimate(bytes: u64, target_format: &str, config: &SchedulerConfig) -> u64 {
    let factor = config.complexity_of(target_format) * config.memory_amplification;
    (bytes as f64 * factor).ceil().min(u64::MAX as f64) as u64
}

/// `Some(reason)` when `op` should be split.
pub fn should_chunk(op: &Operation, band: MemoryBand, config: &SchedulerConfig) -> Option<ChunkReason> {
    if op.estimated_input_bytes > config.chunk_size_threshold_bytes {
        Some(ChunkReason::InputSize)
    } else if band >= MemoryBand::Warning {
        Some(ChunkReason::MemoryPressure)
    } else if config.complexity_of(&op.target_format) > config.complexity_threshold {
        Some(ChunkReason::Complexity)
    } else {
        None
    }
}

// ── Splitting ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("source is empty, nothing to split")]
    EmptySource,

    #[error("cannot split source: {0}")]
    Unsplittable(String),
}

/// Partitions an operation's source into ordered segments.
pub trait Splitter: Send + Sync {
    fn split(&self, op: &Operation, config: &SchedulerConfig) -> Result<Vec<Segment>, SplitError>;
}

/// Page ranges when the page count is known, byte ranges otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageRangeSplitter;

impl PageRangeSplitter {
    /// Memory a single chunk may plan for after the Warning-band margin.
    fn chunk_budget(config: &SchedulerConfig) -> f64 {
        config.chunk_memory_ceiling_bytes as f64 / config.warning_safety_factor.max(1.0)
    }
}

impl Splitter for PageRangeSplitter {
    fn split(&self, op: &Operation, config: &SchedulerConfig) -> Result<Vec<Segment>, SplitError> {
        let budget = Self::chunk_budget(config);
        let per_byte = config.complexity_of(&op.target_format) * config.memory_amplification;
        if !(per_byte.is_finite() && per_byte > 0.0) {
            return Err(SplitError::Unsplittable(format!(
                "memory factor {per_byte} for '{}'",
                op.target_format
            )));
        }

        match op.page_count {
            Some(0) => Err(SplitError::EmptySource),
            Some(pages) => {
                let bytes_per_page = (op.estimated_input_bytes as f64 / f64::from(pages)).max(1.0);
                let per_page = bytes_per_page * per_byte;
                let fit = (budget / per_page).floor();
                let pages_per_chunk = if fit >= f64::from(config.max_pages_per_chunk) {
                    config.max_pages_per_chunk
                } else {
                    (fit as u32).max(1)
                };

                let mut segments = Vec::new();
                let mut first = 1u32;
                while first <= pages {
                    let last = first.saturating_add(pages_per_chunk - 1).min(pages);
                    segments.push(Segment::Pages { first, last });
                    first = last + 1;
                }
                Ok(segments)
            }
            None => {
                let total = op.estimated_input_bytes;
                if total == 0 {
                    return Err(SplitError::EmptySource);
                }
                let len = ((budget / per_byte).floor() as u64).max(1);
                let mut segments = Vec::new();
                let mut offset = 0u64;
                while offset < total {
                    let this = len.min(total - offset);
                    segments.push(Segment::Bytes { offset, len: this });
                    offset += this;
                }
                Ok(segments)
            }
        }
    }
}

// ── Combining ───────────────────────────────────────────────────────────────

/// Joins chunk outputs into one artifact.
///
/// Implementations must be deterministic: the same set of `(index, bytes)`
/// parts gives the same output whatever order they arrive in.
pub trait ResultCombiner: Send + Sync {
    fn combine(&self, parts: Vec<(u32, Vec<u8>)>) -> Vec<u8>;
}

/// Concatenates parts in index order with a [`ChunkSeparator`] between them.
#[derive(Debug, Clone, Default)]
pub struct ConcatCombiner {
    separator: ChunkSeparator,
}

impl ConcatCombiner {
    pub fn new(separator: ChunkSeparator) -> Self {
        Self { separator }
    }
}

impl ResultCombiner for ConcatCombiner {
    fn combine(&self, mut parts: Vec<(u32, Vec<u8>)>) -> Vec<u8> {
        parts.sort_by_key(|(index, _)| *index);
        let mut out = Vec::with_capacity(parts.iter().map(|(_, b)| b.len()).sum());
        for (n, (index, bytes)) in parts.into_iter().enumerate() {
            if n > 0 {
                out.extend_from_slice(self.separator.render(index).as_bytes());
            }
            out.extend_from_slice(&bytes);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConversionRequest;
    use crate::store::ObjectRef;

    const MIB: u64 = 1024 * 1024;

    fn op(bytes: u64, pages: Option<u32>, target: &str) -> Operation {
        let mut req = ConversionRequest::new(ObjectRef::new("mem://src/0"), "pdf", target)
            .estimated_input_bytes(bytes);
        if let Some(p) = pages {
            req = req.page_count(p);
        }
        Operation::from_request(req)
    }

    #[test]
    fn decision_reasons() {
        let c = SchedulerConfig::default();
        assert_eq!(should_chunk(&op(MIB, None, "md"), MemoryBand::Normal, &c), None);
        assert_eq!(
            should_chunk(&op(64 * MIB, None, "md"), MemoryBand::Normal, &c),
            Some(ChunkReason::InputSize)
        );
        assert_eq!(
            should_chunk(&op(MIB, None, "md"), MemoryBand::Warning, &c),
            Some(ChunkReason::MemoryPressure)
        );
        assert_eq!(
            should_chunk(&op(MIB, None, "png"), MemoryBand::Normal, &c),
            Some(ChunkReason::Complexity)
        );
    }

    #[test]
    fn estimate_scales_with_complexity() {
        let c = SchedulerConfig::default();
        assert_eq!(resource_estimate(1_000, "md", &c), 4_000);
        assert_eq!(resource_estimate(1_000, "png", &c), 10_000);
    }

    #[test]
    fn page_ranges_respect_ceiling() {
        // 12 MiB over 96 pages, md: 128 KiB * 4 = 512 KiB per page.
        // Budget 6 MiB / 1.5 = 4 MiB, so 8 pages per chunk.
        let c = SchedulerConfig::builder()
            .chunk_memory_ceiling_bytes(6 * MIB)
            .build()
            .unwrap();
        let segments = PageRangeSplitter.split(&op(12 * MIB, Some(96), "md"), &c).unwrap();
        assert_eq!(segments.len(), 12);
        assert_eq!(segments[0], Segment::Pages { first: 1, last: 8 });
        assert_eq!(segments[11], Segment::Pages { first: 89, last: 96 });
        for pair in segments.windows(2) {
            let (Segment::Pages { last, .. }, Segment::Pages { first, .. }) = (pair[0], pair[1]) else {
                panic!("expected page segments");
            };
            assert_eq!(first, last + 1);
        }
    }

    #[test]
    fn page_ranges_capped_and_floored() {
        let c = SchedulerConfig::builder().max_pages_per_chunk(7).build().unwrap();
        let tiny = PageRangeSplitter.split(&op(100, Some(20), "md"), &c).unwrap();
        assert_eq!(tiny.len(), 3);
        assert_eq!(tiny[2], Segment::Pages { first: 15, last: 20 });

        // A single page over the ceiling still gets its own chunk.
        let huge = PageRangeSplitter.split(&op(4_096 * MIB, Some(2), "md"), &c).unwrap();
        assert_eq!(huge, vec![Segment::Pages { first: 1, last: 1 }, Segment::Pages { first: 2, last: 2 }]);
    }

    #[test]
    fn byte_segments_without_page_count() {
        let c = SchedulerConfig::builder()
            .chunk_memory_ceiling_bytes(6 * MIB)
            .build()
            .unwrap();
        // 4 MiB budget / 4.0 = 1 MiB per chunk.
        let segments = PageRangeSplitter.split(&op(2 * MIB + 10, None, "md"), &c).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Bytes { offset: 0, len: MIB },
                Segment::Bytes { offset: MIB, len: MIB },
                Segment::Bytes { offset: 2 * MIB, len: 10 },
            ]
        );
    }

    #[test]
    fn empty_source_cannot_split() {
        let c = SchedulerConfig::default();
        assert_eq!(
            PageRangeSplitter.split(&op(0, None, "md"), &c),
            Err(SplitError::EmptySource)
        );
        assert_eq!(
            PageRangeSplitter.split(&op(10, Some(0), "md"), &c),
            Err(SplitError::EmptySource)
        );
    }

    #[test]
    fn combine_is_order_independent() {
        let combiner = ConcatCombiner::new(ChunkSeparator::Comment);
        let parts = vec![(0, b"a".to_vec()), (1, b"b".to_vec()), (3, b"d".to_vec())];
        let mut shuffled = parts.clone();
        shuffled.reverse();
        let expected = combiner.combine(parts);
        assert_eq!(combiner.combine(shuffled), expected);
        assert_eq!(
            String::from_utf8(expected).unwrap(),
            "a\n\n<!-- chunk 1 -->\n\nb\n\n<!-- chunk 3 -->\n\nd"
        );
    }

    #[test]
    fn default_combiner_concatenates() {
        let combiner = ConcatCombiner::default();
        assert_eq!(combiner.combine(vec![(1, b"y".to_vec()), (0, b"x".to_vec())]), b"xy");
    }
}
