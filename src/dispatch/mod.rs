//! Discard range batching and per-member streaming.
//!
//! Extents are translated into device-relative `start:length` ranges and
//! split so no single range exceeds the channel's span limit. Members are
//! handled strictly one at a time; a channel failure is reported, never
//! retried, and never stops the later post-discard verification of that
//! member.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::plan::{Extent, ExtentMap};
use crate::ports::{DiscardRange, DiscardSink};

/// Maximum sectors per discard range command. Matches the span the hdparm
/// trim-sector-ranges protocol accepts comfortably.
pub const MAX_RANGE_SECTORS: u64 = 4000;

// =============================================================================
// Range Splitting
// =============================================================================

/// Split one extent into consecutive ranges of at most `max_span` sectors.
///
/// The ranges exactly cover `[begin_lba, begin_lba + length_blocks)` with
/// no overlap, in ascending order.
pub fn split_ranges(extent: &Extent, max_span: u64) -> Vec<DiscardRange> {
    let mut ranges = Vec::new();
    let mut start = extent.begin_lba;
    let mut remaining = extent.length_blocks;

    while remaining > 0 {
        let length = remaining.min(max_span);
        ranges.push(DiscardRange {
            start_sector: start,
            length_sectors: length,
        });
        start += length;
        remaining -= length;
    }

    ranges
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Streams batched discard ranges to one member at a time.
pub struct DiscardDispatcher {
    max_span: u64,
}

impl Default for DiscardDispatcher {
    fn default() -> Self {
        Self {
            max_span: MAX_RANGE_SECTORS,
        }
    }
}

impl DiscardDispatcher {
    pub fn new(max_span: u64) -> Self {
        Self { max_span }
    }

    /// Stream every extent's ranges, shifted by the member's physical
    /// offset, into `sink`, then terminate the stream and wait for the
    /// channel to finish.
    ///
    /// The end-of-input terminator is always delivered, even when a send
    /// fails partway, so the channel can exit cleanly. A non-zero
    /// completion status becomes [`Error::DispatchFailure`]; the caller
    /// reports it and still runs post-discard verification on the member.
    /// Nothing here is ever retried: a destructive command against unknown
    /// drive state must not be repeated.
    pub fn dispatch(
        &self,
        member: &str,
        offset_sectors: u64,
        map: &ExtentMap,
        sink: &mut dyn DiscardSink,
    ) -> Result<()> {
        let mut send_error = None;

        'extents: for extent in map.iter() {
            for mut range in split_ranges(extent, self.max_span) {
                range.start_sector += offset_sectors;
                if let Err(e) = sink.send(range) {
                    warn!("Range send to {} failed: {}", member, e);
                    send_error = Some(e);
                    break 'extents;
                }
            }
        }

        let status = sink.finish();

        if let Some(e) = send_error {
            return Err(e);
        }
        match status? {
            0 => {
                info!("Finished trimming data on {}", member);
                Ok(())
            }
            code => Err(Error::DispatchFailure {
                member: member.to_string(),
                status: code,
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RawExtent;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn extent(begin: u64, length: u64) -> Extent {
        Extent {
            begin_lba: begin,
            end_lba: begin + length - 1,
            length_blocks: length,
            byte_offset: 0,
        }
    }

    #[test]
    fn test_split_exact_at_limit_boundary() {
        // [1000, 1500) with limit 400: 1000:400 then 1400:100
        let ranges = split_ranges(&extent(1000, 500), 400);
        assert_eq!(
            ranges,
            vec![
                DiscardRange {
                    start_sector: 1000,
                    length_sectors: 400
                },
                DiscardRange {
                    start_sector: 1400,
                    length_sectors: 100
                },
            ]
        );
    }

    #[test]
    fn test_split_small_extent_is_one_range() {
        let ranges = split_ranges(&extent(0, 100), 4000);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].length_sectors, 100);
    }

    proptest! {
        #[test]
        fn prop_split_covers_exactly_no_overlap(
            begin in 0u64..1_000_000,
            length in 1u64..100_000,
            max_span in 1u64..10_000,
        ) {
            let ranges = split_ranges(&extent(begin, length), max_span);

            // Exact cover, in order, no overlap.
            let mut cursor = begin;
            for range in &ranges {
                prop_assert_eq!(range.start_sector, cursor);
                prop_assert!(range.length_sectors > 0);
                prop_assert!(range.length_sectors <= max_span);
                cursor += range.length_sectors;
            }
            prop_assert_eq!(cursor, begin + length);

            // Total length preserved.
            let total: u64 = ranges.iter().map(|r| r.length_sectors).sum();
            prop_assert_eq!(total, length);
        }
    }

    /// Recording sink for dispatch tests.
    struct RecordingSink {
        sent: Vec<DiscardRange>,
        finished: bool,
        status: i32,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        fn new(status: i32) -> Self {
            Self {
                sent: Vec::new(),
                finished: false,
                status,
                fail_after: None,
            }
        }
    }

    impl DiscardSink for RecordingSink {
        fn send(&mut self, range: DiscardRange) -> Result<()> {
            if let Some(limit) = self.fail_after {
                if self.sent.len() >= limit {
                    return Err(Error::Io(std::io::Error::other("broken pipe")));
                }
            }
            self.sent.push(range);
            Ok(())
        }

        fn finish(&mut self) -> Result<i32> {
            self.finished = true;
            Ok(self.status)
        }
    }

    fn two_extent_map() -> ExtentMap {
        ExtentMap::from_raw(&[
            RawExtent {
                byte_offset: 0,
                begin_lba: 1000,
                end_lba: 1499,
                length_blocks: 500,
            },
            RawExtent {
                byte_offset: 256_000,
                begin_lba: 5000,
                end_lba: 5099,
                length_blocks: 100,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_dispatch_shifts_ranges_by_member_offset() {
        let mut sink = RecordingSink::new(0);
        let dispatcher = DiscardDispatcher::new(400);

        dispatcher
            .dispatch("sdb", 16, &two_extent_map(), &mut sink)
            .unwrap();

        assert!(sink.finished);
        let starts: Vec<u64> = sink.sent.iter().map(|r| r.start_sector).collect();
        assert_eq!(starts, vec![1016, 1416, 5016]);
    }

    #[test]
    fn test_dispatch_failure_reports_status() {
        let mut sink = RecordingSink::new(5);
        let dispatcher = DiscardDispatcher::default();

        let result = dispatcher.dispatch("sdb", 0, &two_extent_map(), &mut sink);
        assert!(sink.finished);
        assert_matches!(
            result,
            Err(Error::DispatchFailure { status: 5, .. })
        );
    }

    #[test]
    fn test_terminator_delivered_even_after_send_failure() {
        let mut sink = RecordingSink::new(0);
        sink.fail_after = Some(1);
        let dispatcher = DiscardDispatcher::new(400);

        let result = dispatcher.dispatch("sdb", 0, &two_extent_map(), &mut sink);
        assert!(result.is_err());
        assert!(sink.finished, "terminator must be sent after a send failure");
    }
}
