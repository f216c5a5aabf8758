//! Sequence filter (C2): single-writer serialization of the monotonic
//! watermark. See SPEC_FULL.md §4.2.
//!
//! DESIGN:
//! - Market-data feeds on multi-path upstream links can deliver the same
//!   logical record multiple times, possibly out of order by microseconds.
//!   The filter guarantees at-most-one forward per `seqId` value and drops
//!   any frame strictly older than the newest already forwarded. Gaps are
//!   deliberately not recovered.
//! - The watermark variant is canonical (not a seen-set): a missing record
//!   is lost rather than delayed, and admitted frames are strictly
//!   increasing in `seqId`.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::metrics::METRICS;

/// Monotonic sequence-id watermark shared across all upstream sources
/// feeding this process.
pub struct SequenceFilter {
    max_seq: AtomicI64,
}

impl SequenceFilter {
    pub fn new() -> Self {
        Self {
            max_seq: AtomicI64::new(0),
        }
    }

    /// Parses `frame` as a structured document and admits it iff its
    /// `data[0].seqId` strictly exceeds the watermark at the moment of
    /// comparison. The caller forwards the original, unmodified bytes to
    /// the broadcast server when this returns `true` — the filter never
    /// touches the bytes themselves (conservation, spec §8).
    pub fn process(&self, frame: &str, debug: bool) -> bool {
        let doc: serde_json::Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(_) => {
                if debug {
                    log::debug!("[Filter] parse error, dropping frame: {frame}");
                }
                METRICS
                    .frames_dropped_parse
                    .fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        if doc.get("arg").is_none() || doc.get("data").is_none() {
            if debug {
                log::debug!("[Filter] non-data frame, ignored: {frame}");
            }
            return false;
        }

        let seq = match doc
            .get("data")
            .and_then(|d| d.as_array())
            .filter(|arr| !arr.is_empty())
            .and_then(|arr| arr[0].get("seqId"))
            .and_then(|s| s.as_i64())
        {
            Some(s) => s,
            None => {
                if debug {
                    log::debug!("[Filter] missing/empty data or seqId, dropping: {frame}");
                }
                return false;
            }
        };

        if !self.try_admit(seq) {
            if debug {
                log::debug!("[Filter] old or duplicate seqId={seq}, dropping");
            }
            METRICS
                .frames_dropped_duplicate
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }

        METRICS.frames_admitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Admits `seq` iff it strictly exceeds the current watermark, updating
    /// the watermark under a compare-and-swap loop so the check-then-set is
    /// atomic without taking a lock.
    fn try_admit(&self, seq: i64) -> bool {
        let mut current = self.max_seq.load(Ordering::Acquire);
        loop {
            if seq <= current {
                return false;
            }
            match self.max_seq.compare_exchange_weak(
                current,
                seq,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    #[cfg(test)]
    fn watermark(&self) -> i64 {
        self.max_seq.load(Ordering::Acquire)
    }
}

impl Default for SequenceFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: i64) -> String {
        format!(r#"{{"arg":{{}},"data":[{{"seqId":{seq},"px":"A"}}]}}"#)
    }

    #[test]
    fn admits_strictly_increasing_seq() {
        let f = SequenceFilter::new();
        assert!(f.process(&frame(1001), false));
        assert_eq!(f.watermark(), 1001);
    }

    #[test]
    fn drops_duplicate() {
        let f = SequenceFilter::new();
        assert!(f.process(&frame(1001), false));
        assert!(f.process(&frame(1001), false) == false);
        assert_eq!(f.watermark(), 1001);
    }

    #[test]
    fn drops_out_of_order() {
        let f = SequenceFilter::new();
        assert!(f.process(&frame(1001), false));
        assert!(f.process(&frame(1000), false) == false);
        assert_eq!(f.watermark(), 1001);
    }

    #[test]
    fn boundary_seq_equals_watermark_is_dropped() {
        let f = SequenceFilter::new();
        assert!(f.process(&frame(5), false));
        assert!(f.process(&frame(5), false) == false);
    }

    #[test]
    fn boundary_seq_plus_one_is_admitted() {
        let f = SequenceFilter::new();
        assert!(f.process(&frame(5), false));
        assert!(f.process(&frame(6), false));
    }

    #[test]
    fn ignores_event_frame_without_arg() {
        let f = SequenceFilter::new();
        let ev = r#"{"event":"subscribe","arg":{}}"#;
        assert!(f.process(ev, false) == false);
        assert_eq!(f.watermark(), 0);
    }

    #[test]
    fn ignores_empty_data() {
        let f = SequenceFilter::new();
        let ev = r#"{"arg":{},"data":[]}"#;
        assert!(f.process(ev, false) == false);
    }

    #[test]
    fn ignores_data_without_seq_id() {
        let f = SequenceFilter::new();
        let ev = r#"{"arg":{},"data":[{"px":"A"}]}"#;
        assert!(f.process(ev, false) == false);
    }

    #[test]
    fn negative_seq_id_is_reachable_as_first_admission() {
        let f = SequenceFilter::new();
        assert!(f.process(&frame(-5), false));
        assert_eq!(f.watermark(), -5);
        assert!(f.process(&frame(-6), false) == false);
        assert!(f.process(&frame(-4), false));
    }

    #[test]
    fn drops_malformed_json() {
        let f = SequenceFilter::new();
        assert!(f.process("not json", false) == false);
    }

    #[test]
    fn monotonic_sequence_of_admissions_strictly_increases() {
        let f = SequenceFilter::new();
        let mut admitted = Vec::new();
        for seq in [10, 11, 9, 11, 12, 12, 13] {
            if f.process(&frame(seq), false) {
                admitted.push(seq);
            }
        }
        assert_eq!(admitted, vec![10, 11, 12, 13]);
        for w in admitted.windows(2) {
            assert!(w[0] < w[1]);
        }
    }
}
