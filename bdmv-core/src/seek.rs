//! Two-level EP-map search: presentation time (45 kHz) → source packet number.

use crate::clpi::{ClipInfo, CoarseEntry, EpMapEntry, FineEntry};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeekError {
    #[error("clip has no entry point map")]
    NoEntryPoints,
    #[error("no entry points for pid {0:#06x}")]
    NoEntryPointsForPid(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SeekPoint {
    /// Source packet number within the clip
    pub packet: u32,
    /// 45 kHz
    pub pts: u64,
}

#[derive(Debug, Clone)]
pub struct SeekIndex {
    entries: Vec<EpMapEntry>,
    presentation_start: u32,
}

#[inline]
fn coarse_pts(c: &CoarseEntry) -> u64 {
    ((c.pts_ep & !0x01) as u64) << 18
}

#[inline]
fn combined_pts(c: &CoarseEntry, f: &FineEntry) -> u64 {
    coarse_pts(c) | ((f.pts_ep as u64) << 8)
}

impl SeekIndex {
    pub fn new(clip: &ClipInfo) -> Self {
        Self {
            entries: clip.cpi.as_ref().map(|c| c.entries.clone()).unwrap_or_default(),
            presentation_start: clip.presentation_start(),
        }
    }

    pub fn presentation_start(&self) -> u32 {
        self.presentation_start
    }

    fn start_of_clip(&self) -> SeekPoint {
        SeekPoint {
            packet: 0,
            pts: self.presentation_start as u64,
        }
    }

    /// Finds the last entry point at or before `target` (absolute, 45 kHz).
    pub fn lookup(&self, pid: u16, target: u64) -> Result<SeekPoint, SeekError> {
        if self.entries.is_empty() {
            return Err(SeekError::NoEntryPoints);
        }
        let ep = self
            .entries
            .iter()
            .find(|e| e.pid == pid)
            .filter(|e| !e.coarse.is_empty() && !e.fine.is_empty())
            .ok_or(SeekError::NoEntryPointsForPid(pid))?;

        // coarse entries are sorted, so this is the last one not after the target
        let upper = ep.coarse.partition_point(|c| coarse_pts(c) <= target);
        for i in (0..upper).rev() {
            let coarse = &ep.coarse[i];
            let begin = (coarse.ref_ep_fine_id as usize).min(ep.fine.len());
            let end = ep
                .coarse
                .get(i + 1)
                .map(|next| next.ref_ep_fine_id as usize)
                .unwrap_or(ep.fine.len())
                .clamp(begin, ep.fine.len());

            let hit = ep.fine[begin..end]
                .iter()
                .rev()
                .find(|f| combined_pts(coarse, f) <= target);

            if let Some(fine) = hit {
                return Ok(SeekPoint {
                    packet: (coarse.spn_ep & !0x1FFFF) | fine.spn_ep,
                    pts: combined_pts(coarse, fine),
                });
            }
        }

        Ok(self.start_of_clip())
    }

    /// [`lookup`](Self::lookup) with the packet-0 fallback applied.
    pub fn lookup_or_start(&self, pid: u16, target: u64) -> SeekPoint {
        match self.lookup(pid, target) {
            Ok(point) => point,
            Err(e) => {
                tracing::warn!(pid, error = %e, "seek falling back to start of clip");
                self.start_of_clip()
            }
        }
    }

    /// Seeks to `secs` relative to the clip's presentation start.
    pub fn lookup_seconds(&self, pid: u16, secs: f64) -> SeekPoint {
        if secs <= 0.0 {
            return self.start_of_clip();
        }
        let target = self.presentation_start as u64 + (secs * 45_000.0) as u64;
        self.lookup_or_start(pid, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clpi::{parse_clip_info, tests::ClpiBuilder};
    use rand::Rng;

    // aligned to a coarse boundary so the first entry point is the clip start
    const START: u32 = 102 << 18;

    /// Coarse entry every ~5.8 s, four fine entries below each.
    fn index() -> SeekIndex {
        let base = (START >> 18) as u16 & !1;
        let mut coarse = Vec::new();
        let mut fine = Vec::new();
        for c in 0..4u16 {
            coarse.push((fine.len() as u32, base + c * 2, (c as u32) << 17));
            for f in 0..4u16 {
                fine.push((f * 0x100, (f as u32) * 100 + 1));
            }
        }
        let builder = ClpiBuilder { start: START, coarse, fine, ..Default::default() };
        SeekIndex::new(&parse_clip_info(&builder.build()).unwrap())
    }

    #[test]
    fn finds_exact_entry_point() {
        let idx = index();
        let base = ((START >> 18) as u64 & !1) << 18;
        // coarse 1, fine 2
        let target = base + (2u64 << 18) + (0x200 << 8);
        let point = idx.lookup(0x1011, target).unwrap();
        assert_eq!(point.pts, target);
        assert_eq!(point.packet, (1 << 17) | 201);

        // just before it lands on the previous fine entry
        let point = idx.lookup(0x1011, target - 1).unwrap();
        assert_eq!(point.packet, (1 << 17) | 101);
    }

    #[test]
    fn before_first_entry_is_start_of_clip() {
        let idx = index();
        let point = idx.lookup(0x1011, 1000).unwrap();
        assert_eq!(point, SeekPoint { packet: 0, pts: START as u64 });
        assert_eq!(idx.lookup_seconds(0x1011, 0.0).packet, 0);
    }

    #[test]
    fn missing_pid_falls_back_to_zero() {
        let idx = index();
        assert_eq!(idx.lookup(0x1100, 1 << 30), Err(SeekError::NoEntryPointsForPid(0x1100)));
        assert_eq!(idx.lookup_or_start(0x1100, 1 << 30).packet, 0);
    }

    #[test]
    fn empty_map_is_an_error() {
        let clip = parse_clip_info(&ClpiBuilder::default().build()).unwrap();
        let idx = SeekIndex::new(&clip);
        assert_eq!(idx.lookup(0x1011, 0), Err(SeekError::NoEntryPointsForPid(0x1011)));
    }

    #[test]
    fn lookup_is_monotonic() {
        let idx = index();
        let mut rng = rand::thread_rng();
        let base = START as u64 - 45_000;
        let mut targets: Vec<u64> = (0..500).map(|_| base + rng.gen_range(0..45_000 * 40)).collect();
        targets.sort_unstable();
        let points: Vec<SeekPoint> = targets.iter().map(|t| idx.lookup_or_start(0x1011, *t)).collect();
        for w in points.windows(2) {
            assert!(w[0].packet <= w[1].packet);
            assert!(w[0].pts <= w[1].pts);
        }
    }
}
