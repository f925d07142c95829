//! Victim selection for the frame table.

use alloc::collections::BTreeMap;

/// What a replacement policy may observe about a resident frame.
pub trait Resident {
    /// Whether the page in this frame was referenced since the bit was last cleared.
    fn accessed(&self) -> bool;
    fn clear_accessed(&self);
    /// Monotonic stamp of when the frame was (re)queued for replacement.
    fn queued_at(&self) -> u64;
}

pub trait PageReplacementPolicy: Default + Send {
    /// Pick the frame number to evict from `frames`, keyed by frame number.
    ///
    /// Returns `None` only when `frames` is empty.
    fn select_victim<F: Resident>(&mut self, frames: &BTreeMap<usize, F>) -> Option<usize>;
}

/// Second-chance replacement: sweep frames in frame-number order from where
/// the previous sweep stopped, clearing accessed bits, and take the first
/// frame found with the bit already clear.
#[derive(Default)]
pub struct Clock {
    /// The frame number the next sweep starts at.
    hand: usize,
}

impl PageReplacementPolicy for Clock {
    fn select_victim<F: Resident>(&mut self, frames: &BTreeMap<usize, F>) -> Option<usize> {
        // The first sweep clears every bit it passes, so the second one finds
        // a victim unless pages are being touched as fast as we sweep.
        for _ in 0..2 {
            let sweep = frames.range(self.hand..).chain(frames.range(..self.hand));
            for (&number, frame) in sweep {
                if frame.accessed() {
                    frame.clear_accessed();
                } else {
                    self.hand = number + 1;
                    return Some(number);
                }
            }
        }

        let (&number, _) = frames
            .range(self.hand..)
            .next()
            .or_else(|| frames.iter().next())?;
        self.hand = number + 1;
        Some(number)
    }
}

/// Evict whichever frame was queued longest ago, ignoring accessed bits.
#[derive(Default)]
pub struct Fifo;

impl PageReplacementPolicy for Fifo {
    fn select_victim<F: Resident>(&mut self, frames: &BTreeMap<usize, F>) -> Option<usize> {
        frames
            .iter()
            .min_by_key(|(_, frame)| frame.queued_at())
            .map(|(&number, _)| number)
    }
}

#[cfg(not(feature = "fifo_eviction"))]
pub type DefaultPolicy = Clock;
#[cfg(feature = "fifo_eviction")]
pub type DefaultPolicy = Fifo;
