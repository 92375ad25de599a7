//! Randomised traversal of playlist indices.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Steps through a random permutation of `0..len`, drawing a fresh
/// permutation every time the cursor runs off either end.
///
/// Passes are independent, so a track may repeat across a pass boundary.
#[derive(Debug)]
pub struct ShuffleSequencer {
    enabled: bool,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl ShuffleSequencer {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic sequencer for tests and reproducible sessions.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            enabled: false,
            order: Vec::new(),
            cursor: 0,
            rng,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Index under the cursor, if shuffle is on and the order is non-empty.
    pub fn current(&self) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        self.order.get(self.cursor).copied()
    }

    /// Turns shuffle on with a fresh permutation of `0..len`.
    pub fn enable(&mut self, len: usize) {
        self.enabled = true;
        self.regenerate(len);
        self.cursor = 0;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Flips shuffle and returns the new state.
    pub fn toggle(&mut self, len: usize) -> bool {
        if self.enabled {
            self.disable();
        } else {
            self.enable(len);
        }
        self.enabled
    }

    /// Keeps the permutation in step with a replaced playlist.
    pub fn playlist_replaced(&mut self, len: usize) {
        if self.enabled {
            self.regenerate(len);
            self.cursor = 0;
        }
    }

    pub fn next(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        self.cursor += 1;
        if self.cursor >= self.order.len() || self.order.len() != len {
            self.regenerate(len);
            self.cursor = 0;
        }
        self.order.get(self.cursor).copied()
    }

    pub fn prev(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match self.cursor.checked_sub(1) {
            Some(cursor) if self.order.len() == len => self.cursor = cursor,
            _ => {
                self.regenerate(len);
                self.cursor = len - 1;
            }
        }
        self.order.get(self.cursor).copied()
    }

    fn regenerate(&mut self, len: usize) {
        self.order = fisher_yates(len, &mut self.rng);
    }
}

impl Default for ShuffleSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform random permutation of `0..len`.
pub fn fisher_yates<R: Rng>(len: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.gen_range(0..=i);
        order.swap(i, j);
    }
    order
}
