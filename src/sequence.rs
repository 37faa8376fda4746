//! Transmission-order sequence for one matrix pass: information symbols
//! first, then redundancy, optionally interleaved to diffuse burst losses.

use rand::seq::SliceRandom;

use crate::catalog::CodeDescriptor;

#[derive(Debug, Default)]
pub struct TransmitSequence {
    values: Vec<u16>,
}

impl TransmitSequence {
    pub fn new() -> Self {
        TransmitSequence { values: Vec::new() }
    }

    /// Rebuilds the sequence: indices `[0, info_count)`, then `[K, N)` when
    /// redundancy is sent. Interleaving shuffles everything except the final
    /// entry, which stays in place as the end-of-matrix marker the receiver
    /// closes on.
    pub fn reload(
        &mut self,
        code: &CodeDescriptor,
        add_redundancy: bool,
        interleave: bool,
        info_count: u16,
    ) {
        self.values.clear();
        self.values.extend(0..info_count);
        if add_redundancy {
            self.values.extend(code.k..code.n);
        }
        if interleave && self.values.len() > 2 {
            let last = self.values.len() - 1;
            self.values[..last].shuffle(&mut rand::thread_rng());
        }
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
