//! Block decoder seam and the in-tree XOR parity backend.
//!
//! The block reader feeds surviving symbols in, then asks for each missing
//! source symbol by index. Decoder failures are non-fatal: a symbol that
//! cannot be rebuilt is simply not produced.

use crate::status::Status;

/// One FEC block worth of decoding.
///
/// Symbol indices are global within the block: `0..sbl` are source symbols,
/// `sbl..sbl+n_repair` are repair symbols.
pub trait BlockDecoder {
    /// Start a block of `sbl` source symbols plus `n_repair` repair
    /// symbols, each `payload_size` bytes.
    fn begin_block(
        &mut self,
        sbl: usize,
        n_repair: usize,
        payload_size: usize,
    ) -> Result<(), Status>;

    /// Provide a surviving symbol.
    fn set_symbol(&mut self, index: usize, payload: &[u8]);

    /// Rebuild the missing source symbol at `index`, if the surviving set
    /// allows it.
    fn repair_symbol(&mut self, index: usize) -> Option<&[u8]>;

    /// Forget the current block.
    fn end_block(&mut self);
}

/// Single-parity XOR decoder.
///
/// Every repair symbol is the XOR of all source symbols in the block, so
/// exactly one missing source symbol can be rebuilt per block. Losses
/// beyond one per block are left to concealment downstream.
pub struct XorDecoder {
    sbl: usize,
    payload_size: usize,
    symbols: Vec<Option<Vec<u8>>>,
    scratch: Vec<u8>,
}

impl XorDecoder {
    pub fn new() -> Self {
        Self {
            sbl: 0,
            payload_size: 0,
            symbols: Vec::new(),
            scratch: Vec::new(),
        }
    }
}

impl Default for XorDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDecoder for XorDecoder {
    fn begin_block(
        &mut self,
        sbl: usize,
        n_repair: usize,
        payload_size: usize,
    ) -> Result<(), Status> {
        self.sbl = sbl;
        self.payload_size = payload_size;
        self.symbols.clear();
        self.symbols.resize(sbl + n_repair, None);
        Ok(())
    }

    fn set_symbol(&mut self, index: usize, payload: &[u8]) {
        if index >= self.symbols.len() || payload.len() != self.payload_size {
            return;
        }
        self.symbols[index] = Some(payload.to_vec());
    }

    fn repair_symbol(&mut self, index: usize) -> Option<&[u8]> {
        if index >= self.sbl || self.symbols[index].is_some() {
            return None;
        }

        // XOR parity rebuilds one loss; give up on two or more.
        let missing = self.symbols[..self.sbl]
            .iter()
            .filter(|s| s.is_none())
            .count();
        if missing != 1 {
            return None;
        }

        let parity = self.symbols[self.sbl..].iter().flatten().next()?;

        self.scratch.clear();
        self.scratch.extend_from_slice(parity);
        for symbol in self.symbols[..self.sbl].iter().flatten() {
            for (acc, b) in self.scratch.iter_mut().zip(symbol.iter()) {
                *acc ^= b;
            }
        }
        Some(&self.scratch)
    }

    fn end_block(&mut self) {
        self.symbols.clear();
        self.scratch.clear();
        self.sbl = 0;
        self.payload_size = 0;
    }
}

/// Compute the XOR parity of a set of equal-length source payloads.
/// The sender-side counterpart of `XorDecoder`, used by tests.
pub fn xor_parity(sources: &[&[u8]]) -> Vec<u8> {
    let Some(first) = sources.first() else {
        return Vec::new();
    };
    let mut parity = first.to_vec();
    for src in &sources[1..] {
        for (acc, b) in parity.iter_mut().zip(src.iter()) {
            *acc ^= b;
        }
    }
    parity
}
