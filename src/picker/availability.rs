use crate::peer::Bitfield;

/// How many connected peers have each piece.
///
/// Updated incrementally as bitfields and haves arrive and as peers leave,
/// never recomputed from scratch.
#[derive(Debug, Clone)]
pub struct Availability {
    counts: Vec<u32>,
}

impl Availability {
    pub fn new(piece_count: usize) -> Self {
        Self {
            counts: vec![0; piece_count],
        }
    }

    pub fn get(&self, piece: u32) -> u32 {
        self.counts.get(piece as usize).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, piece: u32) {
        if let Some(count) = self.counts.get_mut(piece as usize) {
            *count += 1;
        }
    }

    pub fn decrement(&mut self, piece: u32) {
        if let Some(count) = self.counts.get_mut(piece as usize) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn add_bitfield(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.iter() {
            self.increment(piece as u32);
        }
    }

    pub fn remove_bitfield(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.iter() {
            self.decrement(piece as u32);
        }
    }
}
