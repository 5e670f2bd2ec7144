//! Second-level table descriptors

use tern_cap::Capability;
use tern_platform::{BASE_PAGE_BITS, L1_SECTION_SIZE, L2_ENTRIES, L2_INDEX_MASK};

const CHUNKS: usize = L2_ENTRIES / 32;

/// First-level index of `vaddr`
pub const fn l1_index(vaddr: usize) -> usize {
    vaddr >> 20
}

/// Second-level index of `vaddr`
pub const fn l2_index(vaddr: usize) -> usize {
    (vaddr >> BASE_PAGE_BITS) & L2_INDEX_MASK
}

/// Pages from `vaddr` to the end of its 1 MiB section
pub const fn pages_left_in_section(vaddr: usize) -> usize {
    (L1_SECTION_SIZE - (vaddr & (L1_SECTION_SIZE - 1))) >> BASE_PAGE_BITS
}

/// An installed L2 table and the pages present in it
#[derive(Debug)]
pub struct L2Table {
    cap: Capability,
    present: [u32; CHUNKS],
}

impl L2Table {
    pub fn new(cap: Capability) -> Self {
        Self { cap, present: [0; CHUNKS] }
    }

    pub fn cap(&self) -> &Capability {
        &self.cap
    }

    pub fn into_cap(self) -> Capability {
        self.cap
    }

    pub fn is_present(&self, i2: usize) -> bool {
        i2 < L2_ENTRIES && self.present[i2 / 32] & (1 << (i2 % 32)) != 0
    }

    pub fn set_present(&mut self, i2: usize) {
        self.present[i2 / 32] |= 1 << (i2 % 32);
    }

    pub fn clear_present(&mut self, i2: usize) {
        self.present[i2 / 32] &= !(1 << (i2 % 32));
    }

    pub fn present_count(&self) -> usize {
        self.present.iter().map(|c| c.count_ones() as usize).sum()
    }
}
