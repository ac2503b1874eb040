//! Vector-unit register addressing.
//!
//! A 7-bit vector register number is not an index into a flat array: it
//! encodes a position in one of eight 4x4 banks plus row/column/transpose
//! bits, so two differently-numbered registers can name overlapping storage.
//! Everything here derives flat indices from that encoding; overlap is
//! computed through the same derivation, never through a table.

/// Width of a vector-unit operand group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VectorSize {
    Single = 1,
    Pair = 2,
    Triple = 3,
    Quad = 4,
}

impl VectorSize {
    #[inline]
    pub fn len(self) -> usize {
        self as usize
    }

    pub fn from_len(n: usize) -> Self {
        match n {
            1 => VectorSize::Single,
            2 => VectorSize::Pair,
            3 => VectorSize::Triple,
            4 => VectorSize::Quad,
            _ => panic!("bad vector length {n}"),
        }
    }
}

/// Derive the flat register-file indices named by `reg` at width `size`.
///
/// Returns the indices in group order; element 0 is the group's first
/// element (the lane-0 invariant of the SIMD packer relies on this).
pub fn get_vector_regs(reg: u8, size: VectorSize) -> [u8; 4] {
    let mtx = (reg >> 2) & 7;
    let col = reg & 3;
    let mut transpose = (reg >> 5) & 1;
    let row;
    match size {
        VectorSize::Single => {
            transpose = 0;
            row = (reg >> 5) & 3;
        }
        VectorSize::Pair => row = (reg >> 5) & 2,
        VectorSize::Triple => row = (reg >> 6) & 1,
        VectorSize::Quad => row = (reg >> 5) & 2,
    }

    let mut out = [0u8; 4];
    for (i, slot) in out.iter_mut().enumerate().take(size.len()) {
        let r = (row as usize + i) & 3;
        let idx = if transpose != 0 {
            mtx as usize * 4 + r + col as usize * 32
        } else {
            mtx as usize * 4 + col as usize + r * 32
        };
        *slot = idx as u8;
    }
    out
}

/// Count how many storage elements two operand groups share.
///
/// Pure query over the same index derivation used for addressing; callers
/// treat any nonzero result as aliasing.
pub fn vector_overlap(reg1: u8, size1: VectorSize, reg2: u8, size2: VectorSize) -> usize {
    // Different banks cannot overlap.
    if (reg1 >> 2) & 7 != (reg2 >> 2) & 7 {
        return 0;
    }
    let r1 = get_vector_regs(reg1, size1);
    let r2 = get_vector_regs(reg2, size2);
    let mut count = 0;
    for a in &r1[..size1.len()] {
        for b in &r2[..size2.len()] {
            if a == b {
                count += 1;
            }
        }
    }
    count
}

/// Whether writing group `dst` while reading group `src` requires
/// serialization: true when some element of `dst` appears in `src` at a
/// *different* position. Exact elementwise identity is safe, since lane i
/// then only depends on lane i.
pub fn overlaps_badly<T: PartialEq>(dst: &[T], src: &[T]) -> bool {
    dst.iter().enumerate().any(|(i, d)| {
        src.iter()
            .enumerate()
            .any(|(j, s)| s == d && i != j)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_rows() {
        // Register 0 with row bits cycling selects down one column.
        assert_eq!(get_vector_regs(0x00, VectorSize::Single)[0], 0);
        assert_eq!(get_vector_regs(0x20, VectorSize::Single)[0], 32);
        assert_eq!(get_vector_regs(0x40, VectorSize::Single)[0], 64);
        assert_eq!(get_vector_regs(0x60, VectorSize::Single)[0], 96);
    }

    #[test]
    fn quad_column_stride() {
        let regs = get_vector_regs(0x00, VectorSize::Quad);
        assert_eq!(&regs[..], &[0, 32, 64, 96]);
    }

    #[test]
    fn quad_transposed_is_consecutive() {
        let regs = get_vector_regs(0x20, VectorSize::Quad);
        assert_eq!(&regs[..], &[0, 1, 2, 3]);
    }

    #[test]
    fn row_and_column_views_alias() {
        // A column and the transposed row through the same bank share
        // exactly one element.
        assert_eq!(
            vector_overlap(0x00, VectorSize::Quad, 0x20, VectorSize::Quad),
            1
        );
    }

    #[test]
    fn identical_groups_fully_overlap() {
        assert_eq!(
            vector_overlap(0x05, VectorSize::Pair, 0x05, VectorSize::Pair),
            2
        );
    }

    #[test]
    fn bad_overlap_excludes_identity() {
        let a = [0u8, 32, 64, 96];
        assert!(!overlaps_badly(&a, &a));
        let shifted = [32u8, 64, 96, 0];
        assert!(overlaps_badly(&a, &shifted));
        let disjoint = [1u8, 33, 65, 97];
        assert!(!overlaps_badly(&a, &disjoint));
    }

    proptest! {
        /// The overlap query must agree with brute-force index-set
        /// intersection for every register pair and width combination.
        #[test]
        fn overlap_matches_bruteforce(r1 in 0u8..128, r2 in 0u8..128, s1 in 1usize..5, s2 in 1usize..5) {
            let sz1 = VectorSize::from_len(s1);
            let sz2 = VectorSize::from_len(s2);
            let a = get_vector_regs(r1, sz1);
            let b = get_vector_regs(r2, sz2);
            let mut expected = 0;
            for x in &a[..s1] {
                for y in &b[..s2] {
                    if x == y {
                        expected += 1;
                    }
                }
            }
            prop_assert_eq!(vector_overlap(r1, sz1, r2, sz2), expected);
        }

        /// Derived indices always stay inside the register file.
        #[test]
        fn indices_in_range(r in 0u8..128, s in 1usize..5) {
            let sz = VectorSize::from_len(s);
            let regs = get_vector_regs(r, sz);
            for &idx in &regs[..s] {
                prop_assert!((idx as usize) < crate::state::NUM_VPR);
            }
        }
    }
}
