/// Byte-range edits recorded against a page frame.
///
/// Deltas are kept sorted by offset and merged when they touch or overlap,
/// so the list stays canonical: sorted, pairwise disjoint, non-adjacent.

/// Per-delta framing overhead in a WAL data payload (offset + size, u16 each).
pub const DELTA_OVERHEAD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDelta {
    pub offset: usize,
    pub size: usize,
}

impl PageDelta {
    pub fn new(offset: usize, size: usize) -> Self {
        PageDelta { offset, size }
    }

    fn end(&self) -> usize {
        self.offset + self.size
    }
}

fn can_merge(lhs: &PageDelta, rhs: &PageDelta) -> bool {
    debug_assert!(lhs.offset <= rhs.offset);
    rhs.offset <= lhs.end()
}

fn merge(lhs: &PageDelta, rhs: &PageDelta) -> PageDelta {
    PageDelta {
        offset: lhs.offset,
        size: lhs.size.max(rhs.end() - lhs.offset),
    }
}

/// Insert a delta, merging with its neighbours where ranges touch or overlap.
pub fn insert_delta(deltas: &mut Vec<PageDelta>, delta: PageDelta) {
    debug_assert!(delta.size > 0);
    if deltas.is_empty() {
        deltas.push(delta);
        return;
    }

    // First entry with offset > delta.offset.
    let index = deltas.partition_point(|d| d.offset <= delta.offset);

    if index < deltas.len() && can_merge(&delta, &deltas[index]) {
        deltas[index] = merge(&delta, &deltas[index]);
        // The merged entry may now touch its left neighbour.
        if index > 0 && can_merge(&deltas[index - 1], &deltas[index]) {
            deltas[index - 1] = merge(&deltas[index - 1], &deltas[index]);
            deltas.remove(index);
        }
        return;
    }
    if index > 0 && can_merge(&deltas[index - 1], &delta) {
        deltas[index - 1] = merge(&deltas[index - 1], &delta);
        return;
    }
    deltas.insert(index, delta);
}

/// Pairwise merge in a single left-to-right sweep. Returns the total encoded
/// size of the compressed list (payload bytes plus per-delta overhead).
pub fn compress_deltas(deltas: &mut Vec<PageDelta>) -> usize {
    if deltas.len() > 1 {
        let mut lhs = 0;
        for rhs in 1..deltas.len() {
            if can_merge(&deltas[lhs], &deltas[rhs]) {
                deltas[lhs] = merge(&deltas[lhs], &deltas[rhs]);
            } else {
                lhs += 1;
                deltas[lhs] = deltas[rhs];
            }
        }
        deltas.truncate(lhs + 1);
    }
    deltas.iter().map(|d| d.size + DELTA_OVERHEAD).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(offset: usize, size: usize) -> PageDelta {
        PageDelta::new(offset, size)
    }

    #[test]
    fn insert_keeps_sorted_and_merges_overlap() {
        let mut deltas = Vec::new();
        insert_delta(&mut deltas, d(20, 5));
        insert_delta(&mut deltas, d(0, 10));
        insert_delta(&mut deltas, d(8, 4));
        insert_delta(&mut deltas, d(24, 1));
        assert_eq!(deltas, vec![d(0, 12), d(20, 5)]);
    }

    #[test]
    fn insert_merges_touching_ranges() {
        let mut deltas = vec![d(0, 4), d(8, 4)];
        // Touches both neighbours; all three collapse to one.
        insert_delta(&mut deltas, d(4, 4));
        assert_eq!(deltas, vec![d(0, 12)]);
    }

    #[test]
    fn compress_merges_overlapping_and_touching_runs() {
        let mut deltas = vec![d(0, 10), d(8, 4), d(20, 5), d(24, 2)];
        let encoded = compress_deltas(&mut deltas);
        assert_eq!(deltas, vec![d(0, 12), d(20, 6)]);
        assert_eq!(encoded, 12 + 6 + 2 * DELTA_OVERHEAD);
    }

    #[test]
    fn compress_is_idempotent() {
        let mut deltas = vec![d(0, 10), d(8, 4), d(20, 5), d(24, 2)];
        compress_deltas(&mut deltas);
        let once = deltas.clone();
        let encoded = compress_deltas(&mut deltas);
        assert_eq!(deltas, once);
        assert_eq!(encoded, 12 + 6 + 2 * DELTA_OVERHEAD);
    }

    #[test]
    fn compress_preserves_byte_union() {
        let mut deltas = vec![d(3, 2), d(5, 1), d(10, 2), d(100, 30), d(120, 20)];
        let union: Vec<usize> = deltas
            .iter()
            .flat_map(|delta| delta.offset..delta.offset + delta.size)
            .collect();
        compress_deltas(&mut deltas);
        for byte in union {
            assert!(
                deltas.iter().any(|d| d.offset <= byte && byte < d.offset + d.size),
                "byte {byte} lost by compression"
            );
        }
        // Canonical: sorted, disjoint, non-adjacent.
        for pair in deltas.windows(2) {
            assert!(pair[0].offset + pair[0].size < pair[1].offset);
        }
    }

    #[test]
    fn single_delta_is_untouched() {
        let mut deltas = vec![d(7, 3)];
        assert_eq!(compress_deltas(&mut deltas), 3 + DELTA_OVERHEAD);
        assert_eq!(deltas, vec![d(7, 3)]);
    }
}
