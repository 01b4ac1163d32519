//! FIFO of deferred data rows, each tagged with its origin node.
//!
//! Rows land here in two situations: a handle being transferred to another
//! combiner mid-query has its pending rows absorbed, and the merge-sort
//! driver buffers rows that belong to a tape other than the one it is
//! currently reading. Entries are never reordered; removing a cell adjusts
//! every tape mark that pointed past it.

use std::collections::VecDeque;

use bytes::Bytes;
use trellis_wire::NodeId;

/// One decoded-enough data row: the raw `DataRow` payload tagged with the
/// backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub node: NodeId,
    pub data: Bytes,
}

#[derive(Debug, Default)]
pub struct RowBuffer {
    cells: VecDeque<Tuple>,
    /// Per-tape cursor into `cells`: the first cell this tape has not yet
    /// scanned. Always `<= cells.len()`.
    marks: Vec<usize>,
}

impl RowBuffer {
    pub fn new() -> RowBuffer {
        RowBuffer::default()
    }

    /// Allocate one scan mark per merge-sort tape.
    pub fn init_tapes(&mut self, tapes: usize) {
        self.marks = vec![0; tapes];
    }

    pub fn push_back(&mut self, row: Tuple) {
        self.cells.push_back(row);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Marks never point past the end of the buffer.
    pub fn marks_valid(&self) -> bool {
        self.marks.iter().all(|&m| m <= self.cells.len())
    }

    /// Pop the oldest row regardless of origin (plain, non-sorted fetch).
    pub fn pop_front(&mut self) -> Option<Tuple> {
        let row = self.cells.pop_front()?;
        for mark in &mut self.marks {
            *mark = mark.saturating_sub(1);
        }
        debug_assert!(self.marks_valid());
        Some(row)
    }

    /// Take the first buffered row for `tape` (origin `node`) at or after
    /// the tape's mark. Removal shifts later cells down, so every mark
    /// pointing past the removed cell is pulled back with them.
    pub fn take_for_tape(&mut self, tape: usize, node: NodeId) -> Option<Tuple> {
        let start = self.marks[tape];
        let offset = self
            .cells
            .iter()
            .skip(start)
            .position(|cell| cell.node == node)?;
        let idx = start + offset;
        let row = self.cells.remove(idx)?;
        for mark in &mut self.marks {
            if *mark > idx {
                *mark -= 1;
            }
        }
        // resume the next scan for this tape where the removed cell was
        self.marks[tape] = idx;
        debug_assert!(self.marks_valid());
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn row(node: u32, label: &str) -> Tuple {
        Tuple {
            node: NodeId(node),
            data: Bytes::copy_from_slice(label.as_bytes()),
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut buf = RowBuffer::new();
        buf.push_back(row(1, "a"));
        buf.push_back(row(2, "b"));
        buf.push_back(row(1, "c"));
        assert_eq!(buf.pop_front().unwrap().data, "a");
        assert_eq!(buf.pop_front().unwrap().data, "b");
        assert_eq!(buf.pop_front().unwrap().data, "c");
        assert!(buf.pop_front().is_none());
    }

    #[test]
    fn take_for_tape_skips_other_origins() {
        let mut buf = RowBuffer::new();
        buf.init_tapes(2);
        buf.push_back(row(1, "a1"));
        buf.push_back(row(2, "b1"));
        buf.push_back(row(1, "a2"));
        buf.push_back(row(2, "b2"));

        // tape 1 wants node 2's rows, in order, leaving node 1's in place
        assert_eq!(buf.take_for_tape(1, NodeId(2)).unwrap().data, "b1");
        assert_eq!(buf.take_for_tape(1, NodeId(2)).unwrap().data, "b2");
        assert!(buf.take_for_tape(1, NodeId(2)).is_none());
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.take_for_tape(0, NodeId(1)).unwrap().data, "a1");
        assert_eq!(buf.take_for_tape(0, NodeId(1)).unwrap().data, "a2");
        assert!(buf.marks_valid());
    }

    #[test]
    fn removal_adjusts_other_tapes_marks() {
        let mut buf = RowBuffer::new();
        buf.init_tapes(2);
        buf.push_back(row(2, "b1"));
        buf.push_back(row(1, "a1"));
        buf.push_back(row(2, "b2"));

        // tape 0 consumes node 1's row in the middle; tape 1's scan position
        // must survive the shift
        assert_eq!(buf.take_for_tape(1, NodeId(2)).unwrap().data, "b1");
        assert_eq!(buf.take_for_tape(0, NodeId(1)).unwrap().data, "a1");
        assert_eq!(buf.take_for_tape(1, NodeId(2)).unwrap().data, "b2");
        assert!(buf.is_empty());
        assert!(buf.marks_valid());
    }

    #[test]
    fn pop_front_pulls_marks_back() {
        let mut buf = RowBuffer::new();
        buf.init_tapes(1);
        buf.push_back(row(1, "a"));
        buf.push_back(row(1, "b"));
        // move the mark forward by consuming via the tape
        assert_eq!(buf.take_for_tape(0, NodeId(1)).unwrap().data, "a");
        buf.pop_front().unwrap();
        assert!(buf.marks_valid());
        assert!(buf.is_empty());
    }

    #[test]
    fn marks_never_pass_the_end() {
        let mut buf = RowBuffer::new();
        buf.init_tapes(3);
        for i in 0..10 {
            buf.push_back(row(i % 3, &format!("r{i}")));
        }
        while buf.take_for_tape(0, NodeId(0)).is_some() {}
        while buf.take_for_tape(1, NodeId(1)).is_some() {}
        assert!(buf.marks_valid());
        while buf.take_for_tape(2, NodeId(2)).is_some() {}
        assert!(buf.is_empty());
        assert!(buf.marks_valid());
    }
}
