//! Groups decoded events by the block they occurred in.
//!
//! Buckets are created in first-seen order and items keep push order, which
//! must match ascending log-index order within a block and ascending block
//! order across a batch. No reordering, no deduplication.

use std::collections::HashMap;

use crate::chain::BlockHeader;

pub struct BlockMap<T> {
    buckets: Vec<(BlockHeader, Vec<T>)>,
    index: HashMap<u64, usize>,
}

impl<T> BlockMap<T> {
    pub fn new() -> Self {
        Self {
            buckets: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Append `item` to the bucket for `header`, creating the bucket if this
    /// is the first item seen for that block.
    pub fn push(&mut self, header: BlockHeader, item: T) {
        match self.index.get(&header.height) {
            Some(&i) => self.buckets[i].1.push(item),
            None => {
                self.index.insert(header.height, self.buckets.len());
                self.buckets.push((header, vec![item]));
            }
        }
    }

    /// `(header, items)` pairs in first-seen block order.
    pub fn iter(&self) -> impl Iterator<Item = (&BlockHeader, &[T])> {
        self.buckets.iter().map(|(h, items)| (h, items.as_slice()))
    }

    /// Number of blocks with at least one item.
    pub fn block_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn item_count(&self) -> usize {
        self.buckets.iter().map(|(_, items)| items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl<T> Default for BlockMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64) -> BlockHeader {
        BlockHeader {
            height,
            timestamp: height * 12,
        }
    }

    #[test]
    fn preserves_block_and_push_order() {
        let mut map = BlockMap::new();
        map.push(header(10), "a");
        map.push(header(11), "b");
        map.push(header(10), "c");
        map.push(header(12), "d");

        let collected: Vec<(u64, Vec<&str>)> = map
            .iter()
            .map(|(h, items)| (h.height, items.to_vec()))
            .collect();
        assert_eq!(
            collected,
            vec![
                (10, vec!["a", "c"]),
                (11, vec!["b"]),
                (12, vec!["d"]),
            ]
        );
        assert_eq!(map.block_count(), 3);
        assert_eq!(map.item_count(), 4);
    }

    #[test]
    fn no_deduplication_within_a_bucket() {
        let mut map = BlockMap::new();
        map.push(header(1), 7u32);
        map.push(header(1), 7u32);
        assert_eq!(map.item_count(), 2);
    }
}
