use crate::schema::Layout;
use crate::spatial::Point;

/// One in-flight point: its decoded real-space position plus the canonical
/// record bytes in the absolute schema.
#[derive(Clone, Debug)]
pub struct Voxel {
    pub point: Point,
    pub data: Vec<u8>,
}

impl Voxel {
    pub fn from_record(layout: &Layout, record: &[u8]) -> Voxel {
        Voxel {
            point: layout.point(record),
            data: record.to_vec(),
        }
    }
}

/// Handle to one fixed-width slot in a [`MemBlock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot(u64);

/// Paged bump arena of fixed-width point slots. Grid and overflow points for
/// a chunk live here so serialization walks a handful of contiguous pages
/// instead of thousands of allocations.
#[derive(Debug)]
pub struct MemBlock {
    point_size: usize,
    points_per_page: usize,
    pages: Vec<Vec<u8>>,
    size: u64,
}

impl MemBlock {
    pub fn new(point_size: usize, points_per_page: usize) -> Self {
        assert!(point_size > 0 && points_per_page > 0);
        Self {
            point_size,
            points_per_page,
            pages: Vec::new(),
            size: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn point_size(&self) -> usize {
        self.point_size
    }

    /// Append a record, returning its slot.
    pub fn push(&mut self, record: &[u8]) -> Slot {
        assert_eq!(record.len(), self.point_size);
        let within = (self.size as usize) % self.points_per_page;
        if within == 0 {
            self.pages
                .push(Vec::with_capacity(self.point_size * self.points_per_page));
        }
        let page = self.pages.last_mut().expect("page just ensured");
        page.extend_from_slice(record);
        let slot = Slot(self.size);
        self.size += 1;
        slot
    }

    fn range(&self, slot: Slot) -> (usize, usize) {
        let index = slot.0 as usize;
        assert!((index as u64) < self.size, "slot out of range");
        let page = index / self.points_per_page;
        let start = (index % self.points_per_page) * self.point_size;
        (page, start)
    }

    pub fn get(&self, slot: Slot) -> &[u8] {
        let (page, start) = self.range(slot);
        &self.pages[page][start..start + self.point_size]
    }

    /// Exchange a slot's bytes with `record` in place.
    pub fn swap(&mut self, slot: Slot, record: &mut [u8]) {
        assert_eq!(record.len(), self.point_size);
        let (page, start) = self.range(slot);
        self.pages[page][start..start + self.point_size].swap_with_slice(record);
    }

    /// Records in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.pages
            .iter()
            .flat_map(|page| page.chunks_exact(self.point_size))
    }
}

/// Flat table of fixed-width records, the unit handed to the chunk codec.
#[derive(Clone, Debug, PartialEq)]
pub struct PointTable {
    point_size: usize,
    data: Vec<u8>,
}

impl PointTable {
    pub fn with_capacity(point_size: usize, points: usize) -> Self {
        Self {
            point_size,
            data: Vec::with_capacity(point_size * points),
        }
    }

    pub fn from_bytes(point_size: usize, data: Vec<u8>) -> Self {
        assert_eq!(data.len() % point_size, 0);
        Self { point_size, data }
    }

    pub fn point_size(&self) -> usize {
        self.point_size
    }

    pub fn len(&self) -> u64 {
        (self.data.len() / self.point_size) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn push(&mut self, record: &[u8]) {
        assert_eq!(record.len(), self.point_size);
        self.data.extend_from_slice(record);
    }

    pub fn extend_from_block(&mut self, block: &MemBlock) {
        assert_eq!(block.point_size(), self.point_size);
        for record in block.iter() {
            self.data.extend_from_slice(record);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.point_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: u8, len: usize) -> Vec<u8> {
        vec![tag; len]
    }

    #[test]
    fn mem_block_pages_preserve_insertion_order() {
        let mut block = MemBlock::new(4, 3);
        let slots: Vec<Slot> = (0..10u8).map(|i| block.push(&record(i, 4))).collect();
        assert_eq!(block.size(), 10);
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(block.get(*slot), record(i as u8, 4).as_slice());
        }
        let flattened: Vec<u8> = block.iter().map(|r| r[0]).collect();
        assert_eq!(flattened, (0..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn mem_block_swap_exchanges_payloads() {
        let mut block = MemBlock::new(4, 2);
        let slot = block.push(&record(1, 4));
        let mut incoming = record(9, 4);
        block.swap(slot, &mut incoming);
        assert_eq!(incoming, record(1, 4));
        assert_eq!(block.get(slot), record(9, 4).as_slice());
    }

    #[test]
    fn point_table_concatenates_blocks() {
        let mut a = MemBlock::new(2, 2);
        a.push(&record(1, 2));
        a.push(&record(2, 2));
        let mut b = MemBlock::new(2, 2);
        b.push(&record(3, 2));

        let mut table = PointTable::with_capacity(2, 3);
        table.extend_from_block(&a);
        table.extend_from_block(&b);
        assert_eq!(table.len(), 3);
        let tags: Vec<u8> = table.iter().map(|r| r[0]).collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }
}
