use crate::interface::QuickenInterface;
use log::warn;
use std::sync::Arc;

/// One executable mapping of an image in the target process.
#[derive(Debug, Clone)]
pub struct MapInfo {
    pub start: u64,
    pub end: u64,
    /// File offset the mapping starts at.
    pub offset: u64,
    pub interface: Arc<QuickenInterface>,
}

impl MapInfo {
    pub fn new(start: u64, end: u64, offset: u64, interface: Arc<QuickenInterface>) -> Self {
        Self {
            start,
            end,
            offset,
            interface,
        }
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    /// `pc` as an address of the image's own (ELF virtual) address space.
    pub fn rel_pc(&self, pc: u64) -> u64 {
        pc.wrapping_sub(self.start)
            .wrapping_add(self.offset)
            .wrapping_add(self.interface.load_bias())
    }
}

/// The mapped images of one process, sorted by start address.
#[derive(Debug, Default, Clone)]
pub struct QuickenMaps {
    maps: Vec<MapInfo>,
}

impl QuickenMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, map: MapInfo) {
        let index = match self.maps.binary_search_by_key(&map.start, |m| m.start) {
            Ok(i) => {
                warn!("two maps start at {:#x}", map.start);
                i
            }
            Err(i) => i,
        };
        self.maps.insert(index, map);
    }

    pub fn remove(&mut self, start: u64) -> Option<MapInfo> {
        let index = self.maps.binary_search_by_key(&start, |m| m.start).ok()?;
        Some(self.maps.remove(index))
    }

    pub fn find(&self, pc: u64) -> Option<&MapInfo> {
        let index = match self.maps.binary_search_by_key(&pc, |m| m.start) {
            Ok(i) => i,
            Err(i) => i.checked_sub(1)?,
        };
        let map = &self.maps[index];
        map.contains(pc).then_some(map)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapInfo> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::memory::MemoryBuffer;

    fn map(start: u64, end: u64, offset: u64, load_bias: u64) -> MapInfo {
        let memory = Arc::new(MemoryBuffer::default());
        let interface = QuickenInterface::new(memory, load_bias, Arch::Arm);
        MapInfo::new(start, end, offset, Arc::new(interface))
    }

    #[test]
    fn finds_the_covering_map() {
        let mut maps = QuickenMaps::new();
        maps.insert(map(0x3000, 0x4000, 0, 0));
        maps.insert(map(0x1000, 0x2000, 0, 0));
        assert_eq!(maps.find(0x1000).map(|m| m.start), Some(0x1000));
        assert_eq!(maps.find(0x1fff).map(|m| m.start), Some(0x1000));
        assert_eq!(maps.find(0x3800).map(|m| m.start), Some(0x3000));
        assert!(maps.find(0x2000).is_none());
        assert!(maps.find(0xfff).is_none());
        assert!(maps.find(0x4000).is_none());
    }

    #[test]
    fn remove_by_start() {
        let mut maps = QuickenMaps::new();
        maps.insert(map(0x1000, 0x2000, 0, 0));
        assert!(maps.remove(0x1800).is_none());
        assert!(maps.remove(0x1000).is_some());
        assert!(maps.is_empty());
    }

    #[test]
    fn rel_pc_adds_offset_and_bias() {
        let map = map(0x7000_0000, 0x7001_0000, 0x2000, 0x100);
        assert_eq!(map.rel_pc(0x7000_0010), 0x2110);
    }
}
