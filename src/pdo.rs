//! Process Data Object descriptions: mapping entries, PDOs and per sync
//! manager PDO lists.

use crate::sync_manager_channel::Direction;

/// One mapped object within a PDO.
///
/// On the wire (both in the `0x16xx`/`0x1Axx` mapping objects and in the SII
/// PDO categories) an entry is packed as `index:16 | subindex:8 | bit_len:8`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PdoEntry {
    /// Object dictionary index, 0 for padding entries.
    pub index: u16,
    /// Object dictionary subindex.
    pub sub_index: u8,
    /// Size of the mapped data in bits.
    pub bit_length: u8,
}

impl PdoEntry {
    /// A gap entry mapping nothing.
    pub fn padding(bit_length: u8) -> Self {
        Self {
            index: 0,
            sub_index: 0,
            bit_length,
        }
    }

    /// The packed `u32` representation used by the mapping objects.
    pub fn packed(&self) -> u32 {
        u32::from(self.index) << 16
            | u32::from(self.sub_index) << 8
            | u32::from(self.bit_length)
    }

    /// Decode from the packed `u32` representation.
    pub fn from_packed(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub_index: (raw >> 8) as u8,
            bit_length: raw as u8,
        }
    }
}

impl core::fmt::Display for PdoEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:#06x}:{:02x}, {} bit",
            self.index, self.sub_index, self.bit_length
        )
    }
}

/// A PDO with its mapped entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pdo {
    /// PDO index, `0x1600..=0x17ff` for RxPDOs, `0x1A00..=0x1bff` for TxPDOs.
    pub index: u16,
    /// The sync manager this PDO is assigned to, if known.
    pub sync_index: Option<u8>,
    /// Mapped entries in order.
    pub entries: Vec<PdoEntry>,
}

impl Pdo {
    /// Create an empty PDO.
    pub fn new(index: u16) -> Self {
        Self {
            index,
            sync_index: None,
            entries: Vec::new(),
        }
    }

    /// Total mapped size in bits.
    pub fn bit_length(&self) -> u32 {
        self.entries
            .iter()
            .map(|entry| u32::from(entry.bit_length))
            .sum()
    }

    /// Direction implied by the PDO index range.
    ///
    /// RxPDOs carry master outputs, TxPDOs carry master inputs.
    pub fn direction(&self) -> Direction {
        if (0x1600..=0x17ff).contains(&self.index) {
            Direction::MasterWrite
        } else {
            Direction::MasterRead
        }
    }
}

/// The PDOs assigned to one sync manager.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PdoList {
    pdos: Vec<Pdo>,
}

impl PdoList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// The PDOs in assignment order.
    pub fn pdos(&self) -> &[Pdo] {
        &self.pdos
    }

    /// Mutable access to the PDOs.
    pub(crate) fn pdos_mut(&mut self) -> &mut Vec<Pdo> {
        &mut self.pdos
    }

    /// Append a PDO.
    pub fn push(&mut self, pdo: Pdo) {
        self.pdos.push(pdo);
    }

    /// Find a PDO by its index.
    pub fn find(&self, index: u16) -> Option<&Pdo> {
        self.pdos.iter().find(|pdo| pdo.index == index)
    }

    /// Drop all PDOs.
    pub fn clear(&mut self) {
        self.pdos.clear();
    }

    /// Number of assigned PDOs.
    pub fn len(&self) -> usize {
        self.pdos.len()
    }

    /// Whether no PDOs are assigned.
    pub fn is_empty(&self) -> bool {
        self.pdos.is_empty()
    }

    /// Total mapped size of all PDOs, rounded up to whole bytes.
    pub fn byte_length(&self) -> u16 {
        let bits: u32 = self.pdos.iter().map(Pdo::bit_length).sum();

        bits.div_ceil(8) as u16
    }

    /// Locate a mapped entry within this sync manager's data area.
    ///
    /// Returns `(bit offset, bit length)` counted from the start of the
    /// mapped data.
    pub fn entry_position(&self, index: u16, sub_index: u8) -> Option<(u32, u8)> {
        let mut bit_offset = 0u32;

        for pdo in &self.pdos {
            for entry in &pdo.entries {
                if entry.index == index && entry.sub_index == sub_index {
                    return Some((bit_offset, entry.bit_length));
                }

                bit_offset += u32::from(entry.bit_length);
            }
        }

        None
    }

    /// Whether the assignment (PDO indices in order) matches `other`.
    ///
    /// Used to decide whether assignment writes can be skipped for slaves
    /// that do not allow reconfiguration.
    pub fn assignment_equals(&self, other: &Self) -> bool {
        self.pdos.len() == other.pdos.len()
            && self
                .pdos
                .iter()
                .zip(other.pdos.iter())
                .all(|(a, b)| a.index == b.index)
    }

    /// Whether assignment and every PDO's mapping match `other`.
    pub fn mapping_equals(&self, other: &Self) -> bool {
        self.assignment_equals(other)
            && self
                .pdos
                .iter()
                .zip(other.pdos.iter())
                .all(|(a, b)| a.entries == b.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packing() {
        let entry = PdoEntry {
            index: 0x6000,
            sub_index: 0x01,
            bit_length: 16,
        };

        assert_eq!(entry.packed(), 0x6000_0110);
        assert_eq!(PdoEntry::from_packed(0x6000_0110), entry);
    }

    #[test]
    fn byte_length_rounds_up() {
        let mut list = PdoList::new();

        let mut pdo = Pdo::new(0x1a00);
        pdo.entries.push(PdoEntry {
            index: 0x6000,
            sub_index: 1,
            bit_length: 1,
        });
        pdo.entries.push(PdoEntry::padding(7));

        let mut pdo2 = Pdo::new(0x1a01);
        pdo2.entries.push(PdoEntry {
            index: 0x6010,
            sub_index: 1,
            bit_length: 4,
        });

        list.push(pdo);
        list.push(pdo2);

        assert_eq!(list.byte_length(), 2);
    }

    #[test]
    fn direction_from_index() {
        assert_eq!(Pdo::new(0x1600).direction(), Direction::MasterWrite);
        assert_eq!(Pdo::new(0x1a00).direction(), Direction::MasterRead);
    }

    #[test]
    fn mapping_comparison() {
        let mut a = PdoList::new();
        let mut b = PdoList::new();

        let mut pdo = Pdo::new(0x1600);
        pdo.entries.push(PdoEntry {
            index: 0x7000,
            sub_index: 1,
            bit_length: 8,
        });

        a.push(pdo.clone());
        b.push(pdo);

        assert!(a.mapping_equals(&b));

        b.pdos_mut()[0].entries[0].bit_length = 16;

        assert!(a.assignment_equals(&b));
        assert!(!a.mapping_equals(&b));
    }
}
