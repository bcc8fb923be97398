//! Slave Information Interface (SII): the EEPROM image, its fixed header
//! words and the category area.

use crate::error::SiiError;
use crate::fmt;
use crate::mailbox::MailboxProtocols;
use crate::pdo::{Pdo, PdoEntry, PdoList};

/// Word addresses of the fixed SII header area.
pub(crate) mod word {
    pub const ALIAS: u16 = 0x0004;
    pub const VENDOR_ID: u16 = 0x0008;
    pub const PRODUCT_CODE: u16 = 0x000A;
    pub const REVISION_NUMBER: u16 = 0x000C;
    pub const SERIAL_NUMBER: u16 = 0x000E;
    pub const BOOT_RX_MAILBOX_OFFSET: u16 = 0x0014;
    pub const BOOT_RX_MAILBOX_SIZE: u16 = 0x0015;
    pub const BOOT_TX_MAILBOX_OFFSET: u16 = 0x0016;
    pub const BOOT_TX_MAILBOX_SIZE: u16 = 0x0017;
    pub const STD_RX_MAILBOX_OFFSET: u16 = 0x0018;
    pub const STD_RX_MAILBOX_SIZE: u16 = 0x0019;
    pub const STD_TX_MAILBOX_OFFSET: u16 = 0x001A;
    pub const STD_TX_MAILBOX_SIZE: u16 = 0x001B;
    pub const MAILBOX_PROTOCOLS: u16 = 0x001C;
    /// First category header.
    pub const FIRST_CATEGORY: u16 = 0x0040;
}

/// SII category type codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CategoryType {
    Strings,
    General,
    Fmmu,
    SyncManager,
    TxPdo,
    RxPdo,
    Other(u16),
}

impl CategoryType {
    pub(crate) fn from_code(code: u16) -> Self {
        match code {
            10 => Self::Strings,
            30 => Self::General,
            40 => Self::Fmmu,
            41 => Self::SyncManager,
            50 => Self::TxPdo,
            51 => Self::RxPdo,
            other => Self::Other(other),
        }
    }
}

/// Category walk terminator.
pub(crate) const CATEGORY_TERMINATOR: u16 = 0xffff;

/// Fixed size name string, the longest the SII string category can carry.
pub type SiiString = heapless::String<255>;

/// CoE feature bits from the general category.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CoeDetails {
    pub enable_sdo: bool,
    pub enable_sdo_info: bool,
    pub enable_pdo_assign: bool,
    pub enable_pdo_configuration: bool,
    pub enable_upload_at_startup: bool,
    pub enable_sdo_complete_access: bool,
}

/// Decoded general category (type 30).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CategoryGeneral {
    /// Device group, resolved from the strings category.
    pub group: SiiString,
    /// Image name.
    pub image: SiiString,
    /// Order number.
    pub order: SiiString,
    /// Device name.
    pub name: SiiString,
    /// Physical layer of each port (0 = not implemented).
    pub physical_layer: [u8; 4],
    /// CoE feature bits.
    pub coe_details: CoeDetails,
    /// Slave supports SAFEOP.
    pub enable_safeop: bool,
    /// Slave must not be addressed with LRW.
    pub enable_not_lrw: bool,
    /// EBUS current consumption in mA, negative values mean supply.
    pub current_on_ebus: i16,
}

/// Decoded sync manager category entry (type 41).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SiiSyncManager {
    pub physical_start_address: u16,
    pub default_length: u16,
    pub control: u8,
    pub enable: u8,
    /// Declared usage: 1 = mailbox out, 2 = mailbox in, 3 = process data
    /// out, 4 = process data in.
    pub usage: u8,
}

/// Everything decoded from one slave's SII image.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SiiCategories {
    pub strings: Vec<SiiString>,
    pub general: Option<CategoryGeneral>,
    /// FMMU usage bytes from category 40, in unit order.
    pub fmmu_usage: Vec<u8>,
    pub sync_managers: Vec<SiiSyncManager>,
    /// PDOs from the TxPDO (inputs, type 50) category.
    pub tx_pdos: PdoList,
    /// PDOs from the RxPDO (outputs, type 51) category.
    pub rx_pdos: PdoList,
}

/// A slave's SII EEPROM image as words, plus decoding helpers.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SiiImage {
    words: Vec<u16>,
}

impl SiiImage {
    /// Wrap a fully fetched word image.
    pub fn new(words: Vec<u16>) -> Self {
        Self { words }
    }

    /// Number of fetched words.
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// One word, zero when out of range.
    pub fn word(&self, address: u16) -> u16 {
        self.words.get(usize::from(address)).copied().unwrap_or(0)
    }

    /// The category area as a byte slice starting at `word_address`.
    fn bytes_from(&self, word_address: u16, len: usize) -> Option<Vec<u8>> {
        let start = usize::from(word_address);
        let words = len.div_ceil(2);

        if start + words > self.words.len() {
            return None;
        }

        let mut out = Vec::with_capacity(len);

        for word in &self.words[start..start + words] {
            out.extend_from_slice(&word.to_le_bytes());
        }

        out.truncate(len);

        Some(out)
    }

    pub fn alias(&self) -> u16 {
        self.word(word::ALIAS)
    }

    pub fn vendor_id(&self) -> u32 {
        self.long_word(word::VENDOR_ID)
    }

    pub fn product_code(&self) -> u32 {
        self.long_word(word::PRODUCT_CODE)
    }

    pub fn revision_number(&self) -> u32 {
        self.long_word(word::REVISION_NUMBER)
    }

    pub fn serial_number(&self) -> u32 {
        self.long_word(word::SERIAL_NUMBER)
    }

    pub fn mailbox_protocols(&self) -> MailboxProtocols {
        MailboxProtocols::from_bits_truncate(self.word(word::MAILBOX_PROTOCOLS))
    }

    /// Standard mailbox layout `(rx offset, rx size, tx offset, tx size)`.
    pub fn std_mailbox(&self) -> (u16, u16, u16, u16) {
        (
            self.word(word::STD_RX_MAILBOX_OFFSET),
            self.word(word::STD_RX_MAILBOX_SIZE),
            self.word(word::STD_TX_MAILBOX_OFFSET),
            self.word(word::STD_TX_MAILBOX_SIZE),
        )
    }

    /// Bootstrap mailbox layout `(rx offset, rx size, tx offset, tx size)`.
    pub fn boot_mailbox(&self) -> (u16, u16, u16, u16) {
        (
            self.word(word::BOOT_RX_MAILBOX_OFFSET),
            self.word(word::BOOT_RX_MAILBOX_SIZE),
            self.word(word::BOOT_TX_MAILBOX_OFFSET),
            self.word(word::BOOT_TX_MAILBOX_SIZE),
        )
    }

    fn long_word(&self, address: u16) -> u32 {
        u32::from(self.word(address)) | u32::from(self.word(address + 1)) << 16
    }

    /// Walk the category headers, calling `visit` with each category's type
    /// and word range, until the `0xffff` terminator.
    ///
    /// Used both to size the EEPROM during the scan (with a partial image)
    /// and to decode the categories afterwards.
    pub(crate) fn walk_categories(
        &self,
        mut visit: impl FnMut(CategoryType, u16, u16),
    ) -> Result<(), SiiError> {
        let mut offset = word::FIRST_CATEGORY;

        loop {
            let code = self.word(offset);

            if code == CATEGORY_TERMINATOR {
                return Ok(());
            }

            if usize::from(offset) + 2 > self.words.len() {
                return Err(SiiError::SizeExceeded);
            }

            let size = self.word(offset + 1);

            visit(CategoryType::from_code(code), offset + 2, size);

            offset = offset
                .checked_add(2 + size)
                .ok_or(SiiError::SizeExceeded)?;

            if usize::from(offset) > self.words.len() {
                return Err(SiiError::SizeExceeded);
            }
        }
    }

    /// Decode all categories this master consumes.
    pub fn parse_categories(&self) -> Result<SiiCategories, SiiError> {
        let mut ranges = Vec::new();

        self.walk_categories(|ty, start, size| ranges.push((ty, start, size)))?;

        let mut cats = SiiCategories::default();

        // Strings first, the other categories refer into them.
        for (ty, start, size) in &ranges {
            if *ty == CategoryType::Strings {
                let data = self
                    .bytes_from(*start, usize::from(*size) * 2)
                    .ok_or(SiiError::SizeExceeded)?;

                cats.strings = parse_strings(&data)?;
            }
        }

        for (ty, start, size) in ranges {
            let data = self
                .bytes_from(start, usize::from(size) * 2)
                .ok_or(SiiError::SizeExceeded)?;

            match ty {
                CategoryType::Strings => {}
                CategoryType::General => {
                    cats.general = Some(parse_general(&data, &cats.strings)?);
                }
                CategoryType::Fmmu => {
                    cats.fmmu_usage = data;
                }
                CategoryType::SyncManager => {
                    cats.sync_managers.extend(parse_sync_managers(&data)?);
                }
                CategoryType::TxPdo => {
                    parse_pdos(&data, &mut cats.tx_pdos)?;
                }
                CategoryType::RxPdo => {
                    parse_pdos(&data, &mut cats.rx_pdos)?;
                }
                CategoryType::Other(code) => {
                    fmt::trace!("Ignoring unknown SII category {:#06x}", code);
                }
            }
        }

        Ok(cats)
    }
}

fn sii_string(strings: &[SiiString], index: u8) -> SiiString {
    if index == 0 {
        return SiiString::new();
    }

    strings
        .get(usize::from(index) - 1)
        .cloned()
        .unwrap_or_default()
}

fn parse_strings(data: &[u8]) -> Result<Vec<SiiString>, SiiError> {
    let count = usize::from(*data.first().ok_or(SiiError::Decode)?);
    let mut offset = 1;
    let mut strings = Vec::with_capacity(count);

    for _ in 0..count {
        let len = usize::from(*data.get(offset).ok_or(SiiError::Decode)?);

        offset += 1;

        let raw = data.get(offset..offset + len).ok_or(SiiError::Decode)?;

        let mut out = SiiString::new();

        for byte in raw {
            // Visible strings are ASCII; replace anything else.
            let ch = if byte.is_ascii() && !byte.is_ascii_control() {
                *byte as char
            } else {
                '?'
            };

            out.push(ch).map_err(|_| SiiError::Decode)?;
        }

        strings.push(out);
        offset += len;
    }

    Ok(strings)
}

fn parse_general(data: &[u8], strings: &[SiiString]) -> Result<CategoryGeneral, SiiError> {
    if data.len() < 32 {
        fmt::warn!("Wrong size of general category ({}/32)", data.len());

        return Err(SiiError::Decode);
    }

    let mut general = CategoryGeneral {
        group: sii_string(strings, data[0]),
        image: sii_string(strings, data[1]),
        order: sii_string(strings, data[2]),
        name: sii_string(strings, data[3]),
        ..CategoryGeneral::default()
    };

    for (i, layer) in general.physical_layer.iter_mut().enumerate() {
        *layer = (data[4] >> (i * 2)) & 0x03;
    }

    let coe = data[5];

    general.coe_details = CoeDetails {
        enable_sdo: coe & 0x01 != 0,
        enable_sdo_info: coe & 0x02 != 0,
        enable_pdo_assign: coe & 0x04 != 0,
        enable_pdo_configuration: coe & 0x08 != 0,
        enable_upload_at_startup: coe & 0x10 != 0,
        enable_sdo_complete_access: coe & 0x20 != 0,
    };

    general.enable_safeop = data[0x0b] & 0x01 != 0;
    general.enable_not_lrw = data[0x0b] & 0x02 != 0;
    general.current_on_ebus = i16::from_le_bytes([data[0x0c], data[0x0d]]);

    Ok(general)
}

fn parse_sync_managers(data: &[u8]) -> Result<Vec<SiiSyncManager>, SiiError> {
    if data.len() % 8 != 0 {
        fmt::warn!("Invalid SII sync manager category size {}", data.len());

        return Err(SiiError::Decode);
    }

    Ok(data
        .chunks_exact(8)
        .map(|chunk| SiiSyncManager {
            physical_start_address: u16::from_le_bytes([chunk[0], chunk[1]]),
            default_length: u16::from_le_bytes([chunk[2], chunk[3]]),
            control: chunk[4],
            enable: chunk[6],
            usage: chunk[7],
        })
        .collect())
}

fn parse_pdos(data: &[u8], list: &mut PdoList) -> Result<(), SiiError> {
    let mut rest = data;

    while rest.len() >= 8 {
        let mut pdo = Pdo::new(u16::from_le_bytes([rest[0], rest[1]]));
        let entry_count = usize::from(rest[2]);

        pdo.sync_index = match rest[3] {
            0xff => None,
            index => Some(index),
        };

        rest = &rest[8..];

        for _ in 0..entry_count {
            if rest.len() < 8 {
                return Err(SiiError::Decode);
            }

            pdo.entries.push(PdoEntry {
                index: u16::from_le_bytes([rest[0], rest[1]]),
                sub_index: rest[2],
                bit_length: rest[5],
            });

            rest = &rest[8..];
        }

        list.push(pdo);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a word image with a header area and the given category words.
    fn image_with_categories(categories: &[(u16, &[u16])]) -> SiiImage {
        let mut words = vec![0u16; usize::from(word::FIRST_CATEGORY)];

        for (code, content) in categories {
            words.push(*code);
            words.push(content.len() as u16);
            words.extend_from_slice(content);
        }

        words.push(CATEGORY_TERMINATOR);

        SiiImage::new(words)
    }

    #[test]
    fn header_words() {
        let mut words = vec![0u16; 0x40];

        words[0x04] = 0xbeef;
        words[0x08] = 0x0002;
        words[0x09] = 0x0000;
        words[0x18] = 0x1000;
        words[0x19] = 0x0080;
        words[0x1c] = 0x000c;

        let image = SiiImage::new(words);

        assert_eq!(image.alias(), 0xbeef);
        assert_eq!(image.vendor_id(), 2);
        assert_eq!(image.std_mailbox(), (0x1000, 0x0080, 0, 0));
        assert_eq!(
            image.mailbox_protocols(),
            MailboxProtocols::EOE | MailboxProtocols::COE
        );
    }

    #[test]
    fn category_walk_stops_at_terminator() {
        let image = image_with_categories(&[(30, &[0u16; 16]), (41, &[0u16; 4])]);

        let mut seen = Vec::new();

        image
            .walk_categories(|ty, _start, size| seen.push((ty, size)))
            .unwrap();

        assert_eq!(
            seen,
            vec![(CategoryType::General, 16), (CategoryType::SyncManager, 4)]
        );
    }

    #[test]
    fn truncated_image_errors() {
        // Category claims 100 words but the image ends after 2
        let mut words = vec![0u16; usize::from(word::FIRST_CATEGORY)];
        words.push(30);
        words.push(100);
        words.extend_from_slice(&[0u16; 2]);

        let image = SiiImage::new(words);

        assert_eq!(
            image.walk_categories(|_, _, _| {}),
            Err(SiiError::SizeExceeded)
        );
    }

    #[test]
    fn parse_strings_category() {
        let data = [2u8, 3, b'F', b'o', b'o', 2, b'o', b'k'];

        let strings = parse_strings(&data).unwrap();

        assert_eq!(strings.len(), 2);
        assert_eq!(strings[0].as_str(), "Foo");
        assert_eq!(strings[1].as_str(), "ok");
    }

    #[test]
    fn parse_sync_manager_category() {
        // Two mailbox sync managers as e.g. an EK1100 coupler module declares
        // them, plus two process data SMs
        let data = [
            0x00u8, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x01, // SM0
            0x80, 0x10, 0x80, 0x00, 0x22, 0x00, 0x01, 0x02, // SM1
        ];

        let syncs = parse_sync_managers(&data).unwrap();

        assert_eq!(syncs.len(), 2);
        assert_eq!(syncs[0].physical_start_address, 0x1000);
        assert_eq!(syncs[0].default_length, 0x0080);
        assert_eq!(syncs[0].control, 0x26);
        assert_eq!(syncs[0].usage, 1);
        assert_eq!(syncs[1].usage, 2);
    }

    #[test]
    fn parse_pdo_category() {
        let data = [
            0x00u8, 0x1a, 2, 3, 0, 0, 0, 0, // PDO 0x1a00, 2 entries, SM3
            0x00, 0x60, 0x01, 0, 0, 16, 0, 0, // entry 0x6000:01, 16 bit
            0x00, 0x60, 0x02, 0, 0, 8, 0, 0, // entry 0x6000:02, 8 bit
        ];

        let mut list = PdoList::new();

        parse_pdos(&data, &mut list).unwrap();

        assert_eq!(list.len(), 1);

        let pdo = &list.pdos()[0];

        assert_eq!(pdo.index, 0x1a00);
        assert_eq!(pdo.sync_index, Some(3));
        assert_eq!(pdo.entries.len(), 2);
        assert_eq!(pdo.entries[0].index, 0x6000);
        assert_eq!(pdo.entries[0].bit_length, 16);
        assert_eq!(pdo.bit_length(), 24);
    }

    #[test]
    fn general_category_coe_details() {
        let mut data = vec![0u8; 32];

        data[5] = 0x0d; // sdo + pdo assign + pdo configuration
        data[0x0b] = 0x01;
        data[0x0c..0x0e].copy_from_slice(&(-120i16).to_le_bytes());

        let general = parse_general(&data, &[]).unwrap();

        assert!(general.coe_details.enable_sdo);
        assert!(!general.coe_details.enable_sdo_info);
        assert!(general.coe_details.enable_pdo_assign);
        assert!(general.coe_details.enable_pdo_configuration);
        assert!(general.enable_safeop);
        assert_eq!(general.current_on_ebus, -120);
    }
}
