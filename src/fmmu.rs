//! Fieldbus Memory Management Unit (FMMU) register pages, written to
//! `0x0600 + 16·i`.

use core::fmt;

/// ETG1000.4 Table 56 – Fieldbus memory management unit (FMMU) entity.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 16)]
pub struct Fmmu {
    /// Start address in octets in the logical memory area of the memory
    /// translation.
    #[wire(bytes = 4)]
    pub logical_start_address: u32,

    #[wire(bytes = 2)]
    pub length_bytes: u16,

    #[wire(bits = 3, post_skip = 5)]
    pub logical_start_bit: u8,

    #[wire(bits = 3, post_skip = 5)]
    pub logical_end_bit: u8,

    #[wire(bytes = 2)]
    pub physical_start_address: u16,

    #[wire(bits = 3, post_skip = 5)]
    pub physical_start_bit: u8,

    #[wire(bits = 1)]
    pub read_enable: bool,

    #[wire(bits = 1, post_skip = 6)]
    pub write_enable: bool,

    // Lots of spare bytes after this one!
    #[wire(bits = 1, post_skip = 31)]
    pub enable: bool,
}

impl fmt::Debug for Fmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fmmu")
            .field(
                "logical_start_address",
                &format_args!("{:#010x}", self.logical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("read_enable", &self.read_enable)
            .field("write_enable", &self.write_enable)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for Fmmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "logical {:#010x}, size {}, physical {:#06x}, {}{}, {}",
            self.logical_start_address,
            self.length_bytes,
            self.physical_start_address,
            if self.read_enable { "R" } else { "" },
            if self.write_enable { "W" } else { "" },
            if self.enable { "enabled" } else { "disabled" },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireWrite;

    #[test]
    fn page_image() {
        let fmmu = Fmmu {
            logical_start_address: 0x0000_0004,
            length_bytes: 6,
            logical_start_bit: 0,
            logical_end_bit: 7,
            physical_start_address: 0x1100,
            physical_start_bit: 0,
            read_enable: false,
            write_enable: true,
            enable: true,
        };

        let mut buf = [0u8; 16];

        fmmu.pack_to_slice(&mut buf).unwrap();

        assert_eq!(
            buf,
            [
                0x04, 0x00, 0x00, 0x00, // logical start
                0x06, 0x00, // length
                0x00, 0x07, // start/end bit
                0x00, 0x11, // physical start
                0x00, // physical start bit
                0x02, // write enable
                0x01, // enable
                0x00, 0x00, 0x00, // reserved
            ]
        );
    }
}
