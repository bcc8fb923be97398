//! A scripted bus standing in for real hardware: an in-memory [`Link`] with
//! emulated slaves that execute register-level datagrams and answer in the
//! same cycle.

use ferrocat::{EthernetAddress, Link};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Register space size of an emulated slave.
const REGISTER_SPACE: usize = 0x1000;

/// One emulated slave: a register image, an SII word image and just enough
/// behaviour to follow the master's bring-up.
pub struct EmulatedSlave {
    registers: Vec<u8>,
    sii: Vec<u16>,
}

impl EmulatedSlave {
    /// A simple EoE-capable slave: 2 FMMUs, 4 sync managers, no DC, standard
    /// mailbox layout, one name string.
    pub fn simple(vendor_id: u32, product_code: u32) -> Self {
        let mut registers = vec![0u8; REGISTER_SPACE];

        registers[0x0000] = 0x11; // type
        registers[0x0001] = 0x02; // revision
        registers[0x0004] = 2; // FMMUs
        registers[0x0005] = 4; // sync managers
        registers[0x0007] = 0x0f; // ports 0/1 MII
        registers[0x0110] = 0x10; // DL status: link on port 0
        registers[0x0130] = 0x01; // AL status INIT

        let mut sii = vec![0u16; 0x40];

        sii[0x0008] = (vendor_id & 0xffff) as u16;
        sii[0x0009] = (vendor_id >> 16) as u16;
        sii[0x000a] = (product_code & 0xffff) as u16;
        sii[0x000b] = (product_code >> 16) as u16;
        sii[0x0018] = 0x1000; // std rx mailbox offset
        sii[0x0019] = 0x0080; // std rx mailbox size
        sii[0x001a] = 0x1080; // std tx mailbox offset
        sii[0x001b] = 0x0080; // std tx mailbox size
        sii[0x001c] = 0x0002; // mailbox protocols: EoE only

        // Strings category: one entry, "io16"
        sii.push(10);
        sii.push(3);
        sii.extend_from_slice(&[
            u16::from_le_bytes([1, 4]),
            u16::from_le_bytes([b'i', b'o']),
            u16::from_le_bytes([b'1', b'6']),
        ]);

        // General category: name string 1, no CoE details
        sii.push(30);
        sii.push(16);

        let mut general = [0u8; 32];
        general[3] = 1; // name string index

        for chunk in general.chunks_exact(2) {
            sii.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }

        // Sync manager category: SM0/SM1 mailboxes, SM2/SM3 process data
        sii.push(41);
        sii.push(16);

        for sm in [
            (0x1000u16, 0x0080u16, 0x26u8, 0x01u8, 1u8),
            (0x1080, 0x0080, 0x22, 0x01, 2),
            (0x1100, 0x0000, 0x64, 0x00, 3),
            (0x1180, 0x0000, 0x20, 0x00, 4),
        ] {
            sii.push(sm.0);
            sii.push(sm.1);
            sii.push(u16::from_le_bytes([sm.2, 0x00]));
            sii.push(u16::from_le_bytes([sm.3, sm.4]));
        }

        sii.push(0xffff);

        Self { registers, sii }
    }

    fn station_address(&self) -> u16 {
        u16::from_le_bytes([self.registers[0x0010], self.registers[0x0011]])
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self
                .registers
                .get(offset + i)
                .copied()
                .unwrap_or(0);
        }
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            if let Some(slot) = self.registers.get_mut(offset + i) {
                *slot = *byte;
            }
        }

        // AL control: accept every requested transition immediately
        if offset <= 0x0120 && offset + data.len() > 0x0120 {
            let control = self.registers[0x0120];

            self.registers[0x0130] = control & 0x0f;
            self.registers[0x0134] = 0x00;
            self.registers[0x0135] = 0x00;
        }

        // SII interface: a write of the read trigger loads the addressed
        // words into the data register
        if offset <= 0x0502 && offset + data.len() > 0x0502 {
            let trigger = self.registers[0x0503] & 0x01 != 0;

            if trigger {
                let word =
                    u16::from_le_bytes([self.registers[0x0504], self.registers[0x0505]]);

                for i in 0..2u16 {
                    let value = self
                        .sii
                        .get(usize::from(word + i))
                        .copied()
                        .unwrap_or(0xffff);

                    let base = 0x0508 + usize::from(i) * 2;

                    self.registers[base..base + 2].copy_from_slice(&value.to_le_bytes());
                }

                // Interface idle again
                self.registers[0x0503] = 0x00;
            }
        }
    }
}

/// Shared state of a [`ScriptedLink`].
pub struct BusShared {
    pub slaves: Mutex<Vec<EmulatedSlave>>,
    pub rx_queue: Mutex<Vec<Vec<u8>>>,
    pub up: AtomicBool,
}

/// A [`Link`] that runs every transmitted frame through the emulated slaves
/// and queues the processed frame as the response.
pub struct ScriptedLink {
    shared: Arc<BusShared>,
}

impl ScriptedLink {
    pub fn new(slaves: Vec<EmulatedSlave>) -> (Self, Arc<BusShared>) {
        let shared = Arc::new(BusShared {
            slaves: Mutex::new(slaves),
            rx_queue: Mutex::new(Vec::new()),
            up: AtomicBool::new(true),
        });

        (
            Self {
                shared: Arc::clone(&shared),
            },
            shared,
        )
    }

    /// Execute one EtherCAT frame against the bus, returning the response
    /// frame.
    fn process(slaves: &mut [EmulatedSlave], frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 16 || frame[12] != 0x88 || frame[13] != 0xa4 {
            return None;
        }

        let mut response = frame.to_vec();
        let payload = &mut response[14..];

        let header = u16::from_le_bytes([payload[0], payload[1]]);
        let frame_len = usize::from(header & 0x07ff);

        if header >> 12 != 1 || frame_len + 2 > payload.len() {
            return None;
        }

        let mut cursor = 2usize;
        let mut more = true;

        while more && cursor + 12 <= 2 + frame_len {
            let command = payload[cursor];
            let flags = u16::from_le_bytes([payload[cursor + 6], payload[cursor + 7]]);
            let data_size = usize::from(flags & 0x07ff);

            more = flags & 0x8000 != 0;

            let data_start = cursor + 10;
            let wkc_at = data_start + data_size;

            let mut wkc = 0u16;

            match command {
                // BRD: OR together, every slave counts
                0x07 => {
                    let offset = usize::from(u16::from_le_bytes([
                        payload[cursor + 4],
                        payload[cursor + 5],
                    ]));

                    for slave in slaves.iter() {
                        let mut chunk = vec![0u8; data_size];

                        slave.read(offset, &mut chunk);

                        for (dst, src) in payload[data_start..wkc_at]
                            .iter_mut()
                            .zip(chunk.iter())
                        {
                            *dst |= *src;
                        }

                        wkc += 1;
                    }
                }
                // BWR
                0x08 => {
                    let offset = usize::from(u16::from_le_bytes([
                        payload[cursor + 4],
                        payload[cursor + 5],
                    ]));

                    let data = payload[data_start..wkc_at].to_vec();

                    for slave in slaves.iter_mut() {
                        slave.write(offset, &data);
                        wkc += 1;
                    }
                }
                // APRD/APWR: position addressing with auto increment
                0x01 | 0x02 => {
                    let offset = usize::from(u16::from_le_bytes([
                        payload[cursor + 4],
                        payload[cursor + 5],
                    ]));

                    for slave in slaves.iter_mut() {
                        let position = u16::from_le_bytes([
                            payload[cursor + 2],
                            payload[cursor + 3],
                        ]);

                        if position == 0 {
                            if command == 0x01 {
                                let mut chunk = vec![0u8; data_size];

                                slave.read(offset, &mut chunk);
                                payload[data_start..wkc_at].copy_from_slice(&chunk);
                            } else {
                                let data = payload[data_start..wkc_at].to_vec();

                                slave.write(offset, &data);
                            }

                            wkc += 1;
                        }

                        // Every slave increments the position field
                        payload[cursor + 2..cursor + 4]
                            .copy_from_slice(&position.wrapping_add(1).to_le_bytes());
                    }
                }
                // FPRD/FPWR: configured station addressing
                0x04 | 0x05 => {
                    let station = u16::from_le_bytes([
                        payload[cursor + 2],
                        payload[cursor + 3],
                    ]);
                    let offset = usize::from(u16::from_le_bytes([
                        payload[cursor + 4],
                        payload[cursor + 5],
                    ]));

                    for slave in slaves.iter_mut() {
                        if slave.station_address() != station {
                            continue;
                        }

                        if command == 0x04 {
                            let mut chunk = vec![0u8; data_size];

                            slave.read(offset, &mut chunk);
                            payload[data_start..wkc_at].copy_from_slice(&chunk);
                        } else {
                            let data = payload[data_start..wkc_at].to_vec();

                            slave.write(offset, &data);
                        }

                        wkc += 1;
                    }
                }
                // Anything else passes through unprocessed
                _ => {}
            }

            payload[wkc_at..wkc_at + 2].copy_from_slice(&wkc.to_le_bytes());

            cursor = wkc_at + 2;
        }

        Some(response)
    }
}

impl Link for ScriptedLink {
    fn mac(&self) -> EthernetAddress {
        EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x42])
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), ferrocat::Error> {
        if !self.carrier() {
            return Err(ferrocat::Error::LinkDown);
        }

        let mut slaves = self.shared.slaves.lock().unwrap();

        if let Some(response) = Self::process(&mut slaves, frame) {
            self.shared.rx_queue.lock().unwrap().push(response);
        }

        Ok(())
    }

    fn poll(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<(), ferrocat::Error> {
        for frame in self.shared.rx_queue.lock().unwrap().drain(..) {
            sink(&frame);
        }

        Ok(())
    }

    fn carrier(&self) -> bool {
        self.shared.up.load(Ordering::Relaxed)
    }
}

/// Poll `predicate` for up to `timeout_ms` milliseconds.
pub fn wait_for(timeout_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline =
        std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);

    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }

        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    predicate()
}
