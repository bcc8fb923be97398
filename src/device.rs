//! Ethernet device adapter: binds the master to one physical link, owns a
//! small ring of pre-built transmit frames and keeps traffic statistics.

use crate::error::Error;
use crate::ethernet::{
    EthernetAddress, EthernetFrame, ETHERCAT_ETHERTYPE, ETHERNET_HEADER_LEN, ETH_DATA_LEN,
};
use crate::fmt;

/// Number of pre-built transmit frame buffers per device.
pub(crate) const TX_RING_SIZE: usize = 2;

/// Minimum Ethernet frame length on the wire (without FCS).
const MIN_FRAME_LEN: usize = 60;

/// Rate measurement windows in seconds.
pub(crate) const RATE_INTERVALS: [i32; 3] = [1, 10, 60];

/// Abstraction over one Ethernet link.
///
/// The master drives this from its cyclic context, so implementations must
/// never block: `poll` reports only frames that have already arrived.
pub trait Link: Send {
    /// The MAC address used as the source of all transmitted frames.
    fn mac(&self) -> EthernetAddress;

    /// Transmit one complete Ethernet frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Drain received frames, invoking `sink` once per complete frame.
    fn poll(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<(), Error>;

    /// Current carrier state of the link.
    fn carrier(&self) -> bool;
}

/// Traffic statistics of one device.
///
/// Counters are updated on the send and receive paths; the smoothed rates are
/// recalculated once per second with the low pass filter
/// `y += (x - y) / n` for each window `n` of [`RATE_INTERVALS`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceStats {
    /// Frames transmitted.
    pub tx_frames: u64,
    /// Frames received.
    pub rx_frames: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Transmit errors reported by the link.
    pub tx_errors: u64,

    last_tx_frames: u64,
    last_rx_frames: u64,
    last_tx_bytes: u64,
    last_rx_bytes: u64,

    // Fixed point, scaled by 1000.
    tx_frame_rates: [i32; 3],
    rx_frame_rates: [i32; 3],
    tx_byte_rates: [i32; 3],
    rx_byte_rates: [i32; 3],
}

impl DeviceStats {
    /// Feed one second worth of counter deltas into the rate filters.
    pub(crate) fn update_rates(&mut self) {
        let tx_frame_rate = (self.tx_frames - self.last_tx_frames) as i32 * 1000;
        let rx_frame_rate = (self.rx_frames - self.last_rx_frames) as i32 * 1000;
        let tx_byte_rate = (self.tx_bytes - self.last_tx_bytes) as i32;
        let rx_byte_rate = (self.rx_bytes - self.last_rx_bytes) as i32;

        for (i, n) in RATE_INTERVALS.iter().enumerate() {
            self.tx_frame_rates[i] += (tx_frame_rate - self.tx_frame_rates[i]) / n;
            self.rx_frame_rates[i] += (rx_frame_rate - self.rx_frame_rates[i]) / n;
            self.tx_byte_rates[i] += (tx_byte_rate - self.tx_byte_rates[i]) / n;
            self.rx_byte_rates[i] += (rx_byte_rate - self.rx_byte_rates[i]) / n;
        }

        self.last_tx_frames = self.tx_frames;
        self.last_rx_frames = self.rx_frames;
        self.last_tx_bytes = self.tx_bytes;
        self.last_rx_bytes = self.rx_bytes;
    }

    /// Smoothed transmit rate in frames/s for the given window index into
    /// [`RATE_INTERVALS`].
    pub fn tx_frame_rate(&self, window: usize) -> f64 {
        f64::from(self.tx_frame_rates[window]) / 1000.0
    }

    /// Smoothed receive rate in frames/s.
    pub fn rx_frame_rate(&self, window: usize) -> f64 {
        f64::from(self.rx_frame_rates[window]) / 1000.0
    }

    /// Smoothed transmit rate in bytes/s.
    pub fn tx_byte_rate(&self, window: usize) -> f64 {
        f64::from(self.tx_byte_rates[window])
    }

    /// Smoothed receive rate in bytes/s.
    pub fn rx_byte_rate(&self, window: usize) -> f64 {
        f64::from(self.rx_byte_rates[window])
    }
}

/// One attached Ethernet device.
pub struct Device {
    link: Box<dyn Link>,
    index: usize,
    tx_ring: [Vec<u8>; TX_RING_SIZE],
    ring_index: usize,
    link_up: bool,
    /// Traffic statistics.
    pub stats: DeviceStats,
}

impl Device {
    /// Wrap a link, pre-building the transmit ring's Ethernet headers:
    /// broadcast destination, the link's MAC as source, EtherCAT EtherType.
    pub(crate) fn new(link: Box<dyn Link>, index: usize) -> Self {
        let mac = link.mac();

        let tx_ring = core::array::from_fn(|_| {
            let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ETH_DATA_LEN];

            let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);

            frame.set_dst_addr(EthernetAddress::BROADCAST);
            frame.set_src_addr(mac);
            frame.set_ethertype(ETHERCAT_ETHERTYPE);

            buf
        });

        let link_up = link.carrier();

        Self {
            link,
            index,
            tx_ring,
            ring_index: 0,
            link_up,
            stats: DeviceStats::default(),
        }
    }

    /// Device position in the master's device list (0 = main).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the link currently has carrier.
    pub fn link_up(&self) -> bool {
        self.link_up
    }

    /// Sample the carrier state, logging transitions. Returns the new state.
    pub(crate) fn check_link(&mut self) -> bool {
        let up = self.link.carrier();

        if up != self.link_up {
            if up {
                fmt::info!("Device {}: link is UP", self.index);
            } else {
                fmt::warn!("Device {}: link is DOWN", self.index);
            }

            self.link_up = up;
        }

        up
    }

    /// Payload area (after the pre-built Ethernet header) of the current
    /// transmit ring buffer.
    pub(crate) fn tx_payload_mut(&mut self) -> &mut [u8] {
        &mut self.tx_ring[self.ring_index][ETHERNET_HEADER_LEN..]
    }

    /// Transmit the current ring buffer with `payload_len` bytes of payload,
    /// then advance to the next ring buffer.
    pub(crate) fn transmit(&mut self, payload_len: usize) -> Result<(), Error> {
        let total = (ETHERNET_HEADER_LEN + payload_len).max(MIN_FRAME_LEN);
        let buf = &self.tx_ring[self.ring_index][..total];

        self.ring_index = (self.ring_index + 1) % TX_RING_SIZE;

        match self.link.send(buf) {
            Ok(()) => {
                self.stats.tx_frames += 1;
                self.stats.tx_bytes += total as u64;

                Ok(())
            }
            Err(e) => {
                self.stats.tx_errors += 1;

                Err(e)
            }
        }
    }

    /// Drain received EtherCAT frames, handing each frame's EtherCAT payload
    /// to `sink`. Frames with a foreign EtherType are ignored.
    pub(crate) fn receive(
        &mut self,
        mut sink: impl FnMut(&[u8]),
    ) -> Result<(), Error> {
        let Self { link, stats, .. } = self;

        link.poll(&mut |raw| {
            let Ok(frame) = EthernetFrame::new_checked(raw) else {
                return;
            };

            if frame.ethertype() != ETHERCAT_ETHERTYPE {
                return;
            }

            stats.rx_frames += 1;
            stats.rx_bytes += raw.len() as u64;

            sink(frame.payload());
        })
    }
}

#[cfg(all(unix, target_os = "linux"))]
pub use raw_socket::RawSocketLink;

#[cfg(all(unix, target_os = "linux"))]
mod raw_socket {
    use super::Link;
    use crate::error::Error;
    use crate::ethernet::EthernetAddress;
    use crate::fmt;
    use std::io;

    /// A [`Link`] over an `AF_PACKET` raw socket bound to one interface.
    pub struct RawSocketLink {
        fd: i32,
        mac: EthernetAddress,
        ifname: String,
        rx_buf: Vec<u8>,
    }

    impl RawSocketLink {
        /// Open a non-blocking raw socket on the named interface.
        ///
        /// Requires `CAP_NET_RAW`.
        pub fn open(ifname: &str) -> Result<Self, io::Error> {
            let if_index = nix::net::if_::if_nametoindex(ifname)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

            // SAFETY: Plain libc socket setup; all structs are zero
            // initialised and sized by the kernel ABI.
            let fd = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                    (libc::ETH_P_ALL as u16).to_be() as i32,
                )
            };

            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut addr: libc::sockaddr_ll = unsafe { core::mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as u16;
            addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
            addr.sll_ifindex = if_index as i32;

            let bound = unsafe {
                libc::bind(
                    fd,
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    core::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };

            if bound < 0 {
                let err = io::Error::last_os_error();

                unsafe { libc::close(fd) };

                return Err(err);
            }

            let mac = Self::interface_mac(fd, ifname)?;

            fmt::info!("Opened {} ({})", ifname, mac);

            Ok(Self {
                fd,
                mac,
                ifname: ifname.to_string(),
                rx_buf: vec![0u8; 1536],
            })
        }

        fn ifreq(ifname: &str) -> libc::ifreq {
            let mut req: libc::ifreq = unsafe { core::mem::zeroed() };

            for (dst, src) in req.ifr_name.iter_mut().zip(ifname.as_bytes()) {
                *dst = *src as libc::c_char;
            }

            req
        }

        fn interface_mac(fd: i32, ifname: &str) -> Result<EthernetAddress, io::Error> {
            let mut req = Self::ifreq(ifname);

            let res = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) };

            if res < 0 {
                return Err(io::Error::last_os_error());
            }

            let raw = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data };

            let mut mac = [0u8; 6];

            for (dst, src) in mac.iter_mut().zip(raw.iter()) {
                *dst = *src as u8;
            }

            Ok(EthernetAddress(mac))
        }
    }

    impl Link for RawSocketLink {
        fn mac(&self) -> EthernetAddress {
            self.mac
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
            let sent = unsafe {
                libc::send(
                    self.fd,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                )
            };

            if sent < 0 || sent as usize != frame.len() {
                return Err(Error::LinkDown);
            }

            Ok(())
        }

        fn poll(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<(), Error> {
            loop {
                let received = unsafe {
                    libc::recv(
                        self.fd,
                        self.rx_buf.as_mut_ptr() as *mut libc::c_void,
                        self.rx_buf.len(),
                        libc::MSG_DONTWAIT,
                    )
                };

                if received < 0 {
                    let err = io::Error::last_os_error();

                    return match err.kind() {
                        io::ErrorKind::WouldBlock => Ok(()),
                        _ => Err(Error::LinkDown),
                    };
                }

                sink(&self.rx_buf[..received as usize]);
            }
        }

        fn carrier(&self) -> bool {
            let mut req = Self::ifreq(&self.ifname);

            let res = unsafe { libc::ioctl(self.fd, libc::SIOCGIFFLAGS, &mut req) };

            if res < 0 {
                return false;
            }

            let flags = unsafe { req.ifr_ifru.ifru_flags };

            flags & libc::IFF_RUNNING as libc::c_short != 0
        }
    }

    impl Drop for RawSocketLink {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records transmitted frames and plays back queued responses.
    #[derive(Default)]
    pub(crate) struct LoopbackLink {
        pub(crate) shared: Arc<LoopbackShared>,
    }

    #[derive(Default)]
    pub(crate) struct LoopbackShared {
        pub(crate) sent: Mutex<Vec<Vec<u8>>>,
        pub(crate) rx_queue: Mutex<Vec<Vec<u8>>>,
        pub(crate) up: AtomicBool,
    }

    impl LoopbackLink {
        pub(crate) fn with_handle() -> (Self, Arc<LoopbackShared>) {
            let link = Self::default();

            link.shared.up.store(true, Ordering::Relaxed);

            let handle = Arc::clone(&link.shared);

            (link, handle)
        }
    }

    impl Link for LoopbackLink {
        fn mac(&self) -> EthernetAddress {
            EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
            if !self.carrier() {
                return Err(Error::LinkDown);
            }

            self.shared.sent.lock().unwrap().push(frame.to_vec());

            Ok(())
        }

        fn poll(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<(), Error> {
            for frame in self.shared.rx_queue.lock().unwrap().drain(..) {
                sink(&frame);
            }

            Ok(())
        }

        fn carrier(&self) -> bool {
            self.shared.up.load(Ordering::Relaxed)
        }
    }

    /// A device over a loopback link plus the shared handle to inspect it.
    pub(crate) fn loopback_device() -> (Device, Arc<LoopbackShared>) {
        let (link, handle) = LoopbackLink::with_handle();

        (Device::new(Box::new(link), 0), handle)
    }

    #[test]
    fn prebuilt_headers() {
        let (mut device, handle) = loopback_device();

        device.tx_payload_mut()[0] = 0xaa;
        device.transmit(1).unwrap();

        let sent = handle.sent.lock().unwrap();
        let frame = &sent[0];

        // Padded to the minimum frame size
        assert_eq!(frame.len(), 60);
        assert_eq!(&frame[0..6], &[0xff; 6]);
        assert_eq!(&frame[6..12], &[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&frame[12..14], &[0x88, 0xa4]);
        assert_eq!(frame[14], 0xaa);
    }

    #[test]
    fn tx_ring_alternates() {
        let (mut device, _handle) = loopback_device();

        device.tx_payload_mut()[0] = 1;
        device.transmit(1).unwrap();

        // The next buffer is a different one, still with a pristine header
        assert_eq!(device.ring_index, 1);

        device.tx_payload_mut()[0] = 2;
        device.transmit(1).unwrap();

        assert_eq!(device.ring_index, 0);
        assert_eq!(device.stats.tx_frames, 2);
    }

    #[test]
    fn receive_filters_foreign_ethertype() {
        let (mut device, handle) = loopback_device();

        let mut ecat = vec![0u8; 60];
        ecat[12..14].copy_from_slice(&[0x88, 0xa4]);
        ecat[14] = 0x42;

        let mut ipv4 = vec![0u8; 60];
        ipv4[12..14].copy_from_slice(&[0x08, 0x00]);

        handle.rx_queue.lock().unwrap().push(ipv4);
        handle.rx_queue.lock().unwrap().push(ecat);

        let mut seen = Vec::new();

        device.receive(|payload| seen.push(payload[0])).unwrap();

        assert_eq!(seen, vec![0x42]);
        assert_eq!(device.stats.rx_frames, 1);
    }

    #[test]
    fn rate_filter_converges() {
        let mut stats = DeviceStats::default();

        // Constant 100 frames/s for two minutes
        for _ in 0..120 {
            stats.tx_frames += 100;
            stats.update_rates();
        }

        assert_eq!(stats.tx_frame_rate(0), 100.0);
        assert!((stats.tx_frame_rate(1) - 100.0).abs() < 1.0);
        assert!((stats.tx_frame_rate(2) - 100.0).abs() < 15.0);
    }

    #[test]
    fn link_transitions_logged_and_tracked() {
        let (mut device, handle) = loopback_device();

        assert!(device.link_up());

        handle.up.store(false, Ordering::Relaxed);

        assert!(!device.check_link());
        assert!(!device.link_up());
    }
}
