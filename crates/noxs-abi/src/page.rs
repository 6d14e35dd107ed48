//! Typed access to a control page.
//!
//! [`PageMemory`] is the raw 4 KiB backing store, modelled as little-endian `u32` words so both
//! ends can read and write concurrently without tearing individual fields. [`ControlPage`] wraps
//! it with a validating header check; the per-type views ([`VbdPage`], [`VifPage`],
//! [`SysctlPage`]) are only handed out once the header says the page holds that device type.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{LayoutError, Result};
use crate::features::{SysctlCommand, VbdFeatures, VifFeatures};
use crate::layout::{self, header, sysctl, vbd, vif};
use crate::types::{DeviceId, DeviceType, DomId, EvtchnPort, GrantRef, WatchState, XenbusState};

const WORDS: usize = layout::PAGE_SIZE / 4;

/// One page of shared memory.
#[derive(Debug)]
pub struct PageMemory {
    words: Box<[AtomicU32]>,
}

impl Default for PageMemory {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl PageMemory {
    pub fn zeroed() -> Self {
        let words = (0..WORDS).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    fn word_index(offset: usize, len: usize) -> Result<usize> {
        if offset % 4 != 0 || offset.checked_add(len).map_or(true, |end| end > layout::PAGE_SIZE)
        {
            return Err(LayoutError::OutOfBounds { offset, len });
        }
        Ok(offset / 4)
    }

    fn check_range(offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= layout::PAGE_SIZE => Ok(()),
            _ => Err(LayoutError::OutOfBounds { offset, len }),
        }
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let idx = Self::word_index(offset, 4)?;
        Ok(self.words[idx].load(Ordering::Acquire))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        let idx = Self::word_index(offset, 4)?;
        self.words[idx].store(value, Ordering::Release);
        Ok(())
    }

    /// Reads a `u64` stored as two words, low word first.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        Self::word_index(offset, 8)?;
        let lo = self.read_u32(offset)?;
        let hi = self.read_u32(offset + 4)?;
        Ok(u64::from(lo) | (u64::from(hi) << 32))
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        Self::word_index(offset, 8)?;
        self.write_u32(offset, value as u32)?;
        self.write_u32(offset + 4, (value >> 32) as u32)
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        Self::check_range(offset, out.len())?;
        for (i, byte) in out.iter_mut().enumerate() {
            let pos = offset + i;
            let word = self.words[pos / 4].load(Ordering::Acquire);
            *byte = word.to_le_bytes()[pos % 4];
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        Self::check_range(offset, data.len())?;
        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i;
            let shift = (pos % 4) * 8;
            let cell = &self.words[pos / 4];
            cell.fetch_and(!(0xFFu32 << shift), Ordering::AcqRel);
            cell.fetch_or(u32::from(byte) << shift, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Reads a NUL-padded string field of `max` bytes.
    pub fn read_str(&self, offset: usize, max: usize) -> Result<String> {
        let mut buf = vec![0u8; max];
        self.read_bytes(offset, &mut buf)?;
        let len = buf.iter().position(|&b| b == 0).unwrap_or(max);
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    /// Writes `value` into a NUL-padded field of `max` bytes.
    pub fn write_str(&self, offset: usize, max: usize, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > max {
            return Err(LayoutError::FieldTooLong {
                offset,
                max,
                len: bytes.len(),
            });
        }
        let mut buf = vec![0u8; max];
        buf[..bytes.len()].copy_from_slice(bytes);
        self.write_bytes(offset, &buf)
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }
}

/// Which ring/queue record of a multi-queue payload to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSlot {
    /// Single-queue fields used when exactly one queue is negotiated.
    Inline,
    /// Per-queue sub-record `n`.
    Indexed(usize),
}

impl QueueSlot {
    /// Slot used for queue `index` out of `count` negotiated queues.
    pub fn for_queue(index: usize, count: usize) -> Self {
        if count == 1 {
            QueueSlot::Inline
        } else {
            QueueSlot::Indexed(index)
        }
    }

    fn offset(self, inline: usize, first: usize, stride: usize) -> Result<usize> {
        match self {
            QueueSlot::Inline => Ok(inline),
            QueueSlot::Indexed(index) if index < layout::MAX_QUEUES => Ok(first + index * stride),
            QueueSlot::Indexed(index) => Err(LayoutError::QueueIndex {
                index,
                max: layout::MAX_QUEUES,
            }),
        }
    }
}

/// Header-validated control page handle.
///
/// Cloning is cheap; every clone observes the same memory.
#[derive(Debug, Clone)]
pub struct ControlPage {
    mem: Arc<PageMemory>,
    device_type: DeviceType,
}

impl ControlPage {
    /// Stamps a fresh header into `mem`; used by the backend right after allocation.
    pub fn format(
        mem: Arc<PageMemory>,
        device_type: DeviceType,
        backend_id: DomId,
        device_id: DeviceId,
    ) -> Result<Self> {
        mem.clear();
        mem.write_u32(header::MAGIC, layout::NOXS_MAGIC)?;
        mem.write_u32(header::VERSION, layout::NOXS_VERSION)?;
        mem.write_u32(header::DEVICE_TYPE, device_type.as_u32())?;
        mem.write_u32(header::DOMAIN_ID, u32::from(backend_id))?;
        mem.write_u32(header::DEVICE_ID, device_id)?;
        // A kick before the frontend's first state write must not read as `Unknown`.
        mem.write_u32(header::FE_STATE, XenbusState::Initialising.as_u32())?;
        Ok(Self { mem, device_type })
    }

    /// Validates the header of a page produced elsewhere (the frontend's view of a grant).
    pub fn open(mem: Arc<PageMemory>, expected: Option<DeviceType>) -> Result<Self> {
        let device_type = Self::check_header(&mem)?;
        if let Some(expected) = expected {
            if expected != device_type {
                return Err(LayoutError::DeviceTypeMismatch {
                    expected: expected.as_str(),
                    found: device_type.as_str(),
                });
            }
        }
        Ok(Self { mem, device_type })
    }

    fn check_header(mem: &PageMemory) -> Result<DeviceType> {
        let magic = mem.read_u32(header::MAGIC)?;
        if magic != layout::NOXS_MAGIC {
            return Err(LayoutError::BadMagic { found: magic });
        }
        let version = mem.read_u32(header::VERSION)?;
        if version != layout::NOXS_VERSION {
            return Err(LayoutError::UnsupportedVersion {
                found: version,
                expected: layout::NOXS_VERSION,
            });
        }
        DeviceType::try_from(mem.read_u32(header::DEVICE_TYPE)?)
    }

    /// Re-checks magic, version and type; the peer can scribble over the page at any time.
    pub fn validate(&self) -> Result<()> {
        let found = Self::check_header(&self.mem)?;
        if found != self.device_type {
            return Err(LayoutError::DeviceTypeMismatch {
                expected: self.device_type.as_str(),
                found: found.as_str(),
            });
        }
        Ok(())
    }

    pub fn memory(&self) -> &Arc<PageMemory> {
        &self.mem
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn domain_id(&self) -> Result<DomId> {
        let raw = self.mem.read_u32(header::DOMAIN_ID)?;
        Ok(raw as DomId)
    }

    pub fn device_id(&self) -> Result<DeviceId> {
        self.mem.read_u32(header::DEVICE_ID)
    }

    pub fn grant(&self) -> Result<GrantRef> {
        Ok(GrantRef(self.mem.read_u32(header::GRANT)?))
    }

    pub fn set_grant(&self, gref: GrantRef) -> Result<()> {
        self.mem.write_u32(header::GRANT, gref.0)
    }

    pub fn event_channel(&self) -> Result<EvtchnPort> {
        Ok(EvtchnPort(self.mem.read_u32(header::EVENT_CHANNEL)?))
    }

    pub fn set_event_channel(&self, port: EvtchnPort) -> Result<()> {
        self.mem.write_u32(header::EVENT_CHANNEL, port.0)
    }

    pub fn backend_state(&self) -> Result<XenbusState> {
        self.validate()?;
        XenbusState::try_from(self.mem.read_u32(header::BE_STATE)?)
    }

    pub fn set_backend_state(&self, state: XenbusState) -> Result<()> {
        self.mem.write_u32(header::BE_STATE, state.as_u32())
    }

    /// Frontend state word as stored, without decoding.
    pub fn frontend_state_raw(&self) -> Result<u32> {
        self.validate()?;
        self.mem.read_u32(header::FE_STATE)
    }

    pub fn frontend_state(&self) -> Result<XenbusState> {
        XenbusState::try_from(self.frontend_state_raw()?)
    }

    pub fn set_frontend_state(&self, state: XenbusState) -> Result<()> {
        self.set_frontend_state_raw(state.as_u32())
    }

    pub fn set_frontend_state_raw(&self, raw: u32) -> Result<()> {
        self.mem.write_u32(header::FE_STATE, raw)
    }

    pub fn backend_watch_state(&self) -> Result<WatchState> {
        WatchState::try_from(self.mem.read_u32(header::BE_WATCH_STATE)?)
    }

    pub fn set_backend_watch_state(&self, state: WatchState) -> Result<()> {
        self.mem.write_u32(header::BE_WATCH_STATE, state.as_u32())
    }

    pub fn frontend_watch_state(&self) -> Result<WatchState> {
        WatchState::try_from(self.mem.read_u32(header::FE_WATCH_STATE)?)
    }

    pub fn set_frontend_watch_state(&self, state: WatchState) -> Result<()> {
        self.mem.write_u32(header::FE_WATCH_STATE, state.as_u32())
    }

    fn expect_type(&self, expected: DeviceType) -> Result<()> {
        if self.device_type != expected {
            return Err(LayoutError::DeviceTypeMismatch {
                expected: expected.as_str(),
                found: self.device_type.as_str(),
            });
        }
        Ok(())
    }

    pub fn vbd(&self) -> Result<VbdPage<'_>> {
        self.expect_type(DeviceType::Vbd)?;
        Ok(VbdPage { mem: &self.mem })
    }

    pub fn vif(&self) -> Result<VifPage<'_>> {
        self.expect_type(DeviceType::Vif)?;
        Ok(VifPage { mem: &self.mem })
    }

    pub fn sysctl(&self) -> Result<SysctlPage<'_>> {
        self.expect_type(DeviceType::Sysctl)?;
        Ok(SysctlPage { mem: &self.mem })
    }
}

/// Block device payload view.
#[derive(Debug, Clone, Copy)]
pub struct VbdPage<'a> {
    mem: &'a PageMemory,
}

impl VbdPage<'_> {
    pub fn backend_features(&self) -> Result<VbdFeatures> {
        Ok(VbdFeatures::from_bits_retain(self.mem.read_u32(vbd::BE_FEATURES)?))
    }

    pub fn set_backend_features(&self, features: VbdFeatures) -> Result<()> {
        self.mem.write_u32(vbd::BE_FEATURES, features.bits())
    }

    pub fn frontend_features(&self) -> Result<VbdFeatures> {
        Ok(VbdFeatures::from_bits_retain(self.mem.read_u32(vbd::FE_FEATURES)?))
    }

    pub fn set_frontend_features(&self, features: VbdFeatures) -> Result<()> {
        self.mem.write_u32(vbd::FE_FEATURES, features.bits())
    }

    pub fn max_indirect_segments(&self) -> Result<u32> {
        self.mem.read_u32(vbd::MAX_INDIRECT_SEGMENTS)
    }

    pub fn set_max_indirect_segments(&self, value: u32) -> Result<()> {
        self.mem.write_u32(vbd::MAX_INDIRECT_SEGMENTS, value)
    }

    pub fn max_queues(&self) -> Result<u32> {
        self.mem.read_u32(vbd::MAX_QUEUES)
    }

    pub fn set_max_queues(&self, value: u32) -> Result<()> {
        self.mem.write_u32(vbd::MAX_QUEUES, value)
    }

    pub fn num_queues(&self) -> Result<u32> {
        self.mem.read_u32(vbd::NUM_QUEUES)
    }

    pub fn set_num_queues(&self, value: u32) -> Result<()> {
        self.mem.write_u32(vbd::NUM_QUEUES, value)
    }

    pub fn max_ring_page_order(&self) -> Result<u32> {
        self.mem.read_u32(vbd::MAX_RING_PAGE_ORDER)
    }

    pub fn set_max_ring_page_order(&self, value: u32) -> Result<()> {
        self.mem.write_u32(vbd::MAX_RING_PAGE_ORDER, value)
    }

    pub fn ring_page_order(&self) -> Result<u32> {
        self.mem.read_u32(vbd::RING_PAGE_ORDER)
    }

    pub fn set_ring_page_order(&self, value: u32) -> Result<()> {
        self.mem.write_u32(vbd::RING_PAGE_ORDER, value)
    }

    pub fn sector_size(&self) -> Result<u32> {
        self.mem.read_u32(vbd::SECTOR_SIZE)
    }

    pub fn physical_sector_size(&self) -> Result<u32> {
        self.mem.read_u32(vbd::PHYSICAL_SECTOR_SIZE)
    }

    pub fn sectors(&self) -> Result<u64> {
        self.mem.read_u64(vbd::SECTORS)
    }

    pub fn info(&self) -> Result<u32> {
        self.mem.read_u32(vbd::INFO)
    }

    /// Publishes the disk geometry in one go.
    pub fn set_geometry(
        &self,
        sectors: u64,
        sector_size: u32,
        physical_sector_size: u32,
        info: u32,
    ) -> Result<()> {
        self.mem.write_u64(vbd::SECTORS, sectors)?;
        self.mem.write_u32(vbd::SECTOR_SIZE, sector_size)?;
        self.mem.write_u32(vbd::PHYSICAL_SECTOR_SIZE, physical_sector_size)?;
        self.mem.write_u32(vbd::INFO, info)
    }

    pub fn set_discard(&self, granularity: u32, alignment: u32) -> Result<()> {
        self.mem.write_u32(vbd::DISCARD_GRANULARITY, granularity)?;
        self.mem.write_u32(vbd::DISCARD_ALIGNMENT, alignment)
    }

    pub fn protocol(&self) -> Result<String> {
        self.mem.read_str(vbd::PROTOCOL, vbd::PROTOCOL_BYTES)
    }

    pub fn set_protocol(&self, protocol: &str) -> Result<()> {
        self.mem.write_str(vbd::PROTOCOL, vbd::PROTOCOL_BYTES, protocol)
    }

    fn ring_offset(slot: QueueSlot) -> Result<usize> {
        slot.offset(vbd::INLINE_RING, vbd::QUEUE_RINGS, vbd::ring::BYTES)
    }

    pub fn ring_event_channel(&self, slot: QueueSlot) -> Result<EvtchnPort> {
        let base = Self::ring_offset(slot)?;
        Ok(EvtchnPort(self.mem.read_u32(base + vbd::ring::EVENT_CHANNEL)?))
    }

    pub fn ring_ref(&self, slot: QueueSlot, index: usize) -> Result<GrantRef> {
        if index >= layout::MAX_RING_GRANTS {
            return Err(LayoutError::QueueIndex {
                index,
                max: layout::MAX_RING_GRANTS,
            });
        }
        let base = Self::ring_offset(slot)?;
        Ok(GrantRef(self.mem.read_u32(base + vbd::ring::REFS + index * 4)?))
    }

    /// Frontend side: publish one queue's ring grants and event channel.
    pub fn set_ring(&self, slot: QueueSlot, port: EvtchnPort, refs: &[GrantRef]) -> Result<()> {
        if refs.len() > layout::MAX_RING_GRANTS {
            return Err(LayoutError::QueueIndex {
                index: refs.len(),
                max: layout::MAX_RING_GRANTS,
            });
        }
        let base = Self::ring_offset(slot)?;
        self.mem.write_u32(base + vbd::ring::EVENT_CHANNEL, port.0)?;
        for (i, gref) in refs.iter().enumerate() {
            self.mem.write_u32(base + vbd::ring::REFS + i * 4, gref.0)?;
        }
        Ok(())
    }
}

/// Network device payload view.
#[derive(Debug, Clone, Copy)]
pub struct VifPage<'a> {
    mem: &'a PageMemory,
}

/// One network queue's ring grants and event channels as published by the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VifQueueRecord {
    pub tx_ring_ref: GrantRef,
    pub rx_ring_ref: GrantRef,
    pub tx_event_channel: EvtchnPort,
    /// `EvtchnPort::INVALID` when tx and rx share one channel.
    pub rx_event_channel: EvtchnPort,
}

impl VifPage<'_> {
    pub fn backend_features(&self) -> Result<VifFeatures> {
        Ok(VifFeatures::from_bits_retain(self.mem.read_u32(vif::BE_FEATURES)?))
    }

    pub fn set_backend_features(&self, features: VifFeatures) -> Result<()> {
        self.mem.write_u32(vif::BE_FEATURES, features.bits())
    }

    pub fn frontend_features(&self) -> Result<VifFeatures> {
        Ok(VifFeatures::from_bits_retain(self.mem.read_u32(vif::FE_FEATURES)?))
    }

    pub fn set_frontend_features(&self, features: VifFeatures) -> Result<()> {
        self.mem.write_u32(vif::FE_FEATURES, features.bits())
    }

    pub fn max_queues(&self) -> Result<u32> {
        self.mem.read_u32(vif::MAX_QUEUES)
    }

    pub fn set_max_queues(&self, value: u32) -> Result<()> {
        self.mem.write_u32(vif::MAX_QUEUES, value)
    }

    pub fn num_queues(&self) -> Result<u32> {
        self.mem.read_u32(vif::NUM_QUEUES)
    }

    pub fn set_num_queues(&self, value: u32) -> Result<()> {
        self.mem.write_u32(vif::NUM_QUEUES, value)
    }

    pub fn mac(&self) -> Result<[u8; 6]> {
        let mut mac = [0u8; vif::MAC_BYTES];
        self.mem.read_bytes(vif::MAC, &mut mac)?;
        Ok(mac)
    }

    pub fn set_mac(&self, mac: [u8; 6]) -> Result<()> {
        self.mem.write_bytes(vif::MAC, &mac)
    }

    pub fn ip(&self) -> Result<Ipv4Addr> {
        let mut octets = [0u8; 4];
        self.mem.read_bytes(vif::IP, &mut octets)?;
        Ok(Ipv4Addr::from(octets))
    }

    pub fn set_ip(&self, ip: Ipv4Addr) -> Result<()> {
        self.mem.write_bytes(vif::IP, &ip.octets())
    }

    pub fn bridge(&self) -> Result<String> {
        self.mem.read_str(vif::BRIDGE, vif::BRIDGE_BYTES)
    }

    pub fn set_bridge(&self, bridge: &str) -> Result<()> {
        self.mem.write_str(vif::BRIDGE, vif::BRIDGE_BYTES, bridge)
    }

    pub fn vif_id(&self) -> Result<u32> {
        self.mem.read_u32(vif::VIF_ID)
    }

    pub fn set_vif_id(&self, id: u32) -> Result<()> {
        self.mem.write_u32(vif::VIF_ID, id)
    }

    pub fn request_rx_copy(&self) -> Result<bool> {
        Ok(self.mem.read_u32(vif::REQUEST_RX_COPY)? != 0)
    }

    pub fn set_request_rx_copy(&self, value: bool) -> Result<()> {
        self.mem.write_u32(vif::REQUEST_RX_COPY, u32::from(value))
    }

    pub fn ctrl_ring(&self) -> Result<(GrantRef, EvtchnPort)> {
        Ok((
            GrantRef(self.mem.read_u32(vif::CTRL_RING_REF)?),
            EvtchnPort(self.mem.read_u32(vif::CTRL_EVENT_CHANNEL)?),
        ))
    }

    fn queue_offset(slot: QueueSlot) -> Result<usize> {
        slot.offset(vif::INLINE_QUEUE, vif::QUEUES, vif::queue::BYTES)
    }

    pub fn queue(&self, slot: QueueSlot) -> Result<VifQueueRecord> {
        let base = Self::queue_offset(slot)?;
        Ok(VifQueueRecord {
            tx_ring_ref: GrantRef(self.mem.read_u32(base + vif::queue::TX_RING_REF)?),
            rx_ring_ref: GrantRef(self.mem.read_u32(base + vif::queue::RX_RING_REF)?),
            tx_event_channel: EvtchnPort(self.mem.read_u32(base + vif::queue::TX_EVENT_CHANNEL)?),
            rx_event_channel: EvtchnPort(self.mem.read_u32(base + vif::queue::RX_EVENT_CHANNEL)?),
        })
    }

    pub fn set_queue(&self, slot: QueueSlot, record: VifQueueRecord) -> Result<()> {
        let base = Self::queue_offset(slot)?;
        self.mem.write_u32(base + vif::queue::TX_RING_REF, record.tx_ring_ref.0)?;
        self.mem.write_u32(base + vif::queue::RX_RING_REF, record.rx_ring_ref.0)?;
        self.mem.write_u32(base + vif::queue::TX_EVENT_CHANNEL, record.tx_event_channel.0)?;
        self.mem.write_u32(base + vif::queue::RX_EVENT_CHANNEL, record.rx_event_channel.0)
    }
}

/// System-control payload view.
#[derive(Debug, Clone, Copy)]
pub struct SysctlPage<'a> {
    mem: &'a PageMemory,
}

impl SysctlPage<'_> {
    pub fn command(&self) -> Result<SysctlCommand> {
        Ok(SysctlCommand::from_bits_retain(self.mem.read_u32(sysctl::COMMAND)?))
    }

    pub fn set_command(&self, command: SysctlCommand) -> Result<()> {
        self.mem.write_u32(sysctl::COMMAND, command.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(ty: DeviceType) -> ControlPage {
        ControlPage::format(Arc::new(PageMemory::zeroed()), ty, 0, 7).unwrap()
    }

    #[test]
    fn format_then_open_validates_header() {
        let page = page(DeviceType::Vbd);
        let opened = ControlPage::open(page.memory().clone(), Some(DeviceType::Vbd)).unwrap();
        assert_eq!(opened.device_id().unwrap(), 7);
        assert_eq!(opened.domain_id().unwrap(), 0);
        assert_eq!(opened.backend_state().unwrap(), XenbusState::Unknown);
        assert_eq!(
            opened.frontend_state().unwrap(),
            XenbusState::Initialising
        );
    }

    #[test]
    fn open_rejects_wrong_type_magic_and_version() {
        let page = page(DeviceType::Vif);
        let mem = page.memory().clone();
        assert!(matches!(
            ControlPage::open(mem.clone(), Some(DeviceType::Vbd)),
            Err(LayoutError::DeviceTypeMismatch { .. })
        ));

        mem.write_u32(header::VERSION, 2).unwrap();
        assert_eq!(
            ControlPage::open(mem.clone(), None).unwrap_err(),
            LayoutError::UnsupportedVersion {
                found: 2,
                expected: layout::NOXS_VERSION
            }
        );
        assert!(matches!(
            page.backend_state(),
            Err(LayoutError::UnsupportedVersion { .. })
        ));

        mem.write_u32(header::MAGIC, 0xdead_beef).unwrap();
        assert!(matches!(
            ControlPage::open(mem, None),
            Err(LayoutError::BadMagic { found: 0xdead_beef })
        ));
    }

    #[test]
    fn undecodable_frontend_state_is_reported() {
        let page = page(DeviceType::Sysctl);
        page.set_frontend_state_raw(42).unwrap();
        assert_eq!(page.frontend_state_raw().unwrap(), 42);
        assert_eq!(page.frontend_state(), Err(LayoutError::InvalidState(42)));
    }

    #[test]
    fn byte_fields_do_not_clobber_neighbours() {
        let page = page(DeviceType::Vif);
        let view = page.vif().unwrap();
        view.set_ip(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        view.set_mac([0x00, 0x16, 0x3e, 0x01, 0x02, 0x03]).unwrap();
        view.set_bridge("xenbr0").unwrap();

        assert_eq!(view.mac().unwrap(), [0x00, 0x16, 0x3e, 0x01, 0x02, 0x03]);
        assert_eq!(view.ip().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(view.bridge().unwrap(), "xenbr0");
        assert!(matches!(
            view.set_bridge("a-very-long-bridge-name"),
            Err(LayoutError::FieldTooLong { .. })
        ));
    }

    #[test]
    fn vbd_rings_are_addressed_per_slot() {
        let page = page(DeviceType::Vbd);
        let view = page.vbd().unwrap();
        view.set_ring(QueueSlot::Inline, EvtchnPort(3), &[GrantRef(10)])
            .unwrap();
        view.set_ring(
            QueueSlot::Indexed(1),
            EvtchnPort(5),
            &[GrantRef(20), GrantRef(21)],
        )
        .unwrap();

        assert_eq!(view.ring_event_channel(QueueSlot::Inline).unwrap(), EvtchnPort(3));
        assert_eq!(view.ring_ref(QueueSlot::Inline, 0).unwrap(), GrantRef(10));
        assert_eq!(view.ring_ref(QueueSlot::Indexed(1), 1).unwrap(), GrantRef(21));
        assert_eq!(view.ring_ref(QueueSlot::Indexed(0), 0).unwrap(), GrantRef::INVALID);
        assert!(view.ring_ref(QueueSlot::Indexed(layout::MAX_QUEUES), 0).is_err());
        assert!(page.vif().is_err());
    }

    #[test]
    fn sectors_span_two_words() {
        let page = page(DeviceType::Vbd);
        let view = page.vbd().unwrap();
        view.set_geometry(0x1_0000_0002, 512, 4096, 0).unwrap();
        assert_eq!(view.sectors().unwrap(), 0x1_0000_0002);
        assert_eq!(view.physical_sector_size().unwrap(), 4096);
    }

    #[test]
    fn queue_slot_picks_inline_for_single_queue() {
        assert_eq!(QueueSlot::for_queue(0, 1), QueueSlot::Inline);
        assert_eq!(QueueSlot::for_queue(1, 2), QueueSlot::Indexed(1));
    }
}
