//! Paged guest memory.
//!
//! The 32-bit guest address space is split into 4 KiB pages. A page table
//! maps the top 20 bits of an address to a frame id, and frames are
//! allocated lazily the first time some page is mapped to them. One page is
//! reserved for devices: byte `n` of it is routed to the n-th registered
//! [`Port`].

use crate::cpu::Fault;
use crate::devices::{Port, PortRegistry};
use std::collections::{HashMap, HashSet};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;
const OFFSET_MASK: u32 = (PAGE_SIZE as u32) - 1;
/// Page numbers are 20 bits wide.
pub const PAGE_NUMBER_MASK: u32 = 0xF_FFFF;

/// Page (and frame) reserved for device ports.
pub const DEVICE_PAGE: u32 = 0xFE000;
pub const DEVICE_FRAME: u32 = 0xFE000;
/// First guest address of the device page.
pub const DEVICE_BASE: u32 = DEVICE_PAGE << PAGE_SHIFT;

/// Highest interrupt id accepted by the IVT.
pub const MAX_INTERRUPTS: u32 = 512;
pub const IVT_ENTRY_SIZE: u32 = 4;
/// Ids at or above this value are user interrupts: an empty entry there
/// means "not installed" instead of a fault.
pub const USER_INTERRUPT_BASE: u32 = 0x100;

pub type Frame = Box<[u8; PAGE_SIZE]>;

#[inline(always)]
pub fn page_of(addr: u32) -> u32 {
    addr >> PAGE_SHIFT
}

#[inline(always)]
pub fn offset_of(addr: u32) -> usize {
    (addr & OFFSET_MASK) as usize
}

fn zeroed_frame() -> Frame {
    Box::new([0u8; PAGE_SIZE])
}

/// Guest memory: page table, frame store, device ports, stack and IVT
/// registers.
pub struct Memory {
    page_table: HashMap<u32, u32>,
    frames: HashMap<u32, Frame>,
    ports: PortRegistry,
    stack_base: Option<u32>,
    stack_pos: u32,
    ivt_base: Option<u32>,
}

impl Memory {
    pub fn new() -> Self {
        let mut page_table = HashMap::new();
        let mut frames = HashMap::new();
        page_table.insert(DEVICE_PAGE, DEVICE_FRAME);
        frames.insert(DEVICE_FRAME, zeroed_frame());

        Self {
            page_table,
            frames,
            ports: PortRegistry::new(),
            stack_base: None,
            stack_pos: 0,
            ivt_base: None,
        }
    }

    // --- Paging ----------------------------------------------------------

    /// Map `page` to `frame`, or to the lowest frame id that no page maps
    /// to. Returns the frame used.
    ///
    /// Remapping an already mapped page replaces the old mapping. The device
    /// page and the device frame are never handed out. A page number wider
    /// than 20 bits faults, carrying the number itself since it has no
    /// address.
    pub fn allocate_page(&mut self, page: u32, frame: Option<u32>) -> Result<u32, Fault> {
        if page > PAGE_NUMBER_MASK {
            return Err(Fault::PageFault(page));
        }
        if page == DEVICE_PAGE {
            return Err(Fault::PageFault(page << PAGE_SHIFT));
        }

        let frame = match frame {
            Some(DEVICE_FRAME) => return Err(Fault::PageFault(page << PAGE_SHIFT)),
            Some(f) => f,
            None => self.lowest_free_frame(),
        };

        self.frames.entry(frame).or_insert_with(zeroed_frame);
        self.page_table.insert(page, frame);
        log::debug!("page {:#07x} -> frame {:#07x}", page, frame);
        Ok(frame)
    }

    fn lowest_free_frame(&self) -> u32 {
        let used: HashSet<u32> = self.page_table.values().copied().collect();
        let mut frame = 0;
        while used.contains(&frame) || frame == DEVICE_FRAME {
            frame += 1;
        }
        frame
    }

    /// Drop the mapping for `page`. The frame keeps its contents.
    pub fn free_page(&mut self, page: u32) {
        if page > PAGE_NUMBER_MASK || page == DEVICE_PAGE {
            return;
        }
        if let Some(frame) = self.page_table.remove(&page) {
            log::debug!("page {:#07x} released frame {:#07x}", page, frame);
        }
    }

    /// Move the mapping of `old` to `new`. An unmapped `old` just allocates
    /// `new`.
    pub fn relocate_page(&mut self, old: u32, new: u32) -> Result<u32, Fault> {
        for page in [old, new] {
            if page > PAGE_NUMBER_MASK {
                return Err(Fault::PageFault(page));
            }
        }
        if old == DEVICE_PAGE || new == DEVICE_PAGE {
            return Err(Fault::PageFault(DEVICE_BASE));
        }
        match self.page_table.remove(&old) {
            Some(frame) => self.allocate_page(new, Some(frame)),
            None => self.allocate_page(new, None),
        }
    }

    pub fn page_frame(&self, page: u32) -> Option<u32> {
        self.page_table.get(&page).copied()
    }

    /// Mapped pages in ascending order, the device page included.
    pub fn mapped_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.page_table.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn frame(&self, id: u32) -> Option<&[u8; PAGE_SIZE]> {
        self.frames.get(&id).map(|f| &**f)
    }

    /// Frame ids that have backing storage, ascending.
    pub fn frame_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.frames.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Overwrite (or create) frame `id` with `data`.
    pub fn install_frame(&mut self, id: u32, data: &[u8; PAGE_SIZE]) {
        self.frames
            .entry(id)
            .or_insert_with(zeroed_frame)
            .copy_from_slice(data);
    }

    /// Forget every ordinary mapping and frame. Ports and the device page
    /// stay.
    pub fn clear(&mut self) {
        self.page_table.retain(|&page, _| page == DEVICE_PAGE);
        self.frames.retain(|&id, _| id == DEVICE_FRAME);
        self.stack_base = None;
        self.stack_pos = 0;
        self.ivt_base = None;
    }

    // --- Devices ---------------------------------------------------------

    /// Attach a port; it answers at `DEVICE_BASE + returned offset`.
    pub fn register_port(&mut self, port: Box<dyn Port>) -> usize {
        let offset = self.ports.register(port);
        log::debug!("port {} mapped at {:#010x}", offset, DEVICE_BASE + offset as u32);
        offset
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    // --- Byte access -----------------------------------------------------

    pub fn load(&mut self, addr: u32) -> Result<u8, Fault> {
        let page = page_of(addr);
        let offset = offset_of(addr);
        if page == DEVICE_PAGE {
            if let Some(port) = self.ports.get_mut(offset) {
                return Ok(port.read());
            }
        }
        let frame = self.page_table.get(&page).ok_or(Fault::PageFault(addr))?;
        let bytes = self.frames.get(frame).ok_or(Fault::PageFault(addr))?;
        Ok(bytes[offset])
    }

    pub fn store(&mut self, addr: u32, value: u8) -> Result<(), Fault> {
        let page = page_of(addr);
        let offset = offset_of(addr);
        if page == DEVICE_PAGE {
            if let Some(port) = self.ports.get_mut(offset) {
                port.write(value);
                return Ok(());
            }
        }
        let frame = self.page_table.get(&page).ok_or(Fault::PageFault(addr))?;
        let bytes = self.frames.get_mut(frame).ok_or(Fault::PageFault(addr))?;
        bytes[offset] = value;
        Ok(())
    }

    /// Read a byte without touching ports. `None` if the page is unmapped.
    pub fn load_bypass_devices(&self, addr: u32) -> Option<u8> {
        let frame = self.page_table.get(&page_of(addr))?;
        self.frames.get(frame).map(|bytes| bytes[offset_of(addr)])
    }

    // --- Sized access ----------------------------------------------------

    /// Little-endian load of `n` (<= 8) bytes. Addresses wrap at 4 GiB.
    pub fn load_sized(&mut self, addr: u32, n: usize) -> Result<u64, Fault> {
        let mut value = 0u64;
        for i in 0..n {
            let byte = self.load(addr.wrapping_add(i as u32))?;
            value |= (byte as u64) << (8 * i);
        }
        Ok(value)
    }

    /// Little-endian store of the low `n` (<= 8) bytes of `value`.
    pub fn store_sized(&mut self, addr: u32, n: usize, value: u64) -> Result<(), Fault> {
        for i in 0..n {
            self.store(addr.wrapping_add(i as u32), (value >> (8 * i)) as u8)?;
        }
        Ok(())
    }

    pub fn load_word(&mut self, addr: u32) -> Result<u16, Fault> {
        Ok(self.load_sized(addr, 2)? as u16)
    }

    pub fn load_double(&mut self, addr: u32) -> Result<u32, Fault> {
        Ok(self.load_sized(addr, 4)? as u32)
    }

    pub fn load_quad(&mut self, addr: u32) -> Result<u64, Fault> {
        self.load_sized(addr, 8)
    }

    pub fn store_word(&mut self, addr: u32, value: u16) -> Result<(), Fault> {
        self.store_sized(addr, 2, value as u64)
    }

    pub fn store_double(&mut self, addr: u32, value: u32) -> Result<(), Fault> {
        self.store_sized(addr, 4, value as u64)
    }

    pub fn store_quad(&mut self, addr: u32, value: u64) -> Result<(), Fault> {
        self.store_sized(addr, 8, value)
    }

    // --- Stack -----------------------------------------------------------

    pub fn set_stack_base(&mut self, addr: u32) {
        self.stack_base = Some(addr);
    }

    pub fn stack_base(&self) -> Option<u32> {
        self.stack_base
    }

    /// Bytes currently on the stack.
    pub fn stack_pos(&self) -> u32 {
        self.stack_pos
    }

    pub fn set_stack_pos(&mut self, pos: u32) {
        self.stack_pos = pos;
    }

    /// Push the low `n` bytes of `value`. The stack grows downwards from
    /// the base; depth is not bounds checked.
    pub fn push_sized(&mut self, n: usize, value: u64) -> Result<(), Fault> {
        let addr = self.stack_slot(self.stack_pos, n);
        if self.stack_base.is_none() {
            return Err(Fault::PageFault(addr));
        }
        self.store_sized(addr, n, value)?;
        self.stack_pos = self.stack_pos.wrapping_add(n as u32);
        Ok(())
    }

    pub fn pop_sized(&mut self, n: usize) -> Result<u64, Fault> {
        let pos = self.stack_pos.wrapping_sub(n as u32);
        let addr = self.stack_slot(pos, n);
        if self.stack_base.is_none() {
            return Err(Fault::PageFault(addr));
        }
        let value = self.load_sized(addr, n)?;
        self.stack_pos = pos;
        Ok(value)
    }

    #[inline]
    fn stack_slot(&self, pos: u32, n: usize) -> u32 {
        self.stack_base
            .unwrap_or(0)
            .wrapping_sub(pos)
            .wrapping_sub(n as u32)
    }

    pub fn push(&mut self, value: u8) -> Result<(), Fault> {
        self.push_sized(1, value as u64)
    }

    pub fn pop(&mut self) -> Result<u8, Fault> {
        Ok(self.pop_sized(1)? as u8)
    }

    pub fn push_word(&mut self, value: u16) -> Result<(), Fault> {
        self.push_sized(2, value as u64)
    }

    pub fn pop_word(&mut self) -> Result<u16, Fault> {
        Ok(self.pop_sized(2)? as u16)
    }

    pub fn push_double(&mut self, value: u32) -> Result<(), Fault> {
        self.push_sized(4, value as u64)
    }

    pub fn pop_double(&mut self) -> Result<u32, Fault> {
        Ok(self.pop_sized(4)? as u32)
    }

    pub fn push_quad(&mut self, value: u64) -> Result<(), Fault> {
        self.push_sized(8, value)
    }

    pub fn pop_quad(&mut self) -> Result<u64, Fault> {
        self.pop_sized(8)
    }

    // --- Interrupt vector table -----------------------------------------

    pub fn set_ivt_base(&mut self, addr: u32) {
        self.ivt_base = Some(addr);
    }

    pub fn ivt_base(&self) -> Option<u32> {
        self.ivt_base
    }

    fn ivt_entry(&self, id: u32) -> Result<u32, Fault> {
        if id > MAX_INTERRUPTS {
            return Err(Fault::IvtOverflow(id));
        }
        let base = self.ivt_base.ok_or(Fault::UndefinedInterrupt(id))?;
        Ok(base.wrapping_add(id * IVT_ENTRY_SIZE))
    }

    /// Install `target` as the handler of interrupt `id`.
    pub fn register_int(&mut self, id: u32, target: u32) -> Result<(), Fault> {
        let entry = self.ivt_entry(id)?;
        self.store_double(entry, target)
    }

    /// Resolve the handler of interrupt `id`.
    ///
    /// An empty entry is a fault for system ids and `Ok(0)` for user ids.
    pub fn find_int(&mut self, id: u32) -> Result<u32, Fault> {
        let entry = self.ivt_entry(id)?;
        let target = self.load_double(entry)?;
        if target == 0 && id < USER_INTERRUPT_BASE {
            return Err(Fault::UndefinedInterrupt(id));
        }
        Ok(target)
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingPort {
        written: Rc<RefCell<Vec<u8>>>,
        next_read: u8,
    }

    impl Port for RecordingPort {
        fn read(&mut self) -> u8 {
            self.next_read
        }
        fn write(&mut self, value: u8) {
            self.written.borrow_mut().push(value);
        }
    }

    #[test]
    fn page_roundtrip_and_fault_after_free() {
        let mut mem = Memory::new();
        mem.allocate_page(0x00001, None).unwrap();
        mem.store(0x0000_1234, 0xAB).unwrap();
        assert_eq!(mem.load(0x0000_1234).unwrap(), 0xAB);

        mem.free_page(0x00001);
        assert_eq!(mem.load(0x0000_1234), Err(Fault::PageFault(0x0000_1234)));
        assert_eq!(mem.store(0x0000_1234, 1), Err(Fault::PageFault(0x0000_1234)));
        // Idempotent.
        mem.free_page(0x00001);
    }

    #[test]
    fn unmapped_access_faults_with_address() {
        let mut mem = Memory::new();
        assert_eq!(mem.load(0x1234_5678), Err(Fault::PageFault(0x1234_5678)));
    }

    #[test]
    fn allocation_picks_lowest_unused_frame() {
        let mut mem = Memory::new();
        assert_eq!(mem.allocate_page(0x10, None).unwrap(), 0);
        assert_eq!(mem.allocate_page(0x20, None).unwrap(), 1);
        assert_eq!(mem.allocate_page(0x30, Some(7)).unwrap(), 7);
        mem.free_page(0x10);
        assert_eq!(mem.allocate_page(0x40, None).unwrap(), 0);
        assert_eq!(mem.allocate_page(0x50, None).unwrap(), 2);
    }

    #[test]
    fn freed_frame_keeps_contents() {
        let mut mem = Memory::new();
        mem.allocate_page(0x10, None).unwrap();
        mem.store(0x10_005, 0x5A).unwrap();
        mem.free_page(0x10);
        mem.allocate_page(0x99, Some(0)).unwrap();
        assert_eq!(mem.load(0x99_005).unwrap(), 0x5A);
    }

    #[test]
    fn device_page_and_frame_are_reserved() {
        let mut mem = Memory::new();
        assert!(mem.allocate_page(DEVICE_PAGE, None).is_err());
        assert!(mem.allocate_page(0x10, Some(DEVICE_FRAME)).is_err());
        mem.free_page(DEVICE_PAGE);
        assert_eq!(mem.page_frame(DEVICE_PAGE), Some(DEVICE_FRAME));
    }

    #[test]
    fn page_numbers_wider_than_20_bits_are_rejected() {
        let mut mem = Memory::new();
        mem.allocate_page(0x1, None).unwrap();
        assert_eq!(mem.allocate_page(0x10_0001, None), Err(Fault::PageFault(0x10_0001)));
        assert_eq!(mem.relocate_page(0x1, 0x10_0002), Err(Fault::PageFault(0x10_0002)));
        mem.free_page(0x10_0001);
        assert!(mem.page_frame(0x1).is_some());
        assert!(mem.page_frame(0x10_0001).is_none());
        assert_eq!(mem.mapped_pages(), vec![0x1, DEVICE_PAGE]);
    }

    #[test]
    fn relocate_moves_mapping() {
        let mut mem = Memory::new();
        mem.allocate_page(0x1, None).unwrap();
        mem.store(0x1_010, 0x77).unwrap();
        mem.relocate_page(0x1, 0x2).unwrap();
        assert!(mem.load(0x1_010).is_err());
        assert_eq!(mem.load(0x2_010).unwrap(), 0x77);

        // Unmapped source behaves like a fresh allocation.
        mem.relocate_page(0x3, 0x4).unwrap();
        assert!(mem.page_frame(0x4).is_some());
    }

    #[test]
    fn sized_access_is_little_endian() {
        let mut mem = Memory::new();
        mem.allocate_page(0, None).unwrap();

        mem.store_word(0x10, 0xBEEF).unwrap();
        assert_eq!(mem.load(0x10).unwrap(), 0xEF);
        assert_eq!(mem.load(0x11).unwrap(), 0xBE);
        assert_eq!(mem.load_word(0x10).unwrap(), 0xBEEF);

        mem.store_double(0x20, 0x1234_5678).unwrap();
        assert_eq!(mem.load(0x20).unwrap(), 0x78);
        assert_eq!(mem.load_double(0x20).unwrap(), 0x1234_5678);

        mem.store_quad(0x30, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(mem.load(0x30).unwrap(), 0x08);
        assert_eq!(mem.load(0x37).unwrap(), 0x01);
        assert_eq!(mem.load_quad(0x30).unwrap(), 0x0102_0304_0506_0708);

        mem.store(0x40, 0x99).unwrap();
        assert_eq!(mem.load_sized(0x40, 1).unwrap(), 0x99);
    }

    #[test]
    fn sized_access_spans_pages() {
        let mut mem = Memory::new();
        mem.allocate_page(0, None).unwrap();
        mem.allocate_page(1, None).unwrap();
        mem.store_double(0x0FFE, 0xAABB_CCDD).unwrap();
        assert_eq!(mem.load_double(0x0FFE).unwrap(), 0xAABB_CCDD);
        assert_eq!(mem.load(0x1000).unwrap(), 0xBB);

        // Crossing into an unmapped page faults on the first missing byte.
        assert_eq!(mem.load_double(0x1FFE), Err(Fault::PageFault(0x2000)));
    }

    #[test]
    fn stack_push_pop() {
        let mut mem = Memory::new();
        mem.allocate_page(0x8, None).unwrap();
        mem.set_stack_base(0x9000);

        mem.push_double(0xDEAD_BEEF).unwrap();
        assert_eq!(mem.stack_pos(), 4);
        assert_eq!(mem.load_double(0x8FFC).unwrap(), 0xDEAD_BEEF);
        mem.push_word(0x1234).unwrap();
        mem.push(0x56).unwrap();
        assert_eq!(mem.stack_pos(), 7);

        assert_eq!(mem.pop().unwrap(), 0x56);
        assert_eq!(mem.pop_word().unwrap(), 0x1234);
        assert_eq!(mem.pop_double().unwrap(), 0xDEAD_BEEF);
        assert_eq!(mem.stack_pos(), 0);

        mem.push_quad(u64::MAX - 1).unwrap();
        assert_eq!(mem.pop_quad().unwrap(), u64::MAX - 1);
    }

    #[test]
    fn stack_without_base_faults() {
        let mut mem = Memory::new();
        mem.allocate_page(0xFFFFF, None).unwrap();
        assert_eq!(mem.push_double(1), Err(Fault::PageFault(0xFFFF_FFFC)));
        assert_eq!(mem.stack_pos(), 0);
    }

    #[test]
    fn ivt_roundtrip_and_overflow() {
        let mut mem = Memory::new();
        mem.allocate_page(0x2, None).unwrap();

        assert_eq!(mem.register_int(5, 0x1000), Err(Fault::UndefinedInterrupt(5)));
        mem.set_ivt_base(0x2000);

        mem.register_int(5, 0xCAFE).unwrap();
        assert_eq!(mem.find_int(5).unwrap(), 0xCAFE);
        assert_eq!(mem.load_double(0x2014).unwrap(), 0xCAFE);

        mem.register_int(512, 0x42).unwrap();
        assert_eq!(mem.find_int(512).unwrap(), 0x42);
        assert_eq!(mem.register_int(513, 0x42), Err(Fault::IvtOverflow(513)));
        assert_eq!(mem.find_int(513), Err(Fault::IvtOverflow(513)));
    }

    #[test]
    fn empty_ivt_entries() {
        let mut mem = Memory::new();
        mem.allocate_page(0x2, None).unwrap();
        mem.set_ivt_base(0x2000);
        assert_eq!(mem.find_int(0x10), Err(Fault::UndefinedInterrupt(0x10)));
        assert_eq!(mem.find_int(0x100).unwrap(), 0);
        assert_eq!(mem.find_int(0x1FF).unwrap(), 0);
    }

    #[test]
    fn device_port_delegation() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let mut mem = Memory::new();
        let idx = mem.register_port(Box::new(RecordingPort {
            written: written.clone(),
            next_read: 0x42,
        }));
        assert_eq!(idx, 0);

        mem.store(DEVICE_BASE, 0x41).unwrap();
        assert_eq!(*written.borrow(), vec![0x41]);
        assert_eq!(mem.load(DEVICE_BASE).unwrap(), 0x42);

        // Offsets without a port hit the reserved frame.
        mem.store(DEVICE_BASE + 1, 0x11).unwrap();
        assert_eq!(mem.load(DEVICE_BASE + 1).unwrap(), 0x11);
        assert_eq!(mem.load_bypass_devices(DEVICE_BASE), Some(0));
    }

    #[test]
    fn clear_keeps_device_page() {
        let mut mem = Memory::new();
        mem.allocate_page(3, None).unwrap();
        mem.set_stack_base(0x100);
        mem.clear();
        assert_eq!(mem.mapped_pages(), vec![DEVICE_PAGE]);
        assert_eq!(mem.frame_ids(), vec![DEVICE_FRAME]);
        assert!(mem.stack_base().is_none());
    }
}
