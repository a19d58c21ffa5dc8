//! Boot image flashing.

use crate::emulator::EmulatorError;
use crate::memory::{DEVICE_PAGE, Memory, PAGE_SHIFT, page_of};
use std::path::Path;

/// Where the boot program is flashed.
pub const PROGRAM_BASE: u32 = 0x0000_0000;
/// Where the BIOS image is flashed; execution starts here.
pub const BIOS_BASE: u32 = 0xFFFF_0000;

/// Copy a flat image into guest memory at `base`, mapping every page it
/// covers first. Pages that are already mapped are reused.
///
/// Returns the number of pages the image spans.
pub fn flash(mem: &mut Memory, base: u32, image: &[u8]) -> Result<usize, EmulatorError> {
    if image.is_empty() {
        return Ok(0);
    }
    let end = base as u64 + image.len() as u64;
    if end > 1u64 << 32 {
        return Err(EmulatorError::ImageTooLarge { base, len: image.len() });
    }

    let first = page_of(base);
    let last = page_of((end - 1) as u32);
    if (first..=last).contains(&DEVICE_PAGE) {
        return Err(EmulatorError::ImageOverlapsDevice { base, len: image.len() });
    }

    for page in first..=last {
        if mem.page_frame(page).is_none() {
            mem.allocate_page(page, None)?;
        }
    }
    for (i, &byte) in image.iter().enumerate() {
        mem.store(base + i as u32, byte)?;
    }

    let pages = (last - first + 1) as usize;
    log::debug!(
        "flashed {} bytes at {:#010x} ({} page{}, up to {:#010x})",
        image.len(),
        base,
        pages,
        if pages == 1 { "" } else { "s" },
        (last << PAGE_SHIFT) | 0xFFF
    );
    Ok(pages)
}

/// Read a boot image from disk.
pub fn read_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, EmulatorError> {
    Ok(std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_maps_every_covered_page() {
        let mut mem = Memory::new();
        let image: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        assert_eq!(flash(&mut mem, 0x0FFF, &image).unwrap(), 3);
        assert_eq!(mem.load(0x0FFF).unwrap(), 0);
        assert_eq!(mem.load(0x0FFF + 4999).unwrap(), (4999u32 & 0xFF) as u8);
        assert!(mem.page_frame(0).is_some());
        assert!(mem.page_frame(1).is_some());
        assert!(mem.page_frame(2).is_some());
        assert!(mem.page_frame(3).is_none());
    }

    #[test]
    fn bios_fits_at_top_of_memory() {
        let mut mem = Memory::new();
        let image = vec![0xFFu8; 0x1_0000];
        assert_eq!(flash(&mut mem, BIOS_BASE, &image).unwrap(), 16);
        assert_eq!(mem.load(0xFFFF_FFFF).unwrap(), 0xFF);

        let too_big = vec![0u8; 0x1_0001];
        assert!(matches!(
            flash(&mut mem, BIOS_BASE, &too_big),
            Err(EmulatorError::ImageTooLarge { .. })
        ));
    }

    #[test]
    fn device_page_is_never_flashed() {
        let mut mem = Memory::new();
        let err = flash(&mut mem, 0xFDFF_F000, &[0u8; 0x2000]).unwrap_err();
        assert!(matches!(err, EmulatorError::ImageOverlapsDevice { .. }));
    }

    #[test]
    fn reflash_keeps_existing_frame() {
        let mut mem = Memory::new();
        flash(&mut mem, PROGRAM_BASE, &[1, 2, 3]).unwrap();
        let frame = mem.page_frame(0);
        flash(&mut mem, 0x10, &[9]).unwrap();
        assert_eq!(mem.page_frame(0), frame);
        assert_eq!(mem.load(1).unwrap(), 2);
        assert_eq!(mem.load(0x10).unwrap(), 9);
    }

    #[test]
    fn empty_image_is_a_noop() {
        let mut mem = Memory::new();
        assert_eq!(flash(&mut mem, 0x4000, &[]).unwrap(), 0);
        assert!(mem.page_frame(4).is_none());
    }
}
