//! The page layout and slotted record directory.
//!
//! A page is a fixed-size byte block. The header lives in the first bytes
//! of the block and is accessed with unaligned reads so the block stays a
//! plain byte array on disk. Slot entries grow up from the header; record
//! bytes grow down from the end.

use crate::{Lsn, PageId, PAGE_SIZE};

/// On-disk page header.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PageHeaderData {
    /// LSN of the latest log record applied to this page.
    pub page_lsn: Lsn,

    pub file_id: u64,

    pub page_no: u64,

    pub flags: u16,

    /// End of the slot directory.
    pub lower_offset: u16,

    /// Start of record data.
    pub upper_offset: u16,
}

/// One slot directory entry. A zero length marks a deleted slot.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct SlotData {
    pub offset: u16,

    pub length: u16,
}

pub const PAGE_HEADER_LEN: usize = std::mem::size_of::<PageHeaderData>();

const SLOT_LEN: usize = std::mem::size_of::<SlotData>();

#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,

    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(id: PageId) -> Self {
        let mut page = Page {
            id,
            data: [0; PAGE_SIZE],
        };
        page.initialize();
        page
    }

    pub fn initialize(&mut self) {
        let header = PageHeaderData {
            page_lsn: 0,
            file_id: self.id.file_id,
            page_no: self.id.page_no,
            flags: 0,
            lower_offset: PAGE_HEADER_LEN as u16,
            upper_offset: PAGE_SIZE as u16,
        };
        self.write_header(&header);
    }

    pub fn read_header(&self) -> PageHeaderData {
        unsafe { std::ptr::read_unaligned(self.data.as_ptr() as *const PageHeaderData) }
    }

    pub fn write_header(&mut self, header: &PageHeaderData) {
        unsafe {
            std::ptr::write_unaligned(self.data.as_mut_ptr() as *mut PageHeaderData, *header);
        }
    }

    pub fn page_lsn(&self) -> Lsn {
        self.read_header().page_lsn
    }

    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        let mut header = self.read_header();
        header.page_lsn = lsn;
        self.write_header(&header);
    }

    /// Replaces the page contents with a logged whole-page image. The
    /// caller stamps the page LSN afterwards.
    pub fn install_image(&mut self, image: &[u8]) {
        let len = image.len().min(PAGE_SIZE);
        self.data[..len].copy_from_slice(&image[..len]);
    }

    /// True when a record of `record_len` bytes (plus its slot entry)
    /// fits in the free span.
    pub fn has_room_for(&self, record_len: usize) -> bool {
        let header = self.read_header();
        let free = header.upper_offset.saturating_sub(header.lower_offset) as usize;
        record_len <= u16::MAX as usize && free >= record_len + SLOT_LEN
    }

    /// Adds a record and returns its slot index, or `None` when the page
    /// has no room.
    pub fn insert_record(&mut self, record: &[u8]) -> Option<u16> {
        let needed = record.len() + SLOT_LEN;
        let header = self.read_header();
        let free = header.upper_offset.saturating_sub(header.lower_offset);
        if (free as usize) < needed || record.len() > u16::MAX as usize {
            return None;
        }

        let slot_offset = header.lower_offset;
        let record_offset = header.upper_offset - record.len() as u16;
        let slot_index = (slot_offset - PAGE_HEADER_LEN as u16) / SLOT_LEN as u16;

        self.write_slot(
            slot_offset,
            &SlotData {
                offset: record_offset,
                length: record.len() as u16,
            },
        );
        self.data[record_offset as usize..record_offset as usize + record.len()]
            .copy_from_slice(record);

        let mut header = self.read_header();
        header.lower_offset += SLOT_LEN as u16;
        header.upper_offset = record_offset;
        self.write_header(&header);

        Some(slot_index)
    }

    pub fn read_record(&self, slot: u16) -> Option<&[u8]> {
        let slot_data = self.slot(slot)?;
        Some(&self.data[slot_data.offset as usize..(slot_data.offset + slot_data.length) as usize])
    }

    /// Overwrites a record in place. The replacement must match the
    /// stored length; size-changing updates go through delete + insert.
    pub fn write_record(&mut self, slot: u16, record: &[u8]) -> bool {
        let Some(slot_data) = self.slot(slot) else {
            return false;
        };
        if record.len() != slot_data.length as usize {
            return false;
        }
        self.data[slot_data.offset as usize..(slot_data.offset + slot_data.length) as usize]
            .copy_from_slice(record);
        true
    }

    /// Marks a slot deleted. The space is not reclaimed until the page is
    /// compacted by a heap maintenance pass.
    pub fn delete_record(&mut self, slot: u16) -> bool {
        let Some(mut slot_data) = self.slot(slot) else {
            return false;
        };
        slot_data.length = 0;
        let slot_offset = PAGE_HEADER_LEN as u16 + slot * SLOT_LEN as u16;
        self.write_slot(slot_offset, &slot_data);
        true
    }

    /// Number of slots, deleted ones included.
    pub fn slot_count(&self) -> u16 {
        let lower = self.read_header().lower_offset;
        if lower < PAGE_HEADER_LEN as u16 {
            return 0;
        }
        (lower - PAGE_HEADER_LEN as u16) / SLOT_LEN as u16
    }

    /// Number of live records.
    pub fn record_count(&self) -> u16 {
        (0..self.slot_count())
            .filter(|&s| self.slot(s).is_some())
            .count() as u16
    }

    fn slot(&self, slot: u16) -> Option<SlotData> {
        let slot_offset = PAGE_HEADER_LEN as u16 + slot * SLOT_LEN as u16;
        if slot_offset + SLOT_LEN as u16 > self.read_header().lower_offset {
            return None;
        }
        let slot_data = self.read_slot(slot_offset);
        if slot_data.length == 0 {
            return None;
        }
        if slot_data.offset < self.read_header().lower_offset
            || slot_data.offset as usize + slot_data.length as usize > PAGE_SIZE
        {
            return None;
        }
        Some(slot_data)
    }

    fn read_slot(&self, offset: u16) -> SlotData {
        unsafe {
            std::ptr::read_unaligned(self.data.as_ptr().add(offset as usize) as *const SlotData)
        }
    }

    fn write_slot(&mut self, offset: u16, slot: &SlotData) {
        unsafe {
            std::ptr::write_unaligned(
                self.data.as_mut_ptr().add(offset as usize) as *mut SlotData,
                *slot,
            );
        }
    }
}
