//! A cooperative single-window cache over [`DataReader`].
//!
//! **Thread-affinity contract**: each worker thread owns its own
//! `MemoryReader`; readers are never shared, and a reader is discarded
//! once its top-level enumeration completes so stale memory can't leak
//! across phases. The cache is just a field on whatever context a walk or
//! search carries, not a `thread_local!`.

use crate::config::ReaderConfig;
use crate::external::DataReader;

pub struct MemoryReader<'r, R: DataReader> {
    reader: &'r R,
    window_size: usize,
    window_start: u64,
    window: Vec<u8>,
}

impl<'r, R: DataReader> MemoryReader<'r, R> {
    pub fn new(reader: &'r R, config: ReaderConfig) -> Self {
        MemoryReader {
            reader,
            window_size: config.window_size,
            window_start: 0,
            window: Vec::new(),
        }
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        !self.window.is_empty()
            && addr >= self.window_start
            && addr < self.window_start + self.window.len() as u64
    }

    /// Loads the window covering `addr`, starting exactly at `addr`. A
    /// later read at an address before `addr` within the same page will
    /// miss and reload — a single contiguous window, not a sliding window
    /// aligned to anything cleverer.
    pub fn ensure_range_in_cache(&mut self, addr: u64) {
        if self.contains(addr) {
            return;
        }
        self.window.resize(self.window_size, 0);
        let read = self.reader.read_memory(addr, &mut self.window);
        self.window.truncate(read);
        self.window_start = addr;
    }

    pub fn read_ptr(&mut self, addr: u64) -> Option<u64> {
        self.ensure_range_in_cache(addr);
        if self.contains(addr) && self.contains(addr + 7) {
            let offset = (addr - self.window_start) as usize;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&self.window[offset..offset + 8]);
            return Some(u64::from_le_bytes(bytes));
        }
        let value = self.reader.read_pointer_unsafe(addr);
        if value == 0 && !self.address_is_mapped(addr) {
            return None;
        }
        Some(value)
    }

    pub fn read_dword(&mut self, addr: u64) -> Option<u32> {
        self.ensure_range_in_cache(addr);
        if self.contains(addr) && self.contains(addr + 3) {
            let offset = (addr - self.window_start) as usize;
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&self.window[offset..offset + 4]);
            return Some(u32::from_le_bytes(bytes));
        }
        Some(self.reader.read_u32_unsafe(addr))
    }

    fn address_is_mapped(&self, addr: u64) -> bool {
        let mut probe = [0u8; 1];
        self.reader.read_memory(addr, &mut probe) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeReader {
        base: u64,
        bytes: Vec<u8>,
    }

    impl DataReader for FakeReader {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> usize {
            if addr < self.base || addr >= self.base + self.bytes.len() as u64 {
                return 0;
            }
            let offset = (addr - self.base) as usize;
            let n = buf.len().min(self.bytes.len() - offset);
            buf[..n].copy_from_slice(&self.bytes[offset..offset + n]);
            n
        }

        fn read_pointer_unsafe(&self, addr: u64) -> u64 {
            let mut buf = [0u8; 8];
            self.read_memory(addr, &mut buf);
            u64::from_le_bytes(buf)
        }

        fn read_u32_unsafe(&self, addr: u64) -> u32 {
            let mut buf = [0u8; 4];
            self.read_memory(addr, &mut buf);
            u32::from_le_bytes(buf)
        }
    }

    #[test]
    fn reads_through_cached_window() {
        let mut bytes = vec![0u8; 64];
        bytes[8..16].copy_from_slice(&0xdead_beefu64.to_le_bytes());
        let reader = FakeReader { base: 0x1000, bytes };
        let mut mr = MemoryReader::new(&reader, ReaderConfig { window_size: 64 });
        assert_eq!(mr.read_ptr(0x1008), Some(0xdead_beef));
        assert!(mr.contains(0x1000));
    }

    #[test]
    fn falls_back_past_window_end() {
        let bytes = vec![0u8; 16];
        let reader = FakeReader { base: 0x1000, bytes };
        let mut mr = MemoryReader::new(&reader, ReaderConfig { window_size: 16 });
        // Address well past the cached window and past mapped memory reads as unmapped.
        assert_eq!(mr.read_ptr(0x5000), None);
    }
}
