use core::ops::Range;

/// Non-volatile storage for the application image.
///
/// Owned exclusively by the [`Engine`](crate::Engine), which is the only
/// caller of these methods.
pub trait FlashStore {
    type Error: core::fmt::Debug;

    /// Erase granularity in bytes
    fn page_size(&self) -> u32;

    /// Addresses the application image may occupy
    fn app_region(&self) -> Range<u32>;

    /// Start of the page containing `address`
    fn page_base(&self, address: u32) -> u32 {
        let page_size = self.page_size().max(1);
        address - address % page_size
    }

    /// Erase the page containing `address` unless it was already erased
    /// during this session
    fn erase_if_needed(&mut self, address: u32) -> Result<(), Self::Error>;

    /// Program `data` starting at `address`
    fn write_at(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Commit any buffered writes before hand-off
    fn finalize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Transfer control to the application entry point.
    ///
    /// On hardware this does not return.
    fn start_application(&mut self);
}

#[derive(Copy, Clone, PartialEq, Debug, thiserror::Error)]
pub enum FlashError {
    #[error("{len} bytes at 0x{address:08x} outside flash")]
    OutOfRange { address: u32, len: usize },

    #[error("write to unerased page at 0x{address:08x}")]
    NotErased { address: u32 },

    #[error("programming failed at 0x{address:08x}")]
    WriteFailed { address: u32 },
}

/// RAM backed NOR flash.
///
/// Pages erase to `0xFF` and programming can only clear bits, as on the
/// real part. Useful for simulating a device on the host.
#[derive(Clone, Debug)]
pub struct MemFlash {
    base: u32,
    page_size: u32,
    memory: Vec<u8>,
    erased: Vec<bool>,
    erase_count: usize,
    failures: usize,
    started: bool,
}

impl MemFlash {
    pub fn new(base: u32, page_size: u32, pages: usize) -> Self {
        Self {
            base,
            page_size,
            memory: vec![0u8; page_size as usize * pages],
            erased: vec![false; pages],
            erase_count: 0,
            failures: 0,
            started: false,
        }
    }

    /// Fail the next `count` calls to `write_at`
    pub fn fail_next_writes(&mut self, count: usize) {
        self.failures = count;
    }

    /// Read back `len` bytes at `address`
    pub fn read(&self, address: u32, len: usize) -> Option<&[u8]> {
        let start = address.checked_sub(self.base)? as usize;
        self.memory.get(start..start + len)
    }

    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    /// Whether the application has been started
    pub fn started(&self) -> bool {
        self.started
    }

    fn offset(&self, address: u32, len: usize) -> Result<usize, FlashError> {
        let out = FlashError::OutOfRange { address, len };
        let start = address.checked_sub(self.base).ok_or(out)? as usize;
        if start + len > self.memory.len() {
            return Err(out);
        }
        Ok(start)
    }
}

impl FlashStore for MemFlash {
    type Error = FlashError;

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn app_region(&self) -> Range<u32> {
        self.base..self.base + self.memory.len() as u32
    }

    /// Pages are counted from `base`, which need not be page aligned
    fn page_base(&self, address: u32) -> u32 {
        let page_size = self.page_size.max(1);
        match address.checked_sub(self.base) {
            Some(offset) => address - offset % page_size,
            None => address,
        }
    }

    fn erase_if_needed(&mut self, address: u32) -> Result<(), FlashError> {
        let page = self.offset(address, 1)? / self.page_size as usize;
        if self.erased[page] {
            return Ok(());
        }

        trace!("Erasing page {} (0x{:08x})", page, address);

        let start = page * self.page_size as usize;
        for b in &mut self.memory[start..start + self.page_size as usize] {
            *b = 0xFF;
        }
        self.erased[page] = true;
        self.erase_count += 1;

        Ok(())
    }

    fn write_at(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let start = self.offset(address, data.len())?;

        if self.failures > 0 {
            self.failures -= 1;
            return Err(FlashError::WriteFailed { address });
        }

        let page_size = self.page_size as usize;
        let first = start / page_size;
        let last = (start + data.len().max(1) - 1) / page_size;
        if let Some(p) = (first..=last).find(|p| !self.erased[*p]) {
            return Err(FlashError::NotErased {
                address: self.base + (p * page_size) as u32,
            });
        }

        for (m, d) in self.memory[start..start + data.len()].iter_mut().zip(data) {
            *m &= *d;
        }

        Ok(())
    }

    fn start_application(&mut self) {
        info!("Starting application at 0x{:08x}", self.base);
        self.started = true;
    }
}
