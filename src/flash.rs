//! Flash controller sequences and page geometry.
//!
//! Register access is abstracted behind [`FlashOps`] so the sequences
//! can run against a HAL on hardware and a RAM-backed double in tests.
//! The sequences themselves follow the STM32F1/F3 flash programming
//! procedure: key-register unlock, page erase via PER + address + STRT,
//! half-word programming via PG, a busy wait after every operation.

/// First flash key register unlock value.
pub const KEY1: u32 = 0x45670123;
/// Second flash key register unlock value.
pub const KEY2: u32 = 0xCDEF89AB;

/// Flash page size in bytes.
pub const PAGE_SIZE: usize = 1024;

/// Controller operation selected before `start`/programming writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Page erase, PER bit.
    PageErase,
    /// Half-word programming, PG bit.
    Program,
}

/// Register-level flash controller access.
///
/// Implementations map directly onto the FLASH peripheral registers.
/// All sequencing (key order, busy waits, operation selection) is done
/// by the free functions in this module; implementors only expose the
/// raw accesses.
pub trait FlashOps {
    /// Writes one value to the key register.
    fn write_key(&mut self, key: u32);
    /// Sets the lock bit, ending write access.
    fn lock(&mut self);
    /// Returns true while an erase or programming operation is running.
    fn busy(&self) -> bool;
    /// Selects the operation for subsequent writes (PER or PG bit).
    fn select(&mut self, op: Operation);
    /// Latches the page address for a page erase.
    fn set_page_address(&mut self, address: u32);
    /// Starts the selected erase operation (STRT bit).
    fn start(&mut self);
    /// Programs one half-word at `address`. Only valid while the
    /// Program operation is selected.
    fn program_half_word(&mut self, address: u32, value: u16);
}

/// Spins until the controller reports not busy.
///
/// Unbounded, as on the hardware there is no recovery from a stuck
/// flash controller short of a reset.
pub fn wait_ready<F: FlashOps>(flash: &F) {
    while flash.busy() {}
}

/// Unlocks write access with the two-key sequence.
pub fn unlock<F: FlashOps>(flash: &mut F) {
    flash.write_key(KEY1);
    flash.write_key(KEY2);
}

/// Erases the 1 KiB page at `address`. Flash must be unlocked.
pub fn erase_page<F: FlashOps>(flash: &mut F, address: u32) {
    wait_ready(flash);
    flash.select(Operation::PageErase);
    flash.set_page_address(address);
    flash.start();
    wait_ready(flash);
}

/// Programs `data` at `address` as little-endian half-words.
/// Flash must be unlocked and the target page erased. `data` must
/// have even length.
pub fn program_page<F: FlashOps>(flash: &mut F, address: u32, data: &[u8]) {
    wait_ready(flash);
    flash.select(Operation::Program);
    for (i, pair) in data.chunks_exact(2).enumerate() {
        let half = u16::from_le_bytes([pair[0], pair[1]]);
        flash.program_half_word(address + (i as u32) * 2, half);
        wait_ready(flash);
    }
}

/// Unlocks, erases and programs one full page at `address`.
///
/// The flash is left unlocked; callers relock once the whole update
/// session completes.
pub fn write_page<F: FlashOps>(flash: &mut F, address: u32, data: &[u8]) {
    unlock(flash);
    erase_page(flash, address);
    program_page(flash, address, data);
}

/// Page geometry of the target device.
///
/// Pages on the wire are numbered from the first page after the
/// loader-reserved region, so page 0 is where the application starts.
#[derive(Debug, Clone, Copy)]
pub struct FlashLayout {
    /// Base address of the flash array.
    pub flash_base: u32,
    /// Total number of 1 KiB pages on the device.
    pub total_pages: u16,
    /// Pages at the start of flash reserved for the loader itself.
    pub reserved_pages: u16,
}

impl FlashLayout {
    /// Layout of a 128 KiB part with a 4 KiB loader at 0x0800_0000.
    pub const fn medium_density_128k() -> Self {
        Self {
            flash_base: 0x0800_0000,
            total_pages: 128,
            reserved_pages: 4,
        }
    }

    /// Number of pages available to the application.
    pub const fn user_pages(&self) -> u16 {
        self.total_pages - self.reserved_pages
    }

    /// True when `page` addresses a writable application page.
    pub fn page_valid(&self, page: u8) -> bool {
        (page as u16) < self.user_pages()
    }

    /// Absolute flash address of application page `page`.
    pub fn page_address(&self, page: u8) -> u32 {
        self.flash_base + (self.reserved_pages as u32 + page as u32) * PAGE_SIZE as u32
    }

    /// Address the loader jumps to when handing over to the application.
    pub const fn user_code_address(&self) -> u32 {
        self.flash_base + self.reserved_pages as u32 * PAGE_SIZE as u32
    }
}
