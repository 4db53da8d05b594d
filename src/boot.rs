//! Boot decision and board glue.
//!
//! At reset the loader decides between starting the resident
//! application and staying in update mode. The decision inputs are a
//! magic word the application can leave in a backup register before
//! rebooting, a strapping pin, and a sanity check on the first word of
//! the application's vector table. All hardware access goes through
//! the [`BackupDomain`] and [`Board`] traits.

use crate::flash::FlashOps;
use crate::protocol::Updater;

/// Value an application writes to the backup register to request the
/// loader on the next reset.
pub const MAGIC_BOOT_WORD: u16 = 0x424C;

/// Backup register index used for the magic word on STM32F1 parts.
pub const MAGIC_WORD_INDEX_F1: u8 = 10;
/// Backup register index used for the magic word on STM32F3 parts.
pub const MAGIC_WORD_INDEX_F3: u8 = 16;

/// LED toggle period while an update session is running, in ms.
const BLINK_PERIOD_MS: u32 = 100;
/// How long D+ is held low to force the host to re-enumerate, in ms.
const REENUMERATE_LOW_MS: u32 = 10;

/// Battery-backed register file access.
pub trait BackupDomain {
    /// Reads one 16-bit backup register.
    fn read(&self, index: u8) -> u16;
    /// Opens the backup domain for writes.
    fn enable_writes(&mut self);
    /// Writes one 16-bit backup register. Only valid between
    /// `enable_writes` and `disable_writes`.
    fn write(&mut self, index: u8, value: u16);
    /// Closes the backup domain again.
    fn disable_writes(&mut self);
}

/// GPIO port identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Port {
    A,
    B,
    C,
    D,
    E,
}

/// One GPIO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pin {
    /// GPIO port the pin lives on.
    pub port: Port,
    /// Pin index within the port.
    pub index: u8,
}

impl Pin {
    /// Names one pin of one port.
    pub const fn new(port: Port, index: u8) -> Self {
        Self { port, index }
    }
}

/// Pin configuration states the loader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PinMode {
    InputFloating,
    InputPullDown,
    OutputPushPull,
    OutputOpenDrain,
}

/// Peripherals whose clocks the loader manages itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Peripheral {
    Usb,
    BackupInterface,
    Gpio(Port),
}

/// Minimal board services behind which all registers hide.
///
/// `delay_ms` must busy-wait without masking interrupts so USB
/// traffic keeps flowing underneath it.
pub trait Board {
    /// Gates the clock of one peripheral on.
    fn enable_peripheral_clock(&mut self, peripheral: Peripheral);
    /// Pulses the reset line of one peripheral.
    fn reset_peripheral(&mut self, peripheral: Peripheral);
    /// Reconfigures one pin.
    fn set_pin_mode(&mut self, pin: Pin, mode: PinMode);
    /// Drives an output pin.
    fn write_pin(&mut self, pin: Pin, high: bool);
    /// Samples an input pin.
    fn read_pin(&self, pin: Pin) -> bool;
    /// Busy-waits for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);
    /// Loads the application's stack pointer and reset vector from
    /// `address` and transfers control. Never returns.
    fn jump_to_application(&mut self, address: u32) -> !;
}

/// Reads the magic word register and clears it.
///
/// Clearing is unconditional so a stale request cannot hold the
/// device in the loader across another reset.
pub fn take_magic_word<D: BackupDomain>(bkp: &mut D, index: u8) -> u16 {
    let value = bkp.read(index);
    bkp.enable_writes();
    bkp.write(index, 0);
    bkp.disable_writes();
    value
}

/// Checks the first word of the application vector table.
///
/// A programmed application starts with an initial stack pointer
/// somewhere in SRAM; erased flash reads back as all ones and fails
/// the mask.
pub fn user_code_present(initial_sp: u32) -> bool {
    initial_sp & 0x2FFE_0000 == 0x2000_0000
}

/// The reset-time decision: stay in the loader or run the
/// application.
pub fn should_enter_loader(magic: u16, boot_pin_high: bool, initial_sp: u32) -> bool {
    magic == MAGIC_BOOT_WORD || boot_pin_high || !user_code_present(initial_sp)
}

/// Clocks and resets the USB peripheral before first use.
pub fn usb_power_up<B: Board>(board: &mut B) {
    board.enable_peripheral_clock(Peripheral::Usb);
    board.reset_peripheral(Peripheral::Usb);
}

/// Forces the host to re-enumerate the device.
///
/// USB has no reset line from the device side; pulling D+ low long
/// enough looks like a disconnect, and releasing it back to the
/// peripheral triggers fresh enumeration.
pub fn usb_reenumerate<B: Board>(board: &mut B, dp_pin: Pin) {
    board.set_pin_mode(dp_pin, PinMode::OutputPushPull);
    board.write_pin(dp_pin, false);
    board.delay_ms(REENUMERATE_LOW_MS);
    board.set_pin_mode(dp_pin, PinMode::InputFloating);
}

/// Runs the update loop until the session completes.
///
/// Each 1 ms tick runs `service` (USB polling plus `Updater::pump`)
/// and then the completion check, blinking `led` as a progress
/// indicator. Returns once every page of the session is written and
/// the flash is relocked.
pub fn run_update_session<B: Board, F: FlashOps>(
    board: &mut B,
    led: Pin,
    updater: &mut Updater<F>,
    mut service: impl FnMut(&mut Updater<F>),
) {
    board.set_pin_mode(led, PinMode::OutputPushPull);
    let mut led_on = false;
    let mut elapsed: u32 = 0;

    loop {
        service(updater);
        if updater.poll_complete() {
            board.write_pin(led, false);
            return;
        }
        board.delay_ms(1);
        elapsed = elapsed.wrapping_add(1);
        if elapsed % BLINK_PERIOD_MS == 0 {
            led_on = !led_on;
            board.write_pin(led, led_on);
        }
    }
}
