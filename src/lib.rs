#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! USB CDC ACM bootloader protocol for a `usb-device` device.
//!
//! ## About
//!
//! Small bootloaders often avoid a dedicated flashing protocol and
//! instead enumerate as a plain virtual serial port. The host opens
//! the port like any other and streams fixed-format command frames,
//! each carrying one flash page. This library implements that scheme:
//! a CDC ACM class for the `usb-device` stack, a lock-free serial
//! byte transport, the framed page-programming protocol, and the
//! reset-time boot decision.
//!
//! The library is a protocol implementation only. Flash register
//! access, backup registers, GPIO and the jump to the application are
//! behind traits and are expected to be provided by the library user
//! from a HAL for the target microcontroller.
//!
//! ### Wire format
//!
//! Each page write is an 8-byte little-endian header followed by one
//! raw 1 KiB page:
//!
//! * sync marker `0x41BE`
//! * session page count (first frame) and target page index
//! * data length, always 1024
//! * inverted byte-sum checksum over the first six bytes
//!
//! The session completes after the announced number of pages, the
//! flash relocks, and the device can hand over to the application.
//!
//! ### Boot decision
//!
//! At reset the loader runs the application unless the application
//! left a magic word in a backup register, the boot strap pin is
//! high, or the application's initial stack pointer does not point
//! into SRAM.
//!
//! ## Example
//!
//! The example focuses on [`CdcBootClass`] and [`Updater`]; target
//! controller initialization (USB peripheral, clocks, GPIO) is not in
//! the scope of the example.
//!
//! ```no_run
//! use usb_device::prelude::*;
//! use usbd_cdc_boot::*;
//! #
//! # use usb_device::bus::{UsbBus, UsbBusAllocator};
//! #
//! # fn example<B: UsbBus>(usb_bus_alloc: UsbBusAllocator<B>) -> ! {
//!
//! let mut serial = CdcBootClass::new(&usb_bus_alloc);
//!
//! let mut usb_dev = UsbDeviceBuilder::new(&usb_bus_alloc, UsbVidPid(0x0483, 0x5740))
//!     .strings(&[StringDescriptors::default()
//!         .manufacturer("Example")
//!         .product("Serial bootloader")])
//!     .unwrap()
//!     .device_class(USB_CLASS_CDC)
//!     .build();
//!
//! // MyFlash implements FlashOps over the FLASH peripheral registers.
//! # struct MyFlash;
//! # impl FlashOps for MyFlash {
//! #     fn write_key(&mut self, _key: u32) {}
//! #     fn lock(&mut self) {}
//! #     fn busy(&self) -> bool { false }
//! #     fn select(&mut self, _op: flash::Operation) {}
//! #     fn set_page_address(&mut self, _address: u32) {}
//! #     fn start(&mut self) {}
//! #     fn program_half_word(&mut self, _address: u32, _value: u16) {}
//! # }
//! let mut updater = Updater::new(MyFlash, FlashLayout::medium_density_128k());
//!
//! loop {
//!     // usually from the USB interrupt handler
//!     usb_dev.poll(&mut [&mut serial]);
//!
//!     // foreground: feed received bytes into the update session
//!     updater.pump(&mut serial);
//!     if updater.poll_complete() {
//!         break;
//!     }
//! }
//! # loop {}
//! # }
//! ```
//!
//! A complete loader additionally decides at reset whether to enter
//! update mode at all, see [`boot::should_enter_loader`], and forces
//! re-enumeration after a soft reset, see [`boot::usb_reenumerate`].
//!

#[cfg(feature = "defmt")]
macro_rules! trace {
    ($($arg:tt)*) => { defmt::trace!($($arg)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! trace {
    ($($arg:tt)*) => {{}};
}

/// Boot decision and board collaborator traits
pub mod boot;
/// CDC ACM class and serial transport
pub mod class;
/// Flash controller sequences and page geometry
pub mod flash;
/// Command frame format and the update session
pub mod protocol;
/// SPSC byte ring backing the transport
pub mod ring;

#[doc(inline)]
pub use crate::class::{CdcBootClass, LineCoding, USB_CLASS_CDC};
#[doc(inline)]
pub use crate::flash::{FlashLayout, FlashOps};
#[doc(inline)]
pub use crate::protocol::{ProtocolError, SerialLink, Updater};
#[doc(inline)]
pub use crate::ring::RingBuffer;
