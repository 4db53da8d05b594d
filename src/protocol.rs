//! Flash programming protocol.
//!
//! The host streams fixed 8-byte command frames over the virtual
//! serial port, each followed by one raw 1 KiB page of data:
//!
//! ```text
//! offset  size  field
//!      0     2  sync, 0x41BE little-endian
//!      2     1  id, total page count of the session
//!      3     1  page, target page index
//!      4     2  data length, must be 1024
//!      6     2  checksum over bytes 0..6
//! ```
//!
//! The checksum is the inverted modulo-2^16 sum of the header bytes.
//! This is the historical wire format; it is not a polynomial CRC and
//! must not be replaced by one.

use crate::flash::{self, FlashLayout, FlashOps, PAGE_SIZE};

/// Frame synchronization marker.
pub const FRAME_SYNC: u16 = 0x41BE;
/// Size of the command frame header in bytes.
pub const FRAME_SIZE: usize = 8;

/// Inverted modulo-2^16 byte sum, the wire checksum.
pub fn frame_checksum(data: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for &b in data {
        sum = sum.wrapping_add(b as u16);
    }
    !sum
}

/// Protocol and transport error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ProtocolError {
    /// Control transfer arrived with no setup stage latched.
    NoSetup = 1,
    /// No packet buffer free for a transfer.
    NoFreeBuffer = 2,
    /// More data received than the transfer announced.
    DataOverflow = 3,
    /// Transfer ended short of the announced length.
    DataUnderflow = 4,
    /// Frame data length field is not one page.
    WrongLength = 5,
    /// Sync marker or checksum mismatch.
    WrongCrc = 6,
    /// Page index outside the writable region.
    WrongId = 7,
}

/// Decoded command frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Synchronization marker, expected to be [`FRAME_SYNC`].
    pub sync: u16,
    /// Total page count of the session.
    pub id: u8,
    /// Target page index, relative to the application region.
    pub page: u8,
    /// Payload length, expected to be one page.
    pub data_len: u16,
    /// Checksum over the first six header bytes.
    pub crc: u16,
}

impl FrameHeader {
    /// Decodes the 8 header bytes. Field values are not validated.
    pub fn parse(raw: &[u8; FRAME_SIZE]) -> Self {
        Self {
            sync: u16::from_le_bytes([raw[0], raw[1]]),
            id: raw[2],
            page: raw[3],
            data_len: u16::from_le_bytes([raw[4], raw[5]]),
            crc: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// Validates the decoded fields against `raw` and the device
    /// geometry. Checks run in wire order: sync, checksum, length,
    /// page range.
    pub fn validate(
        &self,
        raw: &[u8; FRAME_SIZE],
        layout: &FlashLayout,
    ) -> Result<(), ProtocolError> {
        if self.sync != FRAME_SYNC {
            return Err(ProtocolError::WrongCrc);
        }
        if self.crc != frame_checksum(&raw[..FRAME_SIZE - 2]) {
            return Err(ProtocolError::WrongCrc);
        }
        if self.data_len as usize != PAGE_SIZE {
            return Err(ProtocolError::WrongLength);
        }
        if !layout.page_valid(self.page) {
            return Err(ProtocolError::WrongId);
        }
        Ok(())
    }
}

/// Byte-stream source the updater drains.
///
/// Implemented by the CDC class over its RX ring and by plain
/// in-memory fakes in tests.
pub trait SerialLink {
    /// Bytes ready to read.
    fn rx_available(&self) -> u16;
    /// Removes and returns the oldest byte, if any.
    fn read_byte(&mut self) -> Option<u8>;
    /// Fills `out` from the stream, returning the count moved.
    fn read_bytes(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.read_byte() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
    /// Appends one byte to the transmit side. Returns false when the
    /// transmit buffer is full.
    fn write_byte(&mut self, byte: u8) -> bool;
}

enum State {
    /// Accumulating the 8 header bytes.
    AwaitHeader { filled: usize },
    /// Accumulating the page payload for the accepted header.
    AwaitPayload { filled: usize },
    /// Dropping the declared payload of a refused frame.
    Discard { remaining: usize },
    /// Session finished, flash relocked.
    Complete,
}

/// Firmware update session state machine.
///
/// Frames are consumed from a [`SerialLink`] by [`pump`], pages are
/// written synchronously once fully buffered, and session completion
/// is detected at the cooperative yield point [`poll_complete`].
/// Everything runs in foreground code; no flash operation happens
/// inside USB interrupt context.
///
/// [`pump`]: Updater::pump
/// [`poll_complete`]: Updater::poll_complete
pub struct Updater<F: FlashOps> {
    flash: F,
    layout: FlashLayout,
    state: State,
    header: [u8; FRAME_SIZE],
    page_buf: [u8; PAGE_SIZE],
    frame: FrameHeader,
    /// Pages written so far in this session.
    crt_page: u16,
    /// Session total, latched from the first accepted frame.
    num_pages: u16,
    last_error: Option<ProtocolError>,
}

impl<F: FlashOps> Updater<F> {
    pub fn new(flash: F, layout: FlashLayout) -> Self {
        Self {
            flash,
            layout,
            state: State::AwaitHeader { filled: 0 },
            header: [0; FRAME_SIZE],
            page_buf: [0; PAGE_SIZE],
            frame: FrameHeader {
                sync: 0,
                id: 0,
                page: 0,
                data_len: 0,
                crc: 0,
            },
            crt_page: 0,
            num_pages: 0,
            last_error: None,
        }
    }

    /// Pages successfully written in this session.
    pub fn pages_written(&self) -> u16 {
        self.crt_page
    }

    /// Session page total, 0 until the first frame is accepted.
    pub fn session_pages(&self) -> u16 {
        self.num_pages
    }

    /// True once the session completed and the flash is relocked.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// Returns and clears the most recent protocol error.
    pub fn take_last_error(&mut self) -> Option<ProtocolError> {
        self.last_error.take()
    }

    /// Records the error and resynchronizes. A frame that passed the
    /// sync and checksum tests is still followed by its declared
    /// payload; those bytes are dropped so they are not mistaken for
    /// headers.
    fn fail(&mut self, err: ProtocolError, drain: usize) {
        trace!("frame rejected: {}", err as u8);
        self.last_error = Some(err);
        self.state = if drain > 0 {
            State::Discard { remaining: drain }
        } else {
            State::AwaitHeader { filled: 0 }
        };
    }

    /// Drains available bytes from `link` and advances the session.
    ///
    /// Call from the foreground loop. A complete valid frame plus
    /// payload triggers the erase and program of one page before the
    /// method returns. Invalid frames are dropped and the machine
    /// returns to awaiting a header.
    pub fn pump<L: SerialLink>(&mut self, link: &mut L) {
        loop {
            match self.state {
                State::Complete => return,
                State::AwaitHeader { mut filled } => {
                    while filled < FRAME_SIZE {
                        match link.read_byte() {
                            Some(b) => {
                                self.header[filled] = b;
                                filled += 1;
                            }
                            None => {
                                self.state = State::AwaitHeader { filled };
                                return;
                            }
                        }
                    }
                    let frame = FrameHeader::parse(&self.header);
                    match frame.validate(&self.header, &self.layout) {
                        Ok(()) => {
                            if self.num_pages == 0 {
                                self.num_pages = frame.id as u16;
                            }
                            self.frame = frame;
                            self.state = State::AwaitPayload { filled: 0 };
                        }
                        Err(e) => {
                            let drain = match e {
                                ProtocolError::WrongLength | ProtocolError::WrongId => {
                                    frame.data_len as usize
                                }
                                _ => 0,
                            };
                            self.fail(e, drain);
                        }
                    }
                }
                State::AwaitPayload { filled } => {
                    let got = link.read_bytes(&mut self.page_buf[filled..]);
                    let filled = filled + got;
                    if filled < PAGE_SIZE {
                        self.state = State::AwaitPayload { filled };
                        return;
                    }
                    self.program_page();
                    self.state = State::AwaitHeader { filled: 0 };
                }
                State::Discard { mut remaining } => {
                    while remaining > 0 {
                        if link.read_byte().is_none() {
                            self.state = State::Discard { remaining };
                            return;
                        }
                        remaining -= 1;
                    }
                    self.state = State::AwaitHeader { filled: 0 };
                }
            }
        }
    }

    fn program_page(&mut self) {
        let address = self.layout.page_address(self.frame.page);
        trace!("writing page {} at {:x}", self.frame.page, address);
        flash::write_page(&mut self.flash, address, &self.page_buf);
        self.crt_page += 1;
    }

    /// Cooperative completion check, run once per foreground tick.
    ///
    /// When every page of the session has been written this relocks
    /// the flash and marks the session complete.
    pub fn poll_complete(&mut self) -> bool {
        if !self.is_complete() && self.num_pages > 0 && self.crt_page == self.num_pages {
            self.flash.lock();
            flash::wait_ready(&self.flash);
            self.state = State::Complete;
            trace!("update session complete, {} pages", self.crt_page);
        }
        self.is_complete()
    }

    /// Consumes the updater, returning the flash collaborator.
    pub fn release(self) -> F {
        self.flash
    }
}
