//! CDC ACM class implementation and serial byte transport.
//!
//! `CdcBootClass` enumerates as a plain two-interface virtual serial
//! port (communications interface with an interrupt notification
//! endpoint, data interface with a 64-byte bulk pair). Received bulk
//! data lands in an RX ring, transmitted data drains from a TX ring,
//! and foreground code sees both through the byte-stream methods or
//! the [`SerialLink`] trait the updater consumes.

use usb_device::class_prelude::*;
use usb_device::control;
use usb_device::device::UsbDeviceState;
use usb_device::Result;

use crate::protocol::SerialLink;
use crate::ring::RingBuffer;

/// CDC communications device class code, for the device descriptor.
pub const USB_CLASS_CDC: u8 = 0x02;

const USB_CLASS_CDC_DATA: u8 = 0x0A;
const CDC_SUBCLASS_ACM: u8 = 0x02;
const CDC_PROTOCOL_AT: u8 = 0x01;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_CALL_MANAGEMENT: u8 = 0x01;
const CDC_TYPE_ACM: u8 = 0x02;
const CDC_TYPE_UNION: u8 = 0x06;

const REQ_SET_LINE_CODING: u8 = 0x20;
const REQ_GET_LINE_CODING: u8 = 0x21;
const REQ_SET_CONTROL_LINE_STATE: u8 = 0x22;
const REQ_SEND_BREAK: u8 = 0x23;

const NOTIFY_SERIAL_STATE: u8 = 0x20;

const BULK_PACKET_SIZE: u16 = 64;
/// Interrupt endpoint size, must fit the 10-byte SERIAL_STATE
/// notification (8-byte request header plus the 2-byte bitmap).
const NOTIFICATION_PACKET_SIZE: u16 = 16;
/// Ring size for each transport direction. Capacity is one less.
const RING_SIZE: usize = 256;

/// Line coding as sent by SET_LINE_CODING, stored verbatim.
///
/// The loader has no UART behind the port, so the values only exist
/// to be read back by GET_LINE_CODING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCoding {
    /// Baud rate in bits per second.
    pub baud_rate: u32,
    /// Stop bit format, 0 for one stop bit.
    pub stop_bits: u8,
    /// Parity, 0 for none.
    pub parity: u8,
    /// Data bits per character.
    pub data_bits: u8,
}

impl LineCoding {
    fn from_bytes(data: &[u8]) -> Self {
        Self {
            baud_rate: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            stop_bits: data[4],
            parity: data[5],
            data_bits: data[6],
        }
    }

    fn to_bytes(self) -> [u8; 7] {
        let b = self.baud_rate.to_le_bytes();
        [
            b[0],
            b[1],
            b[2],
            b[3],
            self.stop_bits,
            self.parity,
            self.data_bits,
        ]
    }
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TxState {
    /// Last packet was short or nothing was sent yet.
    Idle,
    /// Last packet was full-size, a ZLP is owed if the ring drains.
    FullPacket,
}

/// CDC ACM virtual serial port class.
pub struct CdcBootClass<'a, B: UsbBus> {
    comm_if: InterfaceNumber,
    comm_if_name: StringIndex,
    data_if: InterfaceNumber,
    data_if_name: StringIndex,
    comm_ep: EndpointIn<'a, B>,
    read_ep: EndpointOut<'a, B>,
    write_ep: EndpointIn<'a, B>,
    line_coding: LineCoding,
    dtr: bool,
    rts: bool,
    rx: RingBuffer<RING_SIZE>,
    tx: RingBuffer<RING_SIZE>,
    tx_state: TxState,
}

impl<'a, B: UsbBus> CdcBootClass<'a, B> {
    /// Allocates interfaces and endpoints from `alloc`.
    pub fn new(alloc: &'a UsbBusAllocator<B>) -> Self {
        Self {
            comm_if: alloc.interface(),
            comm_if_name: alloc.string(),
            data_if: alloc.interface(),
            data_if_name: alloc.string(),
            comm_ep: alloc.interrupt(NOTIFICATION_PACKET_SIZE, 255),
            read_ep: alloc.bulk(BULK_PACKET_SIZE),
            write_ep: alloc.bulk(BULK_PACKET_SIZE),
            line_coding: LineCoding::default(),
            dtr: false,
            rts: false,
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            tx_state: TxState::Idle,
        }
    }

    /// Last line coding received from the host.
    pub fn line_coding(&self) -> LineCoding {
        self.line_coding
    }

    /// DTR bit of the last SET_CONTROL_LINE_STATE.
    pub fn dtr(&self) -> bool {
        self.dtr
    }

    /// RTS bit of the last SET_CONTROL_LINE_STATE.
    pub fn rts(&self) -> bool {
        self.rts
    }

    /// True when the device is configured and not suspended.
    ///
    /// `usb-device` reports suspend as its own state, so a single
    /// comparison covers both conditions.
    pub fn is_active(&self, state: UsbDeviceState) -> bool {
        state == UsbDeviceState::Configured
    }

    /// Bytes received from the host and not yet read.
    pub fn rx_avail(&self) -> u16 {
        self.rx.read_available()
    }

    /// Reads one received byte.
    pub fn read_one(&mut self) -> Option<u8> {
        self.rx.read()
    }

    /// Reads received bytes into `out`, returning the count moved.
    pub fn read_many(&mut self, out: &mut [u8]) -> usize {
        self.rx.read_n(out)
    }

    /// Room left in the transmit ring.
    pub fn tx_free(&self) -> u16 {
        self.tx.write_available()
    }

    /// True when everything queued for transmission has been taken
    /// by the bus driver.
    pub fn tx_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Queues one byte for transmission. Returns false when the ring
    /// is full.
    pub fn write_one(&mut self, byte: u8) -> bool {
        let ok = self.tx.write(byte);
        self.flush_tx();
        ok
    }

    /// Queues as much of `data` as fits, returning the count taken.
    pub fn write_many(&mut self, data: &[u8]) -> usize {
        let n = self.tx.write_all(data);
        self.flush_tx();
        n
    }

    /// Queues a string for transmission, returning the byte count
    /// taken.
    pub fn write_str(&mut self, s: &str) -> usize {
        self.write_many(s.as_bytes())
    }

    /// Sends a SERIAL_STATE notification on the interrupt endpoint.
    ///
    /// `state` is the UART state bitmap of the CDC PSTN spec.
    pub fn send_serial_state(&mut self, state: u16) -> Result<usize> {
        let s = state.to_le_bytes();
        let notification = [
            0xA1, // bmRequestType: device to host, class, interface
            NOTIFY_SERIAL_STATE,
            0x00,
            0x00,
            u8::from(self.comm_if),
            0x00,
            0x02, // wLength
            0x00,
            s[0],
            s[1],
        ];
        self.comm_ep.write(&notification)
    }

    /// Moves queued bytes to the bulk IN endpoint.
    ///
    /// One packet at a time; a transfer that ended on a packet
    /// boundary is terminated with a zero-length packet once the ring
    /// drains. Driven from `poll` and `endpoint_in_complete`.
    fn flush_tx(&mut self) {
        let avail = self.tx.read_available() as usize;

        if avail == 0 {
            if self.tx_state == TxState::FullPacket && self.write_ep.write(&[]).is_ok() {
                self.tx_state = TxState::Idle;
            }
            return;
        }

        let mut packet = [0u8; BULK_PACKET_SIZE as usize];
        let n = avail.min(BULK_PACKET_SIZE as usize);
        // peek first so a busy endpoint loses nothing
        let n = self.tx.peek_n(&mut packet[..n]);
        match self.write_ep.write(&packet[..n]) {
            Ok(written) => {
                let mut sink = [0u8; BULK_PACKET_SIZE as usize];
                self.tx.read_n(&mut sink[..written]);
                self.tx_state = if written == BULK_PACKET_SIZE as usize {
                    TxState::FullPacket
                } else {
                    TxState::Idle
                };
            }
            Err(UsbError::WouldBlock) => {}
            Err(_) => {
                trace!("bulk in write failed");
            }
        }
    }
}

impl<B: UsbBus> SerialLink for CdcBootClass<'_, B> {
    fn rx_available(&self) -> u16 {
        self.rx.read_available()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.read()
    }

    fn read_bytes(&mut self, out: &mut [u8]) -> usize {
        self.rx.read_n(out)
    }

    fn write_byte(&mut self, byte: u8) -> bool {
        self.write_one(byte)
    }
}

impl<B: UsbBus> UsbClass<B> for CdcBootClass<'_, B> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.interface_alt(
            self.comm_if,
            0,
            USB_CLASS_CDC,
            CDC_SUBCLASS_ACM,
            CDC_PROTOCOL_AT,
            Some(self.comm_if_name),
        )?;

        // Header functional descriptor, bcdCDC 1.10
        writer.write(CS_INTERFACE, &[CDC_TYPE_HEADER, 0x10, 0x01])?;

        // Call management: no capabilities, data interface reference
        writer.write(
            CS_INTERFACE,
            &[CDC_TYPE_CALL_MANAGEMENT, 0x00, u8::from(self.data_if)],
        )?;

        // ACM: no capabilities
        writer.write(CS_INTERFACE, &[CDC_TYPE_ACM, 0x00])?;

        // Union: comm interface controls the data interface
        writer.write(
            CS_INTERFACE,
            &[
                CDC_TYPE_UNION,
                u8::from(self.comm_if),
                u8::from(self.data_if),
            ],
        )?;

        writer.endpoint(&self.comm_ep)?;

        writer.interface_alt(
            self.data_if,
            0,
            USB_CLASS_CDC_DATA,
            0x00,
            0x00,
            Some(self.data_if_name),
        )?;

        writer.endpoint(&self.read_ep)?;
        writer.endpoint(&self.write_ep)?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, lang_id: LangID) -> Option<&str> {
        if lang_id == LangID::EN_US || u16::from(lang_id) == 0 {
            if index == self.comm_if_name {
                return Some("Serial port control");
            }
            if index == self.data_if_name {
                return Some("Serial port data");
            }
        }
        None
    }

    fn reset(&mut self) {
        self.rx.reset();
        self.tx.reset();
        self.tx_state = TxState::Idle;
        self.line_coding = LineCoding::default();
        self.dtr = false;
        self.rts = false;
    }

    fn poll(&mut self) {
        self.flush_tx();
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if req.request_type != control::RequestType::Class
            || req.recipient != control::Recipient::Interface
            || req.index != u8::from(self.comm_if) as u16
        {
            return;
        }

        match req.request {
            REQ_GET_LINE_CODING => {
                xfer.accept_with(&self.line_coding.to_bytes()).ok();
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if req.request_type != control::RequestType::Class
            || req.recipient != control::Recipient::Interface
            || req.index != u8::from(self.comm_if) as u16
        {
            return;
        }

        match req.request {
            REQ_SET_LINE_CODING => {
                let data = xfer.data();
                if data.len() >= 7 {
                    self.line_coding = LineCoding::from_bytes(data);
                    trace!("line coding {} baud", self.line_coding.baud_rate);
                    xfer.accept().ok();
                } else {
                    xfer.reject().ok();
                }
            }
            REQ_SET_CONTROL_LINE_STATE => {
                self.dtr = req.value & 0x01 != 0;
                self.rts = req.value & 0x02 != 0;
                xfer.accept().ok();
            }
            REQ_SEND_BREAK => {
                // no UART behind the port, acknowledged and dropped
                xfer.accept().ok();
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr != self.read_ep.address() {
            return;
        }

        let mut packet = [0u8; BULK_PACKET_SIZE as usize];
        if let Ok(n) = self.read_ep.read(&mut packet) {
            let taken = self.rx.write_all(&packet[..n]);
            if taken < n {
                // ring full, excess bytes are dropped
                trace!("rx overflow, {} bytes lost", n - taken);
            }
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.write_ep.address() {
            self.flush_tx();
        }
    }
}
