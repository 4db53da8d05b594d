//! In-process mock USB bus and host-side driver for the test suites.
//!
//! The bus stores one transfer buffer per endpoint and direction and
//! reports endpoint events through `poll` the way a real bus driver
//! would. `Host` plays the host side: control transactions on EP0,
//! chunked bulk writes, short-packet-terminated bulk reads, and
//! injected suspend/resume events.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::cmp::min;
use std::rc::Rc;

use usb_device::bus::PollResult;
use usb_device::bus::{UsbBus, UsbBusAllocator};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::prelude::*;
use usb_device::{Result, UsbDirection};

use usbd_cdc_boot::{CdcBootClass, USB_CLASS_CDC};

pub const EP0_SIZE: u8 = 32;
pub const DEVICE_ADDRESS: u8 = 5;

// Endpoint indices as assigned by allocation order in
// CdcBootClass::new: notification IN first, then bulk OUT, bulk IN.
pub const NOTIF_EP: usize = 1;
pub const BULK_OUT_EP: usize = 1;
pub const BULK_IN_EP: usize = 2;

#[derive(Debug, PartialEq, Eq)]
pub enum EPErr {
    Stalled,
}

struct EP {
    alloc: bool,
    stall: bool,
    read_len: usize,
    read: [u8; 2048],
    read_ready: bool,
    write_len: usize,
    write: [u8; 2048],
    // one unconsumed transfer at a time, like real packet memory
    write_loaded: bool,
    write_done: bool,
    setup: bool,
    max_size: usize,
}

impl EP {
    fn new() -> Self {
        EP {
            alloc: false,
            stall: false,
            read_len: 0,
            read: [0; 2048],
            read_ready: false,
            write_len: 0,
            write: [0; 2048],
            write_loaded: false,
            write_done: false,
            setup: false,
            max_size: 0,
        }
    }

    fn set_read(&mut self, data: &[u8], setup: bool) {
        self.read_len = data.len();
        self.read[..data.len()].copy_from_slice(data);
        self.setup = setup;
        self.read_ready = true;
    }

    fn get_write(&mut self, data: &mut [u8]) -> usize {
        if !self.write_loaded {
            return 0;
        }
        let res = self.write_len;
        self.write_len = 0;
        self.write_loaded = false;
        data[..res].clone_from_slice(&self.write[..res]);
        self.write_done = true;
        res
    }
}

struct TestBusIO {
    ep_i: [RefCell<EP>; 4],
    ep_o: [RefCell<EP>; 4],
    suspend_pending: Cell<bool>,
    resume_pending: Cell<bool>,
}

impl TestBusIO {
    fn new() -> Self {
        Self {
            ep_i: [
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
            ],
            ep_o: [
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
            ],
            suspend_pending: Cell::new(false),
            resume_pending: Cell::new(false),
        }
    }

    fn epidx(&self, ep_addr: EndpointAddress) -> &RefCell<EP> {
        match ep_addr.direction() {
            UsbDirection::In => self.ep_i.get(ep_addr.index()).unwrap(),
            UsbDirection::Out => self.ep_o.get(ep_addr.index()).unwrap(),
        }
    }

    fn get_write(&self, ep_addr: EndpointAddress, data: &mut [u8]) -> usize {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        ep.get_write(data)
    }

    fn set_read(&self, ep_addr: EndpointAddress, data: &[u8], setup: bool) {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        if setup && ep_addr.index() == 0 && ep_addr.direction() == UsbDirection::Out {
            // setup packet on EP0 OUT removes a stall condition
            ep.stall = false;
            let mut ep0in = self.ep_i.get(0).unwrap().borrow_mut();
            ep0in.stall = false;
        }
        ep.set_read(data, setup)
    }

    fn stalled0(&self) -> bool {
        let in0 = EndpointAddress::from_parts(0, UsbDirection::In);
        let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);
        self.epidx(in0).borrow().stall || self.epidx(out0).borrow().stall
    }
}

pub struct TestBus {
    rio: Rc<TestBusIO>,
}

// tests are single threaded, the bus is never shared across threads
unsafe impl Sync for TestBus {}

impl TestBus {
    fn new(rio: &Rc<TestBusIO>) -> Self {
        Self { rio: rio.clone() }
    }

    fn io(&self) -> &TestBusIO {
        self.rio.as_ref()
    }
}

impl UsbBus for TestBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        _ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> Result<EndpointAddress> {
        let io = self.io();
        let ea = match ep_addr {
            Some(ea) => ea,
            None => {
                // first free index, EP0 is reserved for control
                let eps = match ep_dir {
                    UsbDirection::In => &io.ep_i,
                    UsbDirection::Out => &io.ep_o,
                };
                let idx = (1..eps.len())
                    .find(|&i| !eps[i].borrow().alloc)
                    .ok_or(UsbError::EndpointOverflow)?;
                EndpointAddress::from_parts(idx, ep_dir)
            }
        };

        let mut sep = io.epidx(ea).borrow_mut();
        assert!(!sep.alloc);
        sep.alloc = true;
        sep.stall = false;
        sep.max_size = max_packet_size as usize;

        Ok(ea)
    }

    fn enable(&mut self) {}

    fn force_reset(&self) -> Result<()> {
        Ok(())
    }

    fn poll(&self) -> PollResult {
        let io = self.io();

        if io.suspend_pending.replace(false) {
            return PollResult::Suspend;
        }
        if io.resume_pending.replace(false) {
            return PollResult::Resume;
        }

        let mut ep_out: u16 = 0;
        let mut ep_in_complete: u16 = 0;
        let mut ep_setup: u16 = 0;

        for i in 0..4 {
            let mut epi = io.ep_i[i].borrow_mut();
            if epi.alloc && epi.write_done {
                ep_in_complete |= 1 << i;
                epi.write_done = false;
            }
            let epo = io.ep_o[i].borrow();
            if epo.alloc && epo.read_ready {
                ep_out |= 1 << i;
                if epo.setup {
                    ep_setup |= 1 << i;
                }
            }
        }

        if ep_out != 0 || ep_in_complete != 0 || ep_setup != 0 {
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            }
        } else {
            PollResult::None
        }
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> Result<usize> {
        let io = self.io();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        let len = min(buf.len(), min(ep.read_len, ep.max_size));

        if len == 0 && ep.read_len == 0 {
            return Err(UsbError::WouldBlock);
        }

        buf[..len].clone_from_slice(&ep.read[..len]);

        ep.read_len -= len;
        ep.read.copy_within(len.., 0);

        if ep.read_len == 0 {
            ep.setup = false;
        }

        ep.read_ready = ep.read_len > 0;

        Ok(len)
    }

    fn reset(&self) {}
    fn resume(&self) {}
    fn suspend(&self) {}

    fn set_device_address(&self, addr: u8) {
        assert_eq!(addr, DEVICE_ADDRESS);
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.io().epidx(ep_addr).borrow().stall
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        self.io().epidx(ep_addr).borrow_mut().stall = stalled;
    }

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> Result<usize> {
        let io = self.io();
        let mut ep = io.epidx(ep_addr).borrow_mut();

        if buf.len() > ep.max_size {
            return Err(UsbError::BufferOverflow);
        }
        if ep.write_loaded {
            return Err(UsbError::WouldBlock);
        }

        ep.write[..buf.len()].copy_from_slice(buf);
        ep.write_len = buf.len();
        ep.write_loaded = true;
        ep.write_done = false;
        Ok(buf.len())
    }
}

type Cls<'a> = CdcBootClass<'a, TestBus>;

/// Host side of the mock bus.
pub struct Host<'a> {
    io: Rc<TestBusIO>,
    dev: UsbDevice<'a, TestBus>,
}

impl<'a> Host<'a> {
    /// One bus poll, dispatching endpoint events to the class.
    pub fn poll(&mut self, cls: &mut Cls) -> bool {
        self.dev.poll(&mut [cls])
    }

    pub fn state(&self) -> UsbDeviceState {
        self.dev.state()
    }

    /// Runs one control transaction: setup packet, optional OUT data
    /// stage, IN data collected into `out`.
    pub fn transact(
        &mut self,
        cls: &mut Cls,
        setup: &[u8],
        data: Option<&[u8]>,
        out: &mut [u8],
    ) -> core::result::Result<usize, EPErr> {
        let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);
        let in0 = EndpointAddress::from_parts(0, UsbDirection::In);

        self.io.set_read(out0, setup, true);
        self.poll(cls);
        if self.io.stalled0() {
            return Err(EPErr::Stalled);
        }

        if let Some(val) = data {
            self.io.set_read(out0, val, false);
            for i in 1..100 {
                let res = self.poll(cls);
                if !res {
                    break;
                }
                if i >= 99 {
                    panic!("device kept reading");
                }
            }
            if self.io.stalled0() {
                return Err(EPErr::Stalled);
            }
        }

        let mut len = 0;
        loop {
            let one = self.io.get_write(in0, &mut out[len..]);
            self.poll(cls);
            if self.io.stalled0() {
                return Err(EPErr::Stalled);
            }
            len += one;
            if one < EP0_SIZE as usize {
                // short packet, transfer over
                break;
            }
        }

        Ok(len)
    }

    /// Streams `data` to the bulk OUT endpoint in 64-byte packets.
    pub fn write_bulk(&mut self, cls: &mut Cls, data: &[u8]) {
        let ep = EndpointAddress::from_parts(BULK_OUT_EP, UsbDirection::Out);
        for chunk in data.chunks(64) {
            self.io.set_read(ep, chunk, false);
            for _ in 0..100 {
                self.poll(cls);
                if !self.io.epidx(ep).borrow().read_ready {
                    break;
                }
            }
            assert!(
                !self.io.epidx(ep).borrow().read_ready,
                "device did not consume bulk packet"
            );
        }
    }

    /// Collects one bulk IN transfer, polling until a short packet.
    pub fn read_bulk(&mut self, cls: &mut Cls, out: &mut [u8]) -> usize {
        let ep = EndpointAddress::from_parts(BULK_IN_EP, UsbDirection::In);
        let mut len = 0;
        loop {
            let one = self.io.get_write(ep, &mut out[len..]);
            self.poll(cls);
            len += one;
            if one < 64 {
                break;
            }
        }
        len
    }

    /// Reads one pending notification from the interrupt endpoint.
    pub fn read_notification(&mut self, cls: &mut Cls, out: &mut [u8]) -> usize {
        let ep = EndpointAddress::from_parts(NOTIF_EP, UsbDirection::In);
        let n = self.io.get_write(ep, out);
        self.poll(cls);
        n
    }

    /// Injects a bus suspend event.
    pub fn suspend(&mut self, cls: &mut Cls) {
        self.io.suspend_pending.set(true);
        self.poll(cls);
    }

    /// Injects a bus resume event.
    pub fn resume(&mut self, cls: &mut Cls) {
        self.io.resume_pending.set(true);
        self.poll(cls);
    }
}

/// Builds a device with a `CdcBootClass`, enumerates it, and hands
/// both to the test case.
pub fn with_usb(case: fn(&mut Cls, &mut Host)) {
    let io = Rc::new(TestBusIO::new());
    let bus = TestBus::new(&io);

    let alloc: UsbBusAllocator<TestBus> = UsbBusAllocator::new(bus);

    let mut cls = CdcBootClass::new(&alloc);

    let usb_dev = UsbDeviceBuilder::new(&alloc, UsbVidPid(0x0483, 0x5740))
        .strings(&[StringDescriptors::default()
            .manufacturer("Test")
            .product("Test")
            .serial_number("Test")])
        .expect("strings")
        .device_class(USB_CLASS_CDC)
        .device_release(0x0200)
        .self_powered(false)
        .max_power(100)
        .expect("power")
        .max_packet_size_0(EP0_SIZE)
        .expect("ep0 size")
        .build();

    let mut host = Host {
        io: io.clone(),
        dev: usb_dev,
    };

    host.poll(&mut cls);

    // basic device setup: address, then configuration 1
    {
        let mut buf = [0; 8];

        let len = host
            .transact(&mut cls, &[0, 0x5, DEVICE_ADDRESS, 0, 0, 0, 0, 0], None, &mut buf)
            .expect("set address");
        assert_eq!(len, 0);

        let len = host
            .transact(&mut cls, &[0, 0x9, 1, 0, 0, 0, 0, 0], None, &mut buf)
            .expect("set configuration");
        assert_eq!(len, 0);
    }

    case(&mut cls, &mut host);
}

/// Same as [`with_usb`] but stops before enumeration, for cases that
/// drive the setup sequence themselves.
pub fn with_usb_unconfigured(case: fn(&mut Cls, &mut Host)) {
    let io = Rc::new(TestBusIO::new());
    let bus = TestBus::new(&io);

    let alloc: UsbBusAllocator<TestBus> = UsbBusAllocator::new(bus);

    let mut cls = CdcBootClass::new(&alloc);

    let usb_dev = UsbDeviceBuilder::new(&alloc, UsbVidPid(0x0483, 0x5740))
        .strings(&[StringDescriptors::default()
            .manufacturer("Test")
            .product("Test")
            .serial_number("Test")])
        .expect("strings")
        .device_class(USB_CLASS_CDC)
        .max_packet_size_0(EP0_SIZE)
        .expect("ep0 size")
        .build();

    let mut host = Host {
        io: io.clone(),
        dev: usb_dev,
    };

    host.poll(&mut cls);
    case(&mut cls, &mut host);
}
