//! FunctionFS session: descriptors, ep0 events and endpoint files.
//!
//! The FunctionFS instance must already be mounted and the gadget composed
//! externally (configfs or legacy g_ffs). Opening the [`Function`] writes the
//! descriptors and strings into `ep0`, which makes the endpoint files usable
//! once the host enables the configuration.

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::{
    fs::File,
    io::{Error, ErrorKind, Read, Result, Write},
    os::fd::{AsFd, BorrowedFd},
    path::Path,
    sync::Arc,
};

/// Endpoint address direction bit: device to host.
pub const DIR_IN: u8 = 0x80;
/// Endpoint address direction bit: host to device.
pub const DIR_OUT: u8 = 0x00;

/// Bulk transfer type attribute.
const XFER_BULK: u8 = 0x02;

/// US English string table language id.
const LANG_EN_US: u16 = 0x0409;

bitflags! {
    /// FunctionFS descriptor header flags.
    #[derive(Clone, Copy, Debug)]
    struct Flags: u32 {
        const HAS_FS_DESC = 1;
        const HAS_HS_DESC = 2;
        const HAS_SS_DESC = 4;
    }
}

/// Descriptor blob written to `ep0`, v2 format.
#[derive(Clone, Debug)]
struct Descs {
    fs_descrs: Vec<Desc>,
    hs_descrs: Vec<Desc>,
    ss_descrs: Vec<Desc>,
}

impl Descs {
    const MAGIC_V2: u32 = 3;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();

        data.write_u32::<LE>(Self::MAGIC_V2)?;
        data.write_u32::<LE>(0)?; // length
        data.write_u32::<LE>((Flags::HAS_FS_DESC | Flags::HAS_HS_DESC | Flags::HAS_SS_DESC).bits())?;

        let count = |descrs: &Vec<Desc>| {
            u32::try_from(descrs.len()).map_err(|_| Error::new(ErrorKind::InvalidInput, "too many descriptors"))
        };
        data.write_u32::<LE>(count(&self.fs_descrs)?)?;
        data.write_u32::<LE>(count(&self.hs_descrs)?)?;
        data.write_u32::<LE>(count(&self.ss_descrs)?)?;

        for descr in self.fs_descrs.iter().chain(&self.hs_descrs).chain(&self.ss_descrs) {
            data.extend(descr.to_bytes()?);
        }

        let len: u32 = data.len().try_into().map_err(|_| ErrorKind::InvalidInput)?;
        data[4..8].copy_from_slice(&len.to_le_bytes());

        Ok(data)
    }
}

#[derive(Clone, Debug)]
enum Desc {
    Interface(InterfaceDesc),
    Endpoint(EndpointDesc),
    SsEndpointComp(SsEndpointComp),
}

impl Desc {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();

        data.write_u8(0)?; // length

        match self {
            Self::Interface(d) => d.write(&mut data)?,
            Self::Endpoint(d) => d.write(&mut data)?,
            Self::SsEndpointComp(d) => d.write(&mut data)?,
        }

        data[0] = data.len().try_into().map_err(|_| ErrorKind::InvalidInput)?;
        Ok(data)
    }
}

#[derive(Clone, Debug)]
struct InterfaceDesc {
    interface_number: u8,
    num_endpoints: u8,
    interface_class: u8,
    name_idx: u8,
}

impl InterfaceDesc {
    const TYPE: u8 = 0x04;

    fn write(&self, data: &mut Vec<u8>) -> Result<()> {
        data.write_u8(Self::TYPE)?;
        data.write_u8(self.interface_number)?;
        data.write_u8(0)?; // alternate setting
        data.write_u8(self.num_endpoints)?;
        data.write_u8(self.interface_class)?;
        data.write_u8(0)?; // subclass
        data.write_u8(0)?; // protocol
        data.write_u8(self.name_idx)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct EndpointDesc {
    endpoint_address: u8,
    attributes: u8,
    max_packet_size: u16,
    interval: u8,
}

impl EndpointDesc {
    const TYPE: u8 = 0x05;

    fn write(&self, data: &mut Vec<u8>) -> Result<()> {
        data.write_u8(Self::TYPE)?;
        data.write_u8(self.endpoint_address)?;
        data.write_u8(self.attributes)?;
        data.write_u16::<LE>(self.max_packet_size)?;
        data.write_u8(self.interval)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct SsEndpointComp {
    max_burst: u8,
}

impl SsEndpointComp {
    const TYPE: u8 = 0x30;

    fn write(&self, data: &mut Vec<u8>) -> Result<()> {
        data.write_u8(Self::TYPE)?;
        data.write_u8(self.max_burst)?;
        data.write_u8(0)?; // attributes
        data.write_u16::<LE>(0)?; // bytes per interval
        Ok(())
    }
}

/// String table for a single language.
#[derive(Clone, Debug)]
struct Strings(Vec<String>);

impl Strings {
    const MAGIC: u32 = 2;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();

        data.write_u32::<LE>(Self::MAGIC)?;
        data.write_u32::<LE>(0)?; // length
        data.write_u32::<LE>(self.0.len().try_into().map_err(|_| ErrorKind::InvalidInput)?)?;
        data.write_u32::<LE>(1)?; // language count

        data.write_u16::<LE>(LANG_EN_US)?;
        for string in &self.0 {
            data.write_all(string.as_bytes())?;
            data.write_u8(0)?;
        }

        let len: u32 = data.len().try_into().map_err(|_| ErrorKind::InvalidInput)?;
        data[4..8].copy_from_slice(&len.to_le_bytes());
        Ok(data)
    }
}

/// USB control request header, as carried by a setup event.
#[derive(Clone, Debug)]
pub struct CtrlReq {
    /// bmRequestType.
    pub request_type: u8,
    /// bRequest.
    pub request: u8,
    /// wValue.
    pub value: u16,
    /// wIndex.
    pub index: u16,
    /// wLength.
    pub length: u16,
}

impl CtrlReq {
    fn parse(mut buf: &[u8]) -> Result<Self> {
        let request_type = buf.read_u8()?;
        let request = buf.read_u8()?;
        let value = buf.read_u16::<LE>()?;
        let index = buf.read_u16::<LE>()?;
        let length = buf.read_u16::<LE>()?;
        Ok(Self { request_type, request, value, index, length })
    }
}

mod event_type {
    pub const BIND: u8 = 0;
    pub const UNBIND: u8 = 1;
    pub const ENABLE: u8 = 2;
    pub const DISABLE: u8 = 3;
    pub const SETUP: u8 = 4;
    pub const SUSPEND: u8 = 5;
    pub const RESUME: u8 = 6;
}

/// Decoded `ep0` event.
#[derive(Debug)]
pub enum Event {
    /// Function bound to the gadget.
    Bind,
    /// Function unbound from the gadget.
    Unbind,
    /// Configuration containing the function enabled by the host.
    Enable,
    /// Configuration containing the function disabled by the host.
    Disable,
    /// Bus suspended.
    Suspend,
    /// Bus resumed.
    Resume,
    /// Control request addressed to the function.
    Setup(CtrlReq),
    /// Event type unknown to this implementation.
    Unknown(u8),
}

impl Event {
    /// Size of one raw event record.
    const SIZE: usize = 12;

    /// How many queued events FunctionFS hands out per read at most.
    const MAX_PER_READ: usize = 4;

    fn parse(buf: &[u8]) -> Result<Self> {
        let event = match buf[8] {
            event_type::BIND => Self::Bind,
            event_type::UNBIND => Self::Unbind,
            event_type::ENABLE => Self::Enable,
            event_type::DISABLE => Self::Disable,
            event_type::SUSPEND => Self::Suspend,
            event_type::RESUME => Self::Resume,
            event_type::SETUP => Self::Setup(CtrlReq::parse(&buf[..8])?),
            other => Self::Unknown(other),
        };
        Ok(event)
    }
}

/// An opened FunctionFS function with one bulk IN and one bulk OUT endpoint.
pub struct Function {
    ep0: File,
    ep_in: File,
    ep_out: Arc<File>,
}

impl Function {
    /// Opens the function at the given FunctionFS mount directory and
    /// initializes it with the usbcat descriptors.
    pub fn open(dir: &Path) -> Result<Self> {
        let ep0_path = dir.join("ep0");
        let mut ep0 = File::options().read(true).write(true).open(&ep0_path)?;

        let (descs, strings) = Self::descriptors();

        log::debug!("writing descriptors to {}", ep0_path.display());
        let descs_data = descs.to_bytes()?;
        log::trace!("descriptor data: {descs_data:x?}");
        if ep0.write(&descs_data)? != descs_data.len() {
            return Err(Error::new(ErrorKind::UnexpectedEof, "short descriptor write"));
        }

        log::debug!("writing strings to {}", ep0_path.display());
        let strings_data = strings.to_bytes()?;
        log::trace!("strings data: {strings_data:x?}");
        if ep0.write(&strings_data)? != strings_data.len() {
            return Err(Error::new(ErrorKind::UnexpectedEof, "short strings write"));
        }

        let ep_in = File::options().read(true).write(true).open(dir.join("ep1"))?;
        let ep_out = Arc::new(File::options().read(true).write(true).open(dir.join("ep2"))?);

        log::debug!("function initialized at {}", dir.display());
        Ok(Self { ep0, ep_in, ep_out })
    }

    /// Vendor-specific interface with bulk IN `ep1` and bulk OUT `ep2`,
    /// published for all three speeds.
    fn descriptors() -> (Descs, Strings) {
        let interface =
            InterfaceDesc { interface_number: 0, num_endpoints: 2, interface_class: 0xff, name_idx: 1 };
        // interval 0: bulk endpoints are not polled, and at high speed a
        // nonzero value would be taken as a NAK rate.
        let endpoint = |address, max_packet_size| {
            Desc::Endpoint(EndpointDesc { endpoint_address: address, attributes: XFER_BULK, max_packet_size, interval: 0 })
        };

        let speed = |max_packet_size| {
            vec![
                Desc::Interface(interface.clone()),
                endpoint(1 | DIR_IN, max_packet_size),
                endpoint(2 | DIR_OUT, max_packet_size),
            ]
        };

        let mut ss_descrs = Vec::new();
        for desc in speed(1024) {
            let is_endpoint = matches!(&desc, Desc::Endpoint(_));
            ss_descrs.push(desc);
            if is_endpoint {
                ss_descrs.push(Desc::SsEndpointComp(SsEndpointComp { max_burst: 0 }));
            }
        }

        let descs = Descs { fs_descrs: speed(64), hs_descrs: speed(512), ss_descrs };
        (descs, Strings(vec!["usbcat".to_string()]))
    }

    /// Descriptor that polls readable when `ep0` events are pending.
    pub fn event_fd(&self) -> BorrowedFd<'_> {
        self.ep0.as_fd()
    }

    /// Reads and decodes all events currently queued on `ep0`.
    ///
    /// Must only be called when [`event_fd`](Self::event_fd) is readable,
    /// otherwise the read blocks.
    pub fn events(&mut self) -> Result<Vec<Event>> {
        let mut buf = [0; Event::SIZE * Event::MAX_PER_READ];
        let n = self.ep0.read(&mut buf)?;
        if n == 0 || n % Event::SIZE != 0 {
            return Err(Error::new(ErrorKind::InvalidData, "invalid event size"));
        }

        buf[..n].chunks_exact(Event::SIZE).map(Event::parse).collect()
    }

    /// Stalls the control endpoint in response to a setup request.
    ///
    /// Reading or writing `ep0` against the direction of the request tells
    /// FunctionFS to report a protocol stall to the host.
    pub fn stall(&mut self, req: &CtrlReq) -> Result<()> {
        let mut buf = [0; 1];
        let res = if req.request_type & DIR_IN != 0 {
            self.ep0.read(&mut buf).map(|_| ())
        } else {
            self.ep0.write(&buf).map(|_| ())
        };
        stall_result(res)
    }

    /// Bulk IN endpoint file, for synchronous writes towards the host.
    pub fn writer(&self) -> Result<File> {
        self.ep_in.try_clone()
    }

    /// Bulk OUT endpoint file, read via the AIO driver.
    pub fn out_endpoint(&self) -> Arc<File> {
        self.ep_out.clone()
    }
}

/// The kernel acknowledges a wrong-direction stall of `ep0` with `EL2HLT`;
/// that is the success path, not an error.
fn stall_result(res: Result<()>) -> Result<()> {
    match res {
        Err(err) if err.raw_os_error() == Some(libc::EL2HLT) => Ok(()),
        res => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_blob_layout() {
        let (descs, strings) = Function::descriptors();

        let data = descs.to_bytes().unwrap();
        assert_eq!(&data[..4], &Descs::MAGIC_V2.to_le_bytes());
        assert_eq!(&data[4..8], &(data.len() as u32).to_le_bytes());
        // fs and hs carry 3 descriptors each, ss adds a companion per endpoint.
        assert_eq!(&data[12..16], &3u32.to_le_bytes());
        assert_eq!(&data[16..20], &3u32.to_le_bytes());
        assert_eq!(&data[20..24], &5u32.to_le_bytes());

        // fs section: 24-byte header, 9-byte interface, then two 7-byte
        // endpoint descriptors whose bInterval must be zero for bulk.
        assert_eq!(data[34], EndpointDesc::TYPE);
        assert_eq!(data[33 + 6], 0);
        assert_eq!(data[41], EndpointDesc::TYPE);
        assert_eq!(data[40 + 6], 0);

        let strs = strings.to_bytes().unwrap();
        assert_eq!(&strs[..4], &Strings::MAGIC.to_le_bytes());
        assert_eq!(&strs[4..8], &(strs.len() as u32).to_le_bytes());
        assert!(strs.ends_with(b"usbcat\0"));
    }

    #[test]
    fn event_decode() {
        let mut raw = [0u8; Event::SIZE];

        raw[8] = 2;
        assert!(matches!(Event::parse(&raw).unwrap(), Event::Enable));

        raw[8] = 4;
        raw[0] = 0x80 | 0x40; // device-to-host, vendor
        raw[1] = 0x17;
        raw[6..8].copy_from_slice(&64u16.to_le_bytes());
        match Event::parse(&raw).unwrap() {
            Event::Setup(req) => {
                assert_eq!(req.request_type, 0xc0);
                assert_eq!(req.request, 0x17);
                assert_eq!(req.length, 64);
            }
            other => panic!("unexpected event {other:?}"),
        }

        raw[8] = 99;
        assert!(matches!(Event::parse(&raw).unwrap(), Event::Unknown(99)));
    }

    #[test]
    fn stall_acknowledgement_is_not_an_error() {
        assert!(stall_result(Err(Error::from_raw_os_error(libc::EL2HLT))).is_ok());
        assert!(stall_result(Err(Error::from_raw_os_error(libc::EIO))).is_err());
        assert!(stall_result(Ok(())).is_ok());
    }
}
