//! Endpoint 0 request processing: chapter 9 standard requests plus the two
//! Bulk-Only class requests.
//!
//! [`ControlPipe::process`] picks up a Setup stage captured by the interrupt
//! handler, validates it, runs the handler and then streams the Data stage out in
//! max-packet-size pieces. Any rejected request becomes a Request Error: endpoint 0
//! stalls in both directions until the next Setup.
use core::fmt;

use byteorder::{ByteOrder, LittleEndian};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::bus::Endpoints;
use crate::descriptors::{DescriptorType, Descriptors, LANGID_EN_US, NUM_STRINGS};
use crate::endpoint::{Direction, EndpointAddress};
use crate::error::RequestError;
use crate::hw::Sie;
use crate::logging::*;
use crate::{MAX_LUN, MAX_PKT_SIZE};

const REQ_GET_MAX_LUN: u8 = 0xFE;
const REQ_BULK_ONLY_RESET: u8 = 0xFF;

const FEATURE_ENDPOINT_HALT: u16 = 0;
const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// Largest response any request produces.
const BUFFER_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Detached,
    Attached,
    Powered,
    Default,
    Address,
    Configured,
}

/// Device-wide state shared by the interrupt handler and the control pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub state: DeviceState,
    pub suspended: bool,
    pub remote_wakeup: bool,
    pub self_powered: bool,
}

impl DeviceStatus {
    pub fn new(self_powered: bool) -> DeviceStatus {
        DeviceStatus { state: DeviceState::Attached, suspended: false, remote_wakeup: false, self_powered }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

/// What the mass-storage interface has to do after a request succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceAction {
    Enable,
    Disable,
    /// Set Configuration(1) while already configured.
    Reconfigure,
    /// Bulk-Only Mass Storage Reset.
    Reset,
}

/// The 8-byte Setup payload.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequest {
    pub direction: Direction,
    pub kind: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl DeviceRequest {
    /// Fails only for a reserved recipient code (4..31).
    pub fn parse(raw: &[u8; 8]) -> Result<DeviceRequest, RequestError> {
        let direction = if raw[0] & 0x80 != 0 { Direction::In } else { Direction::Out };
        let kind = RequestType::from_u8((raw[0] >> 5) & 0x3).ok_or(RequestError::Unsupported)?;
        let recipient = Recipient::from_u8(raw[0] & 0x1F).ok_or(RequestError::Unsupported)?;
        Ok(DeviceRequest {
            direction,
            kind,
            recipient,
            request: raw[1],
            value: LittleEndian::read_u16(&raw[2..4]),
            index: LittleEndian::read_u16(&raw[4..6]),
            length: LittleEndian::read_u16(&raw[6..8]),
        })
    }

    fn expect(&self, direction: Direction, recipient: Recipient) -> Result<(), RequestError> {
        if self.direction != direction {
            return Err(RequestError::WrongDirection);
        }
        if self.recipient != recipient {
            return Err(RequestError::WrongRecipient);
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?}/{:?} req {:02x} value {:04x} index {:04x} len {}",
            self.direction, self.kind, self.recipient, self.request, self.value, self.index, self.length
        )
    }
}

type HandlerResult = Result<Option<InterfaceAction>, RequestError>;

pub struct ControlPipe {
    descriptors: Descriptors,
    buf: [u8; BUFFER_BYTES],
    /// Response length, already clipped to wLength.
    dlen: usize,
    /// Bytes of the response queued so far.
    doff: usize,
    /// Data stage still has packets to queue.
    sending: bool,
    /// The response needs a terminating zero-length packet.
    zlp: bool,
}

impl ControlPipe {
    pub fn new(descriptors: Descriptors) -> ControlPipe {
        ControlPipe { descriptors, buf: [0; BUFFER_BYTES], dlen: 0, doff: 0, sending: false, zlp: false }
    }

    /// Drops any Data stage in progress.
    pub fn reset(&mut self) {
        self.sending = false;
        self.dlen = 0;
        self.doff = 0;
    }

    /// Handles a pending Setup stage and feeds the Data stage. Returns the action
    /// the interface must take when a request reconfigured it.
    pub fn process<S: Sie>(
        &mut self,
        bus: &mut Endpoints<S>,
        status: &mut DeviceStatus,
    ) -> Option<InterfaceAction> {
        let mut action = None;
        if let Some(raw) = bus.ep0.take_setup() {
            self.reset();
            match DeviceRequest::parse(&raw).and_then(|req| self.dispatch(&req, bus, status).map(|a| (req, a))) {
                Ok((req, a)) => {
                    trace_usb!("setup {:?} ok", req);
                    action = a;
                    if req.direction == Direction::In {
                        self.dlen = self.dlen.min(req.length as usize);
                        self.zlp = self.dlen < req.length as usize && self.dlen % MAX_PKT_SIZE == 0;
                        self.sending = true;
                    } else {
                        bus.ep0_send_status();
                    }
                }
                Err(e) => {
                    log::debug!("setup {:02x?} refused: {:?}", raw, e);
                    bus.ep0_stall();
                }
            }
        }
        if self.sending {
            self.data(bus);
        }
        action
    }

    /// Queues as much of the Data stage as the endpoint and pool allow.
    fn data<S: Sie>(&mut self, bus: &mut Endpoints<S>) {
        while self.sending && bus.ep0.can_queue() {
            let Some(id) = bus.pool.acquire() else { return };
            let chunk = (self.dlen - self.doff).min(MAX_PKT_SIZE);
            let pkt = bus.pool.packet_mut(id);
            pkt.buf[..chunk].copy_from_slice(&self.buf[self.doff..self.doff + chunk]);
            pkt.count = chunk;
            self.doff += chunk;
            let last = self.doff == self.dlen && !(chunk == MAX_PKT_SIZE && self.zlp);
            bus.ep0_send(id, last);
            if last {
                self.sending = false;
            }
        }
    }

    fn respond(&mut self, data: &[u8]) -> HandlerResult {
        let len = data.len().min(BUFFER_BYTES);
        self.buf[..len].copy_from_slice(&data[..len]);
        self.dlen = len;
        Ok(None)
    }

    fn dispatch<S: Sie>(
        &mut self,
        req: &DeviceRequest,
        bus: &mut Endpoints<S>,
        status: &mut DeviceStatus,
    ) -> HandlerResult {
        if req.recipient == Recipient::Other {
            return Err(RequestError::Unsupported);
        }
        match req.kind {
            RequestType::Standard => match StandardRequest::from_u8(req.request) {
                Some(StandardRequest::GetStatus) => self.get_status(req, bus, status),
                Some(StandardRequest::ClearFeature) => self.feature(req, bus, status, false),
                Some(StandardRequest::SetFeature) => self.feature(req, bus, status, true),
                Some(StandardRequest::SetAddress) => self.set_address(req, bus, status),
                Some(StandardRequest::GetDescriptor) => self.get_descriptor(req),
                Some(StandardRequest::SetDescriptor) => Err(RequestError::Unsupported),
                Some(StandardRequest::GetConfiguration) => self.get_configuration(req, status),
                Some(StandardRequest::SetConfiguration) => self.set_configuration(req, status),
                Some(StandardRequest::GetInterface) => self.get_interface(req, status),
                Some(StandardRequest::SetInterface) => self.set_interface(req, status),
                Some(StandardRequest::SynchFrame) => Err(RequestError::Unsupported),
                None => Err(RequestError::UnknownRequest(req.request)),
            },
            RequestType::Class => match req.request {
                REQ_GET_MAX_LUN => self.get_max_lun(req),
                REQ_BULK_ONLY_RESET => self.bulk_only_reset(req),
                other => Err(RequestError::UnknownRequest(other)),
            },
            RequestType::Vendor | RequestType::Reserved => Err(RequestError::Unsupported),
        }
    }

    /// Default state allows none of the status/feature requests; Address state
    /// only allows the device itself and endpoint 0.
    fn check_addressed(req: &DeviceRequest, status: &DeviceStatus) -> Result<(), RequestError> {
        match status.state {
            DeviceState::Configured => Ok(()),
            DeviceState::Address => match req.recipient {
                Recipient::Device => Ok(()),
                Recipient::Endpoint if req.index & 0x0F == 0 => Ok(()),
                _ => Err(RequestError::WrongState),
            },
            _ => Err(RequestError::WrongState),
        }
    }

    fn get_status<S: Sie>(&mut self, req: &DeviceRequest, bus: &Endpoints<S>, status: &DeviceStatus) -> HandlerResult {
        if req.direction != Direction::In {
            return Err(RequestError::WrongDirection);
        }
        Self::check_addressed(req, status)?;
        if req.value != 0 || req.length != 2 {
            return Err(RequestError::InvalidField);
        }
        match req.recipient {
            Recipient::Device => {
                if req.index != 0 {
                    return Err(RequestError::InvalidField);
                }
                let bits = (status.remote_wakeup as u8) << 1 | status.self_powered as u8;
                self.respond(&[bits, 0])
            }
            Recipient::Interface => {
                if req.index != 0 {
                    return Err(RequestError::InvalidField);
                }
                self.respond(&[0, 0])
            }
            _ => {
                let halted =
                    bus.halted(EndpointAddress::from_index(req.index)).ok_or(RequestError::UnknownEndpoint)?;
                self.respond(&[halted as u8, 0])
            }
        }
    }

    fn feature<S: Sie>(
        &mut self,
        req: &DeviceRequest,
        bus: &mut Endpoints<S>,
        status: &mut DeviceStatus,
        set: bool,
    ) -> HandlerResult {
        if req.direction != Direction::Out {
            return Err(RequestError::WrongDirection);
        }
        Self::check_addressed(req, status)?;
        if req.length != 0 {
            return Err(RequestError::InvalidField);
        }
        match req.recipient {
            Recipient::Device => {
                if req.value != FEATURE_DEVICE_REMOTE_WAKEUP {
                    return Err(RequestError::InvalidField);
                }
                status.remote_wakeup = set;
                Ok(None)
            }
            Recipient::Endpoint => {
                let ep = EndpointAddress::from_index(req.index);
                bus.lookup(ep).ok_or(RequestError::UnknownEndpoint)?;
                if ep.num == 0 || req.value != FEATURE_ENDPOINT_HALT {
                    return Err(RequestError::InvalidField);
                }
                if !bus.set_halt(ep, set) {
                    return Err(RequestError::UnknownEndpoint);
                }
                log::debug!("{:?} halt {}", ep, set);
                Ok(None)
            }
            _ => Err(RequestError::WrongRecipient),
        }
    }

    /// The address only goes live once the Status stage completes; see
    /// [`crate::Usb::isr`].
    fn set_address<S: Sie>(
        &mut self,
        req: &DeviceRequest,
        bus: &mut Endpoints<S>,
        status: &DeviceStatus,
    ) -> HandlerResult {
        req.expect(Direction::Out, Recipient::Device)?;
        if req.value > 127 || req.index != 0 || req.length != 0 {
            return Err(RequestError::InvalidField);
        }
        match status.state {
            DeviceState::Configured => return Err(RequestError::WrongState),
            DeviceState::Address => bus.ep0.set_pending_address(req.value as u8),
            DeviceState::Default if req.value != 0 => bus.ep0.set_pending_address(req.value as u8),
            _ => {}
        }
        Ok(None)
    }

    fn get_descriptor(&mut self, req: &DeviceRequest) -> HandlerResult {
        req.expect(Direction::In, Recipient::Device)?;
        let index = (req.value & 0xFF) as u8;
        // the language table is read with wIndex 0, the strings in a language
        let lang = if index == 0 { 0 } else { LANGID_EN_US };
        let d = &self.descriptors;
        let mut out = [0u8; BUFFER_BYTES];
        let len = match DescriptorType::from_u16(req.value >> 8) {
            Some(DescriptorType::Device) if index == 0 => copy(&mut out, d.device()),
            Some(DescriptorType::Configuration) if index == 0 => copy(&mut out, d.configuration()),
            Some(DescriptorType::String) if (index as usize) < NUM_STRINGS && req.index == lang => {
                copy(&mut out, d.string(index).ok_or(RequestError::UnknownDescriptor)?)
            }
            _ => return Err(RequestError::UnknownDescriptor),
        };
        self.respond(&out[..len])
    }

    fn get_configuration(&mut self, req: &DeviceRequest, status: &DeviceStatus) -> HandlerResult {
        req.expect(Direction::In, Recipient::Device)?;
        if status.state == DeviceState::Default {
            return Err(RequestError::WrongState);
        }
        if req.value != 0 || req.index != 0 || req.length != 1 {
            return Err(RequestError::InvalidField);
        }
        self.respond(&[(status.state == DeviceState::Configured) as u8])
    }

    fn set_configuration(&mut self, req: &DeviceRequest, status: &mut DeviceStatus) -> HandlerResult {
        req.expect(Direction::Out, Recipient::Device)?;
        if status.state == DeviceState::Default {
            return Err(RequestError::WrongState);
        }
        if req.value >> 8 != 0 || req.index != 0 || req.length != 0 {
            return Err(RequestError::InvalidField);
        }
        match (status.state, req.value) {
            (DeviceState::Address, 0) => Ok(None),
            (DeviceState::Address, 1) => {
                log::info!("configured");
                status.state = DeviceState::Configured;
                Ok(Some(InterfaceAction::Enable))
            }
            (DeviceState::Configured, 0) => {
                log::info!("deconfigured");
                status.state = DeviceState::Address;
                Ok(Some(InterfaceAction::Disable))
            }
            (DeviceState::Configured, 1) => Ok(Some(InterfaceAction::Reconfigure)),
            (DeviceState::Address, _) | (DeviceState::Configured, _) => Err(RequestError::InvalidField),
            _ => Err(RequestError::WrongState),
        }
    }

    fn get_interface(&mut self, req: &DeviceRequest, status: &DeviceStatus) -> HandlerResult {
        req.expect(Direction::In, Recipient::Interface)?;
        if status.state != DeviceState::Configured {
            return Err(RequestError::WrongState);
        }
        if req.value != 0 || req.length != 1 || req.index != 0 {
            return Err(RequestError::InvalidField);
        }
        self.respond(&[0])
    }

    fn set_interface(&mut self, req: &DeviceRequest, status: &DeviceStatus) -> HandlerResult {
        req.expect(Direction::Out, Recipient::Interface)?;
        if status.state != DeviceState::Configured {
            return Err(RequestError::WrongState);
        }
        if req.length != 0 || req.value != 0 || req.index != 0 {
            return Err(RequestError::InvalidField);
        }
        Ok(None)
    }

    fn get_max_lun(&mut self, req: &DeviceRequest) -> HandlerResult {
        req.expect(Direction::In, Recipient::Interface)?;
        if req.value != 0 || req.length != 1 || req.index != 0 {
            return Err(RequestError::InvalidField);
        }
        self.respond(&[MAX_LUN])
    }

    fn bulk_only_reset(&mut self, req: &DeviceRequest) -> HandlerResult {
        req.expect(Direction::Out, Recipient::Interface)?;
        if req.value != 0 || req.length != 0 || req.index != 0 {
            return Err(RequestError::InvalidField);
        }
        Ok(Some(InterfaceAction::Reset))
    }
}

fn copy(out: &mut [u8], src: &[u8]) -> usize {
    let len = src.len().min(out.len());
    out[..len].copy_from_slice(&src[..len]);
    len
}
