// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SETUP packets and the standard requests we understand.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, LittleEndian, Unaligned, U16};

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In the vast majority of cases, OUT is represented
/// by a 0 bit, and IN by an `0x80` bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Bits 6..5 of `request_type`: who defined the request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Bits 4..0 of `request_type`: what the request is addressed to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Request type: direction in bit 7, [`RequestKind`] in bits 6..5 and
    /// [`Recipient`] in bits 4..0.
    pub request_type: u8,
    /// Request. Standard setup requests are in the `StandardRequest` enum;
    /// vendor requests are whatever the vendor says they are.
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// Another one. Usually an interface or endpoint number, or a language
    /// ID for strings.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    pub length: U16<LittleEndian>,
}

impl SetupPacket {
    /// Reinterprets the first 8 bytes of `bytes`. `None` if there aren't 8.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..core::mem::size_of::<Self>())?;
        LayoutVerified::<_, Self>::new(bytes).map(|setup| *setup)
    }

    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> RequestKind {
        RequestKind::from_u8((self.request_type >> 5) & 0x3).unwrap_or(RequestKind::Reserved)
    }

    /// `None` for the reserved recipient codes.
    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_u8(self.request_type & 0x1F)
    }

    pub fn standard_request(&self) -> Option<StandardRequest> {
        StandardRequest::from_u8(self.request)
    }
}

/// The standard SETUP requests. Not all of them are supported; see the
/// control endpoint for which.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    /// Notifies the device that it's being moved to a different address on the
    /// bus. Always an OUT.
    SetAddress = 0x05,
    /// Asks the device to send a certain descriptor back to the host. Always
    /// used on an IN request.
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    /// Configures a device by choosing one of the options listed in its
    /// descriptors. Always an OUT.
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_descriptor() {
        let setup = SetupPacket::parse(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]).unwrap();
        assert_eq!(setup.direction(), UsbDir::In);
        assert_eq!(setup.kind(), RequestKind::Standard);
        assert_eq!(setup.recipient(), Some(Recipient::Device));
        assert_eq!(setup.standard_request(), Some(StandardRequest::GetDescriptor));
        assert_eq!(setup.value.get(), 0x0100);
        assert_eq!(setup.length.get(), 64);
    }

    #[test]
    fn classifies_vendor_requests() {
        let setup = SetupPacket::parse(&[0x41, 0x10, 0x34, 0x12, 0x02, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(setup.direction(), UsbDir::Out);
        assert_eq!(setup.kind(), RequestKind::Vendor);
        assert_eq!(setup.recipient(), Some(Recipient::Interface));
        assert_eq!(setup.value.get(), 0x1234);
        assert_eq!(setup.index.get(), 2);
    }

    #[test]
    fn short_packet_is_rejected() {
        assert!(SetupPacket::parse(&[0x80, 0x06, 0x00]).is_none());
    }

    #[test]
    fn endpoint_addresses() {
        assert_eq!(UsbDir::In.endpoint(1), 0x81);
        assert_eq!(UsbDir::of_endpoint_addr(0x02), UsbDir::Out);
    }
}
