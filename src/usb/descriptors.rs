// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor layouts and the pod's descriptor table.
//!
//! The host learns what we are by asking for descriptors with
//! `GET_DESCRIPTOR`, naming each one by a `(value, index)` pair: descriptor
//! type in the high byte of `value`, descriptor number in the low byte, and a
//! language ID in `index` for strings. We answer from [`DESCRIPTORS`], which
//! is a plain table of those pairs, searched front to back.

use zerocopy::{AsBytes, LittleEndian, U16};

/// The pod's USB vendor ID.
pub const VENDOR_ID: u16 = 0x0425;
/// The pod's USB product ID.
pub const PRODUCT_ID: u16 = 0x1001;

/// Max packet size on the control endpoint.
pub const EP0_SIZE: u8 = 64;
/// Max packet size on the bulk endpoints.
pub const BULK_SIZE: u16 = 64;

/// Endpoint number of the bulk IN endpoint.
pub const BULK_IN_ENDPOINT: u8 = 1;
/// Endpoint number of the bulk OUT endpoint.
pub const BULK_OUT_ENDPOINT: u8 = 2;

/// English (US).
pub const LANGUAGE_ID: u16 = 0x0409;

const fn le(value: u16) -> U16<LittleEndian> {
    U16::from_bytes(value.to_le_bytes())
}

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Type of this descriptor, must be `Device`.
    pub descriptor_type: UsbDescType,
    /// Version of the USB protocol, in binary-coded decimal.
    pub bcd_usb: U16<LittleEndian>,
    /// Class of device, giving a broad functional area.
    pub device_class: u8,
    /// Subclass of device, refining the class.
    pub device_subclass: u8,
    /// Protocol within the subclass.
    pub device_protocol: u8,
    /// Maximum unit of data this device can move on endpoint 0.
    pub max_packet_size0: u8,
    /// ID of product vendor.
    pub vendor: U16<LittleEndian>,
    /// ID of product.
    pub product: U16<LittleEndian>,
    /// Device version number, as BCD again.
    pub bcd_device: U16<LittleEndian>,
    /// Index of manufacturer name in string descriptor table.
    pub manufacturer_s: u8,
    /// Index of product name in string descriptor table.
    pub product_s: u8,
    /// Index of serial number in string descriptor table.
    pub serial_s: u8,
    /// Number of configurations supported by this device.
    pub num_configurations: u8,
}

/// The parts of the device descriptor that would change if we ran at high
/// speed. We don't, but USB 2.0 hosts ask anyway.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceQualifierDescriptor {
    /// Length of this structure, must be 10.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub num_configurations: u8,
    pub reserved: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Config`.
    pub descriptor_type: UsbDescType,
    /// Total length of all descriptors in this configuration, concatenated.
    /// This will include this descriptor, plus at least one interface
    /// descriptor, plus each interface descriptor's endpoint descriptors.
    pub total_length: U16<LittleEndian>,
    /// Number of interface descriptors in this configuration.
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    pub configuration_value: u8,
    /// Index of this configuration's name in the string descriptor table.
    pub configuration_s: u8,
    /// Bit set of device attributes:
    ///
    /// - Bit 7 should be set (indicates that device can be bus powered in USB
    /// 1.0).
    /// - Bit 6 indicates that the device can be self-powered.
    /// - Bit 5 indicates that the device can signal remote wakeup of the host
    /// (like a keyboard).
    /// - The rest are reserved and should be zero.
    pub attributes: u8,
    /// Maximum device power consumption in units of 2mA.
    pub max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Interface`.
    pub descriptor_type: UsbDescType,
    /// ID of this interface.
    pub interface_number: u8,
    /// Allows a single `interface_number` to have several alternate interface
    /// settings, where each alternate increments this field. Normally there's
    /// only one, and `alternate_setting` is zero.
    pub alternate_setting: u8,
    /// Number of endpoint descriptors in this interface.
    pub num_endpoints: u8,
    /// Interface class code, distinguishing the type of interface.
    pub interface_class: u8,
    /// Interface subclass code, refining the class of interface.
    pub interface_subclass: u8,
    /// Protocol within the interface class/subclass.
    pub interface_protocol: u8,
    /// Index of interface name within string descriptor table.
    pub interface_s: u8,
}

/// Describes an endpoint within an interface.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbEndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    /// Type of this descriptor, must be `Endpoint`.
    pub descriptor_type: UsbDescType,
    /// Address of this endpoint, where the bottom 4 bits give the endpoint
    /// number (0..15) and the top bit distinguishes IN (1) from OUT (0).
    pub endpoint_address: u8,
    /// Endpoint attributes; the most relevant part is the bottom 2 bits, which
    /// control the transfer type using the values from `UsbTransferType`.
    pub attributes: u8,
    /// Maximum packet size this endpoint can accept/produce.
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval in frames. Ignored for bulk endpoints.
    pub interval: u8,
}

/// Everything the host gets back when it asks for our configuration
/// descriptor in full: the configuration, its one interface, and that
/// interface's endpoints, back to back.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct ConfigurationBundle {
    pub config: UsbConfigurationDescriptor,
    pub interface: UsbInterfaceDescriptor,
    pub endpoints: [UsbEndpointDescriptor; 2],
}

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes)]
#[repr(u8)]
pub enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
}

/// Types of transfer that can be indicated by the `attributes` field on
/// `UsbEndpointDescriptor`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes)]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    Bulk = 2,
}

/// One answer to `GET_DESCRIPTOR`.
#[derive(Copy, Clone, Debug)]
pub enum Descriptor {
    Device(&'static UsbDeviceDescriptor),
    Qualifier(&'static UsbDeviceQualifierDescriptor),
    Configuration(&'static ConfigurationBundle),
    /// Already-serialized bytes; used for strings.
    Bytes(&'static [u8]),
}

impl Descriptor {
    pub fn bytes(&self) -> &'static [u8] {
        match *self {
            Descriptor::Device(d) => d.as_bytes(),
            Descriptor::Qualifier(d) => d.as_bytes(),
            Descriptor::Configuration(d) => d.as_bytes(),
            Descriptor::Bytes(b) => b,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DescriptorEntry {
    pub value: u16,
    pub index: u16,
    pub descriptor: Descriptor,
}

/// Finds the descriptor for a `(value, index)` pair. The first exact match
/// wins.
pub fn find(table: &[DescriptorEntry], value: u16, index: u16) -> Option<&'static [u8]> {
    table
        .iter()
        .find(|entry| entry.value == value && entry.index == index)
        .map(|entry| entry.descriptor.bytes())
}

/// Builds a string descriptor out of ASCII text. `N` must be `2 + 2 *
/// text.len()`; the sizes on the statics below take care of that.
pub const fn string_descriptor<const N: usize>(text: &str) -> [u8; N] {
    let text = text.as_bytes();
    let mut out = [0; N];
    out[0] = N as u8;
    out[1] = UsbDescType::String as u8;
    let mut i = 0;
    while i < text.len() {
        // UTF-16LE, and ASCII is its own low byte.
        out[2 + 2 * i] = text[i];
        i += 1;
    }
    out
}

const MANUFACTURER_NAME: &str = "mubf.de";
const PRODUCT_NAME: &str = "Teensy BDM POD";

pub static LANGUAGE_DESCRIPTOR: [u8; 4] = [
    4,
    UsbDescType::String as u8,
    LANGUAGE_ID.to_le_bytes()[0],
    LANGUAGE_ID.to_le_bytes()[1],
];

pub static MANUFACTURER_DESCRIPTOR: [u8; 2 + 2 * MANUFACTURER_NAME.len()] =
    string_descriptor(MANUFACTURER_NAME);

pub static PRODUCT_DESCRIPTOR: [u8; 2 + 2 * PRODUCT_NAME.len()] = string_descriptor(PRODUCT_NAME);

pub static DEVICE_DESCRIPTOR: UsbDeviceDescriptor = UsbDeviceDescriptor {
    length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
    descriptor_type: UsbDescType::Device,
    bcd_usb: le(0x0200),
    device_class: 0xFF,
    device_subclass: 0xFF,
    device_protocol: 0xFF,
    max_packet_size0: EP0_SIZE,
    vendor: le(VENDOR_ID),
    product: le(PRODUCT_ID),
    bcd_device: le(0x0001),
    manufacturer_s: 1,
    product_s: 2,
    // No real serial number; the product string stands in, which is what the
    // host tools look for.
    serial_s: 2,
    num_configurations: 1,
};

pub static DEVICE_QUALIFIER: UsbDeviceQualifierDescriptor = UsbDeviceQualifierDescriptor {
    length: core::mem::size_of::<UsbDeviceQualifierDescriptor>() as u8,
    descriptor_type: UsbDescType::DeviceQualifier,
    bcd_usb: le(0x0200),
    device_class: 0xFF,
    device_subclass: 0xFF,
    device_protocol: 0xFF,
    max_packet_size0: EP0_SIZE,
    num_configurations: 1,
    reserved: 0,
};

pub static CONFIGURATION: ConfigurationBundle = ConfigurationBundle {
    config: UsbConfigurationDescriptor {
        length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
        descriptor_type: UsbDescType::Config,
        total_length: le(core::mem::size_of::<ConfigurationBundle>() as u16),
        num_interfaces: 1,
        configuration_value: 1,
        configuration_s: 0,
        attributes: 0x80,
        // 500mA. The target may well be powered from the cable.
        max_power: 250,
    },
    interface: UsbInterfaceDescriptor {
        length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: 0,
        alternate_setting: 0,
        num_endpoints: 2,
        interface_class: 0xFF,
        interface_subclass: 0xFF,
        interface_protocol: 0xFF,
        interface_s: 2,
    },
    endpoints: [
        UsbEndpointDescriptor {
            length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
            descriptor_type: UsbDescType::Endpoint,
            endpoint_address: super::setup::UsbDir::In.endpoint(BULK_IN_ENDPOINT),
            attributes: UsbTransferType::Bulk as u8,
            max_packet_size: le(BULK_SIZE),
            interval: 1,
        },
        UsbEndpointDescriptor {
            length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
            descriptor_type: UsbDescType::Endpoint,
            endpoint_address: super::setup::UsbDir::Out.endpoint(BULK_OUT_ENDPOINT),
            attributes: UsbTransferType::Bulk as u8,
            max_packet_size: le(BULK_SIZE),
            interval: 1,
        },
    ],
};

/// Every descriptor we hand out.
pub static DESCRIPTORS: [DescriptorEntry; 6] = [
    DescriptorEntry {
        value: 0x0100,
        index: 0x0000,
        descriptor: Descriptor::Device(&DEVICE_DESCRIPTOR),
    },
    DescriptorEntry {
        value: 0x0200,
        index: 0x0000,
        descriptor: Descriptor::Configuration(&CONFIGURATION),
    },
    DescriptorEntry {
        value: 0x0300,
        index: 0x0000,
        descriptor: Descriptor::Bytes(&LANGUAGE_DESCRIPTOR),
    },
    DescriptorEntry {
        value: 0x0301,
        index: LANGUAGE_ID,
        descriptor: Descriptor::Bytes(&MANUFACTURER_DESCRIPTOR),
    },
    DescriptorEntry {
        value: 0x0302,
        index: LANGUAGE_ID,
        descriptor: Descriptor::Bytes(&PRODUCT_DESCRIPTOR),
    },
    DescriptorEntry {
        value: 0x0600,
        index: 0x0000,
        descriptor: Descriptor::Qualifier(&DEVICE_QUALIFIER),
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_layout() {
        let bytes = DEVICE_DESCRIPTOR.as_bytes();
        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[..2], &[18, 0x01]);
        assert_eq!(bytes[4], 0xFF);
        assert_eq!(bytes[7], 64);
        assert_eq!(&bytes[8..12], &[0x25, 0x04, 0x01, 0x10]);
        assert_eq!(bytes[17], 1);
    }

    #[test]
    fn configuration_bundle_is_contiguous() {
        let bytes = CONFIGURATION.as_bytes();
        assert_eq!(bytes.len(), 9 + 9 + 7 + 7);
        assert_eq!(&bytes[2..4], &[32, 0]);
        // Interface starts right after the configuration.
        assert_eq!(&bytes[9..11], &[9, 0x04]);
        assert_eq!(&bytes[18..21], &[7, 0x05, 0x81]);
        assert_eq!(&bytes[25..28], &[7, 0x05, 0x02]);
    }

    #[test]
    fn string_descriptors_are_utf16() {
        assert_eq!(MANUFACTURER_DESCRIPTOR[0] as usize, MANUFACTURER_DESCRIPTOR.len());
        assert_eq!(&MANUFACTURER_DESCRIPTOR[..6], &[16, 0x03, b'm', 0, b'u', 0]);
        assert_eq!(LANGUAGE_DESCRIPTOR, [4, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn lookup_needs_exact_match() {
        assert_eq!(find(&DESCRIPTORS, 0x0100, 0), Some(DEVICE_DESCRIPTOR.as_bytes()));
        assert_eq!(find(&DESCRIPTORS, 0x0300, 0), Some(&LANGUAGE_DESCRIPTOR[..]));
        assert_eq!(find(&DESCRIPTORS, 0x0301, 0x0409), Some(&MANUFACTURER_DESCRIPTOR[..]));
        assert_eq!(find(&DESCRIPTORS, 0x0301, 0), None);
        assert_eq!(find(&DESCRIPTORS, 0x0303, 0x0409), None);
    }

    #[test]
    fn qualifier_is_ten_bytes() {
        assert_eq!(DEVICE_QUALIFIER.as_bytes().len(), 10);
        assert_eq!(DEVICE_QUALIFIER.as_bytes()[1], 0x06);
    }
}
