//! Serial port discovery and resolution.
//!
//! Ports are enumerated fresh on every resolution attempt — descriptors are
//! never cached, because the whole point of the link is surviving
//! unplug/replug cycles where yesterday's `/dev/ttyACM0` is today's
//! `/dev/ttyACM1`.

use crate::config::{Platform, PortQuery};
use log::debug;

/// Metadata for one currently-attached serial port.
#[derive(Debug, Clone)]
pub struct PortDescriptor {
    /// Device path or identifier (e.g., `/dev/ttyACM0` or `COM3`).
    pub name: String,
    /// USB Vendor ID (if the port is a USB device).
    pub vid: Option<u16>,
    /// USB Product ID (if the port is a USB device).
    pub pid: Option<u16>,
    /// USB product string.
    pub product: Option<String>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
}

impl PortDescriptor {
    /// Descriptor for a port named explicitly by the caller; carries no
    /// USB metadata and is never validated against the attached set.
    #[must_use]
    pub fn unchecked(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vid: None,
            pid: None,
            product: None,
            manufacturer: None,
        }
    }
}

/// Enumerate all currently visible serial ports with USB metadata.
#[must_use]
pub fn detect_ports() -> Vec<PortDescriptor> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let mut descriptor = PortDescriptor {
                    name: p.port_name,
                    vid: None,
                    pid: None,
                    product: None,
                    manufacturer: None,
                };
                if let serialport::SerialPortType::UsbPort(usb) = p.port_type {
                    descriptor.vid = Some(usb.vid);
                    descriptor.pid = Some(usb.pid);
                    descriptor.product = usb.product;
                    descriptor.manufacturer = usb.manufacturer;
                }
                descriptor
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Resolve the best-matching attached port for `query`.
///
/// An explicit port is returned unchecked — the caller asserts it exists.
/// Otherwise candidates are sorted deterministically for the platform hint
/// and the first one matching every set criterion wins.
#[must_use]
pub fn resolve(query: &PortQuery) -> Option<PortDescriptor> {
    if let Some(name) = &query.port {
        return Some(PortDescriptor::unchecked(name));
    }

    let mut ports = detect_ports();
    sort_ports(&mut ports, query.platform.resolved());

    for port in ports {
        debug!(
            "Checking port: {}, VID: {:?}, PID: {:?}, Product: {:?}, Manufacturer: {:?}",
            port.name, port.vid, port.pid, port.product, port.manufacturer
        );

        if matches_query(query, &port) {
            debug!("Matched port: {}", port.name);
            return Some(port);
        }
    }

    None
}

/// A candidate matches iff every set criterion holds; unset criteria are
/// ignored. Substring hints compare case-insensitively.
fn matches_query(query: &PortQuery, port: &PortDescriptor) -> bool {
    let product_hint = query.product.to_lowercase();
    let manufacturer_hint = query.manufacturer.to_lowercase();

    let vid_ok = query.vid.is_none() || query.vid == port.vid;
    let pid_ok = query.pid.is_none() || query.pid == port.pid;
    let product_ok = product_hint.is_empty()
        || port
            .product
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
            .contains(&product_hint);
    let manufacturer_ok = manufacturer_hint.is_empty()
        || port
            .manufacturer
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
            .contains(&manufacturer_hint);

    vid_ok && pid_ok && product_ok && manufacturer_ok
}

/// Order candidates deterministically: USB-CDC style devices first.
///
/// Windows sorts numeric `COM<n>` ports ascending before everything else;
/// other platforms put `/dev/ttyACM*` and `/dev/ttyUSB*` first, then
/// lexicographic.
fn sort_ports(ports: &mut [PortDescriptor], platform: Platform) {
    match platform {
        Platform::Windows => {
            ports.sort_by_key(|p| {
                let number = com_number(&p.name);
                (number.is_none(), number.unwrap_or(u32::MAX), p.name.clone())
            });
        },
        _ => {
            ports.sort_by_key(|p| {
                let preferred =
                    p.name.starts_with("/dev/ttyACM") || p.name.starts_with("/dev/ttyUSB");
                (!preferred, p.name.clone())
            });
        },
    }
}

/// Parse the `<n>` from `COM<n>`, case-insensitively.
fn com_number(name: &str) -> Option<u32> {
    let upper = name.to_uppercase();
    upper.strip_prefix("COM")?.parse().ok()
}
