//! Serial port handling
//!
//! Port discovery and low-level configuration of the stand's USB serial link.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use super::ProtocolError;

/// A serial port the stand might be attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path or COM name
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = Self::bare(info.port_name);
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
        }
        port
    }
}

/// Device classes in the order the console offers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DeviceClass {
    /// Arduino boards enumerate as CDC ACM
    CdcAcm,
    /// FTDI/CH340 adapters
    UsbSerial,
    Other,
}

fn classify(name: &str) -> (DeviceClass, usize, &str) {
    let device = name.rsplit('/').next().unwrap_or(name);
    let numbered = |class, suffix: &str| (class, suffix.parse().unwrap_or(usize::MAX), device);
    if let Some(n) = device.strip_prefix("ttyACM") {
        numbered(DeviceClass::CdcAcm, n)
    } else if let Some(n) = device.strip_prefix("ttyUSB") {
        numbered(DeviceClass::UsbSerial, n)
    } else {
        (DeviceClass::Other, 0, device)
    }
}

/// Order ports: ACM devices, then USB adapters (each by number), then the rest
fn sort_ports(ports: &mut [PortInfo]) {
    ports.sort_by(|a, b| classify(&a.name).cmp(&classify(&b.name)));
}

/// Enumerate serial ports, most likely stand first
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: BTreeMap<String, PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|info| {
            let port = PortInfo::from(info);
            (port.name.clone(), port)
        })
        .collect();

    // udev-less hosts report nothing; pick ACM/USB nodes up from /dev
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        let nodes = entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| classify(name).0 != DeviceClass::Other);
        for node in nodes {
            let path = format!("/dev/{}", node);
            found
                .entry(path.clone())
                .or_insert_with(|| PortInfo::bare(path));
        }
    }

    let mut ports: Vec<PortInfo> = found.into_values().collect();
    sort_ports(&mut ports);
    ports
}

/// Open a serial port as an async stream
pub fn open_port(
    name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<SerialStream, ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::PortNotFound("no port configured".to_string()));
    }
    tokio_serial::new(name, baud_rate)
        .timeout(timeout)
        .open_native_async()
        .map_err(|e| match e.kind {
            tokio_serial::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
            _ => ProtocolError::SerialError(e.to_string()),
        })
}

/// Configure a port for the stand: 8N1, no flow control, DTR/RTS asserted
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(tokio_serial::DataBits::Eight)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_parity(tokio_serial::Parity::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_stop_bits(tokio_serial::StopBits::One)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_flow_control(tokio_serial::FlowControl::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

    // Holding DTR keeps the Arduino from dropping back into its bootloader
    for (line, result) in [
        ("DTR", port.write_data_terminal_ready(true)),
        ("RTS", port.write_request_to_send(true)),
    ] {
        match result {
            Ok(()) => debug!(line, "asserted"),
            Err(e) => warn!(line, error = %e, "could not assert modem line"),
        }
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(tokio_serial::ClearBuffer::All)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))
}
