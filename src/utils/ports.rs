use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};

/// Operator-facing description of a serial port found on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = PortInfo {
            port_name: info.port_name,
            port_type: String::new(),
            manufacturer: None,
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        };
        port.port_type = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                port.manufacturer = usb.manufacturer;
                port.product = usb.product;
                port.serial_number = usb.serial_number;
                port.vid = Some(usb.vid);
                port.pid = Some(usb.pid);
                "usb".to_string()
            }
            SerialPortType::PciPort => "pci".to_string(),
            SerialPortType::BluetoothPort => "bluetooth".to_string(),
            SerialPortType::Unknown => "unknown".to_string(),
        };
        port
    }
}

/// Serial ports visible to the host, sorted by name. Enumeration failures
/// are logged and yield an empty list.
pub fn enumerate_ports() -> Vec<PortInfo> {
    let mut ports = match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(PortInfo::from).collect::<Vec<_>>(),
        Err(err) => {
            log::warn!("Failed to enumerate serial ports: {err}");
            Vec::new()
        }
    };
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    ports
}
