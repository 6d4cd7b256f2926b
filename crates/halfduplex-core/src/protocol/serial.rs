//! Serial port handling
//!
//! Port discovery, opening, and the [`Transport`] implementation for real
//! serial devices. None of this is needed by the engine itself, which only
//! sees a [`Transport`].

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::transport::{
    ByteStream, EventListener, EventListeners, EventedReader, Transport, TransportEvent,
};
use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_VENDOR_ID, WRITE_HIGH_WATER_MARK};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port known only by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let p = PortInfo::from(info);
                map.entry(p.name.clone()).or_insert(p);
            }
        }
        Err(e) => tracing::warn!(error = %e, "serial port enumeration failed"),
    }

    // Linux-only: add /dev/ttyACM* and /dev/ttyUSB* entries the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Default device predicate: Silicon Labs CP210x USB-UART bridges
pub fn is_default_device(port: &PortInfo) -> bool {
    port.vid == Some(DEFAULT_VENDOR_ID)
}

/// First port in `ports` matching `predicate`
pub fn select_port<I, P>(ports: I, predicate: P) -> Result<PortInfo, ProtocolError>
where
    I: IntoIterator<Item = PortInfo>,
    P: Fn(&PortInfo) -> bool,
{
    ports
        .into_iter()
        .find(|port| predicate(port))
        .ok_or(ProtocolError::NoMatchingDevice)
}

/// First available port matching `predicate`
pub fn find_port<P>(predicate: P) -> Result<PortInfo, ProtocolError>
where
    P: Fn(&PortInfo) -> bool,
{
    select_port(list_ports(), predicate)
}

/// First available port with the default vendor id
pub fn find_suitable_port() -> Result<PortInfo, ProtocolError> {
    find_port(is_default_device)
}

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Line settings used when opening a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character (5 to 8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl SerialSettings {
    /// Settings with a non-default baud rate
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    /// Check every field and build the port builder
    fn builder(&self, name: &str) -> Result<tokio_serial::SerialPortBuilder, ProtocolError> {
        if self.baud_rate == 0 {
            return Err(ProtocolError::InvalidConfig(
                "baud rate must be positive".to_string(),
            ));
        }
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(ProtocolError::InvalidConfig(format!(
                    "unsupported data bits: {}",
                    other
                )))
            }
        };
        let stop_bits = match self.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(ProtocolError::InvalidConfig(format!(
                    "unsupported stop bits: {}",
                    other
                )))
            }
        };
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        Ok(tokio_serial::new(name, self.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None))
    }
}

/// Open a serial port for use as a [`Transport`].
///
/// Must be called from within a Tokio runtime.
pub fn open_port(name: &str, settings: &SerialSettings) -> Result<SerialTransport, ProtocolError> {
    tracing::info!(port = name, baud = settings.baud_rate, "opening serial port");
    let stream = settings
        .builder(name)?
        .open_native_async()
        .map_err(|e| ProtocolError::TransportOpen {
            port: name.to_string(),
            message: e.to_string(),
        })?;
    tracing::info!(port = name, "serial port opened");
    Ok(SerialTransport::new(name, stream))
}

/// [`Transport`] over a native serial port.
///
/// Writes are buffered until [`Transport::drain`]; read failures and end of
/// stream are reported to subscribers.
pub struct SerialTransport {
    name: String,
    reader: Option<ReadHalf<SerialStream>>,
    writer: Option<WriteHalf<SerialStream>>,
    pending: BytesMut,
    listeners: EventListeners,
}

impl SerialTransport {
    fn new(name: &str, stream: SerialStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            name: name.to_string(),
            reader: Some(reader),
            writer: Some(writer),
            pending: BytesMut::new(),
            listeners: EventListeners::new(),
        }
    }

    /// Name the port was opened with
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port is closed")
}

#[async_trait]
impl Transport for SerialTransport {
    fn subscribe(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    fn byte_stream(&mut self) -> Option<ByteStream> {
        let reader = self.reader.take()?;
        Some(Box::new(EventedReader::new(reader, self.listeners.clone())))
    }

    fn write(&mut self, data: &[u8]) -> io::Result<bool> {
        if self.writer.is_none() {
            return Err(not_connected());
        }
        self.pending.extend_from_slice(data);
        Ok(self.pending.len() < WRITE_HIGH_WATER_MARK)
    }

    async fn drain(&mut self) -> io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(not_connected)?;
        let pending = self.pending.split();
        writer.write_all(&pending).await?;
        writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.pending.clear();
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        self.listeners.emit(&TransportEvent::Close);
        Ok(())
    }
}
