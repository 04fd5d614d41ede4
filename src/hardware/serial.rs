//! Line-oriented serial transport for the PPC1.
//!
//! The port is split into a buffered read half and a write half so the
//! telemetry poller can block on reads while setters keep writing.
//!
//! `write_line` and `read_line` never fail past this boundary: I/O problems
//! are logged and reported as `false` / `None`. Callers that need the reason
//! use `send` / `receive`, which return a [`TransportError`]. Only
//! [`SerialTransport::open`] reports a typed [`ConnectionError`].

use crate::error::{ConnectionError, ConnectionErrorKind, TransportError};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// USB vendor id of the PPC1.
pub const PPC1_VID: u16 = 0x16D0;
/// USB product id of the PPC1.
pub const PPC1_PID: u16 = 0x083A;
/// Fixed link speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Anything that behaves like a serial port.
///
/// Implemented for `tokio_serial::SerialStream` and `tokio::io::DuplexStream`,
/// which the tests use as a fake device.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

type LineReader = BufReader<ReadHalf<DynSerial>>;

/// Read half plus the bytes of a line not yet terminated.
struct LineSource {
    reader: LineReader,
    partial: Vec<u8>,
}

/// True when a USB id pair belongs to a PPC1.
pub fn is_ppc1(vid: u16, pid: u16) -> bool {
    vid == PPC1_VID && pid == PPC1_PID
}

/// A serial port as seen by the enumerator.
#[derive(Debug, Clone, Serialize)]
pub struct PortListing {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub product: Option<String>,
    pub is_ppc1: bool,
}

/// List serial ports, flagging the ones that identify as a PPC1.
#[cfg(feature = "instrument_serial")]
pub fn list_ports() -> Result<Vec<PortListing>, ConnectionError> {
    let ports = serialport::available_ports()
        .map_err(|e| ConnectionError::new(ConnectionErrorKind::IoFailure, e.to_string()))?;

    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => PortListing {
                is_ppc1: is_ppc1(usb.vid, usb.pid),
                name: port.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => PortListing {
                name: port.port_name,
                vid: None,
                pid: None,
                product: None,
                is_ppc1: false,
            },
        })
        .collect())
}

#[cfg(not(feature = "instrument_serial"))]
pub fn list_ports() -> Result<Vec<PortListing>, ConnectionError> {
    Err(ConnectionError::new(
        ConnectionErrorKind::IoFailure,
        "Serial support not enabled. Rebuild with --features instrument_serial",
    ))
}

/// Check that `port` reports the PPC1 vendor/product id.
pub fn verify_identity(port: &str) -> Result<(), ConnectionError> {
    let listing = list_ports()?
        .into_iter()
        .find(|p| p.name == port)
        .ok_or_else(|| {
            ConnectionError::new(
                ConnectionErrorKind::PortNotOpen,
                format!("Port {port} is not present"),
            )
        })?;

    match (listing.vid, listing.pid) {
        (Some(vid), Some(pid)) if is_ppc1(vid, pid) => Ok(()),
        (Some(vid), Some(pid)) => Err(ConnectionError::new(
            ConnectionErrorKind::ProtocolMismatch,
            format!(
                "Port {port} reports {vid:04X}:{pid:04X}, expected {PPC1_VID:04X}:{PPC1_PID:04X}"
            ),
        )),
        _ => Err(ConnectionError::new(
            ConnectionErrorKind::ProtocolMismatch,
            format!("Port {port} is not a USB device"),
        )),
    }
}

/// Open a port at 8N1 without flow control, off the async runtime.
#[cfg(feature = "tokio_serial")]
async fn open_native(port: &str, baud_rate: u32) -> Result<DynSerial, ConnectionError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port.to_string();
    let stream = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                let kind = match e.kind() {
                    tokio_serial::ErrorKind::NoDevice => ConnectionErrorKind::PortNotOpen,
                    _ => ConnectionErrorKind::IoFailure,
                };
                ConnectionError::new(kind, format!("Failed to open PPC1 serial port {path}: {e}"))
            })
    })
    .await
    .map_err(|e| {
        ConnectionError::new(
            ConnectionErrorKind::IoFailure,
            format!("spawn_blocking for serial port opening failed: {e}"),
        )
    })??;

    Ok(Box::new(stream))
}

#[cfg(not(feature = "tokio_serial"))]
async fn open_native(_port: &str, _baud_rate: u32) -> Result<DynSerial, ConnectionError> {
    Err(ConnectionError::new(
        ConnectionErrorKind::IoFailure,
        "Serial support not enabled. Rebuild with --features tokio_serial",
    ))
}

/// Owner of the PPC1 serial handle.
pub struct SerialTransport {
    reader: Mutex<Option<LineSource>>,
    writer: Mutex<Option<WriteHalf<DynSerial>>>,
    port_name: std::sync::Mutex<Option<String>>,
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            port_name: std::sync::Mutex::new(None),
        }
    }

    /// Open `port` at `baud_rate`, 8N1, no flow control.
    ///
    /// With `check_identity` the port must report the PPC1 USB ids first.
    pub async fn open(
        &self,
        port: &str,
        baud_rate: u32,
        check_identity: bool,
    ) -> Result<(), ConnectionError> {
        if check_identity {
            verify_identity(port)?;
        }
        let stream = open_native(port, baud_rate).await?;
        self.install(stream, port).await;
        info!(port, baud_rate, "PPC1 serial port opened");
        Ok(())
    }

    /// Use an already open byte stream as the port.
    pub async fn attach(&self, stream: DynSerial) {
        self.install(stream, "<attached>").await;
        debug!("Attached serial stream");
    }

    async fn install(&self, stream: DynSerial, name: &str) {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(LineSource {
            reader: BufReader::new(read_half),
            partial: Vec::new(),
        });
        *self.writer.lock().await = Some(write_half);
        if let Ok(mut guard) = self.port_name.lock() {
            *guard = Some(name.to_string());
        }
    }

    /// Drop the port. Idempotent.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Serial shutdown reported an error");
            }
        }
        drop(reader);
        if let Ok(mut guard) = self.port_name.lock() {
            if let Some(name) = guard.take() {
                info!(port = %name, "PPC1 serial port closed");
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Name of the open port, if any.
    pub fn port_name(&self) -> Option<String> {
        self.port_name.lock().ok().and_then(|guard| guard.clone())
    }

    /// Write one command line, appending `\n` when missing.
    pub async fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let mut payload = line.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await?;
        debug!(command = line.trim_end(), "-> PPC1");
        Ok(())
    }

    /// Read one line without its terminator.
    ///
    /// Bytes received before a timeout are kept and prefix the next line.
    pub async fn receive(&self, timeout: Duration) -> Result<String, TransportError> {
        let mut guard = self.reader.lock().await;
        let source = guard.as_mut().ok_or(TransportError::NotOpen)?;

        // read_until is cancel safe: bytes read so far stay in `partial`.
        let read = source.reader.read_until(b'\n', &mut source.partial);
        let result = tokio::time::timeout(timeout, read).await;
        match result {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Ok(0)) => Err(TransportError::Eof),
            Ok(Ok(_)) => {
                let bytes = std::mem::take(&mut source.partial);
                let line = String::from_utf8_lossy(&bytes);
                Ok(line.trim_end_matches(['\r', '\n']).to_string())
            }
            Ok(Err(e)) => {
                source.partial.clear();
                Err(TransportError::Io(e))
            }
        }
    }

    /// [`send`](Self::send) that logs instead of failing.
    pub async fn write_line(&self, line: &str) -> bool {
        match self.send(line).await {
            Ok(()) => true,
            Err(e) => {
                warn!(command = line.trim_end(), error = %e, "Serial write failed");
                false
            }
        }
    }

    /// [`receive`](Self::receive) that logs instead of failing.
    pub async fn read_line(&self, timeout: Duration) -> Option<String> {
        match self.receive(timeout).await {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(error = %e, "Serial read failed");
                None
            }
        }
    }
}
