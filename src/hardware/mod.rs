//! PPC1 hardware access.
//!
//! - [`serial`]: line transport, port enumeration and identity check
//! - [`wire`]: outbound command encoding
//! - [`telemetry`]: streamed frame model and decoder
//! - [`device`]: the [`Ppc1Device`] trait shared by real and simulated devices
//! - [`ppc1`]: the serial controller and its polling task
//! - [`simulated`]: in-memory device for dry runs

pub mod device;
pub mod filter;
pub mod ppc1;
pub mod serial;
pub mod simulated;
pub mod telemetry;
pub mod wire;

pub use device::Ppc1Device;
pub use ppc1::{ConnectionState, Ppc1Controller};
pub use serial::{list_ports, PortListing, SerialTransport};
pub use simulated::SimulatedPpc1;
pub use telemetry::{Channel, DeviceSnapshot, Valve, ValveBits};
