//! # PPC1 Control Library
//!
//! Serial control of a Fluicell PPC1 microfluidic pump controller and a
//! protocol runner on top of it. The `ppc1ctl` binary is a thin front end;
//! everything else lives here so other front ends can share it.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered configuration (defaults, `config/ppc1.toml`,
//!   `PPC1_*` environment variables) loaded with Figment.
//! - **`error`**: the `Ppc1Error` taxonomy and `AppResult` alias.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`hardware`**: serial transport, wire commands, telemetry decoding, the
//!   `Ppc1Device` trait, the serial `Ppc1Controller` and the `SimulatedPpc1`.
//! - **`fluidics`**: percentage views over set points, the Poiseuille flow
//!   model and well volume bookkeeping.
//! - **`experiment`**: protocol files, instruction interpreter and the
//!   pausable, cancelable `ProtocolRunner`.

pub mod config;
pub mod error;
pub mod experiment;
pub mod fluidics;
pub mod hardware;
pub mod logging;
