#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pedalers 🚴
//!
//! A Rust library for controlling indoor-cycling trainers and ergometers over
//! byte-oriented links (serial ports, serial-to-TCP bridges).
//!
//! The library turns raw device telemetry into a physically consistent ride
//! and translates a rider's power or slope targets into device commands.
//!
//! ## Layers
//!
//! - **[`physics`]**: cubic speed/power solver for bicycle dynamics (drag,
//!   rolling resistance, slope, drivetrain loss) and the gear models.
//! - **[`modes`]**: cycling modes (ERG, SmartTrainer, PowerMeter, Daum
//!   Classic) deciding speed, distance and the next power or slope command.
//! - **[`comms`]**: single-in-flight command/response channel with three
//!   framings: Daum classic fixed-length binary, Daum premium escaped binary
//!   with ACK/NAK, Kettler CRLF text.
//! - **[`protocol`]**: per-device command builders and response parsers.
//! - **[`adapter`]**: one device end to end, with a sync loop pulling
//!   telemetry and an emit loop delivering it.
//!
//! Transports are injected through the [`transport::Transport`] trait; a TCP
//! binding is included.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pedalers::{
//!     adapter::{DeviceAdapter, KettlerDriver, StartProps},
//!     transport::{PortRegistry, TcpTransport},
//!     ControlRequest,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(TcpTransport::new("192.168.1.20", 51955));
//!     let driver = Arc::new(KettlerDriver::new(transport, PortRegistry::new()));
//!     let adapter = DeviceAdapter::new(driver);
//!
//!     adapter.check().await?;
//!     adapter.on_data(|data| println!("{data:?}")).await;
//!     adapter.start(StartProps::default()).await?;
//!
//!     // Hold 150 W
//!     adapter.send_update(&ControlRequest::target_power(150.0)).await;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     adapter.stop().await?;
//!     Ok(())
//! }
//! ```

/// Device orchestration and update scheduling
pub mod adapter;
/// Command/response channel and wire framings
pub mod comms;
/// Error types and handling
pub mod error;
/// Cycling modes
pub mod modes;
/// Speed and power calculations
pub mod physics;
/// Device command sets
pub mod protocol;
/// Transport bindings and the port registry
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use adapter::{BikeDriver, DeviceAdapter, StartProps};
pub use error::{PedalError, Result, TimeoutKind};
pub use modes::{CyclingMode, ModeKind};
pub use types::{
    BikeTelemetry, BikeType, ConnectionParams, ConnectionState, ControlRequest, DeviceCommand,
    DeviceInfo, IgnoreFlags, NormalizedOutput, Protocol, SchedulerConfig, TimeoutConfig,
    UserSettings,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
