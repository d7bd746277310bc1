//! Native client library for automating Vector CANoe over COM.
//!
//! CANoe only exposes its automation interface through COM on Windows. This
//! crate drives it through a small helper process (`canoe-com-bridge.exe`)
//! that talks JSON-over-stdio, so the session logic runs unchanged on Linux
//! (under WINE) and on Windows.
//!
//! # Architecture
//!
//! ```text
//! Your Rust code
//!     └── Session (this crate)
//!           └── BridgeConnector: spawns [wine] canoe-com-bridge.exe
//!                 └── COM: CANoe.Application
//! ```
//!
//! A [`Session`] resolves system variables across an ordered list of candidate
//! namespaces, reads and writes them, calls CAPL functions, appends readings to
//! a [`CaptureLog`] and can list everything the configuration contains.
//!
//! # Example
//!
//! ```rust,no_run
//! use canoe_link::{CaptureLog, LinkConfig, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LinkConfig::default();
//!     let mut session = Session::from_config(&config);
//!     session.connect()?;
//!
//!     let temperature = session.read_variable("Temperature", &["General", "Measurement"])?;
//!     let mut log = CaptureLog::csv("temperature.csv")?;
//!     log.append(temperature)?;
//!
//!     session.invoke_procedure("ResetAll")?;
//!     session.disconnect();
//!     Ok(())
//! }
//! ```

mod bridge;
mod capture;
mod config;
mod error;
mod inventory;
mod procedure;
pub mod remote;
mod resolver;
mod session;
mod simulated;
mod variable;

pub use bridge::{find_bridge_exe, BridgeConfig, BridgeConnector, BridgeProcess};
pub use capture::{CaptureError, CaptureLog, CaptureRecord, CaptureSink, CsvSink, MemorySink};
pub use config::LinkConfig;
pub use error::{LinkError, RemoteError, Result};
pub use inventory::{Inventory, ListedValue, VariableListing, VariableWalk};
pub use procedure::ProcedureHandle;
pub use resolver::Resolution;
pub use session::{ConnectionState, Session, SessionInfo};
pub use simulated::{NamespaceSpec, SimulatedApplication, SimulatedConnector, SimulatedGraph};
pub use variable::{EnsurePolicy, VariableHandle};

pub use canoe_com_protocol::{AppIdentity, ObjectHandle, Value};
