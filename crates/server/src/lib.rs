//! Workbook document server.
//!
//! Exposes a directory of workbook documents to remote clients over a
//! length-framed JSON TCP protocol. Three cooperating pieces:
//!
//! - the [`registry`]: the process-wide resource table with
//!   per-resource exclusive locks,
//! - the [`monitor`]: a periodic background task reconciling the
//!   registry against the document directory by content digest,
//! - [`session`] + [`server`]: one thread per accepted connection,
//!   binding to a resource for the connection's lifetime.

pub mod error;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod session;

pub use error::ServerError;
pub use monitor::{DirectoryMonitor, MonitorConfig};
pub use registry::{Registry, Resource, ResourceLock};
pub use server::Server;
pub use session::SessionContext;
