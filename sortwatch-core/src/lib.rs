//! Telemetry acquisition and time-series aggregation for fleets of
//! industrial sorting machines.
//!
//! The [`Coordinator`](registry::Coordinator) owns the machine table and
//! starts one [supervisor](supervisor) task per machine; supervisors feed
//! live samples into bounded [history](history) buffers, which the
//! [hourly store](store) periodically drains into durable per-hour
//! records. UI and report layers consume the query surface only.

pub mod config;
pub mod error;
pub mod history;
pub mod registry;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod ws;

pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use registry::Coordinator;
pub use types::{
    HourlyRecord, MachineConfig, Sample, StorageHealth, SupervisorState, TagUpdate,
};
pub use ws::WsConnector;
