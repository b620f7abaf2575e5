//! Scheduling engine for running simulation windows on exclusive accelerator
//! devices.
//!
//! A [`Scanner`](scan::Scanner) discovers windows on storage and queues them
//! in a [`Ledger`](ledger::Ledger). A [`Scheduler`](scheduler::Scheduler) then
//! dispatches queued windows in FIFO order onto a [`DeviceAllocator`], running
//! at most one job per device, and records each job's outcome as classified
//! by a [`Supervisor`](supervisor::Supervisor).

pub mod config;
pub mod device;
pub mod ledger;
pub mod scan;
pub mod scheduler;
pub mod supervisor;
mod window;

pub use config::Config;
pub use device::DeviceAllocator;
pub use device::DeviceId;
pub use window::WindowDescriptor;
pub use window::WindowId;
