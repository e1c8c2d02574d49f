//! Device fleet state: who is connected under which code, and how their
//! commands are going.

pub mod device;
pub mod dispatcher;
pub mod registry;
pub mod tracker;

pub use device::{ConnectionCode, Device, DeviceDescriptor, DevicePatch, InvalidConnectionCode};
pub use dispatcher::{BatchHandle, CommandDispatcher, StatusMap};
pub use registry::{AgentLink, DeviceRegistry, RegistryError, RegistryEvent, Subscription};
pub use tracker::{InstallState, InstallStatus};
