//! Connection orchestration for hardware wallets: device sessions, the
//! request queue, interactive prompts, compatibility gating and firmware
//! updates on top of a pluggable [`connect_transport::Transport`].

pub mod commands;
mod core;
pub mod device;
pub mod device_list;
pub mod error;
pub mod events;
pub mod features;
pub mod firmware;
pub mod method;
pub mod methods;
pub mod policy;
pub mod prompts;
pub mod queue;
pub mod remote;
pub mod session;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::core::{CallRequest, CallResponse, Core, CoreBuilder};
pub use commands::DeviceCommands;
pub use device::{Device, DeviceContext, RunOptions};
pub use device_list::DeviceList;
pub use error::{ConnectError, ConnectResult, HardwareErrorCode};
pub use events::{DeviceSummary, EventBus, FirmwareTip, Notification, UiResponse};
pub use features::{DeviceMode, DeviceType, Features, ModelFamily};
pub use method::{CommonParams, Method, MethodContext, MethodRegistry};
pub use prompts::{DevicePrompter, PromptHub};
pub use queue::{AbortSignal, RequestQueue};
pub use remote::{
    ConfigSource, FileConfigSource, FirmwareStatus, RemoteConfig, RemoteConfigStore,
    StaticConfigSource,
};
pub use session::{MemorySessionStore, SessionKey, SessionStore};
pub use settings::ConnectSettings;
