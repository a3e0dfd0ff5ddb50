//! sdhost-core: the orchestration core behind the HTTP/WebSocket surface.
//!
//! Components, leaves first: the typed event bus, the model registry, the
//! single-slot model lifecycle, the persistent job queue with its worker
//! thread and preview buffer, user settings, the hot-reloadable
//! architecture catalog, the assistant tool bridge, and the native-error
//! capture ring. The server binary wires these together and exposes them
//! over HTTP; everything here is transport-agnostic.

pub mod assistant;
pub mod capture;
pub mod catalog;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod settings;

pub use capture::ErrorCapture;
pub use catalog::ArchitectureCatalog;
pub use config::Config;
pub use events::{EventBus, EventKind};
pub use lifecycle::ModelLifecycle;
pub use queue::{JobStore, PreviewBuffer, Worker};
pub use registry::{ModelKind, ModelRegistry};
pub use settings::SettingsStore;
