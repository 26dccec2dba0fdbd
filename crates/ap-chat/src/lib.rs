//! Chat state machine and runtime for the AP client.
//!
//! - [`reducer`]: folds backend events into [`ChatState`] plus effects
//! - [`runtime`]: owns one open chat, streams replies, executes effects
//! - [`frontend_tool`]: the hand-off for tools rendered by the client

pub mod effects;
pub mod events;
pub mod frontend_tool;
pub mod host;
pub mod reducer;
pub mod runtime;
pub mod runtime_maps;
pub mod state;

pub use effects::ChatEffect;
pub use host::{ChatHost, NoopHost};
pub use reducer::{EventSource, Reduction, reduce, reduce_at};
pub use runtime::{ChatRuntime, HistorySource, RuntimeOptions};
pub use runtime_maps::RuntimeMaps;
pub use state::{ChatState, FrontendToolState, PlanProgress, plan_progress};
