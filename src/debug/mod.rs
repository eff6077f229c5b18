//! Debugging support for HomeScript: mocked runs with breakpoints and
//! traces, the per-endpoint session snapshot, and the IP-gated public surface.

pub mod access;
pub mod controller;
pub mod sessions;

pub use access::{
    DebugSettingsUpdate, check_public_access, public_access_allowed, read_settings,
    require_ui_user, update_settings, validate_settings,
};
pub use controller::{
    DebugController, DebugHooks, DebugOptions, DebugRunRequest, DebugRunResponse,
    ServiceCallRecord, clamp_line_delay, compute_breakpoints,
};
pub use sessions::{LiveDebugSession, LiveSessionStore};
