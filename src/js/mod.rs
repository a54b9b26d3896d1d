mod bridge;
mod runtime;
mod timers;

pub use bridge::ScriptTransitionListener;
pub use runtime::QuickJsEngine;
