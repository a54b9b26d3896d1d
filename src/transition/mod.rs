//! Navigation transitions: the record, the event fired at the outgoing
//! document, lifetime extension, the new-window handle and the deadline.

pub mod controller;
pub mod dispatcher;
pub mod lifetime;
pub mod record;
pub mod supervisor;
pub mod window_proxy;

pub use controller::{HookOutcome, NavigationRequest, TransitionController};
pub use dispatcher::{DispatchError, TransitionEvent, TransitionListener, UrlInfo};
pub use lifetime::{LifetimeTracker, Registration, TrackerVerdict};
pub use record::{NavigationId, NavigationReason, Phase, TransitionRecord};
pub use supervisor::{Resumption, TimeoutSupervisor};
pub use window_proxy::{
    CancelReason, NavigationError, NewWindow, WindowHandle, WindowProxyHandle, WindowProxyState,
};
