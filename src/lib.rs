// Library exports for the browser shell and tests

pub mod compositor;
pub mod config;
pub mod js;
pub mod origin;
pub mod pipeline;
pub mod promise;
pub mod transition;

// Re-export commonly used types for tests
pub use compositor::{DocumentCompositor, DocumentId};
pub use config::TransitionConfig;
pub use js::ScriptTransitionListener;
pub use pipeline::{BrowsingContext, IncomingDocument, LoadEvent, NavigationSummary};
pub use promise::{JobQueue, Promise};
pub use transition::{NavigationReason, Phase, TransitionController};
