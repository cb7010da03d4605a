pub mod context;

pub use context::{ContextError, ContextHandler, ContextProvider, WorkspaceContextProvider};
