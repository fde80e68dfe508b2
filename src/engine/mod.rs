// src/engine/mod.rs

pub mod clock;
pub mod error;
pub mod events;
pub mod ledger;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod scorer;
pub mod session;
pub mod violation;

pub use error::EngineError;
pub use registry::SessionRegistry;
pub use runtime::SessionHandle;
pub use session::{Phase, SessionController, SessionDeps, SessionSnapshot};
