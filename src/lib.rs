#![doc = include_str!("../README.md")]

#[cfg(feature = "http")]
pub mod client;
pub mod error;
pub mod loop_detector;
pub mod refresh;
pub mod session;
pub mod store;
pub mod types;

// Re-exports for convenient access
#[cfg(feature = "http")]
pub use client::{ApiConfig, HttpAuthClient};
pub use error::{ServiceError, StorageError};
pub use loop_detector::LoopDetector;
pub use refresh::{RefreshCoordinator, RefreshError};
pub use session::{
    AuthError, AuthState, ChildSessionGuard, GuardOptions, GuardState, Phase, RedirectDecision,
    SessionConfig, SessionController,
};
pub use store::{FileStorage, KeyValueStorage, MemoryStorage, Restored, SessionStore};
pub use types::{
    AuthResult, ChildLoginResult, ChildPrincipal, NewParentAccount, ParentPrincipal, Principal,
    PrincipalId, Role, SecretToken, SessionId, SessionRecord,
};
