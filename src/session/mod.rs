//! Session lifecycle for parent and child accounts.
//!
//! A single [`SessionController`] owns the session: it restores it on boot,
//! performs logins and logouts, keeps tokens fresh through the single-flight
//! refresh coordinator, and breaks redirect loops. [`ChildSessionGuard`]
//! gates protected child pages against the remote session authority.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use studyplan_auth::session::{ChildSessionGuard, GuardOptions, SessionConfig, SessionController};
//! use studyplan_auth::{ApiConfig, FileStorage, HttpAuthClient};
//!
//! // 1. One client implements every service trait
//! let api = Arc::new(HttpAuthClient::new(ApiConfig::from_env()?));
//!
//! // 2. Build the controller over durable storage and boot it
//! let controller = SessionController::new(
//!     api.clone(),
//!     api.clone(),
//!     FileStorage::new("session.json"),
//!     SessionConfig::from_env()?,
//! );
//! controller.bootstrap().await;
//!
//! // 3. Guard child pages
//! let guard = ChildSessionGuard::new(controller.clone(), api, GuardOptions::default());
//! let mount = guard.mount();
//! let state = guard.check(&mount, "/child/dashboard").await;
//! ```

mod config;
mod controller;
mod error;
mod guard;
mod state;
mod traits;
mod types;

pub use config::SessionConfig;
pub use controller::{RedirectDecision, SessionController};
pub use error::AuthError;
pub use guard::{ChildSessionGuard, DenyReason, GuardMount, GuardOptions, GuardState};
pub use state::{AuthState, Phase};
pub use traits::{AccountAuth, ChildAuth, SessionAuthority};
pub use types::{
    ActivityAction, ActivityHeartbeat, ActivityPattern, RiskLevel, SessionMetadata,
    SuspiciousActivity, SuspiciousActivityReport,
};
