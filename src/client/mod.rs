//! Client-side session plumbing for portal frontends.
//!
//! The pieces compose bottom-up: a [`storage::TokenStorage`] backend holds
//! the access token between runs, the [`token_manager::TokenManager`] wraps
//! an HTTP client with transparent refresh, the
//! [`session_guard::SessionGuard`] enforces the idle timeout, and
//! [`context::AuthSession`] ties them together behind one facade.

pub mod context;
pub mod session_guard;
pub mod storage;
pub mod token_manager;

pub use context::{AuthSession, LoginFlow};
pub use session_guard::SessionGuard;
pub use storage::{FileStorage, MemoryStorage, TokenStorage};
pub use token_manager::{ClientError, TokenManager};
