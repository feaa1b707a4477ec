mod auth;
mod credential;
mod error;
mod store;

pub use auth::{Authenticator, HttpLoginProvider, LoginMode, LoginProvider, LoginRequest};
pub use credential::{Credential, ExpiryPolicy, LoginGrant};
pub use error::{AuthError, AuthResult, SessionError, SessionResult};
pub use store::{SessionStatus, SessionStore};
