//! Authentication module for ClinicDesk

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{require_auth, AuthError, AuthState, AuthUser};
