//! Bearer-token verification. Tokens are issued by the external auth service.

pub mod claims;
pub mod jwt;

pub use claims::Role;
pub use jwt::{AuthUser, JwtKeys};
