//! Authentication primitives shared by the signaling and relay services.
//!
//! Both services validate bearer tokens with the same HS256 secret; a token
//! issued by the signaling service must verify identically at the relay.

pub mod claims;
pub mod jwt;
pub mod password;

pub use claims::Claims;
pub use jwt::JwtManager;
