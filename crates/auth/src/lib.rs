//! `velopay-auth` — principal identity handed in by the authentication layer.
//!
//! Authentication itself (tokens, OTP, sessions) lives upstream of this
//! service; what crosses the boundary is a resolved [`Principal`].

pub mod principal;
pub mod roles;

pub use principal::{Principal, PrincipalId};
pub use roles::Role;
