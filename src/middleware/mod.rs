//! Request extractors shared by the control API

pub mod auth;

pub use auth::RequireApiKey;
