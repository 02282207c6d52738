//! Command implementations: deploy, info, validate, clean.

pub mod clean;
pub mod deploy;
pub mod info;
pub mod validate;
