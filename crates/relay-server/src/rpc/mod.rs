//! Request/response method dispatch.

pub mod context;
pub mod errors;
pub mod handlers;
pub mod registry;
pub mod validation;
