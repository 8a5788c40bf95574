pub mod admin;
pub mod fallback;
pub mod status;
