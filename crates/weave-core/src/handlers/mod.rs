//! Built-in trait handlers registered by the device manager

mod access;
mod base;

pub use access::AccessApiHandler;
pub use base::BaseApiHandler;
