//! HTTP surface: the binary-cache routes, the optional administrative lock
//! route and the metrics listener.

pub mod handler;
pub mod lock;
