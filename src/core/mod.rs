//! 核心层：错误类型与网关装配

pub mod builder;
pub mod error;

pub use builder::{Gateway, GatewayBuilder};
pub use error::GatewayError;
