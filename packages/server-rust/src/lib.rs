//! `Stratus` Server: local cloud API gateway with protocol codecs, request
//! routing, lazy service activation and tenant-scoped state.

pub mod codec;
pub mod gateway;
pub mod network;
pub mod routing;
pub mod service;
pub mod services;
pub mod storage;
pub mod traits;

pub use gateway::{Gateway, RequestContext};
pub use network::{NetworkConfig, NetworkModule};
pub use service::{ServerConfig, ServiceRegistry};
pub use traits::{ServiceContext, ServiceProvider};
