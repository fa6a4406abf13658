mod error;
pub use error::{Error, FromUriError, NetError, Result};

pub mod alt_svc;
pub mod config;
pub mod connectors;
pub mod factory;
pub mod host_mapping;
pub mod key;
pub mod observer;
pub mod pool;
pub mod proxy;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::StreamFactoryConfig;
pub use factory::{Session, StreamFactory, StreamRequest, StreamRequestDelegate};
pub use transport::{DefaultTransportPool, TransportPool};
