pub mod factory;
mod traits;

pub use factory::build_gateway;
pub use traits::{parse_exchange_kind, ExchangeKind, Gateway, LifecycleStream};

#[cfg(test)]
pub use traits::MockGateway;
