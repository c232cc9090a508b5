pub mod bitflyer;
pub mod bitflyer_ws;
pub mod gmo;
pub mod notify;
pub mod rest;
pub mod retry;

pub use bitflyer::BitflyerGateway;
pub use bitflyer_ws::{BitflyerStream, StreamSettings};
pub use gmo::GmoGateway;
pub use notify::{notifier_from_config, DiscordNotifier, LineNotifier, Notifier};
pub use rest::{ApiCredentials, RequestSigner, RestClient, RestSettings};
pub use retry::{with_retry, with_retry_if, RetryConfig};
