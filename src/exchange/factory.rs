use std::sync::Arc;

use tracing::info;

use crate::adapters::bitflyer::{self, BitflyerGateway};
use crate::adapters::bitflyer_ws::{self, StreamSettings};
use crate::adapters::gmo::{self, GmoGateway};
use crate::adapters::notify::Notifier;
use crate::config::AppConfig;
use crate::error::{PosguardError, Result};

use super::{ExchangeKind, Gateway};

/// Create the runtime gateway from `AppConfig`.
pub fn build_gateway(
    app_config: &AppConfig,
    notifier: Option<Arc<dyn Notifier>>,
) -> Result<Arc<dyn Gateway>> {
    let venue = &app_config.venue;
    let credentials = app_config.api_credentials();
    if credentials.is_empty() {
        return Err(PosguardError::Auth(format!(
            "no API credentials configured for {}",
            venue.exchange
        )));
    }
    let settings = app_config.gateway.rest_settings();

    info!(
        exchange = %venue.exchange,
        instrument = %venue.instrument,
        keys = credentials.len(),
        "Building gateway"
    );

    match venue.exchange {
        ExchangeKind::Bitflyer => {
            let rest_url = venue
                .rest_url
                .as_deref()
                .unwrap_or(bitflyer::DEFAULT_REST_URL);
            let stream_key = credentials[0].clone();

            let mut gateway = BitflyerGateway::new(
                venue.instrument.clone(),
                rest_url,
                credentials,
                settings,
                notifier,
            )?;

            if venue.stream {
                let ws_url = venue
                    .ws_url
                    .as_deref()
                    .unwrap_or(bitflyer_ws::DEFAULT_WS_URL);
                gateway = gateway.with_stream(StreamSettings::new(ws_url, stream_key));
            }

            Ok(Arc::new(gateway))
        }
        ExchangeKind::Gmo => {
            let rest_url = venue.rest_url.as_deref().unwrap_or(gmo::DEFAULT_REST_URL);
            let gateway = GmoGateway::new(
                venue.instrument.clone(),
                rest_url,
                credentials,
                settings,
                notifier,
            )?;
            Ok(Arc::new(gateway))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialConfig;

    fn with_key(mut config: AppConfig) -> AppConfig {
        config.credentials.push(CredentialConfig {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        });
        config
    }

    #[test]
    fn builds_gateway_for_each_venue() {
        let config = with_key(AppConfig::for_venue(ExchangeKind::Bitflyer, "FX_BTC_JPY"));
        let gateway = build_gateway(&config, None).expect("bitflyer gateway");
        assert_eq!(gateway.kind(), ExchangeKind::Bitflyer);
        assert_eq!(gateway.instrument(), "FX_BTC_JPY");

        let config = with_key(AppConfig::for_venue(ExchangeKind::Gmo, "BTC_JPY"));
        let gateway = build_gateway(&config, None).expect("gmo gateway");
        assert_eq!(gateway.kind(), ExchangeKind::Gmo);
    }

    #[tokio::test]
    async fn gmo_has_no_lifecycle_stream() {
        let config = with_key(AppConfig::for_venue(ExchangeKind::Gmo, "BTC_JPY"));
        let gateway = build_gateway(&config, None).expect("gmo gateway");
        assert!(matches!(
            gateway.subscribe_lifecycle_events().await,
            Err(PosguardError::Validation(_))
        ));
    }
}
