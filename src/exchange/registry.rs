use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::{AppConfig, VenueConfig, VenueMode};
use crate::domain::{VenueId, VenueSpec};
use crate::error::{BastionError, Result};

use super::{ExchangeAdapter, PaperExchange};

struct VenueEntry {
    adapter: Arc<dyn ExchangeAdapter>,
    spec: VenueSpec,
}

/// Adapters by venue, with the trading rules the core applies to each.
#[derive(Default)]
pub struct VenueRegistry {
    venues: BTreeMap<VenueId, VenueEntry>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter using the venue's built-in rules.
    pub fn register(&mut self, adapter: Arc<dyn ExchangeAdapter>) {
        let venue = adapter.venue();
        self.register_with_spec(adapter, venue.spec());
    }

    pub fn register_with_spec(&mut self, adapter: Arc<dyn ExchangeAdapter>, spec: VenueSpec) {
        let venue = adapter.venue();
        self.venues.insert(venue, VenueEntry { adapter, spec });
    }

    pub fn with(mut self, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn adapter(&self, venue: VenueId) -> Result<&Arc<dyn ExchangeAdapter>> {
        self.venues
            .get(&venue)
            .map(|e| &e.adapter)
            .ok_or(BastionError::VenueNotConfigured(venue))
    }

    pub fn spec(&self, venue: VenueId) -> VenueSpec {
        self.venues
            .get(&venue)
            .map(|e| e.spec.clone())
            .unwrap_or_else(|| venue.spec())
    }

    pub fn venues(&self) -> impl Iterator<Item = VenueId> + '_ {
        self.venues.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }
}

fn spec_for(config: &VenueConfig) -> VenueSpec {
    let mut spec = config.venue.spec();
    if let Some(fee) = config.maker_fee {
        spec.maker_fee = fee;
    }
    if let Some(fee) = config.taker_fee {
        spec.taker_fee = fee;
    }
    spec
}

/// Build the registry from `AppConfig`.
///
/// Only paper venues can be built from configuration; live adapters are
/// registered by the embedding binary through [`VenueRegistry::register`].
pub async fn build_venue_registry(app_config: &AppConfig) -> Result<VenueRegistry> {
    let mut registry = VenueRegistry::new();

    for venue_config in &app_config.venues {
        let spec = spec_for(venue_config);
        match venue_config.mode {
            VenueMode::Paper => {
                let paper = PaperExchange::with_spec(venue_config.venue, spec.clone());
                paper
                    .set_balance(spec.quote_asset, venue_config.starting_balance)
                    .await;
                info!(
                    venue = %venue_config.venue,
                    balance = %venue_config.starting_balance,
                    "paper venue ready"
                );
                registry.register_with_spec(Arc::new(paper), spec);
            }
            VenueMode::Live => {
                return Err(BastionError::Validation(format!(
                    "no live adapter is built in for venue '{}'",
                    venue_config.venue
                )));
            }
        }
    }

    Ok(registry)
}
