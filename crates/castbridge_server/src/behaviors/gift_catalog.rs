#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{info, warn};

use crate::behaviors::BehaviorModule;
use crate::server::relay::Relay;

/// Logs the platform's gift catalog (id, name, diamond count) once the
/// ingestion feed reports connected, sorted cheapest first.
pub struct GiftCatalog;

impl BehaviorModule for GiftCatalog {
	fn name(&self) -> &'static str {
		"gift_catalog"
	}

	fn attach(&self, relay: &Arc<Relay>) {
		let weak = Arc::downgrade(relay);

		relay.on_feed_connected(move || {
			let Some(relay) = weak.upgrade() else {
				return;
			};

			tokio::spawn(async move {
				let Some(feed) = relay.feed() else {
					warn!("gift catalog: no feed attached");
					return;
				};

				match feed.available_gifts().await {
					Some(mut gifts) => {
						gifts.sort_by_key(|g| g.diamond_count);
						for gift in &gifts {
							info!(id = gift.id, name = %gift.name, diamonds = gift.diamond_count, "available gift");
						}
						info!(count = gifts.len(), username = %relay.username(), "gift catalog loaded");
					}
					None => warn!("gift catalog query failed"),
				}
			});
		});
	}
}
