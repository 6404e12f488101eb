#![forbid(unsafe_code)]

mod gift_catalog;
mod script_relay;

use std::sync::Arc;

use tracing::{info, warn};

pub use gift_catalog::GiftCatalog;
pub use script_relay::ScriptRelay;

use crate::server::relay::Relay;

/// A unit of application behavior: subscribes to platform events through
/// the relay facade and emits control commands in response.
///
/// Modules are a static registry wired explicitly at startup; there is no
/// loading from disk.
pub trait BehaviorModule: Send + Sync {
	fn name(&self) -> &'static str;

	fn attach(&self, relay: &Arc<Relay>);
}

/// All built-in behavior modules.
pub fn builtin_behaviors(script_namespace: &str) -> Vec<Box<dyn BehaviorModule>> {
	vec![Box::new(ScriptRelay::new(script_namespace)), Box::new(GiftCatalog)]
}

/// Attach the modules selected by name; unknown names are skipped with a
/// warning.
pub fn attach_selected(relay: &Arc<Relay>, names: &[String], script_namespace: &str) {
	let available = builtin_behaviors(script_namespace);

	for name in names {
		match available.iter().find(|b| b.name() == name.as_str()) {
			Some(module) => {
				module.attach(relay);
				info!(behavior = %name, "behavior module attached");
			}
			None => warn!(behavior = %name, "unknown behavior module; skipping"),
		}
	}
}
