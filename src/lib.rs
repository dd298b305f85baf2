//! deskrelay: keeps a live MQTT session to a BambuLab printer on the LAN,
//! caches its latest status and serves it, together with the printer
//! settings and cloud account helpers, over a small JSON API.

pub mod cloud;
pub mod mqtt;
pub mod persistence;
pub mod relay;
pub mod server;
pub mod settings;
pub mod telemetry;

pub use relay::{RelayDeps, RelayError, RelayService};
pub use settings::RelaySettings;
