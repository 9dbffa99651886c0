// Cojoin — floating action button widgets for a marketing site, with the
// honeypot / CAPTCHA / nonce gate in front of every send and the small
// server those widgets talk to.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{WidgetId, WidgetState};
pub use engine::config::SiteConfig;
pub use engine::lifecycle::{ControllerDeps, WidgetController};
pub use engine::server::{run_server, SiteServer};
