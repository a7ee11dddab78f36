//! HassTest harness
//!
//! Spins up disposable Home Assistant instances for integration and frontend
//! tests:
//! - provisions a shared Python runtime and claims a port under a
//!   machine-wide lock, so concurrent test processes never collide
//! - starts the server, onboards an owner account and connects to the
//!   realtime API
//! - keeps a live entity table fed by state change events
//! - creates dashboards, registers frontend modules and adds integrations
//! - drives dashboards through a [`browser::BrowserIntegration`] and returns
//!   canonical card HTML for snapshot tests
//!
//! ```no_run
//! use hasstest_harness::{multiply, HarnessConfig, HomeAssistant};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn demo() -> hasstest_harness::Result<()> {
//! let yaml = format!(
//!     "input_number:\n{}",
//!     multiply(1, |i| format!("  slider{}:\n    min: 0\n    max: 100\n    initial: 30", i))
//! );
//! let hass = HomeAssistant::create(&yaml, HarnessConfig::default()).await?;
//! hass.call_service(
//!     "input_number",
//!     "set_value",
//!     Some(json!({ "value": 5 })),
//!     Some(json!({ "entity_id": "input_number.slider1" })),
//! )
//! .await?;
//! hass.wait_for_state("input_number.slider1", "5.0", Duration::from_secs(5)).await?;
//! hass.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod browser;
pub mod cache;
pub mod config;
pub mod config_dir;
pub mod connection;
pub mod dashboard;
pub mod error;
pub mod instance;
pub mod lock;
pub mod lovelace;
pub mod network;
pub mod process;
pub mod provision;
pub mod retry;
mod rpc;
pub mod states;

pub use auth::{AuthClient, AuthCode, Onboarding, OnboardingState, Tokens};
pub use browser::{BrowserIntegration, BrowserPage, ColorScheme, DashboardOptions, NoBrowser};
pub use config::{multiply, CoordinationConfig, HarnessConfig};
pub use connection::Connection;
pub use dashboard::{Card, Dashboard};
pub use error::{Error, Result};
pub use instance::{HomeAssistant, InstanceState};
pub use lovelace::{DashboardCreate, ResourceType};
pub use retry::{Attempt, RetryPolicy};
pub use states::{EntityState, EntityStateTable};

pub use hasstest_dom::{diffable_html, DiffOptions};
