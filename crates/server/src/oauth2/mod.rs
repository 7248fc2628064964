//! OpenID Connect surface of the consent engine.
//!
//! ## Endpoints (nested under `/api/oidc`)
//!
//! - `GET|POST /authorization` - Authorization endpoint
//! - `POST /pushed-authorization-request` - Pushed authorization requests
//! - `POST /device-authorization` - Device authorization (device side)
//! - `PUT /device-authorization` - Device pairing (browser side)
//! - `GET|POST /consent` - Consent page backend

pub mod endpoints;
pub mod engine;
pub mod session;
mod state;

pub use endpoints::router;
pub use engine::CodeFlowEngine;
pub use state::OAuth2State;

/// OpenAPI tag for OpenID Connect endpoints
pub const OAUTH2_TAG: &str = "OpenID Connect";
