//! # passctrl
//!
//! External authorization gateway. A reverse proxy performs a sub-request
//! against PassCtrl; PassCtrl evaluates a declarative rule chain for the
//! addressed endpoint — possibly querying upstream backends — and answers
//! with the status, headers, and body the proxy uses to admit, deny, or
//! error the original request.
//!
//! ## Architecture
//!
//! - **Pipeline** ([`pipeline`]): a fixed agent sequence (admission →
//!   forward policy → endpoint variables → rule chain → response policy →
//!   result caching) over a per-request [`pipeline::state::RequestState`].
//! - **Expression engine** ([`engine`]): typed CEL expressions and minijinja
//!   text templates behind automatic dialect detection (`{{` ⇒ template).
//! - **Decision cache** ([`cache`]): Tier-1 per-rule and Tier-2 per-endpoint
//!   entries under namespaced, epoch-prefixed keys; hot reload bumps the
//!   epoch and prefix-deletes the stale one.
//! - **Definitions** ([`rules`]): documents compiled ahead of time into
//!   immutable endpoint/rule definitions; broken definitions are
//!   quarantined, not fatal.
//!
//! ## Example
//!
//! ```rust,no_run
//! use passctrl::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config.server.logging)?;
//!
//!     let state = AppState::build(config.clone()).await?;
//!     Server::new(config).serve(router(state)).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod rules;
pub mod server;
pub mod state;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::observability::init_tracing;
    pub use crate::server::{router, Server};
    pub use crate::state::AppState;
}
