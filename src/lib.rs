//! # quarry
//!
//! Autonomous research engine. A coordinator worker plans, searches the web
//! and delegates to sub-coordinators and link-followers; link-followers read
//! pages and extract entity summaries and claims of the requested types.
//! Every model call goes through one multi-vendor [`llm::LlmGateway`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use quarry::agent::{ResearchConfig, ResearchEnv, ResearchGoal, ResearchRunner};
//! use quarry::cache::TtlCache;
//! use quarry::llm::{GatewayConfig, LlmGateway};
//! use quarry::services::{HttpFetcher, HttpSearch};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> quarry::Result<()> {
//! let gateway = LlmGateway::from_config(&GatewayConfig::from_env()?)?;
//! let config = ResearchConfig::from_env()?;
//! let search = HttpSearch::new("https://search.example/api", None, Duration::from_secs(30))?;
//! let pages = Arc::new(TtlCache::new(config.cache_capacity, config.cache_ttl));
//! let fetch = HttpFetcher::new(Duration::from_secs(30), pages, config.page_char_budget)?;
//! let env = ResearchEnv::new(Arc::new(gateway), config, Arc::new(search), Arc::new(fetch));
//!
//! let runner = ResearchRunner::new(env);
//! let outcome = runner
//!     .run(&ResearchGoal::new("European rocket launch startups"), &CancellationToken::new())
//!     .await?;
//! println!("{} proposals", outcome.proposals.len());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cache;
pub mod cli;
pub mod error;
pub mod llm;
pub mod services;
pub mod storage;
#[doc(hidden)]
pub mod testing;

pub use agent::{ResearchConfig, ResearchEnv, ResearchGoal, ResearchOutcome, ResearchRunner};
pub use error::{Error, Result};
pub use llm::{LlmGateway, LlmModel, LlmRequest, LlmResponse};
