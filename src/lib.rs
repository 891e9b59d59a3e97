//! Lifecycle manager for LLM provider batch jobs.
//!
//! This crate turns a set of completion requests into correctly sized provider batch
//! submissions (OpenAI, Anthropic, Gemini), tracks each batch's remote state through
//! polling with backoff, and reconciles the mixed results into exactly one outcome per
//! request. Lifecycle records are persisted after every transition, so an interrupted run
//! can be resumed without re-submitting.
//!
//! ```ignore
//! let config = BarrageConfig::default();
//! let adapter = AnyAdapter::from_config(Provider::Anthropic, ReqwestHttpClient::new(), &config)?;
//! let store = FileStore::in_dir(&config.state_dir).await?;
//! let manager = LifecycleManager::new(Arc::new(adapter), Arc::new(store), config.manager.clone());
//! let report = manager.run(&RequestSet::read(path).await?).await?;
//! ```

pub mod batch;
pub mod builder;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod provider;
pub mod reconcile;
pub mod request;
pub mod store;

// Re-export commonly used types
pub use batch::*;
pub use config::BarrageConfig;
pub use error::{BarrageError, Result};
pub use http::{HttpClient, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use lifecycle::{BackoffPolicy, LifecycleManager, ManagerConfig, RunReport, SubmissionReport};
pub use provider::{AnyAdapter, ProviderAdapter};
pub use reconcile::reconcile;
pub use request::*;
pub use store::{FileStore, LifecycleStore, MemoryStore};
