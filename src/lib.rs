//! # rttp-cache
//!
//! Async caching for a from-scratch HTTP/1.1 server: memoized computations
//! over pluggable key-value stores, and a middleware that caches responses as
//! files on disk.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_cache::cache::{CacheConfig, FileCacheMiddleware, FileCacheSettings, Memoizer, StoreRegistry};
//! use rttp_cache::middleware::{LoggerMiddleware, Pipeline};
//! use rttp_cache::server::Server;
//! use rttp_cache::{Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::load(None)?;
//!     let registry = StoreRegistry::from_config(&config)?;
//!     let memo = Memoizer::from_registry(&registry, &config)?;
//!
//!     let pipeline = Pipeline::new()
//!         .layer(Arc::new(LoggerMiddleware))
//!         .layer(Arc::new(FileCacheMiddleware::new(FileCacheSettings::from_config(&config))))
//!         .handler(move |ctx| {
//!             let memo = memo.clone();
//!             async move {
//!                 let path = ctx.request().path().to_owned();
//!                 let page: Result<String, _> = memo
//!                     .compute(path.clone(), || async { Ok::<_, std::io::Error>(format!("<h1>{path}</h1>")) })
//!                     .await;
//!                 match page {
//!                     Ok(page) => Response::new(StatusCode::Ok).body(page),
//!                     Err(e) => Response::new(StatusCode::InternalServerError).body(e.to_string()),
//!                 }
//!             }
//!         });
//!
//!     Server::bind("127.0.0.1:8080").await?.serve(pipeline).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
