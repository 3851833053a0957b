//! # filewire-client
//!
//! Client operations on top of `filewire-core`.
//!
//! [`ResourceClient`] downloads and uploads bytes, strings and files. Each
//! operation has a blocking form and an `*_async` form that runs on a worker
//! through the [`AsyncOperationFacade`], reporting progress and finishing with
//! exactly one [`CompletionEvent`].
//!
//! ```ignore
//! use filewire_client::{ClientConfig, Handlers, ResourceClient, UserToken};
//!
//! let client = ResourceClient::new(ClientConfig::default())?;
//! client.download_data_async(
//!     "/var/log/syslog",
//!     UserToken::none(),
//!     Handlers::new()
//!         .on_progress(|p| eprintln!("{}%", p.percentage))
//!         .on_complete(|done| println!("{:?} bytes", done.result.map(|b| b.len()))),
//! )?;
//! ```

pub mod client;
pub mod config;
pub mod facade;
pub mod progress;

pub use client::ResourceClient;
pub use config::ClientConfig;
pub use facade::{AsyncOperationFacade, BusyGuard, CompletionEvent, Handlers, OperationContext};
pub use progress::{percentage, ProgressEvent, UserToken};
