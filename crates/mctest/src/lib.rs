//!
//! # mctest
//!
//! Standalone memcached instances for tests. Every test gets its own server on its own port,
//! up and accepting connections before the test body runs, and gone again once the test calls
//! [`Server::stop`].
//!
//! Starting a server goes through four steps, in order:
//! - a free loopback port is reserved from a [`PortAllocator`];
//! - `memcached` is spawned listening on it, with its pid written to a throwaway temp path;
//! - we wait for `server listening` on its stderr and then for a TCP connection to succeed;
//! - the ready [`Server`] is handed back.
//!
//! Setup failures are not returned, they fail the test through a [`FailureReporter`]. Attempts
//! that hang past the construction timeout are killed and started over.
//!
//! ## Basic example
//!
//! ```no_run
//! use mctest::{Item, PanicReporter, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = Server::new_started(PanicReporter).await;
//!     let client = server.client();
//!
//!     client.set(&Item::new("1", "42")).await.unwrap();
//!     let item = client.get("1").await.unwrap().unwrap();
//!     assert_eq!(item.value, b"42");
//!
//!     server.stop().await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod client;
mod config;
mod error;
mod pid_file;
mod port;
mod readiness;
mod reporter;
mod server;
pub mod test_name;

pub use client::{Client, ClientError, Item};
pub use config::{ServerConfig, BINARY_ENV, SERVER_LISTENING, VERBOSE_ENV};
pub use error::{Error, FileIOError};
pub use port::{global_allocator, LoopbackPortAllocator, PortAllocator, PortLease};
pub use readiness::MarkerScanner;
pub use reporter::{FailureReporter, PanicReporter};
pub use server::{Server, ServerState};
