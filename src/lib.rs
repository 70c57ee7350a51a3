//! An asynchronous client for a remote in-memory tuple store.
//!
//! The server groups tuples into named [`Space`](ops::Space)s, each with zero
//! or more secondary indexes, and speaks a length-prefixed binary protocol
//! over TCP. This crate owns three things: the [`transport`] layer (framing,
//! request multiplexing, reconnection, authentication), the [`schema`] cache
//! (lazy discovery of server-side spaces/indexes and the value coding they
//! imply), and the [`Client`] data-plane surface built on top of both.
//!
//! ```no_run
//! # async fn go() -> Result<(), tuplestore_client::ClientError> {
//! use tuplestore_client::{Config, Client, ops::Space};
//!
//! let config = Config::builder("127.0.0.1", 3301).build();
//! let client = Client::connect(config).await?;
//! client.ping().await?;
//! let found = client.select(Space::name("widgets"), Space::id(0), vec![1u32.into()], Default::default()).await?;
//! # let _ = found;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod defaults;
pub mod error;
pub mod ops;
pub mod schema;
pub mod transport;
pub mod tuple;
pub mod wire;

mod client;

pub use client::Client;
pub use config::{Config, ConnectOptions};
pub use error::{ClientError, ServerError, TransportError};
pub use tuple::{Tuple, TupleSet};
