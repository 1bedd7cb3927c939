//! # watchd-client
//!
//! Asynchronous client for the watchd file-watching daemon.
//!
//! The daemon speaks a length-prefixed binary protocol over a Unix domain
//! socket. Commands are pipelined one at a time and responses are
//! correlated by arrival order; server-pushed subscription and log
//! messages are delivered out of band to an optional subscriber channel.
//!
//! ## Example
//!
//! ```ignore
//! use watchd_client::{Connection, Value};
//!
//! #[tokio::main]
//! async fn main() -> watchd_client::Result<()> {
//!     let conn = Connection::builder().build();
//!     conn.connect(Value::Map(vec![])).await?;
//!
//!     let resp = conn
//!         .run(Value::Array(vec![
//!             Value::from("watch-list"),
//!         ]))
//!         .await?;
//!     println!("{resp}");
//!     conn.close();
//!     Ok(())
//! }
//! ```

mod buffer;
mod connection;
mod error;
mod queue;

pub mod pdu;
pub mod sockpath;

pub use connection::{Connection, ConnectionBuilder, Notification, State};
pub use error::{Error, Result};
pub use pdu::Value;
