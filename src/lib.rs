//! rumilter
//! ========
//!
//! **rumilter** is a Rust crate implementing the filter side of the milter
//! protocol spoken by MTAs like sendmail or postfix: it listens for MTA
//! connections, drives the per-connection protocol state machine and lets
//! you accept, reject, quarantine or modify mail from a handler trait.
//!
//! This library uses pure safe Rust code and doesn't require external
//! libraries like libmilter.
//!
//! Features
//! --------
//!
//! - Listen on TCP (IPv4/IPv6) or UNIX domain sockets using the usual
//!   `inet:PORT@HOST` / `unix:PATH` connection specs
//! - Full option negotiation: protocol version, action mask, step mask
//!   and per-stage macro requests
//! - One async handler per connection with an event per protocol stage
//! - End-of-message modification actions: add/insert/change/delete
//!   header, replace body, add/remove recipient, quarantine, progress
//!   keep-alive
//! - Uses Rust's type system to prevent misusing the milter protocol
//!
//! Usage
//! -----
//!
//! ```toml
//! [dependencies]
//! rumilter = "0.1"
//! ```
//!
//! Example
//! -------
//!
//! ```no_run
//! use async_trait::async_trait;
//! use rumilter::client_builder::ClientBuilder;
//! use rumilter::context::Context;
//! use rumilter::handler::Handler;
//! use rumilter::status::Status;
//!
//! struct FlagSpam;
//!
//! #[async_trait]
//! impl Handler for FlagSpam {
//!     async fn on_end_of_message(&mut self, context: &mut Context, _final_chunk: &[u8]) -> Status {
//!         if context.macro_value("{spam}").is_some() {
//!             context
//!                 .add_header("X-Spam-Flag", "YES")
//!                 .await
//!                 .expect("add-header was negotiated");
//!         }
//!         Status::Continue
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut client = ClientBuilder::new()
//!         .connection_spec("inet:10025@localhost")
//!         .build()
//!         .expect("valid listener configuration");
//!
//!     client
//!         .run(|context| context.set_handler(Box::new(FlagSpam)))
//!         .await
//!         .expect("failed to run the milter");
//! }
//! ```
//!
//! Status
//! ------
//!
//! **rumilter** speaks milter protocol versions 2 to 6 and implements the
//! full end-of-message modification set. Macro symbol/value maps are
//! passed through as received; interpreting them is up to the handler.
#[macro_use]
extern crate lazy_static;

mod agent;

pub mod client;
pub mod client_builder;
pub mod codec;
pub mod connection_spec;
pub mod context;
pub mod error;
pub mod handler;
pub mod macros;
pub mod option_set;
pub mod status;
