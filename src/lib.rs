//! An asynchronous consumer client for the NSQ binary TCP protocol (V2).
//!
//! The crate is organized leaf-first: [`frame`] and [`codec`] parse and
//! encode the wire format, [`compression`] and [`tls`] are the pluggable
//! transport upgrades a [`Connection`] negotiates through IDENTIFY,
//! [`Message`] is the per-delivery ack handle, and [`Reader`] is the
//! top-level coordination layer applications construct.
//!
//! # Example
//!
//! ```rust,no_run
//! use nsq_client::{Reader, ReaderConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ReaderConfigBuilder::new()
//!         .nsqd_address("127.0.0.1", 4150)
//!         .max_in_flight(100)
//!         .build();
//!
//!     let reader = Reader::new(config);
//!     reader.connect().await?;
//!     reader.subscribe("events", "my-channel").await?;
//!
//!     let consumer = reader.messages();
//!     while let Some(message) = consumer.next().await {
//!         println!("{:?}", message.body);
//!         message.fin().await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod compression;
pub mod config;
pub mod connection;
pub mod consts;
pub mod error;
pub mod frame;
pub mod message;
pub mod reader;
pub mod tls;

pub use codec::{Command, FrameParser, FrameSource};
pub use compression::{CompressionKind, DeflateReader, SnappyReader};
pub use config::{IdentifyConfig, ReaderConfig, ReaderConfigBuilder};
pub use connection::Connection;
pub use error::{NsqError, NsqResult};
pub use frame::{Frame, MessageFrame};
pub use message::Message;
pub use reader::lookup::{BrokerAddress, HttpLookupClient, LookupClient};
pub use reader::rdy::RdyControl;
pub use reader::{MessageConsumer, Reader};
pub use tls::MaybeTlsStream;
