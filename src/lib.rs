//! Outbound FreeSWITCH event socket server driving calls from RESTXML documents
//!
//! FreeSWITCH's `socket` dialplan application connects each call to this
//! server. A [`CallSession`] takes over the connection, fetches a RESTXML
//! document from a web application and executes its elements on the channel.
//!
//! # Architecture
//!
//! - [`EslConnection`] (Clone + Send): strict command/reply correlation over one
//!   socket, with a background loop dispatching events to a [`HandlerRegistry`]
//!   on an injected [`WorkerPool`]
//! - [`CallSession`]: direction resolution and the fetch, parse, execute loop
//! - [`Element`] / [`ElementRegistry`]: the document vocabulary
//! - [`CallFlowFetcher`]: how documents are fetched ([`HttpFetcher`] by default)
//! - [`OutboundServer`]: the accept loop
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use freeswitch_restxml::{ElementRegistry, HttpFetcher, OutboundServer, SessionConfig};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig {
//!         default_answer_url: Some("http://127.0.0.1:5000/answer".into()),
//!         ..Default::default()
//!     };
//!     let fetcher = HttpFetcher::new(std::time::Duration::from_secs(60))?;
//!     let server = OutboundServer::new(Arc::new(config), Arc::new(fetcher), ElementRegistry::builtin());
//!
//!     let listener = TcpListener::bind("127.0.0.1:8084").await?;
//!     server.serve(listener).await;
//!     Ok(())
//! }
//! ```
//!
//! Configure FreeSWITCH to connect to the server:
//! ```xml
//! <action application="socket" data="127.0.0.1:8084 async full"/>
//! ```
//!
//! ## Application Commands
//!
//! ```rust
//! use freeswitch_restxml::AppCommand;
//!
//! let wire = AppCommand::new("speak")
//!     .uuid("abc")
//!     .arg("flite|slt|Hello")
//!     .event_lock(true)
//!     .to_wire_format()
//!     .unwrap();
//! assert!(wire.contains("execute-app-name: speak\n"));
//! ```

#[macro_use]
mod macros;

pub mod channel;
pub mod command;
pub mod config;
pub mod connection;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod headers;
pub mod http;
pub mod protocol;
pub mod restxml;
pub mod server;
pub mod session;
pub mod variables;

pub use channel::{CallDirection, CallStatus};
pub use command::{AppCommand, EslCommand, EslResponse, ResponseKind};
pub use config::{load_config, validate_config, ConfigError, OutboundConfig};
pub use connection::{ConnectionOptions, ConnectionStatus, DisconnectReason, EslConnection};
pub use dispatch::{EventContext, HandlerError, HandlerFailure, HandlerRegistry, WorkerPool};
pub use error::{CallError, CallResult, EslError, EslResult, RestXmlError};
pub use event::{EslEventType, Event, EventFormat};
pub use headers::EventHeader;
pub use http::{CallFlowFetcher, FetchError, HttpFetcher, HttpMethod};
pub use restxml::{parse_document, Element, ElementRegistry, Flow, RedirectTarget, XmlNode};
pub use server::OutboundServer;
pub use session::{CallControl, CallSession, SessionConfig, SessionEnd, SessionState};
pub use variables::ChannelVariable;
