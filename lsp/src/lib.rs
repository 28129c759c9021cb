//! Client side of the Language Server Protocol over TCP.
//!
//! [`MessageParser`] turns a byte stream into JSON-RPC messages,
//! [`RpcClient`] correlates requests with responses over one connection,
//! and [`ServerProcess`] starts a local server when configured to.

pub mod codec;
pub mod config;
pub mod protocol;
pub mod reader;
pub mod types;

mod client;
mod spawn;

pub use client::{RpcClient, next_notification};
pub use codec::{FrameError, MessageParser, ParsingState};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use reader::{DataReader, Extraction};
pub use spawn::{ServerProcess, SpawnError};
pub use types::{
    ConnectionStatus, EventErrorKind, RequestIdGenerator, RpcError, RpcEvent, ServerAddress,
};
