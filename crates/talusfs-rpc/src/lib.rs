#![warn(missing_docs)]

//! TalusFS RPC subsystem: wire codec, imports, bulk transfer, request sets over pluggable network drivers

pub mod bulk;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod import;
pub mod loopnet;
pub mod net;
pub mod request;
pub mod runtime;
pub mod service;
pub mod set;
pub mod stats;
pub mod wire;

pub use bulk::{BulkDesc, BulkIo, BulkRole};
pub use connection::{ConnRegistry, Connection, PeerId};
pub use error::{Result, RpcError};
pub use import::{ConnEpoch, Generation, Import, ImportConfig, ImportEvent, ImportState};
pub use loopnet::LoopNet;
pub use net::{AckPolicy, NetDriver, NetHandle};
pub use request::{InterruptHandle, Phase, Request};
pub use runtime::{RpcConfig, RpcRuntime};
pub use service::{Export, IncomingRequest, RpcHandler};
pub use set::{NbSet, RequestSet, SetAdder};
pub use stats::{RpcStats, StatsSnapshot};
pub use wire::{Msg, MsgHeader, MsgType};
