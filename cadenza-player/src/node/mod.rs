//! Rendering-node client, wrapper, and pool

pub mod client;
pub mod http;
pub mod pool;

pub use client::{Filters, Node, NodeClient, NodeEvent, NodeMessage, NodeStats, SearchResult, TrackEndReason};
pub use http::{NodeConfig, RestNodeClient};
pub use pool::NodePool;
