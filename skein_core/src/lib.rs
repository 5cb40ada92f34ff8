//! # skein core
//!
//! Core runtime for skein, a per-destination active-message aggregation
//! layer for partitioned-global-address-space jobs.
//!
//! Application code on every core emits small messages bound for specific
//! remote cores. Sending each one as its own network operation wrecks
//! throughput; holding them until a barrier wrecks latency. The aggregator
//! sits between the two: it gathers outstanding messages per destination in
//! a lock-free list, ships one concatenated buffer when a byte budget is
//! reached (or on explicit flush), and on arrival walks the buffer invoking
//! each record's registered handler in order.
//!
//! The building blocks:
//!
//! - **Aggregator**: per-core endpoint — wait-free enqueue, capacity and
//!   requested flushes, an immediate bypass path, and the idle-flush task
//! - **Messages**: destination-addressed records with a deserializer id and
//!   an opaque payload, dispatched through a [`DeserializerRegistry`]
//! - **Transport**: the two-primitive fabric contract (medium active
//!   message + one-sided write), with an in-process loopback for tests
//! - **Wire**: the byte-exact record format shared by both sides
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skein_core::{
//!     Aggregator, AggregatorConfig, DeserializerRegistry, LoopbackFabric, Message, Topology,
//! };
//!
//! let fabric = LoopbackFabric::new(2);
//! let registry = Arc::new(DeserializerRegistry::new());
//! registry.register(1, |payload| println!("got {} bytes", payload.len()));
//!
//! let topo = Topology::single_node(2);
//! let agg = Aggregator::init(
//!     AggregatorConfig::default(),
//!     0,
//!     topo,
//!     Arc::new(fabric.endpoint(0)?),
//!     registry,
//! )?;
//!
//! agg.enqueue(Message::new(1, 1, b"hello".to_vec())?)?;
//! agg.flush(1)?;
//! # Ok::<(), skein_core::SkeinError>(())
//! ```

pub mod aggregator;
pub mod config;
pub mod error;
pub mod message;
pub mod runtime;
pub mod topology;
pub mod transport;
pub mod wire;

// Re-export the types most callers need.
pub use aggregator::{Aggregator, StatsSnapshot};
pub use config::{AggregatorConfig, PrefetchStrategy};
pub use error::{SkeinError, SkeinResult};
pub use message::{DeserializerId, DeserializerRegistry, Message};
pub use runtime::FullEmpty;
pub use topology::{Core, Topology};
pub use transport::loopback::{LoopbackFabric, LoopbackTransport};
pub use transport::{HandlerId, ReceiveBufferInfo, RemoteBuffer, RemoteCell, SendBufferInfo, Transport};
