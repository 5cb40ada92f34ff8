//! # skein
//!
//! Per-destination active-message aggregation for partitioned-global-
//! address-space jobs: gather small messages per destination core, ship one
//! buffer per flush, dispatch in order on arrival.
//!
//! This crate re-exports [`skein_core`]; most applications only need the
//! prelude:
//!
//! ```rust,no_run
//! use skein::prelude::*;
//! # use std::sync::Arc;
//!
//! let fabric = LoopbackFabric::new(2);
//! let registry = Arc::new(DeserializerRegistry::new());
//! registry.register(1, |payload| println!("got {} bytes", payload.len()));
//! ```

pub use skein_core::{self, *};

/// Everything you need to get started.
pub mod prelude {
    pub use skein_core::{
        Aggregator, AggregatorConfig, Core, DeserializerId, DeserializerRegistry, FullEmpty,
        LoopbackFabric, LoopbackTransport, Message, PrefetchStrategy, SkeinError, SkeinResult,
        StatsSnapshot, Topology, Transport,
    };
}
