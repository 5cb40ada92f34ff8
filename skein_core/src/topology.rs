//! Core/node topology.
//!
//! The aggregator only needs two facts from the locality layer: how many
//! cores the job has, and which cores share a physical node. The
//! representative core of a node (its lowest-numbered core) anchors
//! cross-core aggregation routing.

use serde::{Deserialize, Serialize};

use crate::error::{SkeinError, SkeinResult};

/// Logical core identifier, dense in `[0, total_cores)`.
pub type Core = u32;

/// Flat description of the job's core layout
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Topology {
    /// Total addressable cores in the job
    pub total_cores: Core,
    /// Cores per physical node (uniform)
    pub cores_per_node: Core,
}

impl Topology {
    /// Single-node topology with `total_cores` colocated cores.
    pub fn single_node(total_cores: Core) -> Self {
        Self {
            total_cores,
            cores_per_node: total_cores,
        }
    }

    pub fn validate(&self) -> SkeinResult<()> {
        if self.total_cores == 0 || self.cores_per_node == 0 {
            return Err(SkeinError::config("topology requires at least one core"));
        }
        if self.cores_per_node > self.total_cores {
            return Err(SkeinError::config(format!(
                "cores_per_node {} exceeds total_cores {}",
                self.cores_per_node, self.total_cores
            )));
        }
        Ok(())
    }

    /// Node index a core lives on
    #[inline]
    pub fn node_of(&self, core: Core) -> Core {
        core / self.cores_per_node
    }

    /// Lowest-numbered core on `core`'s node
    #[inline]
    pub fn representative_of(&self, core: Core) -> Core {
        self.node_of(core) * self.cores_per_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representative_is_lowest_on_node() {
        let topo = Topology {
            total_cores: 8,
            cores_per_node: 4,
        };
        assert_eq!(topo.representative_of(0), 0);
        assert_eq!(topo.representative_of(3), 0);
        assert_eq!(topo.representative_of(4), 4);
        assert_eq!(topo.representative_of(7), 4);
    }

    #[test]
    fn single_node_has_one_representative() {
        let topo = Topology::single_node(6);
        for c in 0..6 {
            assert_eq!(topo.representative_of(c), 0);
        }
    }

    #[test]
    fn rejects_empty_topology() {
        assert!(Topology {
            total_cores: 0,
            cores_per_node: 1
        }
        .validate()
        .is_err());
    }
}
