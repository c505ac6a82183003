//! KubeNexus scheduling core: gang/co-scheduling admission, VRAM- and NUMA-aware
//! filter/score plugins, and gang preemption.
//!
//! This crate is a library of scheduling-framework plugins (`crate::plugin`); it
//! does not run a scheduling loop, own an informer cache, or talk to an API server
//! directly — those belong to the host framework and the out-of-scope integration
//! binary that wires these plugins into it.

pub mod config;
pub mod cycle_state;
pub mod error;
pub mod gang;
pub mod labels;
pub mod numa;
pub mod plugin;
pub mod preemption;
pub mod profile;
pub mod queue;
pub mod reservation;
pub mod vram;
