//! Host-facing contract and stdio bridge for native app integration.

pub mod contract;
pub mod stdio;
