//! runq-runtime - disk detection/validation, hypervisor argv construction,
//! and the `RUNQ_*` env-DSL parsers used by the host proxy.

pub mod complete;
pub mod disk;
pub mod env;
pub mod hypervisor;
