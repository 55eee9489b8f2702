// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::arc_with_non_send_sync,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_unit_value,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::bytes_nth,
    clippy::deprecated_clippy_cfg_attr,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::cmp_null,
    clippy::op_ref
)]

#[macro_use]
extern crate serde;

pub mod cancel;
pub mod config;
pub mod conflicts;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod network;
pub mod persistence;
pub mod scheduler;
pub mod trains;

pub use config::{EngineArgs, EngineConfig};
pub use conflicts::{Conflict, Severity, analyze};
pub use engine::{CycleOutcome, EngineParts, EngineState, OptimizationEngine, SkipReason};
pub use network::Network;
pub use scheduler::{Schedule, ScheduleAction, ScheduleEntry};
pub use trains::{Train, TrainBundle};
