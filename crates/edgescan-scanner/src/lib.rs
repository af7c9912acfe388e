//! EdgeScan scan engine
//!
//! This crate implements the scanning core: candidate IP generation with an
//! exploit/explore feedback loop, per-candidate probing through an external
//! proxy-core tunnel, a bounded-concurrency scheduler with
//! pause/resume/stop semantics, a durable task store, and a layered result
//! persistence cascade that survives loss of the primary database.
//!
//! # Architecture
//!
//! - [`sources`]: CIDR pools and candidate-list resolution for every IP source
//! - [`generator`]: stateful exploit/explore candidate generator
//! - [`tunnel`]: proxy-core runtime config synthesis
//! - [`supervisor`]: per-probe proxy-core process lifecycle
//! - [`tls_verify`]: optional TLS identity pre-check of a candidate
//! - [`probe`]: the measurement pipeline (pre-filter → tunnel → ping →
//!   thresholds → throughput → verdict)
//! - [`registry`]: active scans and the single-owner job record
//! - [`scheduler`]: candidate feed, dual semaphores, lifecycle control
//! - [`task_store`]: durable scan-job rows with crash recovery
//! - [`persistence`]: five-tier result write/read cascade
//! - [`geo`]: caller identity and per-IP enrichment

pub mod generator;
pub mod geo;
pub mod persistence;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod sources;
pub mod supervisor;
pub mod task_store;
pub mod tls_verify;
pub mod tunnel;

pub use generator::SmartIpGenerator;
pub use geo::GeoResolver;
pub use persistence::{PersistMode, PersistenceConfig, ResultLayer, ResultPersistence};
pub use probe::{Candidate, ProbeOptions, ProbePipeline, ProbeRunner};
pub use registry::{JobHandle, ScanRegistry};
pub use scheduler::{CandidateFeed, ScanContext, ScanScheduler};
pub use sources::{RangePool, SourceRegistry};
pub use supervisor::CoreSupervisor;
pub use task_store::TaskStore;
pub use tunnel::{FragmentPolicy, TunnelVariant};
