//! Rally Core - Coordination service for fixed-membership distributed jobs
//!
//! This crate provides the Rust core for coordinating:
//! - Task lifecycle and liveness tracking
//! - Named barrier synchronization
//! - Failure propagation to peer tasks
//! - Cluster-wide device inventory aggregation
//! - A shared configuration key/value store

use std::time::Duration;

pub mod error;
pub mod kv;
pub mod logging;
pub mod metrics;
pub mod service;
pub mod shutdown;
pub mod task;

pub use error::{CoordinationError, ErrorCode, ErrorPayload, Result};
pub use service::{CoordinationService, JobSpec, ServiceConfig};
pub use task::TaskId;

/// Heartbeat timeout applied when the configured value is zero
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for every service-to-client error notification
pub const SERVICE_TO_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of the distinguished device-propagation barrier
pub const DEVICE_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Period of the background liveness scan
pub const LIVENESS_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Ongoing-barrier count above which the service logs a warning
pub const ONGOING_BARRIERS_SOFT_LIMIT: usize = 20;

/// Maximum number of un-arrived task names quoted in a barrier timeout error
pub const PENDING_TASK_LOG_LIMIT: usize = 20;

/// Maximum number of straggler names quoted in connect-progress logs
pub const PENDING_STRAGGLER_LOG_LIMIT: usize = 3;
