pub mod config;
pub mod errors;
pub mod forward;
pub mod governance;
pub mod parse;
pub mod providers;
pub mod ratelimit;
pub mod registry;
pub mod routing;
pub mod serdes;
pub mod stats;
pub mod strng;
pub mod telemetry;
pub mod types;

// Common imports shared across the crate; modules pull these in with `use crate::*`.
pub use std::collections::{HashMap, HashSet};
pub use std::fmt::Debug;
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use bytes::Bytes;
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::strng::Strng;
