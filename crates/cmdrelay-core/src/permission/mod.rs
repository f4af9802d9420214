//! Capability-based authorization for the relay's clients.
//!
//! Permissions are namespaced strings (`resource:action`, e.g.
//! `stock:create`) granted to a session by the backend identity endpoint.
//!
//! # Architecture
//!
//! ```text
//! IdentityClient (trait)          PermissionCache            gate::evaluate
//!     |                           +-----------------+        +-------------+
//!     +-- HttpIdentityClient ---->| Uninitialized   |        | Requirement |
//!     |   (reqwest)               | Loading         |------->| + state     |
//!     +-- test fakes              | Ready(set)      |        | -> Decision |
//!                                 | Errored(msg)    |        +-------------+
//!                                 +-----------------+
//! ```
//!
//! # Invariants
//!
//! - A cache that has not finished loading never answers "granted"
//! - Query methods never panic and never return errors
//! - A 401 from the identity endpoint means "no permissions", not a fault

pub mod cache;
pub mod gate;
pub mod identity;
pub mod set;

pub use cache::{PermissionCache, PermissionState};
pub use gate::{GateDecision, MatchMode, Requirement};
pub use identity::{HttpIdentityClient, Identity, IdentityClient, IdentityError};
pub use set::PermissionSet;
