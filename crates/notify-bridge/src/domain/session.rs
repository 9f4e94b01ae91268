//! Session descriptions and identity.
//!
//! A deployment exposes one or more endpoints; each endpoint runs sessions
//! with a fixed set of [`SessionFeatures`].  The two standard sets are:
//!
//! | Preset          | Snapshot | Registration | Inbound relay |
//! |-----------------|----------|--------------|---------------|
//! | `notify_only()` | no       | no           | no            |
//! | `messages()`    | yes      | yes          | yes           |

use std::sync::Arc;

/// Optional handshake and receive-loop steps enabled for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionFeatures {
    /// Fetch a state snapshot and send it as the session's first frame.
    pub snapshot: bool,
    /// Register the session id with the backend after the first frame, and
    /// deregister it when the session ends.
    pub registration: bool,
    /// Forward every inbound text frame to the backend.
    pub inbound_relay: bool,
}

impl SessionFeatures {
    /// Notifications flow to the client; nothing flows back.
    pub const fn notify_only() -> Self {
        Self {
            snapshot: false,
            registration: false,
            inbound_relay: false,
        }
    }

    /// Snapshot, registration and inbound relay all enabled.
    pub const fn messages() -> Self {
        Self {
            snapshot: true,
            registration: true,
            inbound_relay: true,
        }
    }
}

/// Produces a fresh, unique session identifier for every call.
///
/// Injected into the orchestrator so tests can use predictable ids.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// The production generator: random UUID v4 strings.
pub fn uuid_ids() -> IdGenerator {
    Arc::new(|| uuid::Uuid::new_v4().to_string())
}
