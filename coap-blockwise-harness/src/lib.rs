//! `coap-blockwise-harness`: a scriptable CoAP server that serves files
//! block-wise (RFC 7959 BLOCK2), perturbs the exchange on purpose, and checks
//! that a download client recovers.
//!
//! # Architecture
//!
//! ```text
//!            ClientControl (commands, socket count)
//!  scenario ───────────────────────────────────────▶ client under test
//!     │                                                    │
//!     ├── LifecycleController ── reset / accept ──┐        │ GET + BLOCK2
//!     │                                           ▼        ▼
//!     └── FileServer (task) ─────────────▶ TransportEndpoint
//!            │  ResourceStore    path → payload      │
//!            │  RetransmissionGate + RequestHistory  │ Message
//!            │  BlockTransferSession per path        ▼
//!            │                                 ┌───────────┐
//!            └────────────────────────────────▶│  Socket   │ (tokio UdpSocket)
//!                                              └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`message`]: CoAP message wire format
//! - [`block`]: BLOCK2 option value
//! - [`socket`]: async UDP socket speaking messages
//! - [`endpoint`]: connection-tracking endpoint (accept / reset / peer)
//! - [`store`]: shared path → payload map and resource URIs
//! - [`gate`]: deliberate request drops and the history they count
//! - [`session`]: per-resource block transfer state machine
//! - [`server`]: background serving loop and its handle
//! - [`lifecycle`]: client control seam, reconnect and offline sequencing
//! - [`scenario`]: the download conformance cases
//! - [`config`]: timeouts and block size
//! - [`timer`]: polling waits with deadlines
//! - [`error`]: scenario-level errors

pub mod block;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod message;
pub mod scenario;
pub mod server;
pub mod session;
pub mod socket;
pub mod store;
pub mod timer;

pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
