//! Control-plane connectivity.
//!
//! - [`roster`]: configured endpoints and their last observed load
//! - [`identity`]: the persisted agent id and the facts reported on registration
//! - [`session`]: probing, server selection, and the read/write/registration loops
//! - [`heartbeat`]: fixed-interval keepalive on the write path
//!
//! # Connection Flow
//!
//! 1. [`select_best`] probes every roster entry; each server announces its load
//!    as the first frame and the least-loaded reachable one wins
//! 2. [`Session::run`] starts one read loop and one write loop on that socket
//! 3. The registration loop sends `Register` until the server acknowledges
//! 4. A read failure reconnects in place; a write failure restarts the cycle

pub mod heartbeat;
pub mod identity;
pub mod roster;
pub mod session;

pub use identity::{AgentIdentity, ClientInfo};
pub use roster::{Roster, Server, ServerLoad};
pub use session::{probe, select_best, Session, SessionHandle, SessionState};
