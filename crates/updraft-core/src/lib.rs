//! # updraft-core
//!
//! Core library for updraft - peer-to-peer distribution of signed software
//! updates for fleets of NAT-ed nodes.
//!
//! This crate provides the building blocks shared by the daemon and the
//! operator CLI:
//!
//! - **State machines**: a small synchronized transition-table engine that
//!   the overlay connection and update lifecycle are driven by
//! - **Wire codec**: STUN-family datagram framing with message integrity
//!   and fingerprint validation
//! - **Peer model**: peer identifiers, reachability sessions, and the
//!   session table exchanged with the rendezvous server
//! - **Notifications**: signed, versioned update descriptors with a
//!   canonical bencoded form
//! - **Configuration**: serde-backed config types for the agent and the
//!   rendezvous server
//!
//! ## Example
//!
//! ```rust
//! use updraft_core::automata::{Automata, Transition};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum State { Idle, Busy }
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Event { Start, Done }
//! # impl std::fmt::Display for State {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//! #         write!(f, "{self:?}")
//! #     }
//! # }
//! # impl std::fmt::Display for Event {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//! #         write!(f, "{self:?}")
//! #     }
//! # }
//!
//! let fsm = Automata::new("worker", State::Idle, &[
//!     Transition { src: State::Idle, event: Event::Start, dest: State::Busy },
//!     Transition { src: State::Busy, event: Event::Done, dest: State::Idle },
//! ]);
//! assert_eq!(fsm.event(Event::Start).unwrap(), State::Busy);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod automata;
pub mod config;
pub mod keys;
pub mod notification;
pub mod peer;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::automata::{Automata, Transition, UnmappedTransition};
    pub use crate::notification::{Notification, PayloadInfo};
    pub use crate::peer::{PeerId, Session, SessionTable};
    pub use crate::wire::{Class, Message, MessageBuilder, Method};
}

/// Re-export commonly used types at the crate root.
pub use notification::Notification;
pub use peer::{PeerId, Session, SessionTable};
