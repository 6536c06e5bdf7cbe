//! # updraft-daemon
//!
//! The updraft daemon library: everything behind the `updraft-daemon`
//! binary's two modes.
//!
//! - **Agent mode**: an [`agent::Agent`] owns an overlay connection to the
//!   rendezvous server, the update manager, and the local administration
//!   API on a Unix socket. Signed update notifications arrive over
//!   gossip, from the catalog pull fallback, or from local submission;
//!   payloads are fetched through the swarm adapter.
//! - **Server mode**: a [`rendezvous::RendezvousServer`] maintains the
//!   session table discovered by NAT-reflexive binding, advertises it to
//!   peers, and serves the notification catalog over TCP.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod api;
pub mod overlay;
pub mod rendezvous;
pub mod swarm;
pub mod updates;
