//! A stochastic peer address manager for peer-to-peer networks.
//!
//! The manager remembers endpoints the node has learned about, scores them,
//! and returns well-randomized candidates for new outbound connections. Its
//! design goal is resistance to *eclipse* attempts: an adversary that
//! floods the node with addresses it controls should gain as little
//! influence over future peer selection as possible. To that end, addresses
//! live in two keyed-hash bucket tables (unvetted "new" and proven
//! "tried"), bucket placement is budgeted per address group, and eviction
//! from the tried table is deferred until the incumbent had a chance to
//! prove its liveness.
//!
//! ```
//! use peerbook::bitcoin::network::address::AddrV2;
//! use peerbook::bitcoin::network::constants::ServiceFlags;
//! use peerbook::time::{LocalDuration, LocalTime};
//! use peerbook::{AddrManager, Config, Endpoint, PeerAddr};
//!
//! let clock = LocalTime::from_secs(1_842_000_000);
//! let book = AddrManager::new(Config::default(), fastrand::Rng::with_seed(7), clock);
//!
//! let peer = PeerAddr::new(
//!     Endpoint::from(std::net::SocketAddr::from(([33, 33, 33, 33], 8333))),
//!     ServiceFlags::NETWORK,
//!     clock.timestamp(),
//! );
//! let source = AddrV2::Ipv4([99, 99, 99, 99].into());
//!
//! book.add(peer.clone(), &source, LocalDuration::default());
//! book.good(&peer.endpoint, true, clock);
//!
//! assert_eq!(book.select(false).map(|a| a.endpoint), Some(peer.endpoint));
//! ```
#![deny(missing_docs, unsafe_code)]
pub mod addr;
pub mod asmap;
pub mod collections;
pub mod error;
pub mod manager;
pub mod time;

mod entry;
mod serialize;

pub use addr::{Endpoint, PeerAddr};
pub use asmap::AsMap;
pub use error::Error;
pub use manager::{AddrManager, Config};

pub use bitcoin;
