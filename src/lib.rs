//! guildsync mirrors a guild roster into a local record store and keeps its
//! own container image current.
//!
//! Two independent convergence loops run inside one process:
//! - the roster reconciler ([`reconcile::RosterReconciler`]) pulls the guild
//!   roster and character profiles and converges the store toward them;
//! - the self-updater ([`selfupdate::SelfUpdater`]) compares the registry
//!   digest of the deployed image with the local one and restarts the
//!   container after pulling a newer image.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;
pub mod retry;
pub mod transport;

pub mod roster;
pub mod store;

pub mod reconcile;
pub mod selfupdate;

pub mod scheduler;
