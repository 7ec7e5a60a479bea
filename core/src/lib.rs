//! Cryptographic core of the mailbox-coordinated threshold signing node:
//! curve arithmetic, Feldman VSS DKG, threshold Schnorr signing, the
//! HSM-anchored nonce derivation formula, and the ceremony state machines
//! built on top of them. Everything here is pure with respect to its three
//! collaborators (`Hsm`, `Mailbox`, `StateStore`) — no file I/O, network
//! I/O, or PKCS#11 linkage lives in this crate; see `mpc-node` for those.

pub mod curve;
pub mod dkg;
pub mod error;
pub mod nonce;
pub mod orchestrator;
pub mod protocol;
pub mod signer;
pub mod state;
pub mod traits;

pub use error::{MpcError, Result};
pub use orchestrator::Orchestrator;
pub use traits::{Hsm, HsmMode, Mailbox, StateStore};
