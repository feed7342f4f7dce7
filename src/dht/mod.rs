//! Chord ring overlay.
//!
//! Based on Chord, ref: <https://pdos.csail.mit.edu/papers/chord:sigcomm01/chord_sigcomm.pdf>.
//! Peers form a clockwise ring in the order of [`Key`]; each owns the arc
//! between its predecessor's id (exclusive) and its own id (inclusive).

pub mod key;
pub use key::Key;

pub mod peer;
pub use peer::RemotePeer;

pub mod finger;
pub use finger::Finger;
pub use finger::FingerTable;

pub mod successor;
pub use successor::SuccessorList;

mod chord;
pub use chord::ChordState;
pub use chord::StoreAdapter;

pub mod inspect;
pub use inspect::RingInspect;
