//! Signing identity used to authenticate frames sent to the relay server.

mod keypair;

pub use keypair::{verify_frame, KeyPair, KeyPairError};
