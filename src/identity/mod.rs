//! RSA keypair generation, OpenSSH serialisation, and the embedded mTLS CA
//! (C11).

mod ca;
mod keypair;

pub use ca::{Ca, IssuedCert};
pub use keypair::SshKeypair;
