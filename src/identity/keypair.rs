//! Ephemeral 4096-bit RSA keypairs (spec §4.11): generated per build, public
//! key serialised to OpenSSH authorized-keys format for guest injection,
//! private key kept only in memory for SSH client auth.

use rand::rngs::OsRng;
use rsa::{
    pkcs1::{EncodeRsaPrivateKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use ssh_key::{private::RsaKeypair as SshRsaKeypair, PrivateKey};
use stacked_errors::{Result, StackableErr};

/// An in-memory RSA keypair. Never persisted (spec §4.11: "private key ...
/// never persisted").
pub struct SshKeypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl SshKeypair {
    /// Generates a fresh 4096-bit RSA keypair.
    #[tracing::instrument(skip_all)]
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, 4096)
            .stack_err("SshKeypair::generate -> RSA key generation")?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// The public key in OpenSSH `authorized_keys` line format (spec §4.6
    /// step 3, SSH keys injection), with `comment` appended.
    pub fn public_authorized_keys_line(&self, comment: &str) -> Result<String> {
        let ssh_public = ssh_key::public::RsaPublicKey {
            e: self.public.e().to_bytes_be().into(),
            n: self.public.n().to_bytes_be().into(),
        };
        let key = ssh_key::PublicKey::new(
            ssh_key::public::KeyData::Rsa(ssh_public),
            comment.to_owned(),
        );
        key.to_openssh()
            .stack_err("SshKeypair::public_authorized_keys_line -> encoding")
    }

    /// PKCS#1 DER bytes of the private key, for handing to an SSH client
    /// implementation.
    pub fn private_key_der(&self) -> Result<Vec<u8>> {
        self.private
            .to_pkcs1_der()
            .stack_err("SshKeypair::private_key_der -> encoding")
            .map(|doc| doc.as_bytes().to_vec())
    }

    /// PKCS#1 PEM encoding of the private key, the form the `ssh2`-backed
    /// guest client (C4) hands to `libssh2`'s in-memory pubkey auth.
    pub fn private_key_pem(&self) -> Result<String> {
        self.private
            .to_pkcs1_pem(LineEnding::LF)
            .stack_err("SshKeypair::private_key_pem -> encoding")
            .map(|doc| doc.to_string())
    }

    /// The private key re-expressed as an `ssh_key` private key, ready for an
    /// SSH client handshake.
    pub fn ssh_private_key(&self, comment: &str) -> Result<PrivateKey> {
        let keypair = SshRsaKeypair::try_from(&self.private)
            .stack_err("SshKeypair::ssh_private_key -> converting to ssh_key representation")?;
        let mut key = PrivateKey::from(keypair);
        key.set_comment(comment);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_serialises_to_authorized_keys_line() {
        let kp = SshKeypair::generate().unwrap();
        let line = kp.public_authorized_keys_line("firebuild@guest").unwrap();
        assert!(line.starts_with("ssh-rsa "));
        assert!(line.trim_end().ends_with("firebuild@guest"));
    }
}
