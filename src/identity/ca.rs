//! Embedded CA supporting a mutually-authenticated channel between the
//! controller and future sidecars (spec §4.11): root key generation, an
//! optional one-level intermediate signer, and per-connection client/server
//! certificates valid for a configurable window.

use std::{
    net::IpAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
};
use stacked_errors::{Result, StackableErr};

/// A signed certificate plus its private key, PEM-encoded.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The certificate authority. Holds the signing cert (root, or a one-level
/// intermediate beneath the root) and a monotonically increasing serial
/// counter (spec §4.11: "Serial numbers are monotonically incremented under
/// a mutex").
pub struct Ca {
    issuer: rcgen::Issuer<'static, KeyPair>,
    issuer_cert_pem: String,
    next_serial: Arc<Mutex<u64>>,
}

impl Ca {
    /// Generates a fresh self-signed root CA.
    pub fn new_root(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let key_pair = KeyPair::generate().stack_err("Ca::new_root -> key generation")?;
        let cert = params
            .self_signed(&key_pair)
            .stack_err("Ca::new_root -> self-signing")?;
        let issuer_cert_pem = cert.pem();
        let issuer = rcgen::Issuer::new(params, key_pair);
        Ok(Self {
            issuer,
            issuer_cert_pem,
            next_serial: Arc::new(Mutex::new(1)),
        })
    }

    /// Issues a one-level intermediate signer beneath this CA. Spec §4.11:
    /// "optional one-level intermediate signer" -- nesting further is not
    /// supported, matching the spec's own wording.
    pub fn issue_intermediate(&self, common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Constrained(0));
        params.serial_number = Some(self.next_serial().into());
        let key_pair = KeyPair::generate().stack_err("Ca::issue_intermediate -> key generation")?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .stack_err("Ca::issue_intermediate -> signing")?;
        let issuer_cert_pem = cert.pem();
        let issuer = rcgen::Issuer::new(params, key_pair);
        Ok(Self {
            issuer,
            issuer_cert_pem,
            next_serial: self.next_serial.clone(),
        })
    }

    /// PEM of the cert that should be distributed to verify certs this `Ca`
    /// issues.
    pub fn issuer_cert_pem(&self) -> &str {
        &self.issuer_cert_pem
    }

    fn next_serial(&self) -> u64 {
        let mut guard = self.next_serial.lock().unwrap();
        let serial = *guard;
        *guard += 1;
        serial
    }

    /// Issues a server certificate valid for `validity`, with the given
    /// caller-supplied SANs split into IP and DNS lists (spec §4.11).
    pub fn issue_server_cert(
        &self,
        common_name: &str,
        sans: &[String],
        validity: Duration,
    ) -> Result<IssuedCert> {
        self.issue_cert(common_name, sans, validity, rcgen::ExtendedKeyUsagePurpose::ServerAuth)
    }

    /// Issues a client certificate valid for `validity`.
    pub fn issue_client_cert(
        &self,
        common_name: &str,
        sans: &[String],
        validity: Duration,
    ) -> Result<IssuedCert> {
        self.issue_cert(common_name, sans, validity, rcgen::ExtendedKeyUsagePurpose::ClientAuth)
    }

    fn issue_cert(
        &self,
        common_name: &str,
        sans: &[String],
        validity: Duration,
        eku: rcgen::ExtendedKeyUsagePurpose,
    ) -> Result<IssuedCert> {
        let mut params = CertificateParams::new(sans.to_vec())
            .stack_err("Ca::issue_cert -> building cert params")?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![eku];
        params.serial_number = Some(self.next_serial().into());
        params.not_before = rcgen::date_time_ymd(1975, 1, 1);
        params.not_after = (std::time::SystemTime::now() + validity).into();
        for san in split_sans(sans) {
            params.subject_alt_names.push(san);
        }
        let key_pair = KeyPair::generate().stack_err("Ca::issue_cert -> key generation")?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .stack_err("Ca::issue_cert -> signing")?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Splits caller-supplied addresses into IP and DNS SAN entries (spec
/// §4.11: "Subject alternative names include caller-supplied addresses
/// split into IP and DNS lists by parsing").
fn split_sans(sans: &[String]) -> Vec<SanType> {
    sans.iter()
        .map(|s| match s.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(s.clone().try_into().unwrap_or_else(|_| {
                "invalid".to_string().try_into().expect("ASCII literal is a valid Ia5String")
            })),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_issues_server_and_client_certs_with_distinct_serials() {
        let ca = Ca::new_root("firebuild-ca").unwrap();
        let server = ca
            .issue_server_cert("vmm-control", &["127.0.0.1".to_owned()], Duration::from_secs(3600))
            .unwrap();
        let client = ca
            .issue_client_cert("firebuild-cli", &["localhost".to_owned()], Duration::from_secs(3600))
            .unwrap();
        assert!(server.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(client.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_ne!(server.cert_pem, client.cert_pem);
    }

    #[test]
    fn intermediate_shares_serial_counter_with_root() {
        let root = Ca::new_root("firebuild-root").unwrap();
        let intermediate = root.issue_intermediate("firebuild-intermediate").unwrap();
        let a = intermediate
            .issue_server_cert("a", &[], Duration::from_secs(60))
            .unwrap();
        let b = root.issue_server_cert("b", &[], Duration::from_secs(60)).unwrap();
        assert_ne!(a.cert_pem, b.cert_pem);
    }
}
