use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::Result;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  KeyPair, KeyUsagePurpose, SanType,
};
use rsa::{
  pkcs8::{EncodePrivateKey, LineEnding},
  RsaPrivateKey,
};
use time::{Duration, OffsetDateTime};

pub const CA_VALIDITY_DAYS: i64 = 3650;
pub const LEAF_VALIDITY_DAYS: i64 = 365;

pub const CA_KEY_BITS: usize = 4096;
pub const LEAF_KEY_BITS: usize = 2048;

/// The PEM bundle a node persists after formation
///
/// The CA is identical across the cluster; the server certificate is the
/// node's own leaf, signed by that CA and bound to its bind IP.
#[derive(Clone, Debug)]
pub struct TrustMaterial {
  pub ca_cert_pem: String,
  pub ca_key_pem: String,
  pub server_cert_pem: String,
  pub server_key_pem: String,
}

#[derive(Clone, Debug)]
pub struct ServerCertificate {
  pub cert_pem: String,
  pub key_pem: String,
}

/// Cluster-wide root of trust
///
/// Generated once by the formation initiator. The key travels to joiners in
/// the formation status response so every node can sign its own leaf locally.
pub struct CertificateAuthority {
  cert: rcgen::Certificate,
  key: KeyPair,
}

impl CertificateAuthority {
  /// Self-signed RSA root, valid for ten years
  pub fn generate(cluster_name: &str, bits: usize) -> Result<Self> {
    let key = rsa_key_pair(bits)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&format!("{cluster_name} root CA"));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let cert = params.self_signed(&key)?;
    Ok(Self { cert, key })
  }

  /// Rebuild signing capability from the PEM pair distributed at formation
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key = KeyPair::from_pem(key_pem)?;
    let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
    let cert = params.self_signed(&key)?;
    Ok(Self { cert, key })
  }

  pub fn cert_pem(&self) -> String {
    self.cert.pem()
  }

  pub fn key_pem(&self) -> String {
    self.key.serialize_pem()
  }

  /// Issue a one-year server leaf bound to the given IPs
  ///
  /// `127.0.0.1` and `::1` are always present in the SANs; extras are
  /// deduplicated and junk (empty, unparsable, `0.0.0.0`) is dropped.
  pub fn issue_server_cert(
    &self,
    common_name: &str,
    extra_ips: &[String],
    bits: usize,
  ) -> Result<ServerCertificate> {
    let key = rsa_key_pair(bits)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    for ip in san_ips(extra_ips) {
      params.subject_alt_names.push(SanType::IpAddress(ip));
    }

    let cert = params.signed_by(&key, &self.cert, &self.key)?;
    Ok(ServerCertificate {
      cert_pem: cert.pem(),
      key_pem: key.serialize_pem(),
    })
  }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
  let mut dn = DistinguishedName::new();
  dn.push(DnType::OrganizationName, "Hive");
  dn.push(DnType::CommonName, common_name);
  dn
}

/// rcgen cannot generate RSA keys itself, so the key material comes from the
/// rsa crate and crosses over as PKCS#8 PEM
fn rsa_key_pair(bits: usize) -> Result<KeyPair> {
  let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
  let pem = key.to_pkcs8_pem(LineEnding::LF)?;
  Ok(KeyPair::from_pem(&pem)?)
}

fn san_ips(extra: &[String]) -> Vec<IpAddr> {
  let mut ips = vec![
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
  ];

  for raw in extra {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
      continue;
    }
    let Ok(ip) = trimmed.parse::<IpAddr>() else {
      continue;
    };
    if ip.is_unspecified() || ips.contains(&ip) {
      continue;
    }
    ips.push(ip);
  }

  ips
}
