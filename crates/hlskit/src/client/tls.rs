use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use sha2::{Digest, Sha256};

use crate::error::{HlsError, HlsResult};

/// Accepts any server whose leaf certificate has the given SHA-256
/// fingerprint, regardless of the certificate chain.
#[derive(Debug)]
struct FingerprintVerifier {
    fingerprint: [u8; 32],
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(
                expected = hex::encode(self.fingerprint),
                actual = hex::encode(digest),
                "server fingerprint doesn't match"
            );
            Err(rustls::Error::General(
                "server fingerprint doesn't match".to_string(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Parses a hex encoded SHA-256 fingerprint. Colons are allowed between
/// bytes.
pub(crate) fn parse_fingerprint(fingerprint: &str) -> HlsResult<[u8; 32]> {
    let cleaned: String = fingerprint.chars().filter(|c| *c != ':').collect();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| HlsError::InvalidFingerprint(format!("{fingerprint}: {e}")))?;
    bytes.try_into().map_err(|_| {
        HlsError::InvalidFingerprint(format!("{fingerprint}: expected 32 bytes"))
    })
}

/// A reqwest client that trusts only the server with the given fingerprint.
pub(crate) fn pinned_client(fingerprint: &str) -> HlsResult<reqwest::Client> {
    let provider = Arc::new(ring::default_provider());
    let verifier = FingerprintVerifier {
        fingerprint: parse_fingerprint(fingerprint)?,
        provider: provider.clone(),
    };
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fingerprint() -> HlsResult<()> {
        let hex = "33949e05fffb5ff3e8aa16f8213a6251b4d9363804ba53233c4da9a46d6f2739";
        let parsed = parse_fingerprint(hex)?;
        assert_eq!(parsed[0], 0x33);
        assert_eq!(parsed[31], 0x39);

        let with_colons = hex
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(parse_fingerprint(&with_colons)?, parsed);

        assert!(parse_fingerprint("abcd").is_err());
        assert!(parse_fingerprint("not hex").is_err());
        Ok(())
    }

    #[test]
    fn test_pinned_client() -> HlsResult<()> {
        pinned_client("33949e05fffb5ff3e8aa16f8213a6251b4d9363804ba53233c4da9a46d6f2739")?;
        Ok(())
    }
}
