use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Certificate;

/// Load root certificates to trust from `path`. PEM files may hold a whole
/// bundle; anything not PEM-armoured is read as a single DER certificate.
pub fn load_ca_certificates(path: &Path) -> Result<Vec<Certificate>> {
	let bytes = std::fs::read(path).with_context(|| format!("opening CA file {}", path.display()))?;

	if looks_like_pem(&bytes) {
		let certs = Certificate::from_pem_bundle(&bytes)
			.with_context(|| format!("parsing PEM certificates in {}", path.display()))?;
		if certs.is_empty() {
			anyhow::bail!("no certificates found in {}", path.display());
		}
		return Ok(certs);
	}

	let cert = Certificate::from_der(&bytes)
		.with_context(|| format!("parsing DER certificate {}", path.display()))?;
	Ok(vec![cert])
}

fn looks_like_pem(bytes: &[u8]) -> bool {
	String::from_utf8_lossy(bytes).contains("-----BEGIN")
}
