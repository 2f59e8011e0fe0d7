//! Virus scanning gate consulted before anything is persisted

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{ScannerConfig, ScannerKind};
use crate::error::{Error, Result};

/// The EICAR anti-virus test string
pub const EICAR_SIGNATURE: &[u8] =
    b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

/// Scan outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "signature", rename_all = "lowercase")]
pub enum ScanVerdict {
    Clean,
    Infected(String),
}

/// Trait for virus scanners
///
/// An `Err` means no verdict could be reached (scanner unreachable); the
/// caller decides whether that blocks the upload.
#[async_trait]
pub trait VirusScanner: Send + Sync {
    async fn scan(&self, data: &[u8], filename: &str) -> Result<ScanVerdict>;

    /// False for the explicit no-scan mode
    fn is_enabled(&self) -> bool {
        true
    }

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Explicitly disabled scanning
pub struct DisabledScanner;

#[async_trait]
impl VirusScanner for DisabledScanner {
    async fn scan(&self, _data: &[u8], filename: &str) -> Result<ScanVerdict> {
        tracing::warn!(filename, "Virus scanning disabled; accepting upload unscanned");
        Ok(ScanVerdict::Clean)
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// Matches raw byte signatures
pub struct SignatureScanner {
    signatures: Vec<(String, Vec<u8>)>,
}

impl SignatureScanner {
    /// Scanner that knows only the EICAR test signature
    pub fn new() -> Self {
        Self {
            signatures: vec![("EICAR-Test-File".to_string(), EICAR_SIGNATURE.to_vec())],
        }
    }

    /// Add a named byte signature
    pub fn with_signature(mut self, name: impl Into<String>, pattern: Vec<u8>) -> Self {
        if !pattern.is_empty() {
            self.signatures.push((name.into(), pattern));
        }
        self
    }

    /// Build from hex-encoded signatures in config
    pub fn from_hex_signatures(hex_signatures: &[String]) -> Result<Self> {
        let mut scanner = Self::new();
        for (i, sig) in hex_signatures.iter().enumerate() {
            let pattern = hex::decode(sig.trim())
                .map_err(|e| Error::Config(format!("Invalid scanner signature {}: {}", i, e)))?;
            scanner = scanner.with_signature(format!("custom-{}", i), pattern);
        }
        Ok(scanner)
    }
}

impl Default for SignatureScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VirusScanner for SignatureScanner {
    async fn scan(&self, data: &[u8], _filename: &str) -> Result<ScanVerdict> {
        for (name, pattern) in &self.signatures {
            if data.windows(pattern.len()).any(|w| w == pattern.as_slice()) {
                return Ok(ScanVerdict::Infected(name.clone()));
            }
        }
        Ok(ScanVerdict::Clean)
    }

    fn name(&self) -> &str {
        "signature"
    }
}

#[derive(Deserialize)]
struct HttpScanResponse {
    infected: bool,
    #[serde(default)]
    signature: Option<String>,
}

/// Remote scanning service
///
/// POSTs the raw bytes and expects `{"infected": bool, "signature": "..."}`.
pub struct HttpScanner {
    client: Client,
    endpoint: String,
}

impl HttpScanner {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl VirusScanner for HttpScanner {
    async fn scan(&self, data: &[u8], filename: &str) -> Result<ScanVerdict> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("filename", filename)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Error::transient(format!("Scanner unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "Scanner returned {}",
                response.status()
            )));
        }

        let body: HttpScanResponse = response
            .json()
            .await
            .map_err(|e| Error::transient(format!("Unreadable scanner response: {}", e)))?;

        Ok(if body.infected {
            ScanVerdict::Infected(body.signature.unwrap_or_else(|| "unknown".to_string()))
        } else {
            ScanVerdict::Clean
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Build the scanner selected in config
pub fn from_config(config: &ScannerConfig) -> Result<Box<dyn VirusScanner>> {
    Ok(match config.kind {
        ScannerKind::Disabled => {
            tracing::warn!("Virus scanning is DISABLED; uploads will not be scanned");
            Box::new(DisabledScanner)
        }
        ScannerKind::Signature => Box::new(SignatureScanner::from_hex_signatures(&config.signatures)?),
        ScannerKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| Error::Config("scanner.endpoint is required".into()))?;
            Box::new(HttpScanner::new(endpoint, Duration::from_secs(config.timeout_secs))?)
        }
    })
}
