//! Command line interface.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Overrides;

/// SAML authenticating reverse proxy.
#[derive(Parser, Debug)]
#[command(name = "samlgate", about = "SAML authenticating reverse proxy", version)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SAMLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend URL; repeat for several backends
    #[arg(short, long = "target", value_name = "URL")]
    pub targets: Vec<String>,

    /// Externally visible root URL of this gateway
    #[arg(long, value_name = "URL")]
    pub service_root_url: Option<String>,

    /// Service provider certificate (PEM)
    #[arg(long, value_name = "FILE")]
    pub service_certificate: Option<PathBuf>,

    /// Service provider private key (PEM)
    #[arg(long, value_name = "FILE")]
    pub service_key: Option<PathBuf>,

    /// Identity provider metadata (XML)
    #[arg(long, value_name = "FILE")]
    pub idp_metadata: Option<PathBuf>,

    /// Certificate for serving HTTPS (PEM)
    #[arg(long, value_name = "FILE")]
    pub https_certificate: Option<PathBuf>,

    /// Private key for serving HTTPS (PEM)
    #[arg(long, value_name = "FILE")]
    pub https_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            targets: self.targets.clone(),
            service_root_url: self.service_root_url.clone(),
            service_certificate: self.service_certificate.clone(),
            service_key: self.service_key.clone(),
            idp_metadata: self.idp_metadata.clone(),
            https_certificate: self.https_certificate.clone(),
            https_key: self.https_key.clone(),
            log_level: self.log_level.clone(),
        }
    }
}
