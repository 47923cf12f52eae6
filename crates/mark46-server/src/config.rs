use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the signaling server.
#[derive(Parser, Debug, Clone)]
#[command(name = "mark46s")]
#[command(about = "MARK-46 signaling server")]
#[command(version)]
pub struct Args {
    /// Host address to listen on.
    #[arg(long, default_value = "0.0.0.0", env = "MARK46_HOST")]
    pub host: String,
    /// TCP port to listen on.
    #[arg(long, default_value = "8046", env = "MARK46_PORT")]
    pub port: u16,
    /// Terminate TLS on the listener.
    #[arg(long, env = "MARK46_TLS")]
    pub tls: bool,
    /// Path to the TLS certificate chain (required with --tls).
    #[arg(long, env = "MARK46_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,
    /// Path to the TLS private key (required with --tls).
    #[arg(long, env = "MARK46_TLS_KEY")]
    pub tls_key: Option<PathBuf>,
    /// Maximum assembled message size in bytes. 0 disables the check.
    #[arg(long, default_value = "1048576", env = "MARK46_MAX_PAYLOAD")]
    pub max_payload: u64,
    /// Maximum number of connected clients.
    #[arg(long, default_value = "1024", env = "MARK46_MAX_CLIENTS")]
    pub max_clients: u32,
    /// Seconds an unauthenticated connection may stay open.
    #[arg(long, default_value = "7", env = "MARK46_VERIFY_TIMEOUT")]
    pub verify_timeout: u64,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9046", env = "MARK46_METRICS")]
    pub metrics_addr: SocketAddr,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to listen on.
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Terminate TLS on the listener.
    pub tls: bool,
    /// Path to the TLS certificate chain.
    pub tls_cert: Option<PathBuf>,
    /// Path to the TLS private key.
    pub tls_key: Option<PathBuf>,
    /// Maximum assembled message size in bytes. 0 disables the check.
    pub max_payload: u64,
    /// Maximum number of connected clients.
    pub max_clients: u32,
    /// Seconds an unauthenticated connection may stay open.
    pub verify_timeout: u64,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
}

impl ServerConfig {
    /// The verify deadline as a [`Duration`].
    #[must_use]
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first violated bound.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be greater than 0".to_string());
        }

        if self.max_clients == 0 {
            return Err("max_clients must be greater than 0".to_string());
        }
        if self.max_clients > 1_000_000 {
            return Err("max_clients exceeds reasonable limit (1,000,000)".to_string());
        }

        // 0 disables the payload check entirely.
        const MAX_ALLOWED_PAYLOAD: u64 = 1 << 30;
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_PAYLOAD
            ));
        }

        if self.verify_timeout == 0 {
            return Err("verify_timeout must be greater than 0".to_string());
        }
        if self.verify_timeout > 300 {
            return Err("verify_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.tls {
            if self.tls_cert.is_none() {
                return Err("tls requires tls_cert".to_string());
            }
            if self.tls_key.is_none() {
                return Err("tls requires tls_key".to_string());
            }
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            tls: args.tls,
            tls_cert: args.tls_cert,
            tls_key: args.tls_key,
            max_payload: args.max_payload,
            max_clients: args.max_clients,
            verify_timeout: args.verify_timeout,
            metrics_addr: args.metrics_addr,
        }
    }
}
