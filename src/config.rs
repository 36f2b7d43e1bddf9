//! Configuration for archive-relay
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// archive-relay - chunked archive transfer over NATS
#[derive(Parser, Debug, Clone)]
#[command(name = "archive-relay")]
#[command(about = "Uploads and downloads archives as ordered NATS message streams")]
pub struct Args {
    /// Unique node identifier for this relay instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (dev JWT secret, in-memory fallbacks)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "storage-api")]
    pub mongodb_db: String,

    /// PEM public key of the auth service that signs bearer tokens (required in production)
    #[arg(long, env = "AUTH_PUBLIC_KEY")]
    pub auth_public_key: Option<String>,

    /// Browser origin allowed to call the HTTP routes with credentials (required in production)
    #[arg(long, env = "FRONTEND_ORIGIN")]
    pub frontend_origin: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Base directory for archive bytes (<path>/<owner>/<archive>)
    #[arg(long, env = "STORAGE_PATH", default_value = "./archives")]
    pub storage_path: PathBuf,

    /// Size of each data segment emitted on the download stream
    #[arg(long, env = "DOWNLOAD_SEGMENT_BYTES", default_value = "65536")]
    pub download_segment_bytes: usize,

    /// Order number clients assign to the first data chunk (0 or 1)
    #[arg(long, env = "ORDER_BASE", default_value = "0")]
    pub order_base: u64,

    /// Abort uploads with no activity for this many seconds (disabled when unset)
    #[arg(long, env = "UPLOAD_IDLE_TIMEOUT_SECS")]
    pub upload_idle_timeout_secs: Option<u64>,

    /// How often the reaper scans for idle uploads and orphan lanes, in seconds
    #[arg(long, env = "REAPER_INTERVAL_SECS", default_value = "60")]
    pub reaper_interval_secs: u64,
}

/// NATS connection and topology configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,

    /// JetStream stream holding all archive transfer subjects
    #[arg(long, env = "STREAM_NAME", default_value = "ARCHIVE_TRANSFER")]
    pub stream_name: String,

    /// Durable consumer name for the upload stream
    #[arg(long, env = "CONSUMER_NAME", default_value = "storage-api-group")]
    pub consumer_name: String,

    /// Subject clients publish upload chunks to
    #[arg(long, env = "UPLOAD_STREAM_SUBJECT", default_value = "upload-stream")]
    pub upload_subject: String,

    /// Subject upload acknowledgements are published to
    #[arg(long, env = "UPLOAD_ACK_SUBJECT", default_value = "upload-acknowledge")]
    pub ack_subject: String,

    /// Subject download frames are published to
    #[arg(long, env = "DOWNLOAD_SUBJECT", default_value = "download-stream")]
    pub download_subject: String,

    /// Maximum unacknowledged upload messages in flight
    #[arg(long, env = "MAX_ACK_PENDING", default_value = "256")]
    pub max_ack_pending: i64,

    /// Seconds JetStream waits for an ack before redelivering an upload message
    #[arg(long, env = "ACK_WAIT_SECS", default_value = "30")]
    pub ack_wait_secs: u64,
}

impl NatsArgs {
    /// All subjects carried by the transfer stream
    pub fn subjects(&self) -> Vec<String> {
        vec![
            self.upload_subject.clone(),
            self.ack_subject.clone(),
            self.download_subject.clone(),
        ]
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

impl Args {
    /// Allowed CORS origin; any origin in dev mode when unset
    pub fn cors_origin(&self) -> String {
        match &self.frontend_origin {
            Some(origin) => origin.clone(),
            None => "*".to_string(),
        }
    }

    /// Idle timeout for the upload reaper, if enabled
    pub fn upload_idle_timeout(&self) -> Option<Duration> {
        self.upload_idle_timeout_secs.map(Duration::from_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.auth_public_key.is_none() {
            return Err("AUTH_PUBLIC_KEY is required in production mode".to_string());
        }

        if !self.dev_mode && self.frontend_origin.is_none() {
            return Err("FRONTEND_ORIGIN is required in production mode".to_string());
        }

        if self.download_segment_bytes == 0 {
            return Err("DOWNLOAD_SEGMENT_BYTES must be greater than zero".to_string());
        }

        if self.order_base > 1 {
            return Err("ORDER_BASE must be 0 or 1".to_string());
        }

        if self.reaper_interval_secs == 0 {
            return Err("REAPER_INTERVAL_SECS must be greater than zero".to_string());
        }

        if self.nats.ack_wait_secs < 2 {
            return Err("ACK_WAIT_SECS must be at least 2".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["archive-relay"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--dev-mode"]);
        assert_eq!(args.download_segment_bytes, 65536);
        assert_eq!(args.order_base, 0);
        assert_eq!(args.nats.upload_subject, "upload-stream");
        assert!(args.upload_idle_timeout().is_none());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_production_requires_auth_key_and_origin() {
        let args = parse(&[]);
        assert!(args.validate().is_err());

        let args = parse(&["--auth-public-key", "pem"]);
        assert!(args.validate().is_err());

        let args = parse(&[
            "--auth-public-key",
            "pem",
            "--frontend-origin",
            "https://app.example.com",
        ]);
        assert!(args.validate().is_ok());
        assert_eq!(args.cors_origin(), "https://app.example.com");
    }

    #[test]
    fn test_rejects_bad_order_base() {
        let args = parse(&["--dev-mode", "--order-base", "2"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_dev_mode_allows_any_origin() {
        let args = parse(&["--dev-mode"]);
        assert_eq!(args.cors_origin(), "*");
    }

    #[test]
    fn test_ack_wait() {
        let args = parse(&["--dev-mode", "--ack-wait-secs", "45"]);
        assert_eq!(args.nats.ack_wait(), Duration::from_secs(45));

        let args = parse(&["--dev-mode", "--ack-wait-secs", "1"]);
        assert!(args.validate().is_err());
    }
}
