// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::fmt;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use nodewarden_core::constants::MAX_INFLATED_CARVE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LoggerKind {
    None,
    Stdout,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CarverKind {
    Local,
    Db,
    S3,
}

#[derive(Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct ServiceOptions {
    #[arg(long, default_value = "127.0.0.1", env("NODEWARDEN_HTTP_HOST"))]
    pub host: String,
    #[arg(long, default_value = "8080", env("NODEWARDEN_HTTP_PORT"))]
    pub port: u16,
    #[arg(long, value_enum, default_value = "stdout", env("NODEWARDEN_LOGGER"))]
    pub logger: LoggerKind,
    #[arg(long, default_value = "nodewarden-nodes.log", env("NODEWARDEN_LOGGER_FILE"))]
    pub logger_file: PathBuf,
    #[arg(long, value_enum, default_value = "db", env("NODEWARDEN_CARVER"))]
    pub carver: CarverKind,
    #[arg(long, default_value = "carves", env("NODEWARDEN_CARVER_DIR"))]
    pub carver_dir: PathBuf,
    #[arg(
        long,
        default_value = "false",
        env("NODEWARDEN_CARVER_DECOMPRESS"),
        action = ArgAction::SetTrue
    )]
    pub carver_decompress: bool,
    /// Largest size in bytes a gzip carve may inflate to
    #[arg(long, default_value_t = MAX_INFLATED_CARVE_SIZE, env("NODEWARDEN_CARVER_MAX_INFLATED"))]
    pub carver_max_inflated: u64,
    #[arg(long, env("NODEWARDEN_CARVER_S3_BUCKET"))]
    pub carver_s3_bucket: Option<String>,
    #[arg(long, env("NODEWARDEN_CARVER_S3_REGION"))]
    pub carver_s3_region: Option<String>,
    #[arg(long, env("NODEWARDEN_CARVER_S3_KEY_ID"))]
    pub carver_s3_key_id: Option<String>,
    #[arg(long, env("NODEWARDEN_CARVER_S3_SECRET"))]
    pub carver_s3_secret: Option<String>,
    /// JSON file with initial environments, settings, nodes and queries
    #[arg(long, env("NODEWARDEN_SEED_FILE"))]
    pub seed_file: Option<PathBuf>,
    #[arg(
        long,
        default_value = "false",
        env("NODEWARDEN_SKIP_REFRESH"),
        action = ArgAction::SetTrue
    )]
    pub skip_refresh: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            host: "127.0.0.1".to_string(),
            port: 8080,
            logger: LoggerKind::None,
            logger_file: PathBuf::from("nodewarden-nodes.log"),
            carver: CarverKind::Db,
            carver_dir: PathBuf::from("carves"),
            carver_decompress: false,
            carver_max_inflated: MAX_INFLATED_CARVE_SIZE,
            carver_s3_bucket: None,
            carver_s3_region: None,
            carver_s3_key_id: None,
            carver_s3_secret: None,
            seed_file: None,
            skip_refresh: true,
        }
    }
}

// Custom Debug implementation so startup logging never prints the S3 secret
impl fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("logger", &self.logger)
            .field("logger_file", &self.logger_file)
            .field("carver", &self.carver)
            .field("carver_dir", &self.carver_dir)
            .field("carver_decompress", &self.carver_decompress)
            .field("carver_max_inflated", &self.carver_max_inflated)
            .field("carver_s3_bucket", &self.carver_s3_bucket)
            .field("carver_s3_region", &self.carver_s3_region)
            .field("carver_s3_key_id", &self.carver_s3_key_id)
            .field(
                "carver_s3_secret",
                &self.carver_s3_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("seed_file", &self.seed_file)
            .field("skip_refresh", &self.skip_refresh)
            .finish()
    }
}
