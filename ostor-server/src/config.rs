//! 配置相关的结构：可选的 TOML 文件，由命令行参数覆盖。
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8080;
/// gRPC 消息大小上限，单位 MiB。
pub const DEFAULT_MAX_MSG_SIZE: i64 = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub meta_dir: PathBuf,
    /// profiling HTTP 端点地址，为空时关闭。
    pub profile_addr: String,
    pub no_auth: bool,
    /// 单位 MiB。
    pub max_msg_size: i64,
    pub async_write: bool,
    pub debug: bool,
    /// list pipeline 通道容量，非正数时使用默认值。
    pub job_count: i64,
    /// 用于校验 token 的 PEM 编码 ES384 公钥。
    pub jwt_public_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: PathBuf::from(".db/data"),
            meta_dir: PathBuf::from(".db/meta"),
            profile_addr: String::new(),
            no_auth: false,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            async_write: false,
            debug: false,
            job_count: 0,
            jwt_public_key: None,
        }
    }
}

/// 应用默认值之后由 [`ServerConfig`] 得出的配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_msg_bytes: usize,
    pub job_count: usize,
}

pub fn default_job_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

impl ServerConfig {
    pub fn sanitize(&self) -> Limits {
        let mib = if self.max_msg_size > 0 {
            self.max_msg_size
        } else {
            DEFAULT_MAX_MSG_SIZE
        };
        let job_count = if self.job_count > 0 {
            self.job_count as usize
        } else {
            default_job_count()
        };
        Limits {
            max_msg_bytes: (mib as usize).saturating_mul(1024 * 1024),
            job_count,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "ostord", about = "Multi-tenant object storage server")]
pub struct Cli {
    /// TOML file supplying defaults for every other flag
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Port to bind the gRPC server on
    #[arg(long)]
    pub port: Option<u16>,
    /// Directory holding the table and blob files
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Directory holding the write-ahead log and manifest
    #[arg(long)]
    pub meta_dir: Option<PathBuf>,
    /// Serve profiling data over HTTP on this address
    #[arg(long)]
    pub profile_addr: Option<String>,
    /// Disable token verification, never use in production
    #[arg(long)]
    pub no_auth: bool,
    /// Maximum message size in MiB
    #[arg(long)]
    pub max_msg_size: Option<i64>,
    /// Do not fsync every write
    #[arg(long)]
    pub async_write: bool,
    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
    /// Capacity of the list pipeline
    #[arg(long)]
    pub job_count: Option<i64>,
    /// PEM file with the ES384 public key of the token issuer
    #[arg(long)]
    pub jwt_public_key: Option<PathBuf>,
}

impl Cli {
    /// 加载配置文件（如有），再叠加命令行参数。
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let mut cfg = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        self.apply(&mut cfg);
        Ok(cfg)
    }

    fn apply(self, cfg: &mut ServerConfig) {
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(dir) = self.data_dir {
            cfg.data_dir = dir;
        }
        if let Some(dir) = self.meta_dir {
            cfg.meta_dir = dir;
        }
        if let Some(addr) = self.profile_addr {
            cfg.profile_addr = addr;
        }
        if let Some(size) = self.max_msg_size {
            cfg.max_msg_size = size;
        }
        if let Some(jobs) = self.job_count {
            cfg.job_count = jobs;
        }
        if let Some(key) = self.jwt_public_key {
            cfg.jwt_public_key = Some(key);
        }
        // 布尔参数只能开启某项设置
        cfg.no_auth |= self.no_auth;
        cfg.async_write |= self.async_write;
        cfg.debug |= self.debug;
    }
}
