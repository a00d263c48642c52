// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Configuration management for IPCP instances
//!
//! Supports both command-line arguments and TOML configuration files.
//! A file, when given, provides everything except the number of demo
//! members and the log level.

use crate::error::{IpcpError, SerializationError};
use crate::pci::DtConstants;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for local delivery descriptors
pub const MAX_RESERVED_FDS: usize = 1 << 16;

/// Command-line arguments for the IPCP
#[derive(Parser, Debug)]
#[command(name = "ari-normal")]
#[command(author = "ARI Contributors")]
#[command(version = "0.1.0")]
#[command(about = "RINA normal IPC Process", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file (overrides name and DIF name)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Base IPCP name; members are named <NAME>-<N>
    #[arg(long, value_name = "NAME", default_value = "ipcp")]
    pub name: String,

    /// DIF name
    #[arg(long, value_name = "DIF", default_value = "normal.DIF")]
    pub dif_name: String,

    /// Number of IPCPs in the in-memory DIF
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub members: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    pub ipcp: IpcpConfig,
    pub dif: DifConfig,
    #[serde(default)]
    pub dt: DtConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
}

/// IPCP section of config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcpConfig {
    pub name: String,
}

/// DIF section of config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifConfig {
    pub name: String,
    /// Address of the bootstrapping IPCP
    #[serde(default = "default_bootstrap_address")]
    pub bootstrap_address: u64,
    /// Addresses handed out to enrolling IPCPs
    #[serde(default = "default_pool_start")]
    pub address_pool_start: u64,
    #[serde(default = "default_pool_end")]
    pub address_pool_end: u64,
}

fn default_bootstrap_address() -> u64 {
    1
}

fn default_pool_start() -> u64 {
    2
}

fn default_pool_end() -> u64 {
    254
}

/// Data-transfer section of config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DtConfig {
    pub addr_size: u8,
    pub cep_id_size: u8,
    pub pdu_length_size: u8,
    pub seqno_size: u8,
    pub ttl_size: u8,
    pub chk_size: u8,
    pub min_pdu_size: u32,
    pub max_pdu_size: u32,
    /// TTL set on PDUs originated by this IPCP
    pub default_ttl: u64,
    /// Number of local delivery descriptors
    pub reserved_fds: usize,
}

impl Default for DtConfig {
    fn default() -> Self {
        let dtc = DtConstants::default();
        Self {
            addr_size: dtc.addr_size,
            cep_id_size: dtc.cep_id_size,
            pdu_length_size: dtc.pdu_length_size,
            seqno_size: dtc.seqno_size,
            ttl_size: dtc.ttl_size,
            chk_size: dtc.chk_size,
            min_pdu_size: dtc.min_pdu_size,
            max_pdu_size: dtc.max_pdu_size,
            default_ttl: 60,
            reserved_fds: 16,
        }
    }
}

impl DtConfig {
    pub fn constants(&self) -> DtConstants {
        DtConstants {
            addr_size: self.addr_size,
            cep_id_size: self.cep_id_size,
            pdu_length_size: self.pdu_length_size,
            seqno_size: self.seqno_size,
            ttl_size: self.ttl_size,
            chk_size: self.chk_size,
            min_pdu_size: self.min_pdu_size,
            max_pdu_size: self.max_pdu_size,
        }
    }
}

/// Enrollment section of config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentConfig {
    /// Timeout for a single enrollment attempt (seconds)
    #[serde(default = "default_enrollment_timeout")]
    pub timeout_secs: u64,
    /// Maximum number of attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff duration in milliseconds (doubles on each retry)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_enrollment_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_enrollment_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

/// Unified configuration after parsing CLI or file
#[derive(Debug, Clone)]
pub struct IpcpConfiguration {
    pub name: String,
    pub dif_name: String,
    pub members: usize,
    pub bootstrap_address: u64,
    pub address_pool_start: u64,
    pub address_pool_end: u64,
    pub dt: DtConfig,
    pub enrollment_timeout_secs: u64,
    pub enrollment_max_retries: u32,
    pub enrollment_initial_backoff_ms: u64,
}

impl Default for IpcpConfiguration {
    fn default() -> Self {
        Self {
            name: "ipcp".to_string(),
            dif_name: "normal.DIF".to_string(),
            members: 3,
            bootstrap_address: default_bootstrap_address(),
            address_pool_start: default_pool_start(),
            address_pool_end: default_pool_end(),
            dt: DtConfig::default(),
            enrollment_timeout_secs: default_enrollment_timeout(),
            enrollment_max_retries: default_max_retries(),
            enrollment_initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

impl IpcpConfiguration {
    /// Creates configuration from command-line arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self, IpcpError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self {
                name: args.name.clone(),
                dif_name: args.dif_name.clone(),
                ..Self::default()
            },
        };
        config.members = args.members;

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, IpcpError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| IpcpError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parses configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, IpcpError> {
        let config: TomlConfig = toml::from_str(contents).map_err(SerializationError::from)?;

        Ok(Self {
            name: config.ipcp.name,
            dif_name: config.dif.name,
            members: 3,
            bootstrap_address: config.dif.bootstrap_address,
            address_pool_start: config.dif.address_pool_start,
            address_pool_end: config.dif.address_pool_end,
            dt: config.dt,
            enrollment_timeout_secs: config.enrollment.timeout_secs,
            enrollment_max_retries: config.enrollment.max_retries,
            enrollment_initial_backoff_ms: config.enrollment.initial_backoff_ms,
        })
    }

    /// Rejects configurations no DIF can run with
    pub fn validate(&self) -> Result<(), IpcpError> {
        if self.name.is_empty() {
            return Err("IPCP name must not be empty".into());
        }
        if self.members == 0 {
            return Err("At least one member is required".into());
        }

        let dtc = self.dt.constants();
        dtc.validate()
            .map_err(|e| IpcpError::Config(e.to_string()))?;

        if dtc.ttl_size > 0 && (self.dt.default_ttl == 0 || self.dt.default_ttl > dtc.max_ttl()) {
            return Err(IpcpError::Config(format!(
                "default_ttl {} does not fit a {} byte TTL",
                self.dt.default_ttl, dtc.ttl_size
            )));
        }
        if self.dt.reserved_fds == 0 || self.dt.reserved_fds > MAX_RESERVED_FDS {
            return Err(IpcpError::Config(format!(
                "reserved_fds must lie in 1..={MAX_RESERVED_FDS}"
            )));
        }

        if self.address_pool_start > self.address_pool_end {
            return Err("Address pool is empty".into());
        }
        if self.address_pool_end > dtc.max_addr() || self.bootstrap_address > dtc.max_addr() {
            return Err(IpcpError::Config(format!(
                "Addresses must fit in {} bytes",
                dtc.addr_size
            )));
        }
        if (self.address_pool_start..=self.address_pool_end).contains(&self.bootstrap_address) {
            return Err("Bootstrap address lies inside the address pool".into());
        }

        if self.enrollment_max_retries == 0 {
            return Err("enrollment max_retries must be at least 1".into());
        }

        Ok(())
    }

    /// Configuration of the `index`th IPCP of the DIF
    pub fn member(&self, index: usize) -> Self {
        Self {
            name: format!("{}-{}", self.name, index),
            ..self.clone()
        }
    }

    pub fn enrollment_timeout(&self) -> Duration {
        Duration::from_secs(self.enrollment_timeout_secs)
    }

    /// Prints configuration summary
    pub fn print_summary(&self) {
        println!("=== IPCP Configuration ===");
        println!("Name: {}", self.name);
        println!("DIF: {}", self.dif_name);
        println!("Members: {}", self.members);
        println!("Bootstrap Address: {}", self.bootstrap_address);
        println!(
            "Address Pool: {}-{}",
            self.address_pool_start, self.address_pool_end
        );
        println!(
            "PCI: addr {}B, cep-id {}B, ttl {}B, seqno {}B",
            self.dt.addr_size, self.dt.cep_id_size, self.dt.ttl_size, self.dt.seqno_size
        );
        println!();
    }
}
