//! Node configuration: a `clap` CLI overlay on top of `config`-loaded
//! defaults and environment variables, the way `engine/src/settings.rs`
//! layers `config::Config` under its own CLI flags.

use std::collections::BTreeMap;

use clap::Args;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigHsmMode {
    Demo,
    Production,
}

impl From<ConfigHsmMode> for mpc_core::HsmMode {
    fn from(m: ConfigHsmMode) -> Self {
        match m {
            ConfigHsmMode::Demo => mpc_core::HsmMode::Demo,
            ConfigHsmMode::Production => mpc_core::HsmMode::Production,
        }
    }
}

/// Everything a node needs to run: identity, storage, transport, HSM
/// credentials, and the ceremony's participant set.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub data_dir: String,
    pub mailbox_url: String,
    pub hsm_pin: String,
    pub mode: ConfigHsmMode,
    pub threshold: usize,
    /// node_id -> index, bijective, all indices nonzero.
    pub participants: BTreeMap<String, u32>,
    /// PKCS#11 module path, e.g. SoftHSM's `libsofthsm2.so` in demo/test
    /// deployments, or the vendor's PKCS#11 module in production.
    pub pkcs11_module_path: String,
    pub pkcs11_slot: u64,
}

impl NodeConfig {
    /// Assembled from (lowest to highest precedence) `config/default.toml`
    /// if present, `NODE_` environment variables, and CLI flags.
    pub fn load(cli: &CliOverrides) -> Result<Self, NodeError> {
        let mut builder = Config::builder();
        if std::path::Path::new("config/default.toml").exists() {
            builder = builder.add_source(File::with_name("config/default"));
        }
        builder = builder.add_source(Environment::with_prefix("NODE").separator("__"));

        if let Some(v) = &cli.node_id {
            builder = builder.set_override("node_id", v.clone())?;
        }
        if let Some(v) = &cli.data_dir {
            builder = builder.set_override("data_dir", v.clone())?;
        }
        if let Some(v) = &cli.mailbox_url {
            builder = builder.set_override("mailbox_url", v.clone())?;
        }

        let config = builder.build()?;
        let node_config: NodeConfig = config.try_deserialize()?;

        if node_config.hsm_pin.len() < 8 {
            return Err(NodeError::Config(
                "hsm_pin must be at least 8 characters; generate one with a CSPRNG".to_string(),
            ))
        }
        if !node_config.participants.contains_key(&node_config.node_id) {
            return Err(NodeError::Config(format!(
                "participants does not include this node's own id {:?}",
                node_config.node_id
            )))
        }
        if node_config.threshold == 0 || node_config.threshold > node_config.participants.len() {
            return Err(NodeError::Config(format!(
                "threshold {} is not in range (0, {}]",
                node_config.threshold,
                node_config.participants.len()
            )))
        }

        Ok(node_config)
    }
}

/// CLI-level overrides that take precedence over file/env configuration.
/// Kept deliberately small: most configuration is operational and belongs
/// in the environment, not retyped on every invocation.
#[derive(Debug, Args, Default)]
pub struct CliOverrides {
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<String>,
    #[arg(long, env = "MAILBOX_URL")]
    pub mailbox_url: Option<String>,
}
