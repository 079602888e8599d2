use icbmsg_core::{InstanceConfig, MAX_BITS, MAX_ENDPOINTS, RegionLayout};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Both directions of one link. Region 0 of the mapping carries A→B, region 1
/// carries B→A.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    #[serde(default = "defaults::shm_file_path")]
    pub shm_file_path: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Bytes per direction.
    #[serde(default = "defaults::region_size")]
    pub region_size: usize,
    #[serde(default = "defaults::blocks")]
    pub blocks_a_to_b: usize,
    #[serde(default = "defaults::blocks")]
    pub blocks_b_to_a: usize,
    #[serde(default = "defaults::num_endpoints")]
    pub num_endpoints: usize,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "defaults::telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
}

/// Which core of the link a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// Index of the region this side sends into.
    pub fn tx_region(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }

    pub fn rx_region(self) -> usize {
        1 - self.tx_region()
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" | "A" => Ok(Side::A),
            "b" | "B" => Ok(Side::B),
            other => Err(format!("unknown side '{other}', expected 'a' or 'b'")),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("a"),
            Side::B => f.write_str("b"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn shm_file_path() -> String {
        "/tmp/icbmsg_link".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn region_size() -> usize {
        4096
    }

    pub fn blocks() -> usize {
        16
    }

    pub fn num_endpoints() -> usize {
        8
    }

    pub fn telemetry_interval_ms() -> u64 {
        1000
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            shm_file_path: defaults::shm_file_path(),
            log_level: defaults::log_level(),
            region_size: defaults::region_size(),
            blocks_a_to_b: defaults::blocks(),
            blocks_b_to_a: defaults::blocks(),
            num_endpoints: defaults::num_endpoints(),
            endpoints: Vec::new(),
            telemetry_interval_ms: defaults::telemetry_interval_ms(),
        }
    }
}

impl LinkConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let link_config: LinkConfig = toml::from_str(&toml_to_str)?;
        link_config.validate()?;
        Ok(link_config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (dir, blocks) in [("a_to_b", self.blocks_a_to_b), ("b_to_a", self.blocks_b_to_a)] {
            if blocks == 0 || blocks > MAX_BITS {
                return Err(ConfigError::Invalid(format!(
                    "blocks_{dir} = {blocks}, must be within 1..={MAX_BITS}"
                )));
            }
        }
        if self.num_endpoints == 0 || self.num_endpoints > MAX_ENDPOINTS {
            return Err(ConfigError::Invalid(format!(
                "num_endpoints = {}, must be within 1..={MAX_ENDPOINTS}",
                self.num_endpoints
            )));
        }
        // Each direction's blocks share the region with the other's releases.
        for (local, remote) in [
            (self.blocks_a_to_b, self.blocks_b_to_a),
            (self.blocks_b_to_a, self.blocks_a_to_b),
        ] {
            RegionLayout::compute(self.region_size, local, remote).map_err(|e| {
                ConfigError::Invalid(format!("region_size = {}: {e}", self.region_size))
            })?;
        }
        if self.endpoints.len() > self.num_endpoints {
            return Err(ConfigError::Invalid(format!(
                "{} endpoints configured for a table of {}",
                self.endpoints.len(),
                self.num_endpoints
            )));
        }
        let mut seen = HashSet::new();
        for ept in &self.endpoints {
            if ept.name.is_empty() || ept.name.contains('\0') {
                return Err(ConfigError::Invalid(format!("bad endpoint name {:?}", ept.name)));
            }
            if !seen.insert(ept.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate endpoint '{}'", ept.name)));
            }
        }
        Ok(())
    }

    /// Instance parameters for one side of the link.
    pub fn instance_config(&self, side: Side) -> InstanceConfig {
        let (tx_blocks, rx_blocks) = match side {
            Side::A => (self.blocks_a_to_b, self.blocks_b_to_a),
            Side::B => (self.blocks_b_to_a, self.blocks_a_to_b),
        };
        InstanceConfig {
            tx_blocks,
            rx_blocks,
            num_endpoints: self.num_endpoints,
        }
    }

    /// Size of the mapping holding both regions.
    pub fn mapping_size(&self) -> usize {
        2 * self.region_size
    }
}
