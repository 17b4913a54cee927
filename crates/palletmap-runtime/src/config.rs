//! Deployment configuration – one TOML file describing the whole site.
//!
//! ```toml
//! tick_ms = 200
//! fusion_interval_ms = 500
//!
//! [geometry.bounds]
//! min = { x = 0.0, y = 0.0, z = 0.0 }
//! max = { x = 40.0, y = 20.0, z = 6.0 }
//!
//! [[geometry.anchors]]
//! id = "a1"
//! position = { x = 0.0, y = 0.0, z = 4.0 }
//!
//! [[geometry.edges]]
//! node = "edge-west"
//! polygon = [[0.0, 0.0], [20.0, 0.0], [20.0, 20.0], [0.0, 20.0]]
//! anchors = ["a1", "a2", "a3", "a4"]
//!
//! [trilateration]
//! strategy = "multilateral"
//!
//! [filter]
//! strategy = "kalman"
//! ```
//!
//! Every section except `geometry` is optional and falls back to its
//! defaults. See `config/warehouse.toml` for a complete example.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use palletmap_central::FusionConfig;
use palletmap_edge::EdgeConfig;
use palletmap_perception::filter::FilterConfig;
use palletmap_perception::geometry::Geometry;
use palletmap_perception::trilateration::{Strategy, TrilaterationConfig};
use palletmap_sim::{ChaosConfig, SimulationConfig};
use palletmap_types::TagRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value '{value}' for {var}")]
    Env { var: &'static str, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ────────────────────────────────────────────────────────────────────────────
// DeploymentConfig
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Edge segment period (milliseconds).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Central fusion period (milliseconds).
    #[serde(default = "default_fusion_interval_ms")]
    pub fusion_interval_ms: u64,
    /// Readings buffered per edge inbox before the producer sees back-pressure.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Frames buffered per bus topic before slow subscribers lag.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    pub geometry: Geometry,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub trilateration: TrilaterationConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    /// Known pallets.
    #[serde(default)]
    pub tags: Vec<TagRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation: Option<SimulationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos: Option<ChaosConfig>,
}

fn default_tick_ms() -> u64 {
    200
}
fn default_fusion_interval_ms() -> u64 {
    500
}
fn default_inbox_capacity() -> usize {
    1024
}
fn default_bus_capacity() -> usize {
    256
}

impl DeploymentConfig {
    /// A config with default knobs around `geometry`.
    pub fn new(geometry: Geometry) -> Self {
        Self {
            tick_ms: default_tick_ms(),
            fusion_interval_ms: default_fusion_interval_ms(),
            inbox_capacity: default_inbox_capacity(),
            bus_capacity: default_bus_capacity(),
            geometry,
            edge: EdgeConfig::default(),
            trilateration: TrilaterationConfig::default(),
            filter: FilterConfig::default(),
            fusion: FusionConfig::default(),
            tags: Vec::new(),
            simulation: None,
            chaos: None,
        }
    }

    /// Structural checks run after every load.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let g = &self.geometry;

        if self.tick_ms == 0 || self.fusion_interval_ms == 0 {
            return invalid("tick_ms and fusion_interval_ms must be positive".to_string());
        }
        if self.inbox_capacity == 0 || self.bus_capacity == 0 {
            return invalid("inbox_capacity and bus_capacity must be positive".to_string());
        }
        if !g.bounds.is_valid() {
            return invalid("geometry bounds are empty or not finite".to_string());
        }
        if g.edges.is_empty() {
            return invalid("at least one edge node is required".to_string());
        }
        for obstacle in &g.obstacles {
            if !obstacle.bounds.is_valid() || !obstacle.bounds.overlaps(&g.bounds) {
                return invalid(format!(
                    "obstacle '{}' is empty or lies outside the warehouse",
                    obstacle.id
                ));
            }
        }

        let mut anchors = BTreeSet::new();
        for anchor in &g.anchors {
            if !anchors.insert(&anchor.id) {
                return invalid(format!("duplicate anchor '{}'", anchor.id));
            }
            if !anchor.position.is_finite() {
                return invalid(format!("anchor '{}' has a non-finite position", anchor.id));
            }
            let n = anchor.noise;
            if !(n.std_dev.is_finite() && n.std_dev >= 0.0)
                || !(0.0..=1.0).contains(&n.outlier_probability)
                || !(n.max_range > 0.0)
            {
                return invalid(format!("anchor '{}' has an invalid noise profile", anchor.id));
            }
        }

        let mut readers = BTreeSet::new();
        for reader in &g.readers {
            if !readers.insert(&reader.id) {
                return invalid(format!("duplicate reader '{}'", reader.id));
            }
            if !(reader.read_range > 0.0) || !(reader.path_loss_exponent > 0.0) {
                return invalid(format!(
                    "reader '{}' needs a positive read range and path-loss exponent",
                    reader.id
                ));
            }
        }

        let mut nodes = BTreeSet::new();
        for edge in &g.edges {
            if edge.node.as_str().trim().is_empty() {
                return invalid("edge node with an empty id".to_string());
            }
            if !nodes.insert(&edge.node) {
                return invalid(format!("duplicate edge node '{}'", edge.node));
            }
            if !edge.polygon.is_valid() {
                return invalid(format!(
                    "coverage polygon of '{}' needs at least 3 finite vertices",
                    edge.node
                ));
            }
            if let Some(missing) = edge.anchors.iter().find(|a| !anchors.contains(a)) {
                return invalid(format!("edge '{}' references unknown anchor '{missing}'", edge.node));
            }
            if let Some(missing) = edge.readers.iter().find(|r| !readers.contains(r)) {
                return invalid(format!("edge '{}' references unknown reader '{missing}'", edge.node));
            }
        }

        let f = &self.fusion;
        if !(f.silence_timeout_secs > 0.0)
            || !(f.boundary_conflict_tolerance >= 0.0)
            || !(f.link_timeout_secs > 0.0)
        {
            return invalid("fusion timeouts must be positive".to_string());
        }
        if !(self.edge.coherence_window_secs > 0.0) || self.edge.buffer_size == 0 {
            return invalid("edge coherence window and buffer size must be positive".to_string());
        }

        let mut tags = BTreeSet::new();
        for tag in &self.tags {
            if !tags.insert(&tag.tag_id) {
                return invalid(format!("duplicate tag '{}'", tag.tag_id));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Loading & saving
// ────────────────────────────────────────────────────────────────────────────

/// Parse, apply `PALLETMAP_*` overrides and validate.
pub fn load_from(path: &Path) -> Result<DeploymentConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg = from_toml_str(&raw)?;
    apply_env_overrides(&mut cfg)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Parse without overrides or validation.
pub fn from_toml_str(raw: &str) -> Result<DeploymentConfig, ConfigError> {
    Ok(toml::from_str(raw)?)
}

pub fn save_to(cfg: &DeploymentConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `PALLETMAP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PALLETMAP_TICK_MS` | `tick_ms` |
/// | `PALLETMAP_SILENCE_TIMEOUT_SECS` | `fusion.silence_timeout_secs` |
/// | `PALLETMAP_CONFLICT_TOLERANCE_M` | `fusion.boundary_conflict_tolerance` |
/// | `PALLETMAP_TRILATERATION` | `trilateration.strategy` |
pub fn apply_env_overrides(cfg: &mut DeploymentConfig) -> Result<(), ConfigError> {
    apply_overrides(cfg, |var| std::env::var(var).ok())
}

/// Override logic with an injectable lookup, so tests never touch the
/// process environment.
pub(crate) fn apply_overrides(
    cfg: &mut DeploymentConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { var, value })
    }

    if let Some(v) = lookup("PALLETMAP_TICK_MS") {
        cfg.tick_ms = parse("PALLETMAP_TICK_MS", v)?;
    }
    if let Some(v) = lookup("PALLETMAP_SILENCE_TIMEOUT_SECS") {
        cfg.fusion.silence_timeout_secs = parse("PALLETMAP_SILENCE_TIMEOUT_SECS", v)?;
    }
    if let Some(v) = lookup("PALLETMAP_CONFLICT_TOLERANCE_M") {
        cfg.fusion.boundary_conflict_tolerance = parse("PALLETMAP_CONFLICT_TOLERANCE_M", v)?;
    }
    if let Some(v) = lookup("PALLETMAP_TRILATERATION") {
        cfg.trilateration.strategy = parse::<Strategy>("PALLETMAP_TRILATERATION", v)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use palletmap_perception::filter::FilterKind;
    use palletmap_perception::geometry::{Aabb, Obstacle};
    use palletmap_types::Point3;

    pub(crate) const SITE: &str = r#"
tick_ms = 50
fusion_interval_ms = 100

[geometry.bounds]
min = { x = 0.0, y = 0.0, z = 0.0 }
max = { x = 20.0, y = 10.0, z = 5.0 }

[[geometry.anchors]]
id = "a1"
position = { x = 0.0, y = 0.0, z = 3.0 }
noise = { std_dev = 0.0 }

[[geometry.anchors]]
id = "a2"
position = { x = 10.0, y = 0.0, z = 3.0 }
noise = { std_dev = 0.0 }

[[geometry.anchors]]
id = "a3"
position = { x = 10.0, y = 10.0, z = 3.0 }
noise = { std_dev = 0.0 }

[[geometry.anchors]]
id = "a4"
position = { x = 0.0, y = 10.0, z = 3.0 }
noise = { std_dev = 0.0 }

[[geometry.anchors]]
id = "a5"
position = { x = 5.0, y = 5.0, z = 4.5 }
noise = { std_dev = 0.0 }

[[geometry.edges]]
node = "edge-a"
polygon = [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]
anchors = ["a1", "a2", "a3", "a4", "a5"]

[filter]
strategy = "kalman"

[[tags]]
tag_id = "PLT-A001"
uwb_id = "u1"
rfid_id = "E200-0001"
pallet_id = "PLT-A001"
"#;

    fn site() -> DeploymentConfig {
        from_toml_str(SITE).unwrap()
    }

    #[test]
    fn minimal_site_parses_with_defaults() {
        let cfg = site();
        assert_eq!(cfg.tick_ms, 50);
        assert_eq!(cfg.inbox_capacity, 1024);
        assert_eq!(cfg.filter.strategy, FilterKind::Kalman);
        assert_eq!(cfg.trilateration.strategy, Strategy::Multilateral);
        assert_eq!(cfg.fusion.silence_timeout_secs, 30.0);
        assert_eq!(cfg.geometry.anchors[0].noise.max_range, 100.0);
        assert!(cfg.simulation.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn save_then_load_preserves_config() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("site.toml");
        let mut cfg = site();
        cfg.simulation = Some(SimulationConfig::default());
        save_to(&cfg, &path)?;
        let back: DeploymentConfig = from_toml_str(&fs::read_to_string(&path)?)?;
        assert_eq!(back, cfg);
        Ok(())
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_from(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn unknown_anchor_reference_is_rejected() {
        let mut cfg = site();
        cfg.geometry.edges[0].anchors.push("ghost".into());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"), "{err}");
    }

    #[test]
    fn degenerate_polygon_is_rejected() {
        let mut cfg = site();
        cfg.geometry.edges[0].polygon = vec![[0.0, 0.0], [1.0, 0.0]].into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn no_edges_is_rejected() {
        let mut cfg = site();
        cfg.geometry.edges.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn obstacle_outside_the_warehouse_is_rejected() {
        let mut cfg = site();
        cfg.geometry.obstacles.push(Obstacle {
            id: "rack-x".into(),
            kind: "rack".into(),
            bounds: Aabb::new(Point3::new(30.0, 0.0, 0.0), Point3::new(32.0, 2.0, 3.0)),
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("rack-x"), "{err}");

        // Touching the outer wall still counts as inside.
        cfg.geometry.obstacles[0].bounds =
            Aabb::new(Point3::new(18.0, 0.0, 0.0), Point3::new(20.0, 2.0, 3.0));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn negative_noise_is_rejected() {
        let mut cfg = site();
        cfg.geometry.anchors[1].noise.std_dev = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = site();
        apply_overrides(&mut cfg, |var| match var {
            "PALLETMAP_TICK_MS" => Some("75".to_string()),
            "PALLETMAP_SILENCE_TIMEOUT_SECS" => Some("12.5".to_string()),
            "PALLETMAP_CONFLICT_TOLERANCE_M" => Some("0.5".to_string()),
            "PALLETMAP_TRILATERATION" => Some("LLS".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.tick_ms, 75);
        assert_eq!(cfg.fusion.silence_timeout_secs, 12.5);
        assert_eq!(cfg.fusion.boundary_conflict_tolerance, 0.5);
        assert_eq!(cfg.trilateration.strategy, Strategy::Linear);
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let mut cfg = site();
        let err = apply_overrides(&mut cfg, |var| {
            (var == "PALLETMAP_TICK_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "PALLETMAP_TICK_MS", .. }));
    }

    #[test]
    fn shipped_sample_config_is_valid() -> Result<(), Box<dyn std::error::Error>> {
        let raw = include_str!("../../../config/warehouse.toml");
        let cfg = from_toml_str(raw)?;
        cfg.validate()?;
        assert!(cfg.simulation.is_some());
        Ok(())
    }
}
