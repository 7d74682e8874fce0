//! Configuration management.
//!
//! Settings load from a TOML file (explicit `--config`, `./cadastre.toml`,
//! or the platform config directory, in that order) and fall back to
//! defaults rooted at the working directory. Spatial radius and fuzzy
//! threshold are policy knobs tuned per observed region data quality, so
//! both exist as defaults with per-region overrides rather than constants.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::RegionError;
use crate::geocode::GeocodePolicy;
use crate::geometry::Crs;
use crate::matcher::MatchPolicy;
use crate::models::SourceKind;
use crate::readers::{ColumnMapping, MappingRegistry, SourcePaths};

/// Geocoding provider endpoint and rate/retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeocoderSettings {
    pub base_url: String,
    pub user_agent: String,
    /// Minimum milliseconds between provider requests.
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for GeocoderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org/search".to_string(),
            user_agent: "cadastre (parcel reconciliation)".to_string(),
            min_interval_ms: 1100,
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

/// Batching and write-chunking.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Regions processed between control checkpoints.
    pub batch_size: usize,
    /// Records per store transaction.
    pub chunk_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 4,
            chunk_size: 500,
        }
    }
}

/// Default matching policy, overridable per region.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MatchDefaults {
    pub spatial_radius_m: f64,
    pub fuzzy_threshold: f64,
}

impl Default for MatchDefaults {
    fn default() -> Self {
        Self {
            spatial_radius_m: 150.0,
            fuzzy_threshold: 0.88,
        }
    }
}

/// Per-region overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegionSettings {
    /// CRS code for projected geometry sources (e.g. "EPSG:2234"), or the
    /// name of a custom [crs.*] entry. Defaults to geographic coordinates.
    pub crs: Option<String>,
    /// Pin the supplemental column mapping by name instead of detecting it.
    pub column_mapping: Option<String>,
    /// Explicit file paths when the default naming convention doesn't match.
    pub geometry_file: Option<PathBuf>,
    pub authoritative_file: Option<PathBuf>,
    pub supplemental_file: Option<PathBuf>,
    pub spatial_radius_m: Option<f64>,
    pub fuzzy_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    database: Option<String>,
    data_dir: Option<String>,
    reports_dir: Option<String>,
    geocoder: GeocoderSettings,
    pipeline: PipelineSettings,
    defaults: MatchDefaults,
    regions: BTreeMap<String, RegionSettings>,
    /// Custom supplemental column layouts.
    mappings: Vec<ColumnMapping>,
    /// Custom projections, keyed by the code regions reference.
    crs: BTreeMap<String, Crs>,
}

/// Resolved application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub geocoder: GeocoderSettings,
    pub pipeline: PipelineSettings,
    pub defaults: MatchDefaults,
    pub regions: BTreeMap<String, RegionSettings>,
    pub mappings: Vec<ColumnMapping>,
    pub crs: BTreeMap<String, Crs>,
}

impl Settings {
    /// Locate and load settings. `explicit` must exist when given; otherwise
    /// discovery falls back to defaults rooted at the working directory.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Settings> {
        let candidate = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let local = PathBuf::from("cadastre.toml");
                if local.exists() {
                    Some(local)
                } else {
                    dirs::config_dir()
                        .map(|d| d.join("cadastre/config.toml"))
                        .filter(|p| p.exists())
                }
            }
        };

        match candidate {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
                let root = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."));
                Settings::from_toml(&content, &root)
            }
            None => Ok(Settings::for_root(Path::new("."))),
        }
    }

    /// Parse settings from TOML, resolving relative paths against `root`.
    pub fn from_toml(content: &str, root: &Path) -> anyhow::Result<Settings> {
        let raw: RawSettings = toml::from_str(content)?;
        let resolve = |value: Option<String>, default: &str| -> PathBuf {
            let text = value.unwrap_or_else(|| default.to_string());
            let expanded = shellexpand::tilde(&text).into_owned();
            let path = PathBuf::from(expanded);
            if path.is_absolute() {
                path
            } else {
                root.join(path)
            }
        };

        Ok(Settings {
            database_path: resolve(raw.database, "cadastre.db"),
            data_dir: resolve(raw.data_dir, "data"),
            reports_dir: resolve(raw.reports_dir, "reports"),
            geocoder: raw.geocoder,
            pipeline: raw.pipeline,
            defaults: raw.defaults,
            regions: raw.regions,
            mappings: raw.mappings,
            crs: raw.crs,
        })
    }

    /// Default settings rooted at a directory. Used when no config file
    /// exists, and by tests.
    pub fn for_root(root: &Path) -> Settings {
        Settings {
            database_path: root.join("cadastre.db"),
            data_dir: root.join("data"),
            reports_dir: root.join("reports"),
            geocoder: GeocoderSettings::default(),
            pipeline: PipelineSettings::default(),
            defaults: MatchDefaults::default(),
            regions: BTreeMap::new(),
            mappings: Vec::new(),
            crs: BTreeMap::new(),
        }
    }

    /// Regions named in configuration.
    pub fn configured_regions(&self) -> Vec<String> {
        self.regions.keys().cloned().collect()
    }

    fn region(&self, name: &str) -> Option<&RegionSettings> {
        self.regions.get(name)
    }

    /// Default naming convention: `data_dir/<region>/<kind>.csv`, unless the
    /// region overrides the path explicitly.
    pub fn source_path(&self, region: &str, kind: SourceKind) -> PathBuf {
        let override_path = self.region(region).and_then(|r| match kind {
            SourceKind::Geometry => r.geometry_file.clone(),
            SourceKind::Authoritative => r.authoritative_file.clone(),
            SourceKind::Supplemental => r.supplemental_file.clone(),
        });
        match override_path {
            Some(path) if path.is_absolute() => path,
            Some(path) => self.data_dir.join(path),
            None => self
                .data_dir
                .join(region)
                .join(format!("{}.csv", kind.as_str())),
        }
    }

    pub fn source_paths(&self, region: &str) -> SourcePaths {
        SourcePaths {
            geometry: self.source_path(region, SourceKind::Geometry),
            authoritative: self.source_path(region, SourceKind::Authoritative),
            supplemental: self.source_path(region, SourceKind::Supplemental),
        }
    }

    /// The CRS a region's projected geometry arrives in. Custom [crs.*]
    /// entries shadow the built-in registry.
    pub fn region_crs(&self, region: &str) -> Result<Crs, RegionError> {
        let Some(code) = self.region(region).and_then(|r| r.crs.as_deref()) else {
            return Ok(Crs::Geographic);
        };
        if let Some(custom) = self.crs.get(code) {
            return Ok(*custom);
        }
        Crs::from_code(code).map_err(|_| RegionError::UnknownCrs {
            region: region.to_string(),
            code: code.to_string(),
        })
    }

    /// Matching policy with per-region overrides applied.
    pub fn match_policy(&self, region: &str) -> MatchPolicy {
        let overrides = self.region(region);
        MatchPolicy {
            spatial_radius_m: overrides
                .and_then(|r| r.spatial_radius_m)
                .unwrap_or(self.defaults.spatial_radius_m),
            fuzzy_threshold: overrides
                .and_then(|r| r.fuzzy_threshold)
                .unwrap_or(self.defaults.fuzzy_threshold),
        }
    }

    /// Pinned supplemental mapping name for a region, when configured.
    pub fn pinned_mapping(&self, region: &str) -> Option<&str> {
        self.region(region).and_then(|r| r.column_mapping.as_deref())
    }

    /// Column-mapping registry: builtins plus config-supplied layouts.
    pub fn mapping_registry(&self) -> MappingRegistry {
        let mut registry = MappingRegistry::builtin();
        for mapping in &self.mappings {
            registry.register(mapping.clone());
        }
        registry
    }

    pub fn geocode_policy(&self) -> GeocodePolicy {
        GeocodePolicy {
            min_interval: std::time::Duration::from_millis(self.geocoder.min_interval_ms),
            max_retries: self.geocoder.max_retries,
            backoff: std::time::Duration::from_millis(self.geocoder.backoff_ms),
        }
    }
}

/// Template written by `cadastre init`.
pub const DEFAULT_CONFIG: &str = r#"# cadastre configuration

database = "cadastre.db"
data_dir = "data"
reports_dir = "reports"

[geocoder]
base_url = "https://nominatim.openstreetmap.org/search"
user_agent = "cadastre (parcel reconciliation)"
min_interval_ms = 1100
max_retries = 3
backoff_ms = 500

[pipeline]
batch_size = 4
chunk_size = 500

# Matching policy defaults; both are tunable per region below.
[defaults]
spatial_radius_m = 150.0
fuzzy_threshold = 0.88

# [regions.avon]
# crs = "EPSG:2234"
# spatial_radius_m = 120.0
# geometry_file = "avon/parcels_2025.csv"

# Custom supplemental column layouts:
# [[mappings]]
# name = "county-export"
# identifier = "ACCT_NO"
# address = "SITUS_ADDR"
# [mappings.fields]
# owner_name = "OWNER_NM"

# Custom projections:
# [crs."STATEPLANE-CUSTOM"]
# projection = "lambert_conformal_conic"
# lat_origin = 40.8333
# lon_origin = -72.75
# standard_parallel_1 = 41.2
# standard_parallel_2 = 41.8667
# false_easting = 1000000.0
# false_northing = 500000.0
# unit = "us_foot"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_no_file() {
        let settings = Settings::for_root(Path::new("/tmp/work"));
        assert_eq!(settings.database_path, PathBuf::from("/tmp/work/cadastre.db"));
        assert_eq!(
            settings.source_path("avon", SourceKind::Geometry),
            PathBuf::from("/tmp/work/data/avon/geometry.csv")
        );
        assert_eq!(settings.region_crs("avon").unwrap(), Crs::Geographic);
    }

    #[test]
    fn test_default_config_template_parses() {
        let settings = Settings::from_toml(DEFAULT_CONFIG, Path::new("/base")).unwrap();
        assert_eq!(settings.pipeline.batch_size, 4);
        assert_eq!(settings.geocoder.min_interval_ms, 1100);
        assert_eq!(settings.defaults.fuzzy_threshold, 0.88);
    }

    #[test]
    fn test_region_overrides() {
        let settings = Settings::from_toml(
            r#"
            [regions.avon]
            crs = "EPSG:2234"
            spatial_radius_m = 120.0
            geometry_file = "avon/parcels_2025.csv"

            [regions.bethel]
            "#,
            Path::new("/base"),
        )
        .unwrap();

        assert!(matches!(
            settings.region_crs("avon").unwrap(),
            Crs::LambertConformalConic(_)
        ));
        assert_eq!(settings.match_policy("avon").spatial_radius_m, 120.0);
        assert_eq!(settings.match_policy("bethel").spatial_radius_m, 150.0);
        assert_eq!(
            settings.source_path("avon", SourceKind::Geometry),
            PathBuf::from("/base/data/avon/parcels_2025.csv")
        );
        assert_eq!(
            settings.source_path("bethel", SourceKind::Authoritative),
            PathBuf::from("/base/data/bethel/authoritative.csv")
        );
        assert_eq!(settings.configured_regions(), vec!["avon", "bethel"]);
    }

    #[test]
    fn test_unknown_crs_is_region_error() {
        let settings = Settings::from_toml(
            r#"
            [regions.avon]
            crs = "EPSG:99999"
            "#,
            Path::new("/base"),
        )
        .unwrap();
        assert!(matches!(
            settings.region_crs("avon"),
            Err(RegionError::UnknownCrs { .. })
        ));
    }

    #[test]
    fn test_custom_crs_and_mapping() {
        let settings = Settings::from_toml(
            r#"
            [crs."GRID-X"]
            projection = "transverse_mercator"
            lat_origin = 0.0
            lon_origin = -75.0
            scale_factor = 0.9996
            false_easting = 500000.0
            false_northing = 0.0
            unit = "meter"

            [regions.avon]
            crs = "GRID-X"

            [[mappings]]
            name = "county-export"
            identifier = "ACCT_NO"
            address = "SITUS_ADDR"
            [mappings.fields]
            owner_name = "OWNER_NM"
            "#,
            Path::new("/base"),
        )
        .unwrap();

        assert!(matches!(
            settings.region_crs("avon").unwrap(),
            Crs::TransverseMercator(_)
        ));
        let registry = settings.mapping_registry();
        assert!(registry.get("county-export").is_some());
    }
}
