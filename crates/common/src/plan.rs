//! The declarative provision plan document.
//!
//! ```json
//! {
//!   "users":    { "create": [{"username": "alice"}], "delete": ["bob"] },
//!   "volumes":  { "create": [{"name": "vol1", "owner": "alice", ...}], "delete": [] },
//!   "gateways": { "create": [{"owner": "alice", "volume": "inst1.vol1", "type": "UG",
//!                             "host": "h1", "port": 8080}], "delete": [] }
//! }
//! ```
//!
//! Plans are re-submitted verbatim after partial failure, so every field here
//! must describe an entity in a way that addresses the same remote object on
//! every apply.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse plan: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for '{field}': expected true or false, got {value}")]
    InvalidFlag { field: &'static str, value: String },
    #[error("volume '{0}' is not qualified with an instance")]
    UnqualifiedVolume(String),
    #[error("host '{0}' is not a valid gateway host")]
    InvalidHost(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionPlan {
    #[serde(default)]
    pub users: SubPlan<UserSpec, String>,
    #[serde(default)]
    pub volumes: SubPlan<VolumeSpec, String>,
    #[serde(default)]
    pub gateways: SubPlan<GatewaySpec, GatewayRef>,
}

impl ProvisionPlan {
    pub fn from_json(raw: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPlan<C, D> {
    #[serde(default = "Vec::new")]
    pub create: Vec<C>,
    #[serde(default = "Vec::new")]
    pub delete: Vec<D>,
}

impl<C, D> Default for SubPlan<C, D> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            delete: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub blocksize: u64,
    pub owner: String,
    #[serde(default)]
    pub private: LooseBool,
    #[serde(default)]
    pub archive: LooseBool,
}

impl VolumeSpec {
    /// The instance-less volume name; bootstrap keys and failure tracking use this.
    pub fn volume_name(&self) -> &str {
        QualifiedVolume::parse(&self.name).name
    }
}

/// A boolean that operators may write as `true`, `"true"` or `"TRUE"`.
///
/// Anything that is not recognisably true or false only fails when read, so one bad
/// entity does not sink the rest of the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LooseBool {
    Bool(bool),
    Other(Value),
}

impl Default for LooseBool {
    fn default() -> Self {
        LooseBool::Bool(false)
    }
}

impl LooseBool {
    pub fn parse(&self, field: &'static str) -> Result<bool, PlanError> {
        match self {
            LooseBool::Bool(value) => Ok(*value),
            LooseBool::Other(Value::String(text)) if text.eq_ignore_ascii_case("true") => Ok(true),
            LooseBool::Other(Value::String(text)) if text.eq_ignore_ascii_case("false") => {
                Ok(false)
            }
            LooseBool::Other(other) => Err(PlanError::InvalidFlag {
                field,
                value: other.to_string(),
            }),
        }
    }
}

impl From<bool> for LooseBool {
    fn from(value: bool) -> Self {
        LooseBool::Bool(value)
    }
}

/// `instance.volume`, split at the first dot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualifiedVolume<'a> {
    pub instance: Option<&'a str>,
    pub name: &'a str,
}

impl<'a> QualifiedVolume<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.split_once('.') {
            Some((instance, name)) if !instance.is_empty() && !name.is_empty() => Self {
                instance: Some(instance),
                name,
            },
            _ => Self {
                instance: None,
                name: raw,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GatewayType {
    /// User-facing gateway
    #[serde(rename = "UG")]
    User,
    /// Replica gateway
    #[serde(rename = "RG")]
    Replica,
    /// Archive-facing gateway
    #[serde(rename = "AG")]
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadData,
    WriteData,
    ReadMetadata,
    WriteMetadata,
    Coordinate,
}

impl GatewayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayType::User => "UG",
            GatewayType::Replica => "RG",
            GatewayType::Archive => "AG",
        }
    }

    pub fn capabilities(&self) -> BTreeSet<Capability> {
        use Capability::*;

        match self {
            GatewayType::User => [ReadData, WriteData, ReadMetadata, WriteMetadata, Coordinate]
                .into_iter()
                .collect(),
            GatewayType::Replica => BTreeSet::new(),
            GatewayType::Archive => [ReadMetadata, WriteMetadata].into_iter().collect(),
        }
    }
}

impl fmt::Display for GatewayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySpec {
    pub owner: String,
    /// Fully qualified `instance.volume`
    pub volume: String,
    #[serde(rename = "type")]
    pub kind: GatewayType,
    pub host: String,
    pub port: u16,
    /// Driver package reference, resolved against the daemon's driver directory
    #[serde(default)]
    pub driver: Option<String>,
}

impl GatewaySpec {
    pub fn volume_name(&self) -> &str {
        QualifiedVolume::parse(&self.volume).name
    }

    pub fn name(&self) -> Result<String, PlanError> {
        gateway_name_for(&self.volume, self.kind, &self.host)
    }
}

/// Gateways to delete, either by name or by the attributes that derive the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GatewayRef {
    Name(String),
    Spec {
        volume: String,
        #[serde(rename = "type")]
        kind: GatewayType,
        host: String,
    },
}

impl GatewayRef {
    pub fn name(&self) -> Result<String, PlanError> {
        match self {
            GatewayRef::Name(name) => Ok(name.clone()),
            GatewayRef::Spec { volume, kind, host } => gateway_name_for(volume, *kind, host),
        }
    }
}

/// Deterministic gateway name: `<instance>-<TYPE>-<volume>-<host>`.
///
/// Dots in the host become `_`. Hosts may only contain ASCII letters, digits,
/// `-` and `.`, so two different hosts never share a name.
pub fn gateway_name(
    instance: &str,
    kind: GatewayType,
    volume: &str,
    host: &str,
) -> Result<String, PlanError> {
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(PlanError::InvalidHost(host.to_string()));
    }
    Ok(format!(
        "{}-{}-{}-{}",
        instance,
        kind,
        volume,
        host.replace('.', "_")
    ))
}

fn gateway_name_for(volume: &str, kind: GatewayType, host: &str) -> Result<String, PlanError> {
    let qualified = QualifiedVolume::parse(volume);
    let instance = qualified
        .instance
        .ok_or_else(|| PlanError::UnqualifiedVolume(volume.to_string()))?;
    gateway_name(instance, kind, qualified.name, host)
}

#[cfg(test)]
mod test {
    use super::*;

    const SCENARIO: &str = r#"{
        "users": {"create": [{"username": "alice"}], "delete": []},
        "volumes": {"create": [{"name": "vol1", "description": "d", "blocksize": 4096,
                                "owner": "alice", "private": "true", "archive": "false"}],
                    "delete": []},
        "gateways": {"create": [{"owner": "alice", "volume": "inst1.vol1", "type": "UG",
                                 "host": "h1", "port": 8080}],
                     "delete": []}
    }"#;

    #[test]
    fn test_parse_scenario_plan() {
        let plan = ProvisionPlan::from_json(SCENARIO).unwrap();

        assert_eq!(plan.users.create[0].username, "alice");
        let volume = &plan.volumes.create[0];
        assert_eq!(volume.blocksize, 4096);
        assert!(volume.private.parse("private").unwrap());
        assert!(!volume.archive.parse("archive").unwrap());

        let gateway = &plan.gateways.create[0];
        assert_eq!(gateway.kind, GatewayType::User);
        assert_eq!(gateway.volume_name(), "vol1");
        assert_eq!(gateway.name().unwrap(), "inst1-UG-vol1-h1");
    }

    #[test]
    fn test_missing_sections_default_to_empty() {
        let plan = ProvisionPlan::from_json(r#"{"users": {"create": [{"username": "a"}]}}"#)
            .unwrap();
        assert!(plan.users.delete.is_empty());
        assert!(plan.volumes.create.is_empty());
        assert!(plan.gateways.delete.is_empty());
    }

    #[test]
    fn test_loose_bool_accepts_strings_case_insensitively() {
        let flag = |raw: &str| serde_json::from_str::<LooseBool>(raw).unwrap();

        assert!(flag("true").parse("f").unwrap());
        assert!(flag("\"TRUE\"").parse("f").unwrap());
        assert!(!flag("\"False\"").parse("f").unwrap());
        assert!(matches!(
            flag("\"yes\"").parse("f"),
            Err(PlanError::InvalidFlag { field: "f", .. })
        ));
        assert!(flag("1").parse("f").is_err());
    }

    #[test]
    fn test_bad_flag_does_not_reject_plan() {
        let raw = r#"{"volumes": {"create": [
            {"name": "v1", "blocksize": 1, "owner": "a", "private": "maybe"},
            {"name": "v2", "blocksize": 1, "owner": "a", "private": false}
        ]}}"#;
        let plan = ProvisionPlan::from_json(raw).unwrap();
        assert!(plan.volumes.create[0].private.parse("private").is_err());
        assert!(!plan.volumes.create[1].private.parse("private").unwrap());
    }

    #[test]
    fn test_gateway_names_are_deterministic() {
        let by_ref = GatewayRef::Spec {
            volume: "inst1.vol1".to_string(),
            kind: GatewayType::Replica,
            host: "node-1.example.org".to_string(),
        };
        assert_eq!(by_ref.name().unwrap(), "inst1-RG-vol1-node-1_example_org");
        assert_eq!(
            by_ref.name().unwrap(),
            gateway_name("inst1", GatewayType::Replica, "vol1", "node-1.example.org").unwrap()
        );

        let by_name: GatewayRef = serde_json::from_str("\"inst1-AG-vol1-h1\"").unwrap();
        assert_eq!(by_name.name().unwrap(), "inst1-AG-vol1-h1");
    }

    #[test]
    fn test_hosts_that_could_collide_are_refused() {
        let name = |host: &str| gateway_name("inst1", GatewayType::Replica, "vol1", host);

        assert_eq!(name("node-1.example.org").unwrap(), "inst1-RG-vol1-node-1_example_org");
        for host in ["node-1_example_org", "node 1", "h1/..", "", "höst"] {
            assert!(
                matches!(name(host), Err(PlanError::InvalidHost(_))),
                "{:?} should be refused",
                host
            );
        }
    }

    #[test]
    fn test_unqualified_gateway_volume_fails_naming() {
        let spec = GatewaySpec {
            owner: "alice".to_string(),
            volume: "vol1".to_string(),
            kind: GatewayType::User,
            host: "h1".to_string(),
            port: 1,
            driver: None,
        };
        assert!(matches!(spec.name(), Err(PlanError::UnqualifiedVolume(_))));
    }

    #[test]
    fn test_capabilities_follow_type() {
        assert!(GatewayType::Replica.capabilities().is_empty());
        assert!(GatewayType::User
            .capabilities()
            .contains(&Capability::WriteData));
        assert!(!GatewayType::Archive
            .capabilities()
            .contains(&Capability::WriteData));
    }
}
