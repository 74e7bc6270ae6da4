//! Configuration entities.
//!
//! Field names match the agent's YAML document exactly (`on-link`,
//! `table-hard-sync`). Zero values are omitted on output so a rendered
//! document only carries what was declared.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// A complete routing configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigModel {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleModel>,

    #[serde(default, skip_serializing_if = "SettingsModel::is_empty")]
    pub settings: SettingsModel,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteModel>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vlans: Vec<VlanModel>,
}

impl ConfigModel {
    /// Returns true if no rule, route, VLAN or sync table is declared.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
            && self.routes.is_empty()
            && self.vlans.is_empty()
            && self.settings.is_empty()
    }

    /// Render the document posted to agents.
    pub fn to_yaml(&self) -> Result<String, ModelError> {
        serde_yaml::to_string(self).map_err(ModelError::Render)
    }

    /// Parse a document in the agent format.
    pub fn from_yaml(raw: &str) -> Result<Self, ModelError> {
        serde_yaml::from_str(raw).map_err(ModelError::Parse)
    }
}

/// Agent-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsModel {
    /// Routing tables the agent owns outright: entries it did not push are
    /// removed from these tables.
    #[serde(
        rename = "table-hard-sync",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub table_hard_sync: Vec<u32>,
}

impl SettingsModel {
    pub fn is_empty(&self) -> bool {
        self.table_hard_sync.is_empty()
    }
}

/// A policy routing rule (`ip rule add from <from> table <table>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleModel {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub table: u32,
}

impl RuleModel {
    pub fn new(from: impl Into<String>, table: u32) -> Self {
        Self {
            from: from.into(),
            table,
        }
    }

    /// Identity used when merging: source prefix and table.
    pub fn dedup_key(&self) -> (&str, u32) {
        (&self.from, self.table)
    }
}

/// A route entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteModel {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub via: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub table: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    #[serde(rename = "on-link", default, skip_serializing_if = "is_false")]
    pub on_link: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

impl RouteModel {
    /// Identity used when merging. Every field takes part.
    pub fn dedup_key(&self) -> (&str, &str, u32, &str, &str, bool, &str) {
        (
            &self.to,
            &self.via,
            self.table,
            &self.dev,
            &self.protocol,
            self.on_link,
            &self.scope,
        )
    }
}

/// An 802.1Q VLAN interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VlanModel {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Parent link.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link: String,

    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub id: u16,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl VlanModel {
    pub fn dedup_key(&self) -> (&str, &str, u16, &str) {
        (&self.name, &self.link, self.id, &self.protocol)
    }
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}
