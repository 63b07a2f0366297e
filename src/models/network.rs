//! Represents VPC networks in the source project.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub self_link: Option<String>,
    pub subnetworks: Vec<String>,
    pub auto_create_subnetworks: Option<bool>,
}
