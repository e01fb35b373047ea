// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read access to security groups and provider rules.

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("security group store: {0}")]
pub struct StoreError(pub String);

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// One ingress rule of a security group.
///
/// For TCP and UDP the port fields are a port range. For ICMP they carry
/// the type and code, with -1 meaning "any".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: u64,
    pub parent_group_id: u64,
    pub protocol: Option<Protocol>,
    pub from_port: i32,
    pub to_port: i32,
    pub cidr: Option<String>,
    /// Grants access to every member of another group instead of a CIDR.
    pub grantee_group_id: Option<u64>,
}

/// A host-wide drop rule applied ahead of any security group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRule {
    pub protocol: Protocol,
    pub from_port: i32,
    pub to_port: i32,
    pub cidr: String,
}

#[async_trait]
pub trait SecurityGroupStore: Send + Sync {
    async fn security_groups_for_instance(
        &self,
        instance_id: u64,
    ) -> Result<Vec<u64>, StoreError>;

    async fn rules_for_group(
        &self,
        group_id: u64,
    ) -> Result<Vec<SecurityGroupRule>, StoreError>;

    /// Ids of the instances that belong to a group.
    async fn group_members(&self, group_id: u64) -> Result<Vec<u64>, StoreError>;

    async fn fixed_addresses(
        &self,
        instance_id: u64,
    ) -> Result<Vec<String>, StoreError>;

    async fn provider_rules(&self) -> Result<Vec<ProviderRule>, StoreError>;
}
