//! Upgrade planning and execution per management group
//!
//! The core provider drives all plan logic for its management group: every
//! member is expected to support the same API contract, so the candidate
//! contracts are the group's current one plus any strictly newer contract
//! the core provider has releases for. A plan that would switch contract
//! while leaving a member behind is discarded; mixing contracts within a
//! group is forbidden.

use semver::Version;
use std::sync::Arc;
use tracing::{debug, info};

use crate::installer::{install_and_record, ComponentsInstaller, DeleteOptions};
use crate::inventory::{Inventory, ManagementGroup, Provider};
use crate::repository::{
    parse_version, version_tag, ComponentsOptions, ReleaseMetadata, RepositoryFactory,
};
use crate::{Error, Result};

/// A possible upgrade target for one provider in a management group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeItem {
    /// The provider to upgrade
    pub provider: Provider,
    /// Next available version tag; empty means no upgrade available
    pub next_version: String,
}

/// A proposed upgrade for one management group and one target contract
#[derive(Debug, Clone)]
pub struct UpgradePlan {
    /// The contract every item in the plan targets
    pub contract: String,
    /// The core provider of the management group
    pub core: Provider,
    /// One item per group member
    pub items: Vec<UpgradeItem>,
}

impl UpgradePlan {
    /// Whether at least one item has no target version
    pub fn is_partial_upgrade(&self) -> bool {
        self.items.iter().any(|i| i.next_version.is_empty())
    }
}

/// Release information for one provider: current version, published
/// metadata, and the strictly newer releases
#[derive(Debug, Clone)]
struct UpgradeInfo {
    provider: Provider,
    current_version: Version,
    metadata: ReleaseMetadata,
    next_versions: Vec<Version>,
}

impl UpgradeInfo {
    fn new(provider: Provider, metadata: ReleaseMetadata, versions: Vec<Version>) -> Result<Self> {
        let current_version = parse_version(&provider.version)?;
        let mut next_versions: Vec<Version> = versions
            .into_iter()
            .filter(|v| *v > current_version)
            .collect();
        next_versions.sort();
        Ok(Self {
            provider,
            current_version,
            metadata,
            next_versions,
        })
    }

    /// Contract supported by the currently installed version
    fn current_contract(&self) -> Result<String> {
        self.contract_for_version(&self.current_version)
    }

    /// Contract a given version supports
    fn contract_for_version(&self, version: &Version) -> Result<String> {
        self.metadata
            .series_for(version)
            .map(|s| s.contract.clone())
            .ok_or_else(|| Error::InvalidMetadata {
                provider: self.provider.instance_name(),
                message: format!("version v{} does not match any release series", version),
            })
    }

    /// The current contract plus every strictly newer contract present in
    /// this provider's releases, in release order
    fn contracts_for_upgrade(&self) -> Result<Vec<String>> {
        let current = self.current_contract()?;
        let mut contracts = vec![current.clone()];
        for version in &self.next_versions {
            // Releases without a matching series cannot be targets.
            let Some(series) = self.metadata.series_for(version) else {
                continue;
            };
            if series.contract > current && !contracts.contains(&series.contract) {
                contracts.push(series.contract.clone());
            }
        }
        Ok(contracts)
    }

    /// Highest release supporting the contract that is strictly newer than
    /// the current version
    fn latest_next_version(&self, contract: &str) -> Option<Version> {
        self.next_versions
            .iter()
            .filter(|v| {
                self.metadata
                    .series_for(v)
                    .is_some_and(|s| s.contract == contract)
            })
            .max()
            .cloned()
    }
}

/// Plans and executes provider upgrades
pub struct UpgradePlanner {
    inventory: Inventory,
    repositories: Arc<dyn RepositoryFactory>,
    installer: ComponentsInstaller,
}

impl UpgradePlanner {
    /// Create a planner
    pub fn new(
        inventory: Inventory,
        repositories: Arc<dyn RepositoryFactory>,
        installer: ComponentsInstaller,
    ) -> Self {
        Self {
            inventory,
            repositories,
            installer,
        }
    }

    /// One upgrade plan per `(management group, candidate contract)` pair
    ///
    /// Plans that would switch the contract while leaving at least one
    /// member without a target version are dropped.
    pub async fn plan(&self) -> Result<Vec<UpgradePlan>> {
        info!("Checking new release availability...");

        let groups = self.inventory.management_groups().await?;
        let mut plans = Vec::new();

        for group in &groups {
            let core_info = self.upgrade_info(&group.core).await?;
            let current_contract = core_info.current_contract()?;

            for contract in core_info.contracts_for_upgrade()? {
                let plan = self.plan_for_group(group, &contract).await?;
                if plan.is_partial_upgrade() && contract != current_contract {
                    debug!(
                        group = %group.core.instance_name(),
                        contract = %contract,
                        "Dropping partial contract-switch plan"
                    );
                    continue;
                }
                plans.push(plan);
            }
        }

        Ok(plans)
    }

    /// Execute the plan for a management group and contract
    pub async fn apply_plan(&self, core_instance_name: &str, contract: &str) -> Result<()> {
        info!(core = %core_instance_name, contract = %contract, "Performing upgrade...");

        let group = self.management_group(core_instance_name).await?;
        let plan = self.plan_for_group(&group, contract).await?;
        self.do_upgrade(&plan).await
    }

    /// Execute an upgrade from user-provided items
    ///
    /// The target contract is derived from the core provider's target
    /// version (its current version when the core is not in the subset).
    /// Every item must support the target contract and every member left
    /// out of the subset must already support it.
    pub async fn apply_custom_plan(
        &self,
        core_instance_name: &str,
        items: Vec<UpgradeItem>,
    ) -> Result<()> {
        info!(core = %core_instance_name, "Performing upgrade...");

        let group = self.management_group(core_instance_name).await?;
        let plan = self.create_custom_plan(&group, items).await?;
        self.do_upgrade(&plan).await
    }

    async fn management_group(&self, core_instance_name: &str) -> Result<ManagementGroup> {
        let groups = self.inventory.management_groups().await?;
        groups
            .into_iter()
            .find(|g| g.core.instance_name() == core_instance_name)
            .ok_or_else(|| {
                Error::validation(format!(
                    "unable to identify the management group for {}",
                    core_instance_name
                ))
            })
    }

    async fn upgrade_info(&self, provider: &Provider) -> Result<UpgradeInfo> {
        let repository = self.repositories.repository_for(provider)?;
        let versions = repository.versions().await?;
        // The latest release publishes the most complete series table.
        let metadata_version = versions
            .last()
            .cloned()
            .map(Ok)
            .unwrap_or_else(|| parse_version(&provider.version))?;
        let metadata = repository.metadata(&metadata_version).await?;
        UpgradeInfo::new(provider.clone(), metadata, versions)
    }

    async fn plan_for_group(
        &self,
        group: &ManagementGroup,
        contract: &str,
    ) -> Result<UpgradePlan> {
        let mut items = Vec::with_capacity(group.providers.len());
        for provider in &group.providers {
            let info = self.upgrade_info(provider).await?;
            let next_version = info.latest_next_version(contract);
            items.push(UpgradeItem {
                provider: provider.clone(),
                next_version: version_tag(next_version.as_ref()),
            });
        }

        Ok(UpgradePlan {
            contract: contract.to_string(),
            core: group.core.clone(),
            items,
        })
    }

    async fn contract_for(&self, provider: &Provider, tag: &str) -> Result<String> {
        let version = parse_version(tag)?;
        let info = self.upgrade_info(provider).await?;
        info.contract_for_version(&version)
    }

    async fn create_custom_plan(
        &self,
        group: &ManagementGroup,
        items: Vec<UpgradeItem>,
    ) -> Result<UpgradePlan> {
        // The target contract follows the core provider's target version.
        let target_core_version = items
            .iter()
            .find(|i| i.provider.instance_name() == group.core.instance_name())
            .map(|i| i.next_version.clone())
            .unwrap_or_else(|| group.core.version.clone());
        let target_contract = self.contract_for(&group.core, &target_core_version).await?;

        let mut plan = UpgradePlan {
            contract: target_contract.clone(),
            core: group.core.clone(),
            items: Vec::new(),
        };

        let mut upgraded_instance_names = Vec::new();
        for item in items {
            let provider = group
                .provider(&item.provider.instance_name())
                .ok_or_else(|| {
                    Error::validation(format!(
                        "provider {} is not part of the {} management group",
                        item.provider.instance_name(),
                        group.core.instance_name()
                    ))
                })?;

            let contract = self.contract_for(provider, &item.next_version).await?;
            if contract != target_contract {
                return Err(Error::ContractMismatch {
                    provider: provider.instance_name(),
                    expected: target_contract,
                    found: contract,
                });
            }

            upgraded_instance_names.push(provider.instance_name());
            // Carry auxiliary fields (watched namespace) from the inventory
            // record into the item.
            plan.items.push(UpgradeItem {
                provider: provider.clone(),
                next_version: item.next_version,
            });
        }

        // Members left out of the subset must already be on the target
        // contract.
        for provider in &group.providers {
            if upgraded_instance_names.contains(&provider.instance_name()) {
                continue;
            }
            let contract = self.contract_for(provider, &provider.version).await?;
            if contract != target_contract {
                return Err(Error::ContractLagging {
                    provider: provider.instance_name(),
                    expected: target_contract,
                    found: contract,
                });
            }
        }

        Ok(plan)
    }

    /// Upgrade every item with a target version, core provider first
    ///
    /// Per item: fetch the components at the target version, delete the
    /// running provider preserving CRDs and namespace, install the new
    /// bundle, record it in the inventory. A failed step aborts the
    /// remaining items; the error surfaces verbatim and the cluster is
    /// left in the documented partial-upgrade state.
    async fn do_upgrade(&self, plan: &UpgradePlan) -> Result<()> {
        let mut items: Vec<&UpgradeItem> = plan.items.iter().collect();
        items.sort_by(|a, b| {
            (a.provider.provider_type.upgrade_order(), &a.provider.name)
                .cmp(&(b.provider.provider_type.upgrade_order(), &b.provider.name))
        });

        for item in items {
            if item.next_version.is_empty() {
                continue;
            }

            info!(
                provider = %item.provider.instance_name(),
                from = %item.provider.version,
                to = %item.next_version,
                "Upgrading provider"
            );

            let repository = self.repositories.repository_for(&item.provider)?;
            let components = repository
                .components(&ComponentsOptions {
                    version: item.next_version.clone(),
                    target_namespace: item.provider.namespace.clone(),
                    watched_namespace: item.provider.watched_namespace.clone(),
                })
                .await?;

            self.installer
                .delete(
                    &item.provider,
                    &DeleteOptions {
                        include_namespace: false,
                        include_crds: false,
                    },
                )
                .await?;

            let record = Provider {
                version: item.next_version.clone(),
                contract: plan.contract.clone(),
                ..item.provider.clone()
            };
            install_and_record(&self.installer, &self.inventory, &components, &record).await?;
        }

        Ok(())
    }
}
