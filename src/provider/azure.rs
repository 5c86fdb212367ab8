//! Azure translation.
//!
//! Databases are flexible servers with an application database, compute
//! services are Container Apps inside a managed environment, and load
//! balancers are application gateways.

use super::ProviderResult;
use super::adapter::{CloudAdapter, Translator};
use super::api::ApiCall;
use super::common::{
    SizeTier, Step, engine, env_map, flag, integer, number, remote_name, required_text, text,
};
use crate::config::ProviderKind;
use crate::error::ProviderError;
use crate::model::{Resource, ResourceKind};

/// Adapter for Azure.
pub type AzureAdapter = CloudAdapter<Azure>;

/// Azure attribute translation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Azure;

const SERVER_SKUS: [&str; 4] = [
    "Standard_B1ms",
    "Standard_D2s_v3",
    "Standard_D4s_v3",
    "Standard_D8s_v3",
];
/// Redis SKU name, family and capacity per tier.
const REDIS_SKUS: [(&str, &str, u64); 4] = [
    ("Basic", "C", 0),
    ("Standard", "C", 1),
    ("Standard", "C", 3),
    ("Premium", "P", 1),
];

impl Translator for Azure {
    const PROVIDER: ProviderKind = ProviderKind::Azure;

    fn translate(&self, resource: &Resource, region: &str) -> ProviderResult<Vec<Step>> {
        let name = remote_name(&resource.id);
        match resource.kind {
            ResourceKind::Network => Ok(vec![Step::primary(
                ApiCall::new("network/virtual-networks")
                    .param("name", name)
                    .param("location", region)
                    .param("address_space", vec![required_text(resource, "cidr")?]),
            )]),
            ResourceKind::Subnet => Ok(vec![Step::primary(
                ApiCall::new("network/subnets")
                    .param("name", name)
                    .param("virtual_network", required_text(resource, "network")?)
                    .param("address_prefix", required_text(resource, "cidr")?),
            )]),
            ResourceKind::Database => database(resource, &name, region),
            ResourceKind::Cache => cache(resource, &name, region),
            ResourceKind::ComputeService => compute(resource, &name, region),
            ResourceKind::SecretStore => Ok(vec![Step::primary(
                ApiCall::new("keyvault/vaults")
                    .param("name", name)
                    .param("location", region)
                    .param("sku", "standard"),
            )]),
            ResourceKind::LoadBalancer => {
                let public = flag(resource, "public", true)?;
                Ok(vec![Step::primary(
                    ApiCall::new("network/application-gateways")
                        .param("name", name)
                        .param("location", region)
                        .param("sku", "Standard_v2")
                        .param("frontend_port", integer(resource, "port", 443)?)
                        .param("backend_address", required_text(resource, "target")?)
                        .param("public_frontend", public)
                        .param_opt("subnet", text(resource, "subnet")?),
                )])
            }
            ResourceKind::LogGroup => {
                let days = integer(resource, "retention_days", 30)?;
                if !(30..=730).contains(&days) {
                    return Err(ProviderError::unsupported(
                        &resource.id,
                        "retention_days",
                        "must be between 30 and 730 on Log Analytics",
                    ));
                }
                Ok(vec![Step::primary(
                    ApiCall::new("operationalinsights/workspaces")
                        .param("name", name)
                        .param("location", region)
                        .param("sku", "PerGB2018")
                        .param("retention_in_days", days),
                )])
            }
        }
    }

    fn secret_reference(&self, resource: &Resource, _remote_id: &str, _region: &str) -> String {
        format!("https://{}.vault.azure.net/", remote_name(&resource.id))
    }
}

fn database(resource: &Resource, name: &str, region: &str) -> ProviderResult<Vec<Step>> {
    let tier = SizeTier::of(resource)?;
    let engine = engine(resource)?;
    let zone_redundant = flag(resource, "high_availability", false)?;
    if zone_redundant && tier == SizeTier::Small {
        return Err(ProviderError::unsupported(
            &resource.id,
            "high_availability",
            "is not available on the Burstable tier (size small)",
        ));
    }

    let (family, default_version) = if engine == "mysql" {
        ("mysql", "8.0.21")
    } else {
        ("postgresql", "16")
    };
    let server = ApiCall::new(format!("{family}/flexible-servers"))
        .param("name", name)
        .param("location", region)
        .param("sku_name", tier.pick(SERVER_SKUS))
        .param(
            "version",
            text(resource, "version")?.unwrap_or_else(|| default_version.to_string()),
        )
        .param("storage_size_gb", integer(resource, "storage_gb", 32)?)
        .param(
            "high_availability",
            if zone_redundant { "ZoneRedundant" } else { "Disabled" },
        )
        .param_opt("delegated_subnet", text(resource, "subnet")?);
    let database = ApiCall::new(format!("{family}/databases"))
        .param("name", format!("{name}-app"))
        .param("charset", "UTF8");

    Ok(vec![Step::primary(server), Step::auxiliary(database).linked("server")])
}

fn cache(resource: &Resource, name: &str, region: &str) -> ProviderResult<Vec<Step>> {
    let tier = SizeTier::of(resource)?;
    if engine(resource)? == "memcached" {
        return Err(ProviderError::unsupported(
            &resource.id,
            "engine",
            "memcached is not offered by Azure Cache for Redis",
        ));
    }
    let replicated = flag(resource, "high_availability", false)?;
    if replicated && tier == SizeTier::Small {
        return Err(ProviderError::unsupported(
            &resource.id,
            "high_availability",
            "is not available on the Basic tier (size small)",
        ));
    }
    let (sku, family, capacity) = tier.pick(REDIS_SKUS);

    Ok(vec![Step::primary(
        ApiCall::new("cache/redis")
            .param("name", name)
            .param("location", region)
            .param("sku", sku)
            .param("family", family)
            .param("capacity", capacity)
            .param("replicas_per_primary", u64::from(replicated))
            .param_opt("subnet", text(resource, "subnet")?),
    )])
}

fn compute(resource: &Resource, name: &str, region: &str) -> ProviderResult<Vec<Step>> {
    let cpu = number(resource, "cpu", 0.5)?;
    let quarters = cpu * 4.0;
    if !(1.0..=8.0).contains(&quarters) || quarters.fract() != 0.0 {
        return Err(ProviderError::unsupported(
            &resource.id,
            "cpu",
            "must be a multiple of 0.25 between 0.25 and 2 on Container Apps",
        ));
    }
    let memory_gb = cpu * 2.0;
    if let Some(memory_mb) = resource.attributes.get("memory_mb") {
        let expected = memory_gb * 1024.0;
        if memory_mb.as_f64().is_none_or(|m| (m - expected).abs() > f64::EPSILON) {
            return Err(ProviderError::unsupported(
                &resource.id,
                "memory_mb",
                format!("must be {expected} (2 GiB per vCPU) on Container Apps"),
            ));
        }
    }

    let environment = ApiCall::new("app/managed-environments")
        .param("name", format!("{name}-env"))
        .param("location", region)
        .param_opt("infrastructure_subnet", text(resource, "subnet")?);
    let app = ApiCall::new("app/container-apps")
        .param("name", name)
        .param("location", region)
        .param("image", required_text(resource, "image")?)
        .param("cpu", cpu)
        .param("memory", format!("{memory_gb}Gi"))
        .param("target_port", integer(resource, "port", 8080)?)
        .param("min_replicas", integer(resource, "replicas", 1)?)
        .param_opt("env", env_map(resource)?);

    Ok(vec![Step::auxiliary(environment), Step::primary(app).linked("environment")])
}
