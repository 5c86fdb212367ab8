//! GCP translation.
//!
//! Cloud SQL instances get an application database, caches are Memorystore
//! for Redis, compute services run on Cloud Run and load balancers are a
//! backend service behind a forwarding rule.

use super::ProviderResult;
use super::adapter::{CloudAdapter, Translator};
use super::api::ApiCall;
use super::common::{
    SizeTier, Step, engine, env_map, flag, integer, number, remote_name, required_text, text,
};
use crate::config::ProviderKind;
use crate::error::ProviderError;
use crate::model::{Resource, ResourceKind};

/// Adapter for GCP.
pub type GcpAdapter = CloudAdapter<Gcp>;

/// GCP attribute translation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gcp;

const SQL_TIERS: [&str; 4] = [
    "db-f1-micro",
    "db-custom-2-7680",
    "db-custom-4-15360",
    "db-custom-8-30720",
];
const REDIS_MEMORY_GB: [u64; 4] = [1, 5, 13, 26];
const RUN_CPUS: [u64; 4] = [1, 2, 4, 8];

impl Translator for Gcp {
    const PROVIDER: ProviderKind = ProviderKind::Gcp;

    fn translate(&self, resource: &Resource, region: &str) -> ProviderResult<Vec<Step>> {
        let name = remote_name(&resource.id);
        match resource.kind {
            ResourceKind::Network => {
                required_text(resource, "cidr")?;
                Ok(vec![Step::primary(
                    ApiCall::new("compute/networks")
                        .param("name", name)
                        .param("auto_create_subnetworks", false)
                        .param("routing_mode", "REGIONAL"),
                )])
            }
            ResourceKind::Subnet => Ok(vec![Step::primary(
                ApiCall::new("compute/subnetworks")
                    .param("name", name)
                    .param("network", required_text(resource, "network")?)
                    .param("ip_cidr_range", required_text(resource, "cidr")?)
                    .param("region", region),
            )]),
            ResourceKind::Database => database(resource, &name, region),
            ResourceKind::Cache => cache(resource, &name, region),
            ResourceKind::ComputeService => compute(resource, &name, region),
            ResourceKind::SecretStore => Ok(vec![Step::primary(
                ApiCall::new("secretmanager/secrets")
                    .param("name", name)
                    .param("replication", "automatic"),
            )]),
            ResourceKind::LoadBalancer => load_balancer(resource, &name),
            ResourceKind::LogGroup => {
                let days = integer(resource, "retention_days", 30)?;
                if !(1..=3650).contains(&days) {
                    return Err(ProviderError::unsupported(
                        &resource.id,
                        "retention_days",
                        "must be between 1 and 3650 on Cloud Logging",
                    ));
                }
                Ok(vec![Step::primary(
                    ApiCall::new("logging/buckets")
                        .param("name", name)
                        .param("location", region)
                        .param("retention_days", days),
                )])
            }
        }
    }

    fn secret_reference(&self, resource: &Resource, _remote_id: &str, _region: &str) -> String {
        format!("projects/_/secrets/{}", remote_name(&resource.id))
    }
}

fn database_version(resource: &Resource, engine: &str) -> ProviderResult<String> {
    let version = text(resource, "version")?;
    Ok(match (engine, version) {
        ("mysql", None) => String::from("MYSQL_8_0"),
        ("mysql", Some(v)) => format!("MYSQL_{}", v.replace('.', "_")),
        (_, None) => String::from("POSTGRES_15"),
        (_, Some(v)) => format!("POSTGRES_{v}"),
    })
}

fn database(resource: &Resource, name: &str, region: &str) -> ProviderResult<Vec<Step>> {
    let tier = SizeTier::of(resource)?;
    let engine = engine(resource)?;
    let regional = flag(resource, "high_availability", false)?;
    if regional && tier == SizeTier::Small {
        return Err(ProviderError::unsupported(
            &resource.id,
            "high_availability",
            "requires size medium or larger on Cloud SQL (shared-core tier)",
        ));
    }

    let instance = ApiCall::new("sql/instances")
        .param("name", name)
        .param("region", region)
        .param("database_version", database_version(resource, &engine)?)
        .param("tier", tier.pick(SQL_TIERS))
        .param("disk_size_gb", integer(resource, "storage_gb", 20)?)
        .param("availability_type", if regional { "REGIONAL" } else { "ZONAL" })
        .param_opt("private_network", text(resource, "network")?);
    let database = ApiCall::new("sql/databases")
        .param("name", format!("{name}-app"))
        .param("charset", "UTF8");

    Ok(vec![Step::primary(instance), Step::auxiliary(database).linked("instance")])
}

fn cache(resource: &Resource, name: &str, region: &str) -> ProviderResult<Vec<Step>> {
    let tier = SizeTier::of(resource)?;
    if engine(resource)? == "memcached" {
        return Err(ProviderError::unsupported(
            &resource.id,
            "engine",
            "memcached is not offered by Memorystore for Redis",
        ));
    }
    let replicated = flag(resource, "high_availability", false)?;

    Ok(vec![Step::primary(
        ApiCall::new("redis/instances")
            .param("name", name)
            .param("region", region)
            .param("tier", if replicated { "STANDARD_HA" } else { "BASIC" })
            .param("memory_size_gb", tier.pick(REDIS_MEMORY_GB))
            .param_opt("authorized_network", text(resource, "network")?),
    )])
}

fn compute(resource: &Resource, name: &str, region: &str) -> ProviderResult<Vec<Step>> {
    let cpu = number(resource, "cpu", 1.0)?;
    let Some(cpu) = RUN_CPUS
        .iter()
        .copied()
        .find(|c| (*c as f64 - cpu).abs() < f64::EPSILON)
    else {
        return Err(ProviderError::unsupported(
            &resource.id,
            "cpu",
            "must be one of 1, 2, 4, 8 on Cloud Run",
        ));
    };
    let memory = integer(resource, "memory_mb", 512)?;
    if memory < 128 || memory > cpu * 4096 {
        return Err(ProviderError::unsupported(
            &resource.id,
            "memory_mb",
            format!("must be between 128 and {} for {cpu} CPU on Cloud Run", cpu * 4096),
        ));
    }

    Ok(vec![Step::primary(
        ApiCall::new("run/services")
            .param("name", name)
            .param("region", region)
            .param("image", required_text(resource, "image")?)
            .param("cpu", cpu.to_string())
            .param("memory", format!("{memory}Mi"))
            .param("container_port", integer(resource, "port", 8080)?)
            .param("min_instances", integer(resource, "replicas", 1)?)
            .param_opt("vpc_connector", text(resource, "network")?)
            .param_opt("env", env_map(resource)?),
    )])
}

fn load_balancer(resource: &Resource, name: &str) -> ProviderResult<Vec<Step>> {
    let port = integer(resource, "port", 443)?;
    let public = flag(resource, "public", true)?;
    let backend = ApiCall::new("compute/backend-services")
        .param("name", format!("{name}-backend"))
        .param("backend", required_text(resource, "target")?)
        .param("protocol", if port == 443 { "HTTPS" } else { "HTTP" });
    let rule = ApiCall::new("compute/forwarding-rules")
        .param("name", name)
        .param("port_range", port.to_string())
        .param(
            "load_balancing_scheme",
            if public { "EXTERNAL_MANAGED" } else { "INTERNAL_MANAGED" },
        );

    Ok(vec![Step::auxiliary(backend), Step::primary(rule).linked("backend_service")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Fault, ProviderAdapter, RetryPolicy, SimOp, SimulatedCloud};
    use crate::state::BindingStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn adapter() -> (Arc<SimulatedCloud>, GcpAdapter) {
        let sim = Arc::new(SimulatedCloud::new(ProviderKind::Gcp, "europe-west1"));
        let adapter = GcpAdapter::new(Gcp, sim.clone()).with_retry(RetryPolicy::immediate());
        (sim, adapter)
    }

    #[test]
    fn test_tier_mapping() {
        let (_, adapter) = adapter();
        let db = Resource::new("db", ResourceKind::Database)
            .with_attribute("size", "xlarge")
            .with_attribute("high_availability", true);
        let params = adapter.normalize(&db).expect("db");
        assert_eq!(params["tier"], json!("db-custom-8-30720"));
        assert_eq!(params["availability_type"], json!("REGIONAL"));
        assert_eq!(params["database_version"], json!("POSTGRES_15"));

        let cache = Resource::new("cache", ResourceKind::Cache).with_attribute("size", "medium");
        let params = adapter.normalize(&cache).expect("cache");
        assert_eq!(params["memory_size_gb"], json!(5));
        assert_eq!(params["tier"], json!("BASIC"));
    }

    #[test]
    fn test_unsupported_configurations() {
        let (_, adapter) = adapter();

        let cache = Resource::new("cache", ResourceKind::Cache).with_attribute("engine", "memcached");
        let err = adapter.normalize(&cache).expect_err("memcached");
        assert!(matches!(err, ProviderError::UnsupportedConfiguration { ref attribute, .. } if attribute == "engine"));

        let db = Resource::new("db", ResourceKind::Database).with_attribute("high_availability", true);
        assert!(adapter.normalize(&db).is_err());

        let svc = Resource::new("svc", ResourceKind::ComputeService)
            .with_attribute("image", "x:1")
            .with_attribute("cpu", 0.5);
        assert!(adapter.normalize(&svc).is_err());
    }

    #[tokio::test]
    async fn test_database_partial_failure() {
        let (sim, adapter) = adapter();
        sim.inject(Fault::on(SimOp::Create, "sql/databases")).await;

        let db = Resource::new("db", ResourceKind::Database).with_attribute("size", "medium");
        let err = adapter.create(&db).await.expect_err("partial");
        let ProviderError::PartialFailure { binding, .. } = err else {
            panic!("expected partial failure, got {err:?}");
        };
        assert_eq!(binding.status, BindingStatus::Partial);
        assert_eq!(binding.components.len(), 1);
        assert_eq!(binding.components[0].path, "sql/instances");

        sim.clear_faults().await;
        adapter.destroy(&binding).await.expect("cleanup");
        assert!(sim.objects().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_and_read_round_trip() {
        let (_, adapter) = adapter();
        let svc = Resource::new("web", ResourceKind::ComputeService)
            .with_attribute("image", "gcr.io/shop/web:3")
            .with_attribute("cpu", 2)
            .with_attribute("env", json!({"MODE": "prod"}));

        let binding = adapter.create(&svc).await.expect("create");
        let read = adapter.read(&binding).await.expect("read").expect("exists");
        assert_eq!(read.remote_attributes["image"], json!("gcr.io/shop/web:3"));
        assert_eq!(read.remote_attributes["cpu"], json!("2"));
        assert_eq!(read.remote_attributes["env"], json!({"MODE": "prod"}));
        assert_eq!(read.remote_attributes["url"], binding.remote_attributes["url"]);

        let secrets = Resource::new("app_secrets", ResourceKind::SecretStore);
        let binding = adapter.create(&secrets).await.expect("create");
        assert_eq!(
            binding.remote_attributes["reference"],
            json!("projects/_/secrets/app-secrets")
        );
    }
}
