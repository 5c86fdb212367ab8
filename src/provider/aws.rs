//! AWS translation.
//!
//! Databases and caches get a subnet group when placed in a network,
//! compute services run as an ECS task definition plus service, and load
//! balancers are an ALB with one listener.

use super::ProviderResult;
use super::adapter::{CloudAdapter, Translator};
use super::api::ApiCall;
use super::common::{
    SizeTier, Step, engine, engine_port, env_map, flag, integer, number, remote_name,
    required_text, text,
};
use crate::config::ProviderKind;
use crate::error::ProviderError;
use crate::model::{Resource, ResourceKind};

/// Adapter for AWS.
pub type AwsAdapter = CloudAdapter<Aws>;

/// AWS attribute translation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aws;

const DB_CLASSES: [&str; 4] = ["db.t3.micro", "db.t3.medium", "db.r6g.large", "db.r6g.xlarge"];
const CACHE_NODES: [&str; 4] = [
    "cache.t3.micro",
    "cache.t3.medium",
    "cache.r6g.large",
    "cache.r6g.xlarge",
];
/// Fargate vCPU sizes and their CPU units.
const FARGATE_CPU: [(f64, u64); 5] = [(0.25, 256), (0.5, 512), (1.0, 1024), (2.0, 2048), (4.0, 4096)];
const LOG_RETENTION_DAYS: [u64; 17] = [
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1827, 3653,
];

impl Translator for Aws {
    const PROVIDER: ProviderKind = ProviderKind::Aws;

    fn translate(&self, resource: &Resource, region: &str) -> ProviderResult<Vec<Step>> {
        let name = remote_name(&resource.id);
        match resource.kind {
            ResourceKind::Network => Ok(vec![Step::primary(
                ApiCall::new("ec2/vpc")
                    .param("name", name)
                    .param("cidr_block", required_text(resource, "cidr")?)
                    .param("enable_dns_hostnames", true),
            )]),
            ResourceKind::Subnet => Ok(vec![Step::primary(
                ApiCall::new("ec2/subnet")
                    .param("name", name)
                    .param("vpc_id", required_text(resource, "network")?)
                    .param("cidr_block", required_text(resource, "cidr")?)
                    .param_opt("availability_zone", text(resource, "zone")?),
            )]),
            ResourceKind::Database => database(resource, &name),
            ResourceKind::Cache => cache(resource, &name),
            ResourceKind::ComputeService => compute(resource, &name, region),
            ResourceKind::SecretStore => Ok(vec![Step::primary(
                ApiCall::new("secretsmanager/secret")
                    .param("name", name)
                    .param_opt("description", text(resource, "description")?),
            )]),
            ResourceKind::LoadBalancer => load_balancer(resource, &name),
            ResourceKind::LogGroup => {
                let days = integer(resource, "retention_days", 30)?;
                if !LOG_RETENTION_DAYS.contains(&days) {
                    return Err(ProviderError::unsupported(
                        &resource.id,
                        "retention_days",
                        "is not a CloudWatch Logs retention period",
                    ));
                }
                Ok(vec![Step::primary(
                    ApiCall::new("logs/log-group")
                        .param("name", name)
                        .param("retention_in_days", days),
                )])
            }
        }
    }

    fn secret_reference(&self, _resource: &Resource, remote_id: &str, region: &str) -> String {
        format!("arn:aws:secretsmanager:{region}:secret:{remote_id}")
    }
}

/// Prepends a subnet group step when the resource names a subnet.
fn with_subnet_group(
    resource: &Resource,
    name: &str,
    path: &str,
    link: &'static str,
    primary: ApiCall,
) -> ProviderResult<Vec<Step>> {
    match text(resource, "subnet")? {
        Some(subnet) => Ok(vec![
            Step::auxiliary(
                ApiCall::new(path)
                    .param("name", format!("{name}-subnets"))
                    .param("subnet_ids", vec![subnet]),
            ),
            Step::primary(primary).linked(link),
        ]),
        None => Ok(vec![Step::primary(primary)]),
    }
}

fn database(resource: &Resource, name: &str) -> ProviderResult<Vec<Step>> {
    let tier = SizeTier::of(resource)?;
    let engine = engine(resource)?;
    let instance = ApiCall::new("rds/db-instance")
        .param("name", name)
        .param("engine", engine.clone())
        .param_opt("engine_version", text(resource, "version")?)
        .param("instance_class", tier.pick(DB_CLASSES))
        .param("allocated_storage", integer(resource, "storage_gb", 20)?)
        .param("multi_az", flag(resource, "high_availability", false)?)
        .param("port", engine_port(&engine));
    with_subnet_group(resource, name, "rds/db-subnet-group", "db_subnet_group", instance)
}

fn cache(resource: &Resource, name: &str) -> ProviderResult<Vec<Step>> {
    let tier = SizeTier::of(resource)?;
    let engine = engine(resource)?;
    let replicated = flag(resource, "high_availability", false)?;
    if replicated && engine == "memcached" {
        return Err(ProviderError::unsupported(
            &resource.id,
            "high_availability",
            "is not available for memcached on ElastiCache",
        ));
    }
    let cluster = ApiCall::new("elasticache/cluster")
        .param("name", name)
        .param("engine", engine.clone())
        .param("node_type", tier.pick(CACHE_NODES))
        .param("num_cache_nodes", if replicated { 2 } else { 1 })
        .param("port", engine_port(&engine));
    with_subnet_group(
        resource,
        name,
        "elasticache/subnet-group",
        "cache_subnet_group",
        cluster,
    )
}

fn compute(resource: &Resource, name: &str, region: &str) -> ProviderResult<Vec<Step>> {
    let cpu = number(resource, "cpu", 0.5)?;
    let Some((_, units)) = FARGATE_CPU.iter().find(|(v, _)| (v - cpu).abs() < f64::EPSILON) else {
        return Err(ProviderError::unsupported(
            &resource.id,
            "cpu",
            "must be one of 0.25, 0.5, 1, 2, 4 on Fargate",
        ));
    };
    let memory = integer(resource, "memory_mb", 1024)?;
    if memory < 512 || memory > units * 8 {
        return Err(ProviderError::unsupported(
            &resource.id,
            "memory_mb",
            format!("must be between 512 and {} for {cpu} vCPU", units * 8),
        ));
    }

    let task = ApiCall::new("ecs/task-definition")
        .param("name", format!("{name}-task"))
        .param("image", required_text(resource, "image")?)
        .param("cpu", *units)
        .param("memory", memory)
        .param("container_port", integer(resource, "port", 8080)?)
        .param("log_region", region)
        .param_opt("environment", env_map(resource)?);
    let service = ApiCall::new("ecs/service")
        .param("name", name)
        .param("launch_type", "FARGATE")
        .param("desired_count", integer(resource, "replicas", 1)?)
        .param_opt("subnet_id", text(resource, "subnet")?);

    Ok(vec![Step::auxiliary(task), Step::primary(service).linked("task_definition")])
}

fn load_balancer(resource: &Resource, name: &str) -> ProviderResult<Vec<Step>> {
    let port = integer(resource, "port", 443)?;
    let public = flag(resource, "public", true)?;
    let balancer = ApiCall::new("elbv2/load-balancer")
        .param("name", name)
        .param("type", "application")
        .param("scheme", if public { "internet-facing" } else { "internal" })
        .param_opt("subnet_id", text(resource, "subnet")?);
    let listener = ApiCall::new("elbv2/listener")
        .param("name", format!("{name}-listener"))
        .param("port", port)
        .param("protocol", if port == 443 { "HTTPS" } else { "HTTP" })
        .param("target", required_text(resource, "target")?);

    Ok(vec![Step::primary(balancer), Step::auxiliary(listener).linked("load_balancer_arn")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderAdapter, RetryPolicy, SimulatedCloud};
    use serde_json::json;
    use std::sync::Arc;

    fn adapter() -> (Arc<SimulatedCloud>, AwsAdapter) {
        let sim = Arc::new(SimulatedCloud::new(ProviderKind::Aws, "eu-west-1"));
        let adapter = AwsAdapter::new(Aws, sim.clone()).with_retry(RetryPolicy::immediate());
        (sim, adapter)
    }

    #[test]
    fn test_database_tiers() {
        let (_, adapter) = adapter();
        for (size, class) in [
            ("small", "db.t3.micro"),
            ("medium", "db.t3.medium"),
            ("large", "db.r6g.large"),
            ("xlarge", "db.r6g.xlarge"),
        ] {
            let db = Resource::new("db", ResourceKind::Database).with_attribute("size", size);
            let params = adapter.normalize(&db).expect("normalize");
            assert_eq!(params["instance_class"], json!(class));
            assert_eq!(params["engine"], json!("postgres"));
        }
    }

    #[tokio::test]
    async fn test_database_in_subnet_is_composite() {
        let (sim, adapter) = adapter();
        let db = Resource::new("orders_db", ResourceKind::Database)
            .with_attribute("subnet", "subnet-000002")
            .with_attribute("engine", "mysql");

        let binding = adapter.create(&db).await.expect("create");
        assert_eq!(binding.components.len(), 2);
        assert_eq!(binding.components[0].path, "rds/db-subnet-group");
        assert_eq!(binding.remote_attributes["port"], json!(3306));
        assert_eq!(binding.remote_attributes["name"], json!("orders-db"));
        assert!(
            binding.remote_attributes["endpoint"]
                .as_str()
                .is_some_and(|e| e.starts_with("orders-db-"))
        );
        assert_eq!(sim.objects().await.len(), 2);
    }

    #[tokio::test]
    async fn test_compute_service_url() {
        let (_, adapter) = adapter();
        let svc = Resource::new("api", ResourceKind::ComputeService)
            .with_attribute("image", "ghcr.io/shop/api:1.2")
            .with_attribute("cpu", 1)
            .with_attribute("memory_mb", 2048);

        let binding = adapter.create(&svc).await.expect("create");
        assert_eq!(binding.components[0].path, "ecs/task-definition");
        let task_id = binding.components[0].id.clone();
        assert_eq!(binding.remote_attributes["task_definition"], json!(task_id));
        assert!(
            binding.remote_attributes["url"]
                .as_str()
                .is_some_and(|u| u.starts_with("https://api-"))
        );
    }

    #[test]
    fn test_unsupported_combinations() {
        let (_, adapter) = adapter();

        let svc = Resource::new("api", ResourceKind::ComputeService)
            .with_attribute("image", "x:1")
            .with_attribute("cpu", 3);
        let err = adapter.normalize(&svc).expect_err("cpu");
        assert!(matches!(err, ProviderError::UnsupportedConfiguration { ref attribute, .. } if attribute == "cpu"));

        let cache = Resource::new("c", ResourceKind::Cache)
            .with_attribute("engine", "memcached")
            .with_attribute("high_availability", true);
        assert!(adapter.normalize(&cache).is_err());

        let logs = Resource::new("logs", ResourceKind::LogGroup).with_attribute("retention_days", 10);
        assert!(adapter.normalize(&logs).is_err());
    }

    #[tokio::test]
    async fn test_secret_reference_and_balancer() {
        let (_, adapter) = adapter();
        let secrets = Resource::new("secrets", ResourceKind::SecretStore);
        let binding = adapter.create(&secrets).await.expect("create");
        let remote_id = binding.remote_id.clone().expect("id");
        let expected = format!("arn:aws:secretsmanager:eu-west-1:secret:{remote_id}");
        assert_eq!(binding.remote_attributes["reference"], json!(expected));

        let lb = Resource::new("edge", ResourceKind::LoadBalancer).with_attribute("target", "api.internal");
        let binding = adapter.create(&lb).await.expect("create");
        assert_eq!(binding.remote_id.as_deref(), Some(binding.components[0].id.as_str()));
        assert!(binding.remote_attributes.contains_key("dns_name"));
    }
}
