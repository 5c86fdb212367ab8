//! Pieces shared by every adapter: retries, composite steps, size tiers,
//! attribute readers and the canonical attributes exposed to placeholders
//! and outputs.

use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::ProviderResult;
use super::api::{ApiCall, RemoteObject};
use crate::config::{ProviderKind, SIZE_TIERS};
use crate::error::ProviderError;
use crate::model::{Resource, ResourceKind};

/// Retry behaviour for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further one.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Three attempts without waiting.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32, err: &ProviderError) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let wanted = match err {
            ProviderError::Throttled {
                retry_after_secs, ..
            } => backoff.max(Duration::from_secs(*retry_after_secs)),
            _ => backoff,
        };
        wanted.min(self.max_delay)
    }
}

/// Runs `op`, retrying transient failures with exponential backoff.
///
/// # Errors
///
/// Returns the first permanent error, or the last transient one once the
/// attempts are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt, &e);
                warn!("{what} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}", policy.max_attempts);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One remote object of a resource's translation.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub(crate) call: ApiCall,
    pub(crate) link: Option<&'static str>,
    pub(crate) primary: bool,
}

impl Step {
    /// The object whose id becomes the resource's remote id.
    #[must_use]
    pub const fn primary(call: ApiCall) -> Self {
        Self {
            call,
            link: None,
            primary: true,
        }
    }

    /// A supporting object created alongside the primary one.
    #[must_use]
    pub const fn auxiliary(call: ApiCall) -> Self {
        Self {
            call,
            link: None,
            primary: false,
        }
    }

    /// Passes the previous step's remote id in parameter `param`.
    #[must_use]
    pub const fn linked(mut self, param: &'static str) -> Self {
        self.link = Some(param);
        self
    }

    /// Returns the API call.
    #[must_use]
    pub const fn call(&self) -> &ApiCall {
        &self.call
    }

    /// Returns true for the primary step.
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        self.primary
    }
}

/// Generic size tiers shared by every provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeTier {
    /// Development-sized.
    Small,
    /// Default production size.
    Medium,
    /// Memory or CPU heavy.
    Large,
    /// Largest supported.
    XLarge,
}

impl SizeTier {
    /// Reads the `size` attribute, defaulting to small.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedConfiguration` for an unknown tier.
    pub fn of(resource: &Resource) -> ProviderResult<Self> {
        match text(resource, "size")?.as_deref() {
            None | Some("small") => Ok(Self::Small),
            Some("medium") => Ok(Self::Medium),
            Some("large") => Ok(Self::Large),
            Some("xlarge") => Ok(Self::XLarge),
            Some(other) => Err(ProviderError::unsupported(
                &resource.id,
                "size",
                format!("has unknown tier '{other}' (expected {})", SIZE_TIERS.join(", ")),
            )),
        }
    }

    /// Picks the entry for this tier from a small..xlarge table.
    #[must_use]
    pub fn pick<T: Copy>(self, table: [T; 4]) -> T {
        table[self as usize]
    }
}

/// Reads an optional string attribute; numbers are accepted as text.
pub(crate) fn text(resource: &Resource, key: &str) -> ProviderResult<Option<String>> {
    match resource.attributes.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(ProviderError::unsupported(&resource.id, key, "must be a string")),
    }
}

/// Reads a required string attribute.
pub(crate) fn required_text(resource: &Resource, key: &str) -> ProviderResult<String> {
    text(resource, key)?.ok_or_else(|| ProviderError::unsupported(&resource.id, key, "is required"))
}

/// Reads a numeric attribute.
pub(crate) fn number(resource: &Resource, key: &str, default: f64) -> ProviderResult<f64> {
    match resource.attributes.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ProviderError::unsupported(&resource.id, key, "must be a number")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| ProviderError::unsupported(&resource.id, key, "must be a number")),
        Some(_) => Err(ProviderError::unsupported(&resource.id, key, "must be a number")),
    }
}

/// Reads a non-negative integer attribute.
pub(crate) fn integer(resource: &Resource, key: &str, default: u64) -> ProviderResult<u64> {
    match resource.attributes.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            ProviderError::unsupported(&resource.id, key, "must be a non-negative integer")
        }),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| {
            ProviderError::unsupported(&resource.id, key, "must be a non-negative integer")
        }),
        Some(_) => Err(ProviderError::unsupported(
            &resource.id,
            key,
            "must be a non-negative integer",
        )),
    }
}

/// Reads a boolean attribute.
pub(crate) fn flag(resource: &Resource, key: &str, default: bool) -> ProviderResult<bool> {
    match resource.attributes.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s == "true" || s == "false" => Ok(s == "true"),
        Some(_) => Err(ProviderError::unsupported(&resource.id, key, "must be true or false")),
    }
}

/// Reads the `env` attribute, which must be a map.
pub(crate) fn env_map(resource: &Resource) -> ProviderResult<Option<Value>> {
    match resource.attributes.get("env") {
        None | Some(Value::Null) => Ok(None),
        Some(v @ Value::Object(_)) => Ok(Some(v.clone())),
        Some(_) => Err(ProviderError::unsupported(&resource.id, "env", "must be a map")),
    }
}

/// Reads the database or cache engine.
pub(crate) fn engine(resource: &Resource) -> ProviderResult<String> {
    let (default, allowed): (&str, &[&str]) = match resource.kind {
        ResourceKind::Cache => ("redis", &["redis", "memcached"]),
        _ => ("postgres", &["postgres", "mysql"]),
    };
    let engine = text(resource, "engine")?.unwrap_or_else(|| default.to_string());
    if allowed.contains(&engine.as_str()) {
        Ok(engine)
    } else {
        Err(ProviderError::unsupported(
            &resource.id,
            "engine",
            format!("must be one of {}", allowed.join(", ")),
        ))
    }
}

/// Default listening port of an engine.
pub(crate) fn engine_port(engine: &str) -> u16 {
    match engine {
        "mysql" => 3306,
        "memcached" => 11211,
        "redis" => 6379,
        _ => 5432,
    }
}

/// Turns a resource id into a name most clouds accept.
pub(crate) fn remote_name(id: &str) -> String {
    id.replace('_', "-")
}

/// Canonical attributes fixed at create time rather than read from the object.
pub(crate) fn carried_attributes(
    resource: &Resource,
    secret_reference: Option<String>,
) -> ProviderResult<BTreeMap<String, Value>> {
    let mut carried = BTreeMap::new();
    match resource.kind {
        ResourceKind::Network | ResourceKind::Subnet => {
            if let Some(cidr) = text(resource, "cidr")? {
                carried.insert(String::from("cidr"), Value::String(cidr));
            }
        }
        ResourceKind::Database => {
            let engine = engine(resource)?;
            carried.insert(String::from("port"), Value::from(engine_port(&engine)));
            carried.insert(String::from("engine"), Value::String(engine));
        }
        ResourceKind::Cache => {
            let engine = engine(resource)?;
            carried.insert(String::from("port"), Value::from(engine_port(&engine)));
        }
        ResourceKind::SecretStore => {
            if let Some(reference) = secret_reference {
                carried.insert(String::from("reference"), Value::String(reference));
            }
        }
        ResourceKind::LogGroup => {
            carried.insert(String::from("name"), Value::String(remote_name(&resource.id)));
        }
        ResourceKind::ComputeService | ResourceKind::LoadBalancer => {}
    }
    Ok(carried)
}

/// Keys of [`carried_attributes`] for a kind.
pub(crate) const fn carried_keys(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Network | ResourceKind::Subnet => &["cidr"],
        ResourceKind::Database => &["engine", "port"],
        ResourceKind::Cache => &["port"],
        ResourceKind::SecretStore => &["reference"],
        ResourceKind::LogGroup => &["name"],
        ResourceKind::ComputeService | ResourceKind::LoadBalancer => &[],
    }
}

/// Builds a binding's remote attributes from the primary object.
///
/// Carried values fill the canonical keys, host-derived keys come from the
/// object's hostname, and the object's own attributes win over both.
pub(crate) fn exposed_attributes(
    provider: ProviderKind,
    kind: ResourceKind,
    object: &RemoteObject,
    carried: &BTreeMap<String, Value>,
) -> ProviderResult<BTreeMap<String, Value>> {
    let mut attributes: BTreeMap<String, Value> = carried_keys(kind)
        .iter()
        .filter_map(|k| carried.get(*k).map(|v| ((*k).to_string(), v.clone())))
        .collect();

    let host_key = match kind {
        ResourceKind::Database | ResourceKind::Cache => Some("endpoint"),
        ResourceKind::ComputeService => Some("url"),
        ResourceKind::LoadBalancer => Some("dns_name"),
        _ => None,
    };
    if let Some(key) = host_key {
        let host = object.hostname().ok_or_else(|| ProviderError::InvalidResponse {
            provider,
            message: format!("{} {} has no hostname", object.path, object.id),
        })?;
        let value = if kind == ResourceKind::ComputeService {
            format!("https://{host}")
        } else {
            host.to_string()
        };
        attributes.insert(key.to_string(), Value::String(value));
    }

    attributes.extend(object.attributes.clone());
    attributes.insert(String::from("id"), Value::String(object.id.clone()));
    debug!("Exposed {} attributes for {}", attributes.len(), object.id);
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(), "create", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::Throttled {
                    provider: ProviderKind::Aws,
                    retry_after_secs: 0,
                })
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.expect("third attempt"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = with_retry(&RetryPolicy::immediate(), "create", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::unavailable(ProviderKind::Gcp, "down"))
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = with_retry(&RetryPolicy::immediate(), "create", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::api(ProviderKind::Azure, 400, "bad"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3),
        };
        let outage = ProviderError::unavailable(ProviderKind::Aws, "x");
        assert_eq!(policy.delay(1, &outage), Duration::from_millis(100));
        assert_eq!(policy.delay(3, &outage), Duration::from_millis(400));

        let throttled = ProviderError::Throttled {
            provider: ProviderKind::Aws,
            retry_after_secs: 2,
        };
        assert_eq!(policy.delay(1, &throttled), Duration::from_secs(2));
        let throttled = ProviderError::Throttled {
            provider: ProviderKind::Aws,
            retry_after_secs: 60,
        };
        assert_eq!(policy.delay(1, &throttled), Duration::from_secs(3));
    }

    #[test]
    fn test_size_tier() {
        let db = Resource::new("db", ResourceKind::Database);
        assert_eq!(SizeTier::of(&db).expect("default"), SizeTier::Small);

        let db = db.with_attribute("size", "large");
        let tier = SizeTier::of(&db).expect("large");
        assert_eq!(tier.pick(["a", "b", "c", "d"]), "c");

        let db = Resource::new("db", ResourceKind::Database).with_attribute("size", "huge");
        let err = SizeTier::of(&db).expect_err("unknown");
        assert!(matches!(err, ProviderError::UnsupportedConfiguration { ref attribute, .. } if attribute == "size"));
    }

    #[test]
    fn test_attribute_readers() {
        let svc = Resource::new("svc", ResourceKind::ComputeService)
            .with_attribute("cpu", "2")
            .with_attribute("replicas", 3)
            .with_attribute("public", true)
            .with_attribute("env", json!(["not", "a", "map"]));

        assert!((number(&svc, "cpu", 1.0).expect("cpu") - 2.0).abs() < f64::EPSILON);
        assert_eq!(integer(&svc, "replicas", 1).expect("replicas"), 3);
        assert_eq!(integer(&svc, "port", 8080).expect("default"), 8080);
        assert!(flag(&svc, "public", false).expect("flag"));
        assert!(env_map(&svc).is_err());
        assert!(required_text(&svc, "image").is_err());
    }

    #[test]
    fn test_exposed_attributes() {
        let db = Resource::new("db", ResourceKind::Database).with_attribute("engine", "mysql");
        let carried = carried_attributes(&db, None).expect("carried");

        let mut object = RemoteObject {
            id: String::from("db-000002"),
            path: String::from("rds/db-instance"),
            attributes: BTreeMap::new(),
        };
        object
            .attributes
            .insert(String::from("hostname"), json!("db.example.internal"));

        let attrs = exposed_attributes(ProviderKind::Aws, db.kind, &object, &carried).expect("exposed");
        assert_eq!(attrs["endpoint"], json!("db.example.internal"));
        assert_eq!(attrs["port"], json!(3306));
        assert_eq!(attrs["engine"], json!("mysql"));
        assert_eq!(attrs["id"], json!("db-000002"));

        object.attributes.clear();
        let err = exposed_attributes(ProviderKind::Aws, db.kind, &object, &carried)
            .expect_err("no hostname");
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }
}
