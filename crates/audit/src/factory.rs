//! Provider selection by configuration discriminant.

use std::{collections::HashMap, fmt, sync::Arc};

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::info,
};

use crate::{
    composite::CompositeAuditProvider,
    error::AuditError,
    file::{FileAuditConfig, FileAuditProvider},
    provider::AuditProvider,
    sqlite::{SqliteAuditConfig, SqliteAuditProvider},
    webhook::{WebhookAuditConfig, WebhookAuditProvider},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditProviderKind {
    #[default]
    File,
    #[serde(alias = "embedded-database")]
    Sqlite,
    Webhook,
    Composite,
    Custom,
}

impl AuditProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Sqlite => "sqlite",
            Self::Webhook => "webhook",
            Self::Composite => "composite",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AuditProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeAuditConfig {
    pub providers: Vec<AuditProviderKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomAuditConfig {
    /// Name the factory was registered under.
    pub name: String,
    /// Passed verbatim to the factory.
    pub options: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub provider: AuditProviderKind,
    pub flush_interval_ms: u64,
    pub file: FileAuditConfig,
    pub sqlite: SqliteAuditConfig,
    pub webhook: Option<WebhookAuditConfig>,
    pub composite: Option<CompositeAuditConfig>,
    pub custom: Option<CustomAuditConfig>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: AuditProviderKind::File,
            flush_interval_ms: 5_000,
            file: FileAuditConfig::default(),
            sqlite: SqliteAuditConfig::default(),
            webhook: None,
            composite: None,
            custom: None,
        }
    }
}

/// Builds a user-supplied provider from its free-form options.
pub type ProviderFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn AuditProvider>, AuditError> + Send + Sync>;

/// Named factories for `provider = "custom"`.
#[derive(Clone, Default)]
pub struct AuditProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl AuditProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Value) -> Result<Arc<dyn AuditProvider>, AuditError>
        + Send
        + Sync
        + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    fn build(&self, config: &CustomAuditConfig) -> Result<Arc<dyn AuditProvider>, AuditError> {
        let factory = self.factories.get(&config.name).ok_or_else(|| {
            AuditError::config(format!("no custom audit provider registered as {:?}", config.name))
        })?;
        factory(&config.options)
    }
}

/// Check the whole provider graph before anything is built.
///
/// A composite may not list itself or any provider twice, and every
/// referenced provider must have the sections it needs.
pub fn validate_config(
    config: &AuditConfig,
    registry: &AuditProviderRegistry,
) -> Result<(), AuditError> {
    let mut visited = Vec::new();
    validate_kind(config.provider, config, registry, &mut visited)
}

fn validate_kind(
    kind: AuditProviderKind,
    config: &AuditConfig,
    registry: &AuditProviderRegistry,
    visited: &mut Vec<AuditProviderKind>,
) -> Result<(), AuditError> {
    if visited.contains(&kind) {
        return Err(AuditError::config(match kind {
            AuditProviderKind::Composite => {
                "composite audit provider cannot include itself".to_string()
            },
            other => format!("audit provider {other} is listed more than once"),
        }));
    }
    visited.push(kind);

    match kind {
        AuditProviderKind::File | AuditProviderKind::Sqlite => Ok(()),
        AuditProviderKind::Webhook => match &config.webhook {
            Some(webhook) if !webhook.url.trim().is_empty() => Ok(()),
            _ => Err(AuditError::config("webhook audit provider requires webhook.url")),
        },
        AuditProviderKind::Custom => match &config.custom {
            Some(custom) if registry.contains(&custom.name) => Ok(()),
            Some(custom) => Err(AuditError::config(format!(
                "no custom audit provider registered as {:?}",
                custom.name
            ))),
            None => Err(AuditError::config("custom audit provider requires custom.name")),
        },
        AuditProviderKind::Composite => {
            let children = config
                .composite
                .as_ref()
                .map(|c| c.providers.as_slice())
                .unwrap_or_default();
            if children.is_empty() {
                return Err(AuditError::config(
                    "composite audit provider requires at least one provider",
                ));
            }
            for child in children {
                validate_kind(*child, config, registry, visited)?;
            }
            Ok(())
        },
    }
}

/// Validate, then instantiate the configured provider. Storage is not
/// touched until [`AuditProvider::init`].
pub async fn create_provider(
    config: &AuditConfig,
    registry: &AuditProviderRegistry,
) -> Result<Arc<dyn AuditProvider>, AuditError> {
    validate_config(config, registry)?;
    let provider = build(config.provider, config, registry).await?;
    info!(provider = provider.name(), "audit provider created");
    Ok(provider)
}

async fn build(
    kind: AuditProviderKind,
    config: &AuditConfig,
    registry: &AuditProviderRegistry,
) -> Result<Arc<dyn AuditProvider>, AuditError> {
    if kind != AuditProviderKind::Composite {
        return build_leaf(kind, config, registry).await;
    }
    let mut children = Vec::new();
    for child in config.composite.iter().flat_map(|c| &c.providers) {
        children.push(build_leaf(*child, config, registry).await?);
    }
    Ok(Arc::new(CompositeAuditProvider::new(children)))
}

async fn build_leaf(
    kind: AuditProviderKind,
    config: &AuditConfig,
    registry: &AuditProviderRegistry,
) -> Result<Arc<dyn AuditProvider>, AuditError> {
    let provider: Arc<dyn AuditProvider> = match kind {
        AuditProviderKind::File => Arc::new(FileAuditProvider::new(config.file.clone())),
        AuditProviderKind::Sqlite => Arc::new(SqliteAuditProvider::connect(&config.sqlite).await?),
        AuditProviderKind::Webhook => {
            let webhook = config
                .webhook
                .as_ref()
                .ok_or_else(|| AuditError::config("webhook audit provider requires webhook.url"))?;
            Arc::new(WebhookAuditProvider::new(webhook)?)
        },
        AuditProviderKind::Custom => {
            let custom = config
                .custom
                .as_ref()
                .ok_or_else(|| AuditError::config("custom audit provider requires custom.name"))?;
            registry.build(custom)?
        },
        AuditProviderKind::Composite => {
            return Err(AuditError::config("composite audit providers cannot be nested"));
        },
    };
    Ok(provider)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::composite::tests::MemoryProvider, std::path::PathBuf};

    fn composite_of(providers: Vec<AuditProviderKind>) -> AuditConfig {
        AuditConfig {
            provider: AuditProviderKind::Composite,
            composite: Some(CompositeAuditConfig { providers }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn self_referential_composite_is_rejected_before_building() {
        let built = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut registry = AuditProviderRegistry::new();
        registry.register("mem", move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Arc::new(MemoryProvider::default()) as Arc<dyn AuditProvider>)
        });

        let mut config = composite_of(vec![AuditProviderKind::Custom, AuditProviderKind::Composite]);
        config.custom = Some(CustomAuditConfig {
            name: "mem".into(),
            options: Value::Null,
        });

        let err = create_provider(&config, &registry).await.err();
        assert!(matches!(err, Some(AuditError::Configuration(_))));
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_children_are_rejected() {
        let config = composite_of(vec![AuditProviderKind::File, AuditProviderKind::File]);
        assert!(validate_config(&config, &AuditProviderRegistry::new()).is_err());
    }

    #[test]
    fn webhook_without_url_is_rejected() {
        let config = AuditConfig {
            provider: AuditProviderKind::Webhook,
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&config, &AuditProviderRegistry::new()),
            Err(AuditError::Configuration(_))
        ));
    }

    #[test]
    fn embedded_database_alias_parses() {
        let config: AuditConfig =
            serde_json::from_str(r#"{"provider": "embedded-database"}"#).unwrap();
        assert_eq!(config.provider, AuditProviderKind::Sqlite);
    }

    #[tokio::test]
    async fn builds_composite_of_file_and_custom() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = AuditProviderRegistry::new();
        registry.register("mem", |_| {
            Ok(Arc::new(MemoryProvider::default()) as Arc<dyn AuditProvider>)
        });
        let mut config = composite_of(vec![AuditProviderKind::File, AuditProviderKind::Custom]);
        config.file.path = dir.path().join("audit.log");
        config.sqlite.path = PathBuf::from(":memory:");
        config.custom = Some(CustomAuditConfig {
            name: "mem".into(),
            options: Value::Null,
        });

        let provider = create_provider(&config, &registry).await.unwrap();
        assert_eq!(provider.name(), "composite");
        assert!(provider.supports_query());
    }
}
