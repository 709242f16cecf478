//! Enrichment pipeline
//!
//! Meta-fetchers ([`Enricher`]) augment a single observable; plugins
//! ([`Plugin`]) derive new observables from one. A [`Pipeline`] applies them
//! in two passes:
//!
//! 1. every enricher, in order, on the primary observable
//! 2. every plugin, in order, on that enriched primary
//! 3. every enricher, in order, on each derived observable
//!
//! The result is the primary followed by everything the plugins derived.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use cif_common::{CifError, Observable, Result};

pub mod builtin;

pub use builtin::{EmailFqdn, ReportTime, UrlFqdn};

/// Augments one observable without changing its identity
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    fn enrich(&self, observable: Observable) -> Result<Observable>;
}

/// Derives zero or more new observables from an existing one
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn derive(&self, observable: &Observable) -> Result<Vec<Observable>>;
}

/// Closure-backed enricher
pub struct FnEnricher<F> {
    name: String,
    f: F,
}

impl<F> FnEnricher<F>
where
    F: Fn(Observable) -> Result<Observable> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Enricher for FnEnricher<F>
where
    F: Fn(Observable) -> Result<Observable> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn enrich(&self, observable: Observable) -> Result<Observable> {
        (self.f)(observable)
    }
}

/// Closure-backed plugin
pub struct FnPlugin<F> {
    name: String,
    f: F,
}

impl<F> FnPlugin<F>
where
    F: Fn(&Observable) -> Result<Vec<Observable>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Plugin for FnPlugin<F>
where
    F: Fn(&Observable) -> Result<Vec<Observable>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn derive(&self, observable: &Observable) -> Result<Vec<Observable>> {
        (self.f)(observable)
    }
}

/// Ordered enrichers and plugins
#[derive(Clone, Default)]
pub struct Pipeline {
    enrichers: Vec<Arc<dyn Enricher>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enricher(mut self, enricher: impl Enricher + 'static) -> Self {
        self.enrichers.push(Arc::new(enricher));
        self
    }

    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn push_enricher(&mut self, enricher: Arc<dyn Enricher>) {
        self.enrichers.push(enricher);
    }

    pub fn push_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn enricher_names(&self) -> Vec<&str> {
        self.enrichers.iter().map(|e| e.name()).collect()
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Run both passes and return `[primary] + derived`
    pub fn run(&self, primary: Observable) -> Result<Vec<Observable>> {
        let primary = self.enrich(primary)?;

        let mut derived = Vec::new();
        for plugin in &self.plugins {
            debug!(plugin = %plugin.name(), "Running plugin");
            derived.extend(plugin.derive(&primary)?);
        }

        let mut results = Vec::with_capacity(derived.len() + 1);
        results.push(primary);
        for (index, observable) in derived.into_iter().enumerate() {
            debug!(index, "Fetching meta for derived observable");
            results.push(self.enrich(observable)?);
        }

        Ok(results)
    }

    fn enrich(&self, mut observable: Observable) -> Result<Observable> {
        for enricher in &self.enrichers {
            let (otype, value) = observable.identity();
            let (otype, value) = (otype, value.to_string());

            observable = enricher.enrich(observable)?;

            if observable.identity() != (otype, value.as_str()) {
                return Err(CifError::pipeline(
                    enricher.name(),
                    format!("changed observable identity from {} {}", otype, value),
                ));
            }
        }
        Ok(observable)
    }
}

type EnricherFactory = Box<dyn Fn() -> Arc<dyn Enricher> + Send + Sync>;
type PluginFactory = Box<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Enrichers and plugins selectable by name from configuration
pub struct EnrichmentRegistry {
    enrichers: BTreeMap<String, EnricherFactory>,
    plugins: BTreeMap<String, PluginFactory>,
}

impl EnrichmentRegistry {
    pub fn empty() -> Self {
        Self {
            enrichers: BTreeMap::new(),
            plugins: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_enricher("reporttime", || Arc::new(ReportTime));
        registry.register_plugin("url_fqdn", || Arc::new(UrlFqdn));
        registry.register_plugin("email_fqdn", || Arc::new(EmailFqdn));
        registry
    }

    pub fn register_enricher<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Enricher> + Send + Sync + 'static,
    {
        self.enrichers.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_plugin<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.plugins.insert(name.to_string(), Box::new(factory));
    }

    pub fn has_enricher(&self, name: &str) -> bool {
        self.enrichers.contains_key(name)
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Build a pipeline in the order the names are given
    pub fn pipeline(&self, meta: &[String], plugins: &[String]) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new();

        for name in meta {
            let factory = self
                .enrichers
                .get(name)
                .ok_or_else(|| CifError::Config(format!("Unknown meta-fetcher: {}", name)))?;
            pipeline.push_enricher(factory());
        }

        for name in plugins {
            let factory = self
                .plugins
                .get(name)
                .ok_or_else(|| CifError::Config(format!("Unknown plugin: {}", name)))?;
            pipeline.push_plugin(factory());
        }

        Ok(pipeline)
    }
}

impl Default for EnrichmentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cif_common::ObservableType;
    use serde_json::json;

    fn counter(name: &'static str) -> FnEnricher<impl Fn(Observable) -> Result<Observable> + Send + Sync> {
        FnEnricher::new(name, move |mut o: Observable| {
            let seen = o.meta.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
            o.meta.insert(name.to_string(), json!(seen + 1));
            Ok(o)
        })
    }

    #[test]
    fn test_primary_first_and_every_result_enriched() {
        let pipeline = Pipeline::new()
            .with_enricher(counter("geo"))
            .with_enricher(counter("asn"))
            .with_plugin(FnPlugin::new("split", |o: &Observable| {
                Ok(vec![
                    o.derive(ObservableType::Fqdn, "a.example"),
                    o.derive(ObservableType::Fqdn, "b.example"),
                ])
            }))
            .with_plugin(FnPlugin::new("nothing", |_: &Observable| Ok(Vec::new())));

        let results = pipeline
            .run(Observable::new(ObservableType::Url, "http://a.example/x"))
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].otype(), ObservableType::Url);
        for result in &results {
            assert_eq!(result.meta["geo"], json!(1));
            assert_eq!(result.meta["asn"], json!(1));
        }
    }

    #[test]
    fn test_plugins_see_enriched_primary_not_each_other() {
        let pipeline = Pipeline::new()
            .with_enricher(counter("geo"))
            .with_plugin(FnPlugin::new("first", |o: &Observable| {
                assert!(o.meta.contains_key("geo"));
                Ok(vec![o.derive(ObservableType::Fqdn, "one.example")])
            }))
            .with_plugin(FnPlugin::new("second", |o: &Observable| {
                assert_eq!(o.otype(), ObservableType::Url);
                Ok(vec![o.derive(ObservableType::Fqdn, "two.example")])
            }));

        let results = pipeline
            .run(Observable::new(ObservableType::Url, "http://one.example/"))
            .unwrap();
        let values: Vec<&str> = results.iter().map(|o| o.value()).collect();
        assert_eq!(values, vec!["http://one.example/", "one.example", "two.example"]);
    }

    #[test]
    fn test_enricher_cannot_change_identity() {
        let pipeline = Pipeline::new().with_enricher(FnEnricher::new("rewrite", |o: Observable| {
            Ok(Observable::new(o.otype(), o.value().to_uppercase()))
        }));

        let err = pipeline
            .run(Observable::new(ObservableType::Fqdn, "example.com"))
            .unwrap_err();
        assert!(matches!(err, CifError::Pipeline { ref stage, .. } if stage == "rewrite"));
    }

    #[test]
    fn test_plugin_error_propagates() {
        let pipeline = Pipeline::new().with_plugin(FnPlugin::new("dns", |_: &Observable| {
            Err(CifError::pipeline("dns", "resolver timeout"))
        }));
        assert!(pipeline
            .run(Observable::new(ObservableType::Fqdn, "example.com"))
            .is_err());
    }

    #[test]
    fn test_registry_builds_in_configured_order() {
        let registry = EnrichmentRegistry::builtin();
        let pipeline = registry
            .pipeline(
                &["reporttime".to_string()],
                &["email_fqdn".to_string(), "url_fqdn".to_string()],
            )
            .unwrap();
        assert_eq!(pipeline.enricher_names(), vec!["reporttime"]);
        assert_eq!(pipeline.plugin_names(), vec!["email_fqdn", "url_fqdn"]);

        assert!(registry.pipeline(&["whois".to_string()], &[]).is_err());
        assert!(registry.pipeline(&[], &["passivedns".to_string()]).is_err());
    }
}
