//! One reconciliation cycle: translate the desired-state cache into a single
//! configuration transaction, commit it, then reload or restart the proxy.
//!
//! Steps:
//!
//! 1. Open a transaction (failure aborts the cycle before any pass runs).
//! 2. The transaction guard disposes of it on every exit path.
//! 3. Global passes, then the default service.
//! 4. Per relevant namespace and ingress: status publication, default path,
//!    rule paths, TLS bindings (one call per secret name per ingress), then
//!    the annotation passes.
//! 5. Proxy-wide refreshes, map files, TCP services, backend switching.
//! 6. Commit (failure aborts, no lifecycle action), then tell the passes.
//! 7. Cache cleanup.
//! 8. Restart beats reload beats nothing.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use ingress_core::{ControllerConfig, DesiredState, IngressRule, SyncEvent};
use ingress_process::{ServiceAction, ServiceControl, ServiceOutcome};

use crate::backend::{ConfigBackend, FileBackend, TransactionId};
use crate::error::SyncError;
use crate::passes::{Decision, PassContext, PassOutcome, Passes, StatusPublisher};
use crate::status::FileStatusPublisher;
use crate::transaction::TransactionManager;
use crate::translate::Translator;

/// What a completed cycle did.
#[derive(Debug)]
pub struct CycleReport {
    pub transaction: TransactionId,
    pub decision: Decision,
    /// Whether the commit rewrote the live configuration file.
    pub config_changed: bool,
    pub pass_errors: usize,
    /// Lifecycle action dispatched, with the supervisor's answer.
    pub outcome: Option<(ServiceAction, Result<ServiceOutcome, String>)>,
}

/// Running fold of pass outcomes for one cycle.
#[derive(Debug, Default)]
struct Fold {
    decision: Decision,
    errors: usize,
}

impl Fold {
    fn record(&mut self, pass: &str, outcome: PassOutcome) {
        if let Some(err) = &outcome.error {
            self.errors += 1;
            tracing::error!("{pass}: {err}");
        }
        if outcome.reload || outcome.restart {
            tracing::debug!(
                "{pass}: reload={} restart={}",
                outcome.reload,
                outcome.restart
            );
        }
        self.decision.absorb(&outcome);
    }
}

pub struct Reconciler {
    config: Arc<ControllerConfig>,
    cache: DesiredState,
    transactions: TransactionManager,
    passes: Box<dyn Passes>,
    publisher: Box<dyn StatusPublisher>,
    service: Arc<dyn ServiceControl>,
}

impl Reconciler {
    pub fn new(
        config: Arc<ControllerConfig>,
        backend: Box<dyn ConfigBackend>,
        passes: Box<dyn Passes>,
        publisher: Box<dyn StatusPublisher>,
        service: Arc<dyn ServiceControl>,
    ) -> Self {
        Self {
            cache: DesiredState::from_config(&config),
            transactions: TransactionManager::new(backend),
            config,
            passes,
            publisher,
            service,
        }
    }

    /// File backend, built-in translator and file status publisher.
    pub fn from_config(config: Arc<ControllerConfig>, service: Arc<dyn ServiceControl>) -> Self {
        let backend = Box::new(FileBackend::from_config(&config));
        let passes = Box::new(Translator::new(&config));
        let publisher = Box::new(FileStatusPublisher::new(config.paths.status_dir()));
        Self::new(config, backend, passes, publisher, service)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn cache(&self) -> &DesiredState {
        &self.cache
    }

    /// Fold one event into the desired-state cache.
    pub fn apply(&mut self, event: SyncEvent) -> bool {
        self.cache.apply(event)
    }

    /// Run one full cycle.
    pub fn cycle(&mut self) -> Result<CycleReport, SyncError> {
        let mut tx = self.transactions.begin().map_err(|e| {
            tracing::error!("failed to open transaction: {e}");
            e
        })?;
        let transaction = tx.id();

        let mut fold = Fold::default();
        let mut used_certs = BTreeSet::new();
        {
            let mut ctx = PassContext {
                config: self.config.as_ref(),
                cache: &self.cache,
                document: tx.view()?,
                used_certs: &mut used_certs,
            };
            let passes = self.passes.as_mut();

            fold.record("global annotations", passes.global_annotations(&mut ctx));
            fold.record("default service", passes.default_service(&mut ctx));

            for ns in self.cache.relevant_namespaces() {
                for ingress in ns.ingresses.values() {
                    if let Some(service) = &self.config.publish_service {
                        if !ingress.status.is_deleted() {
                            if let Err(e) = self.publisher.publish(ingress, service) {
                                tracing::warn!("status update for {}: {e}", ingress.key());
                            }
                        }
                    }

                    if let Some(default) = &ingress.default_backend {
                        let rule = IngressRule::default();
                        fold.record("default path", passes.path(&mut ctx, ingress, &rule, default));
                    }
                    for rule in &ingress.rules {
                        for path in &rule.paths {
                            fold.record("path", passes.path(&mut ctx, ingress, rule, path));
                        }
                    }

                    let mut seen = HashSet::new();
                    for tls in &ingress.tls {
                        if seen.insert(tls.secret_name.as_str()) {
                            fold.record("tls secret", passes.tls_secret(&mut ctx, ingress, tls));
                        }
                    }

                    fold.record("rate limiting", passes.rate_limiting(&mut ctx, ingress));
                    fold.record("request capture", passes.request_capture(&mut ctx, ingress));
                    fold.record("request set-header", passes.request_set_header(&mut ctx, ingress));
                    fold.record("response set-header", passes.response_set_header(&mut ctx, ingress));
                    fold.record("deny list", passes.deny_list(&mut ctx, ingress));
                    fold.record("allow list", passes.allow_list(&mut ctx, ingress));
                    fold.record("http redirect", passes.http_redirect(&mut ctx, ingress));
                }
            }

            fold.record("proxy protocol", passes.proxy_protocol(&mut ctx));
            fold.record("default certificate", passes.default_certificate(&mut ctx));
            fold.record("https frontend", passes.https_frontend(&mut ctx));
            fold.record("http request rules", passes.http_request_rules(&mut ctx));
            fold.record("http response rules", passes.http_response_rules(&mut ctx));
            fold.record("tcp request rules", passes.tcp_request_rules(&mut ctx));
            fold.record(
                "backend http request rules",
                passes.backend_http_request_rules(&mut ctx),
            );
            fold.record("map files", passes.map_files(&mut ctx));
            fold.record("tcp services", passes.tcp_services(&mut ctx));
            fold.record("backend switching", passes.backend_switching(&mut ctx));
        }

        let config_changed = tx.commit().map_err(|e| {
            tracing::error!("failed to commit transaction {transaction}: {e}");
            e
        })?;
        drop(tx);
        self.passes.committed();

        self.cache.clean();

        let decision = fold.decision;
        let outcome = decision.action().map(|action| (action, self.dispatch(action)));
        if fold.errors > 0 {
            tracing::warn!("cycle {transaction}: {} pass(es) failed", fold.errors);
        }

        Ok(CycleReport {
            transaction,
            decision,
            config_changed,
            pass_errors: fold.errors,
            outcome,
        })
    }

    fn dispatch(&self, action: ServiceAction) -> Result<ServiceOutcome, String> {
        match self.service.run(action) {
            Ok(outcome) => {
                tracing::info!("proxy {action}: {outcome}");
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!("proxy {action} failed: {e}");
                Err(e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::tests::MemoryBackend;
    use ingress_core::{
        ConfigFile, Ingress, IngressPath, IngressTls, PublishService, Status,
    };
    use ingress_process::ProcessError;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Passes that record every call and answer from fixed key sets. Keys are
    /// the pass name, suffixed with `:<ingress>` for per-ingress passes.
    #[derive(Default)]
    struct ScriptedPasses {
        journal: Journal,
        reload_on: HashSet<String>,
        restart_on: HashSet<String>,
        fail_on: HashSet<String>,
    }

    impl ScriptedPasses {
        fn hit(&self, key: String) -> PassOutcome {
            self.journal.lock().unwrap().push(key.clone());
            if self.fail_on.contains(&key) {
                return PassOutcome::failed(SyncError::InvalidSetting {
                    name: key,
                    value: "scripted".into(),
                });
            }
            PassOutcome {
                reload: self.reload_on.contains(&key),
                restart: self.restart_on.contains(&key),
                error: None,
            }
        }
    }

    impl Passes for ScriptedPasses {
        fn global_annotations(&mut self, _: &mut PassContext<'_>) -> PassOutcome {
            self.hit("global_annotations".into())
        }
        fn default_service(&mut self, _: &mut PassContext<'_>) -> PassOutcome {
            self.hit("default_service".into())
        }
        fn path(
            &mut self,
            _: &mut PassContext<'_>,
            ingress: &Ingress,
            rule: &IngressRule,
            path: &IngressPath,
        ) -> PassOutcome {
            self.hit(format!("path:{}:{}{}", ingress.name, rule.host, path.path))
        }
        fn tls_secret(
            &mut self,
            _: &mut PassContext<'_>,
            ingress: &Ingress,
            tls: &IngressTls,
        ) -> PassOutcome {
            self.hit(format!("tls_secret:{}:{}", ingress.name, tls.secret_name))
        }
        fn rate_limiting(&mut self, _: &mut PassContext<'_>, ingress: &Ingress) -> PassOutcome {
            self.hit(format!("rate_limiting:{}", ingress.name))
        }
        fn proxy_protocol(&mut self, _: &mut PassContext<'_>) -> PassOutcome {
            self.hit("proxy_protocol".into())
        }
        fn default_certificate(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
            self.hit(format!("default_certificate:{}", ctx.used_certs.len()))
        }
        fn map_files(&mut self, _: &mut PassContext<'_>) -> PassOutcome {
            self.hit("map_files".into())
        }
        fn backend_switching(&mut self, _: &mut PassContext<'_>) -> PassOutcome {
            self.hit("backend_switching".into())
        }
        fn committed(&mut self) {
            self.journal.lock().unwrap().push("committed".into());
        }
    }

    #[derive(Default)]
    struct RecordingService {
        calls: Arc<Mutex<Vec<ServiceAction>>>,
        fail: bool,
    }

    impl ServiceControl for RecordingService {
        fn run(&self, action: ServiceAction) -> Result<ServiceOutcome, ProcessError> {
            self.calls.lock().unwrap().push(action);
            if self.fail {
                return Err(ProcessError::UnknownAction("scripted".into()));
            }
            Ok(ServiceOutcome::Reloaded { pid: 42 })
        }
    }

    #[derive(Default, Clone)]
    struct RecordingPublisher {
        published: Arc<Mutex<Vec<String>>>,
    }

    impl StatusPublisher for RecordingPublisher {
        fn publish(&self, ingress: &Ingress, _: &PublishService) -> Result<(), SyncError> {
            self.published.lock().unwrap().push(ingress.key());
            Ok(())
        }
    }

    struct Harness {
        reconciler: Reconciler,
        passes: Journal,
        backend: Journal,
        service: Arc<Mutex<Vec<ServiceAction>>>,
        published: Arc<Mutex<Vec<String>>>,
    }

    fn harness(passes: ScriptedPasses, backend: MemoryBackend, publish: bool) -> Harness {
        let mut file = ConfigFile::default();
        if publish {
            file.publish_service = Some(PublishService {
                namespace: "ingress".into(),
                name: "haproxy".into(),
                addresses: vec!["10.0.0.5".into()],
            });
        }
        let config = Arc::new(file.resolve().unwrap());
        let service = RecordingService::default();
        let publisher = RecordingPublisher::default();
        Harness {
            passes: Arc::clone(&passes.journal),
            backend: Arc::clone(&backend.journal),
            service: Arc::clone(&service.calls),
            published: Arc::clone(&publisher.published),
            reconciler: Reconciler::new(
                config,
                Box::new(backend),
                Box::new(passes),
                Box::new(publisher),
                Arc::new(service),
            ),
        }
    }

    fn ingress(name: &str, tls: &[&str]) -> Ingress {
        Ingress {
            namespace: "shop".into(),
            name: name.into(),
            annotations: BTreeMap::new(),
            default_backend: None,
            rules: vec![IngressRule {
                host: format!("{name}.example.com"),
                paths: vec![IngressPath {
                    path: "/".into(),
                    service_name: "web".into(),
                    service_port: 80,
                    status: Status::Added,
                }],
                status: Status::Added,
            }],
            tls: tls
                .iter()
                .map(|secret| IngressTls {
                    hosts: vec![],
                    secret_name: secret.to_string(),
                    status: Status::Added,
                })
                .collect(),
            status: Status::Added,
        }
    }

    fn keys(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn open_failure_runs_no_pass_and_no_action() {
        let backend = MemoryBackend {
            fail_start: true,
            ..MemoryBackend::default()
        };
        let mut h = harness(ScriptedPasses::default(), backend, true);
        h.reconciler.apply(SyncEvent::Ingress(ingress("a", &[])));

        assert!(h.reconciler.cycle().is_err());
        assert!(h.passes.lock().unwrap().is_empty());
        assert!(h.service.lock().unwrap().is_empty());
        assert!(h.published.lock().unwrap().is_empty());
        assert_eq!(
            h.reconciler.cache().ingress("shop", "a").unwrap().status,
            Status::Added
        );
    }

    #[test]
    fn commit_failure_takes_no_action_and_keeps_cache_dirty() {
        let passes = ScriptedPasses {
            reload_on: keys(&["path:a:a.example.com/"]),
            ..ScriptedPasses::default()
        };
        let backend = MemoryBackend {
            fail_commit: true,
            ..MemoryBackend::default()
        };
        let mut h = harness(passes, backend, false);
        h.reconciler.apply(SyncEvent::Ingress(ingress("a", &[])));

        assert!(matches!(
            h.reconciler.cycle(),
            Err(SyncError::Validation { .. })
        ));
        assert!(h.service.lock().unwrap().is_empty());
        assert!(!h.passes.lock().unwrap().contains(&"committed".to_string()));
        assert_eq!(
            *h.backend.lock().unwrap(),
            vec!["start 1", "commit 1 failed", "delete 1"]
        );
        assert_eq!(
            h.reconciler.cache().ingress("shop", "a").unwrap().status,
            Status::Added
        );

        // The next cycle can open a fresh transaction.
        assert!(h.reconciler.cycle().is_err());
        assert!(h.backend.lock().unwrap().contains(&"start 2".to_string()));
    }

    #[test]
    fn failing_pass_does_not_stop_the_cycle() {
        let passes = ScriptedPasses {
            fail_on: keys(&["rate_limiting:a"]),
            reload_on: keys(&["path:b:b.example.com/"]),
            ..ScriptedPasses::default()
        };
        let mut h = harness(passes, MemoryBackend::default(), false);
        h.reconciler.apply(SyncEvent::Ingress(ingress("a", &[])));
        h.reconciler.apply(SyncEvent::Ingress(ingress("b", &[])));

        let report = h.reconciler.cycle().unwrap();
        assert_eq!(
            report.decision,
            Decision {
                reload: true,
                restart: false
            }
        );
        assert_eq!(report.pass_errors, 1);
        assert_eq!(*h.service.lock().unwrap(), vec![ServiceAction::Reload]);
        assert!(matches!(
            report.outcome,
            Some((ServiceAction::Reload, Ok(ServiceOutcome::Reloaded { pid: 42 })))
        ));
        assert!(h
            .passes
            .lock()
            .unwrap()
            .contains(&"rate_limiting:b".to_string()));
    }

    #[test]
    fn restart_dominates_reload() {
        let passes = ScriptedPasses {
            restart_on: keys(&["global_annotations"]),
            reload_on: keys(&["path:a:a.example.com/", "map_files"]),
            ..ScriptedPasses::default()
        };
        let mut h = harness(passes, MemoryBackend::default(), false);
        h.reconciler.apply(SyncEvent::Ingress(ingress("a", &[])));

        let report = h.reconciler.cycle().unwrap();
        assert!(report.decision.restart && report.decision.reload);
        assert_eq!(*h.service.lock().unwrap(), vec![ServiceAction::Restart]);
    }

    #[test]
    fn decision_is_the_or_of_every_pass_wherever_it_sits() {
        for pass in [
            "global_annotations",
            "default_service",
            "path:a:a.example.com/",
            "tls_secret:a:cert",
            "rate_limiting:a",
            "proxy_protocol",
            "map_files",
            "backend_switching",
        ] {
            let passes = ScriptedPasses {
                reload_on: keys(&[pass]),
                ..ScriptedPasses::default()
            };
            let mut h = harness(passes, MemoryBackend::default(), false);
            h.reconciler.apply(SyncEvent::Ingress(ingress("a", &["cert"])));

            let report = h.reconciler.cycle().unwrap();
            assert!(report.decision.reload, "reload from {pass} was lost");
            assert_eq!(*h.service.lock().unwrap(), vec![ServiceAction::Reload]);
        }
    }

    #[test]
    fn quiet_cycle_dispatches_nothing() {
        let mut h = harness(ScriptedPasses::default(), MemoryBackend::default(), false);
        let report = h.reconciler.cycle().unwrap();
        assert_eq!(report.decision, Decision::default());
        assert!(report.outcome.is_none());
        assert!(h.service.lock().unwrap().is_empty());
    }

    #[test]
    fn tls_bindings_deduplicated_per_ingress() {
        let mut h = harness(ScriptedPasses::default(), MemoryBackend::default(), false);
        h.reconciler
            .apply(SyncEvent::Ingress(ingress("a", &["shared", "shared", "own"])));
        h.reconciler.apply(SyncEvent::Ingress(ingress("b", &["shared"])));
        h.reconciler.cycle().unwrap();

        let journal = h.passes.lock().unwrap();
        let tls: Vec<&str> = journal
            .iter()
            .filter(|k| k.starts_with("tls_secret"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            tls,
            vec!["tls_secret:a:shared", "tls_secret:a:own", "tls_secret:b:shared"]
        );
    }

    #[test]
    fn passes_run_in_cycle_order() {
        let mut h = harness(ScriptedPasses::default(), MemoryBackend::default(), false);
        let mut ing = ingress("a", &[]);
        ing.default_backend = Some(IngressPath {
            path: String::new(),
            service_name: "fallback".into(),
            service_port: 80,
            status: Status::Added,
        });
        h.reconciler.apply(SyncEvent::Ingress(ing));
        h.reconciler.cycle().unwrap();

        assert_eq!(
            *h.passes.lock().unwrap(),
            vec![
                "global_annotations",
                "default_service",
                "path:a:",
                "path:a:a.example.com/",
                "rate_limiting:a",
                "proxy_protocol",
                "default_certificate:0",
                "map_files",
                "backend_switching",
                "committed",
            ]
        );
    }

    #[test]
    fn cleanup_runs_after_successful_commit() {
        let mut h = harness(ScriptedPasses::default(), MemoryBackend::default(), false);
        h.reconciler.apply(SyncEvent::Ingress(ingress("a", &[])));
        h.reconciler.cycle().unwrap();
        assert_eq!(
            h.reconciler.cache().ingress("shop", "a").unwrap().status,
            Status::Empty
        );

        let mut gone = ingress("a", &[]);
        gone.status = Status::Deleted;
        h.reconciler.apply(SyncEvent::Ingress(gone));
        h.reconciler.cycle().unwrap();
        assert!(h.reconciler.cache().ingress("shop", "a").is_none());
        assert_eq!(
            *h.backend.lock().unwrap(),
            vec!["start 1", "commit 1", "start 2", "commit 2"]
        );
    }

    #[test]
    fn status_published_for_live_ingresses_only() {
        let mut h = harness(ScriptedPasses::default(), MemoryBackend::default(), true);
        h.reconciler.apply(SyncEvent::Ingress(ingress("a", &[])));
        h.reconciler.apply(SyncEvent::Ingress(ingress("b", &[])));
        h.reconciler.cycle().unwrap();

        let mut gone = ingress("b", &[]);
        gone.status = Status::Deleted;
        h.reconciler.apply(SyncEvent::Ingress(gone));
        h.reconciler.cycle().unwrap();

        assert_eq!(
            *h.published.lock().unwrap(),
            vec!["shop/a", "shop/b", "shop/a"]
        );
    }

    #[test]
    fn supervisor_failure_is_reported_not_raised() {
        let passes = ScriptedPasses {
            reload_on: keys(&["map_files"]),
            ..ScriptedPasses::default()
        };
        let backend = MemoryBackend::default();
        let mut h = harness(passes, backend, false);
        h.reconciler.service = Arc::new(RecordingService {
            calls: Arc::clone(&h.service),
            fail: true,
        });

        let report = h.reconciler.cycle().unwrap();
        assert!(matches!(report.outcome, Some((ServiceAction::Reload, Err(_)))));
    }
}
