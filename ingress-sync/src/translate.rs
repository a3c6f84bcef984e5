//! Built-in translation of the desired state into proxy configuration.
//!
//! The operator's base configuration owns the frontends; the translator owns
//! a `backend ing-<namespace>-<service>-<port>` section per referenced
//! service, the `host-path` map that routes requests to them (`path` for
//! rules without a host), and one PEM bundle per referenced TLS secret. A
//! typical base frontend:
//!
//! ```text
//! frontend http
//!     bind *:80
//!     use_backend %[base,map_beg(/etc/haproxy/maps/host-path.map,default-backend)]
//!
//! frontend https
//!     bind *:443 ssl crt /etc/haproxy/certs/
//!     use_backend %[base,map_beg(/etc/haproxy/maps/host-path.map,default-backend)]
//! ```
//!
//! Passes without a built-in translation (rate limiting, header rewriting,
//! access lists, redirects, TCP services and the rule refreshes) keep the
//! trait's no-op bodies.

use std::collections::BTreeSet;
use std::path::Path;

use ingress_core::{ControllerConfig, Ingress, IngressPath, IngressRule, IngressTls, ServiceRef};

use crate::error::{io_err, SyncError};
use crate::maps::{MapFiles, HOST_PATH_MAP, PATH_MAP};
use crate::passes::{PassContext, PassOutcome, Passes};
use crate::writer::{atomic_write, remove_owned, HashStore};

/// Prefix of every backend section the translator owns.
pub const BACKEND_PREFIX: &str = "ing-";
pub const DEFAULT_BACKEND: &str = "default-backend";
/// Certificate file written for the configured default certificate.
pub const DEFAULT_CERT_FILE: &str = "default.pem";

/// Global settings translated into `global` directives. Any change to them
/// needs a full restart.
const GLOBAL_DIRECTIVES: &[(&str, &str, bool)] = &[
    // (setting, directive, numeric)
    ("nbthread", "nbthread", true),
    ("maxconn", "maxconn", true),
    ("hard-stop-after", "hard-stop-after", false),
];

pub struct Translator {
    maps: MapFiles,
    certs: HashStore,
    used_backends: BTreeSet<String>,
    /// Global directives the live configuration carries from settings; only
    /// these are removed when their setting disappears.
    applied_globals: BTreeSet<&'static str>,
    /// What `applied_globals` becomes if this cycle commits.
    staged_globals: Option<BTreeSet<&'static str>>,
}

impl Translator {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            maps: MapFiles::new(&config.paths.map_dir),
            certs: HashStore::new(),
            used_backends: BTreeSet::new(),
            applied_globals: BTreeSet::new(),
            staged_globals: None,
        }
    }

    fn write_cert(
        &mut self,
        ctx: &mut PassContext<'_>,
        namespace: &str,
        secret_name: &str,
        file: &str,
    ) -> Result<bool, SyncError> {
        let key = format!("{namespace}/{secret_name}");
        let secret = ctx
            .cache
            .secret(namespace, secret_name)
            .filter(|s| !s.status.is_deleted())
            .ok_or_else(|| SyncError::MissingSecret { key: key.clone() })?;
        let pem = secret
            .pem_bundle()
            .ok_or(SyncError::IncompleteSecret { key })?;

        let path = ctx.config.paths.cert_dir.join(file);
        let written = atomic_write(&path, &pem, &mut self.certs)?.is_written();
        ctx.used_certs.insert(file.to_string());
        Ok(written)
    }

    fn prune_certs(&mut self, cert_dir: &Path, used: &BTreeSet<String>) -> Result<bool, SyncError> {
        let entries = match std::fs::read_dir(cert_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(cert_dir, e)),
        };
        let mut removed = false;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(cert_dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".pem") && !used.contains(&name) {
                removed |= remove_owned(&entry.path(), &mut self.certs)?;
            }
        }
        Ok(removed)
    }
}

/// `ing-<namespace>-<service>-<port>`, restricted to characters the proxy
/// accepts in identifiers.
pub fn backend_name(namespace: &str, service: &str, port: u16) -> String {
    let raw = format!("{BACKEND_PREFIX}{namespace}-{service}-{port}");
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn cert_file_name(namespace: &str, secret_name: &str) -> String {
    format!("{namespace}_{secret_name}.pem")
}

fn backend_lines(namespace: &str, service: &str, port: u16) -> Vec<String> {
    vec![
        "mode http".to_string(),
        "balance roundrobin".to_string(),
        format!("server {service} {service}.{namespace}:{port} check"),
    ]
}

/// Map and key routing `path` of `rule`; host-less rules route on the path alone.
fn map_entry(rule: &IngressRule, path: &IngressPath) -> (&'static str, String) {
    let prefix = if path.path.is_empty() { "/" } else { &path.path };
    if rule.host.is_empty() {
        (PATH_MAP, prefix.to_string())
    } else {
        (HOST_PATH_MAP, format!("{}{prefix}", rule.host))
    }
}

impl Passes for Translator {
    fn global_annotations(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        let global = ctx.cache.global();
        let mut outcome = PassOutcome::unchanged();
        let mut staged = self.applied_globals.clone();
        for &(setting, directive, numeric) in GLOBAL_DIRECTIVES {
            let value = global.get(setting);
            match value {
                Some(v) if numeric && v.parse::<u64>().is_err() => {
                    outcome.error = Some(SyncError::InvalidSetting {
                        name: setting.to_string(),
                        value: v.to_string(),
                    });
                    continue;
                }
                None if !self.applied_globals.contains(directive) => continue,
                _ => {}
            }
            if ctx.document.set_directive("global", directive, value) {
                tracing::info!("global {directive} changed");
                outcome.restart = true;
            }
            if value.is_some() {
                staged.insert(directive);
            } else {
                staged.remove(directive);
            }
        }
        self.staged_globals = Some(staged);
        outcome
    }

    fn default_service(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        let Some(ServiceRef {
            namespace,
            name,
            port,
        }) = ctx.config.default_backend.as_ref()
        else {
            return PassOutcome::unchanged();
        };
        let header = format!("backend {DEFAULT_BACKEND}");
        let changed = ctx
            .document
            .set_section(&header, backend_lines(namespace, name, *port));
        PassOutcome::from_result(Ok(changed))
    }

    fn path(
        &mut self,
        ctx: &mut PassContext<'_>,
        ingress: &Ingress,
        rule: &IngressRule,
        path: &IngressPath,
    ) -> PassOutcome {
        if ingress.status.is_deleted() || rule.status.is_deleted() || path.status.is_deleted() {
            return PassOutcome::unchanged();
        }
        let backend = backend_name(&ingress.namespace, &path.service_name, path.service_port);
        let changed = ctx.document.set_section(
            &format!("backend {backend}"),
            backend_lines(&ingress.namespace, &path.service_name, path.service_port),
        );
        let (map, key) = map_entry(rule, path);
        self.maps.insert(map, key, backend.clone());
        self.used_backends.insert(backend);
        PassOutcome::from_result(Ok(changed))
    }

    fn tls_secret(
        &mut self,
        ctx: &mut PassContext<'_>,
        ingress: &Ingress,
        tls: &IngressTls,
    ) -> PassOutcome {
        if ingress.status.is_deleted() || tls.status.is_deleted() {
            return PassOutcome::unchanged();
        }
        let file = cert_file_name(&ingress.namespace, &tls.secret_name);
        PassOutcome::from_result(self.write_cert(ctx, &ingress.namespace, &tls.secret_name, &file))
    }

    fn default_certificate(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        let Some(reference) = ctx.config.default_certificate.clone() else {
            return PassOutcome::unchanged();
        };
        let Some((namespace, name)) = reference.split_once('/') else {
            return PassOutcome::failed(SyncError::InvalidSetting {
                name: "default_certificate".to_string(),
                value: reference,
            });
        };
        PassOutcome::from_result(self.write_cert(ctx, namespace, name, DEFAULT_CERT_FILE))
    }

    fn https_frontend(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        let cert_dir = ctx.config.paths.cert_dir.clone();
        PassOutcome::from_result(self.prune_certs(&cert_dir, ctx.used_certs))
    }

    fn map_files(&mut self, _ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::from_result(self.maps.refresh())
    }

    fn committed(&mut self) {
        if let Some(staged) = self.staged_globals.take() {
            self.applied_globals = staged;
        }
    }

    fn backend_switching(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        let used = std::mem::take(&mut self.used_backends);
        let removed = ctx.document.retain_sections(|section| {
            let owned = section.kind() == "backend"
                && section
                    .name()
                    .is_some_and(|name| name.starts_with(BACKEND_PREFIX));
            !owned || section.name().is_some_and(|name| used.contains(name))
        });
        for header in &removed {
            tracing::info!("removed {header}");
        }
        PassOutcome::from_result(Ok(!removed.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ConfigDocument;
    use ingress_core::{ConfigFile, DesiredState, Secret, Status, SyncEvent};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> ControllerConfig {
        ConfigFile {
            config_dir: Some(tmp.path().to_path_buf()),
            state_dir: Some(tmp.path().join("state")),
            default_backend: Some(ServiceRef {
                namespace: "kube-system".into(),
                name: "fallback".into(),
                port: 8080,
            }),
            ..ConfigFile::default()
        }
        .resolve()
        .unwrap()
    }

    fn ingress(paths: &[(&str, &str, u16)], tls: &[&str]) -> Ingress {
        Ingress {
            namespace: "shop".into(),
            name: "front".into(),
            annotations: BTreeMap::new(),
            default_backend: None,
            rules: vec![IngressRule {
                host: "shop.example.com".into(),
                paths: paths
                    .iter()
                    .map(|(p, svc, port)| IngressPath {
                        path: p.to_string(),
                        service_name: svc.to_string(),
                        service_port: *port,
                        status: Status::Added,
                    })
                    .collect(),
                status: Status::Added,
            }],
            tls: tls
                .iter()
                .map(|s| IngressTls {
                    hosts: vec!["shop.example.com".into()],
                    secret_name: s.to_string(),
                    status: Status::Added,
                })
                .collect(),
            status: Status::Added,
        }
    }

    fn secret(name: &str) -> Secret {
        Secret {
            namespace: "shop".into(),
            name: name.into(),
            data: [
                ("tls.crt".to_string(), "CERT".to_string()),
                ("tls.key".to_string(), "KEY".to_string()),
            ]
            .into_iter()
            .collect(),
            status: Status::Added,
        }
    }

    /// Run the translator's passes over every ingress, the way a cycle does.
    fn translate(
        translator: &mut Translator,
        config: &ControllerConfig,
        cache: &DesiredState,
        document: &mut ConfigDocument,
    ) -> Vec<PassOutcome> {
        let mut used_certs = BTreeSet::new();
        let mut ctx = PassContext {
            config,
            cache,
            document,
            used_certs: &mut used_certs,
        };
        let mut outcomes = vec![
            translator.global_annotations(&mut ctx),
            translator.default_service(&mut ctx),
        ];
        for ns in cache.relevant_namespaces() {
            for ing in ns.ingresses.values() {
                for rule in &ing.rules {
                    for path in &rule.paths {
                        outcomes.push(translator.path(&mut ctx, ing, rule, path));
                    }
                }
                for tls in &ing.tls {
                    outcomes.push(translator.tls_secret(&mut ctx, ing, tls));
                }
            }
        }
        outcomes.push(translator.default_certificate(&mut ctx));
        outcomes.push(translator.https_frontend(&mut ctx));
        outcomes.push(translator.map_files(&mut ctx));
        outcomes.push(translator.backend_switching(&mut ctx));
        outcomes
    }

    #[test]
    fn backend_name_is_sanitized() {
        assert_eq!(backend_name("shop", "web", 80), "ing-shop-web-80");
        assert_eq!(backend_name("shop", "web:v2", 80), "ing-shop-web_v2-80");
    }

    #[test]
    fn paths_produce_backends_and_map_entries() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let mut cache = DesiredState::new(vec![]);
        cache.apply(SyncEvent::Ingress(ingress(
            &[("/", "web", 80), ("/api", "api", 8080)],
            &[],
        )));
        let mut doc = ConfigDocument::parse("global\n    daemon\n");
        let mut translator = Translator::new(&config);

        let outcomes = translate(&mut translator, &config, &cache, &mut doc);
        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert!(outcomes.iter().any(|o| o.reload));
        assert!(doc.section("backend ing-shop-web-80").is_some());
        assert!(doc.section("backend ing-shop-api-8080").is_some());
        assert!(doc.section("backend default-backend").is_some());

        let map = fs::read_to_string(config.paths.map_dir.join("host-path.map")).unwrap();
        assert_eq!(
            map,
            "shop.example.com/ ing-shop-web-80\nshop.example.com/api ing-shop-api-8080\n"
        );

        // A second identical pass over the same state changes nothing.
        cache.clean();
        let outcomes = translate(&mut translator, &config, &cache, &mut doc);
        assert!(outcomes.iter().all(|o| !o.reload && !o.restart));
    }

    #[test]
    fn ingress_default_backend_routes_on_path_alone() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let mut translator = Translator::new(&config);
        let mut doc = ConfigDocument::parse("global\n");
        let cache = DesiredState::new(vec![]);
        let mut used_certs = BTreeSet::new();
        let mut ctx = PassContext {
            config: &config,
            cache: &cache,
            document: &mut doc,
            used_certs: &mut used_certs,
        };
        let ing = ingress(&[], &[]);
        let default = IngressPath {
            path: String::new(),
            service_name: "catch-all".into(),
            service_port: 80,
            status: Status::Added,
        };
        assert!(translator.path(&mut ctx, &ing, &IngressRule::default(), &default).reload);
        assert!(translator.map_files(&mut ctx).reload);

        let map = fs::read_to_string(config.paths.map_dir.join("path.map")).unwrap();
        assert_eq!(map, "/ ing-shop-catch-all-80\n");
    }

    #[test]
    fn removed_service_drops_its_backend() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let mut cache = DesiredState::new(vec![]);
        cache.apply(SyncEvent::Ingress(ingress(
            &[("/", "web", 80), ("/api", "api", 8080)],
            &[],
        )));
        let mut doc = ConfigDocument::parse("global\n    daemon\n");
        let mut translator = Translator::new(&config);
        translate(&mut translator, &config, &cache, &mut doc);
        cache.clean();

        cache.apply(SyncEvent::Ingress(ingress(&[("/", "web", 80)], &[])));
        let outcomes = translate(&mut translator, &config, &cache, &mut doc);
        assert!(outcomes.last().unwrap().reload, "backend switching reports removal");
        assert!(doc.section("backend ing-shop-api-8080").is_none());
        assert!(doc.section("backend ing-shop-web-80").is_some());
    }

    #[test]
    fn tls_secret_is_written_and_stale_certs_pruned() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        fs::create_dir_all(&config.paths.cert_dir).unwrap();
        fs::write(config.paths.cert_dir.join("shop_old.pem"), "OLD").unwrap();

        let mut cache = DesiredState::new(vec![]);
        cache.apply(SyncEvent::Secret(secret("shop-tls")));
        cache.apply(SyncEvent::Ingress(ingress(&[("/", "web", 80)], &["shop-tls"])));
        let mut doc = ConfigDocument::parse("global\n");
        let mut translator = Translator::new(&config);
        translate(&mut translator, &config, &cache, &mut doc);

        let pem = fs::read_to_string(config.paths.cert_dir.join("shop_shop-tls.pem")).unwrap();
        assert_eq!(pem, "CERT\nKEY\n");
        assert!(!config.paths.cert_dir.join("shop_old.pem").exists());
    }

    #[test]
    fn missing_secret_is_a_pass_error() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let mut cache = DesiredState::new(vec![]);
        cache.apply(SyncEvent::Ingress(ingress(&[("/", "web", 80)], &["absent"])));
        let mut doc = ConfigDocument::parse("global\n");
        let mut translator = Translator::new(&config);

        let outcomes = translate(&mut translator, &config, &cache, &mut doc);
        let errors: Vec<_> = outcomes.iter().filter_map(|o| o.error.as_ref()).collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SyncError::MissingSecret { key } if key == "shop/absent"));
    }

    #[test]
    fn base_global_directives_survive_until_a_setting_claims_them() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let mut translator = Translator::new(&config);
        let mut doc = ConfigDocument::parse("global\n    maxconn 1000\n");
        let mut cache = DesiredState::new(vec![]);

        let run = |translator: &mut Translator, cache: &DesiredState, doc: &mut ConfigDocument| {
            let mut used_certs = BTreeSet::new();
            let mut ctx = PassContext {
                config: &config,
                cache,
                document: doc,
                used_certs: &mut used_certs,
            };
            translator.global_annotations(&mut ctx)
        };

        assert!(!run(&mut translator, &cache, &mut doc).restart);
        assert_eq!(doc.section("global").unwrap().lines, vec!["maxconn 1000"]);

        let settings: BTreeMap<_, _> = [("maxconn".to_string(), "3000".to_string())]
            .into_iter()
            .collect();
        cache.apply(SyncEvent::Global(settings));
        assert!(run(&mut translator, &cache, &mut doc).restart);
        assert_eq!(doc.section("global").unwrap().lines, vec!["maxconn 3000"]);
        translator.committed();

        cache.apply(SyncEvent::Global(BTreeMap::new()));
        assert!(run(&mut translator, &cache, &mut doc).restart);
        assert!(doc.section("global").unwrap().lines.is_empty());
    }

    #[test]
    fn uncommitted_setting_does_not_claim_the_base_directive() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let mut translator = Translator::new(&config);
        let mut cache = DesiredState::new(vec![]);
        let base = "global\n    maxconn 1000\n";

        let run = |translator: &mut Translator, cache: &DesiredState, doc: &mut ConfigDocument| {
            let mut used_certs = BTreeSet::new();
            let mut ctx = PassContext {
                config: &config,
                cache,
                document: doc,
                used_certs: &mut used_certs,
            };
            translator.global_annotations(&mut ctx)
        };

        let settings: BTreeMap<_, _> = [("maxconn".to_string(), "3000".to_string())]
            .into_iter()
            .collect();
        cache.apply(SyncEvent::Global(settings));
        let mut failed = ConfigDocument::parse(base);
        assert!(run(&mut translator, &cache, &mut failed).restart);

        // The commit never happened; the next cycle starts from the base file.
        cache.apply(SyncEvent::Global(BTreeMap::new()));
        let mut doc = ConfigDocument::parse(base);
        assert!(!run(&mut translator, &cache, &mut doc).restart);
        assert_eq!(doc.section("global").unwrap().lines, vec!["maxconn 1000"]);
    }

    #[test]
    fn global_settings_request_restart() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let mut cache = DesiredState::new(vec![]);
        let settings = [
            ("maxconn".to_string(), "4000".to_string()),
            ("nbthread".to_string(), "many".to_string()),
        ]
        .into_iter()
        .collect();
        cache.apply(SyncEvent::Global(settings));
        let mut doc = ConfigDocument::parse("global\n    daemon\n    maxconn 1000\n");
        let mut translator = Translator::new(&config);

        let mut used_certs = BTreeSet::new();
        let mut ctx = PassContext {
            config: &config,
            cache: &cache,
            document: &mut doc,
            used_certs: &mut used_certs,
        };
        let outcome = translator.global_annotations(&mut ctx);
        assert!(outcome.restart);
        assert!(matches!(
            outcome.error,
            Some(SyncError::InvalidSetting { ref name, .. }) if name == "nbthread"
        ));
        assert_eq!(
            doc.section("global").unwrap().lines,
            vec!["daemon", "maxconn 4000"]
        );
    }
}
