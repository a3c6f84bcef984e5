//! The translation-pass surface of a reconciliation cycle.
//!
//! Each pass edits the transaction's [`ConfigDocument`] (or a side file) for
//! one aspect of the desired state and reports what the proxy needs as a
//! [`PassOutcome`]. The reconciler folds every outcome into one [`Decision`].

use std::collections::BTreeSet;

use ingress_core::{ControllerConfig, DesiredState, Ingress, IngressPath, IngressRule, IngressTls};
use ingress_core::PublishService;
use ingress_process::ServiceAction;

use crate::document::ConfigDocument;
use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Outcome and decision
// ---------------------------------------------------------------------------

/// Result of one pass.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub reload: bool,
    pub restart: bool,
    pub error: Option<SyncError>,
}

impl PassOutcome {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn reload() -> Self {
        Self {
            reload: true,
            ..Self::default()
        }
    }

    pub fn restart() -> Self {
        Self {
            restart: true,
            ..Self::default()
        }
    }

    pub fn failed(error: SyncError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// `Ok(true)` requests a reload, `Ok(false)` is a no-op.
    pub fn from_result(result: Result<bool, SyncError>) -> Self {
        match result {
            Ok(true) => Self::reload(),
            Ok(false) => Self::unchanged(),
            Err(e) => Self::failed(e),
        }
    }
}

/// What a cycle asks of the proxy process. Both flags only ever go from
/// `false` to `true` within a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decision {
    pub reload: bool,
    pub restart: bool,
}

impl Decision {
    pub fn absorb(&mut self, outcome: &PassOutcome) {
        self.reload |= outcome.reload;
        self.restart |= outcome.restart;
    }

    /// Restart beats reload beats nothing.
    pub fn action(&self) -> Option<ServiceAction> {
        if self.restart {
            Some(ServiceAction::Restart)
        } else if self.reload {
            Some(ServiceAction::Reload)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Context and trait
// ---------------------------------------------------------------------------

/// Everything a pass may read or edit during one cycle.
pub struct PassContext<'a> {
    pub config: &'a ControllerConfig,
    pub cache: &'a DesiredState,
    /// Document of the open transaction.
    pub document: &'a mut ConfigDocument,
    /// Certificate files referenced so far this cycle (file names inside the
    /// certificate directory).
    pub used_certs: &'a mut BTreeSet<String>,
}

/// One method per pass, called by the reconciler in a fixed order. Every
/// method defaults to [`PassOutcome::unchanged`].
#[allow(unused_variables)]
pub trait Passes: Send {
    fn global_annotations(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn default_service(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn path(
        &mut self,
        ctx: &mut PassContext<'_>,
        ingress: &Ingress,
        rule: &IngressRule,
        path: &IngressPath,
    ) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn tls_secret(
        &mut self,
        ctx: &mut PassContext<'_>,
        ingress: &Ingress,
        tls: &IngressTls,
    ) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn rate_limiting(&mut self, ctx: &mut PassContext<'_>, ingress: &Ingress) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn request_capture(&mut self, ctx: &mut PassContext<'_>, ingress: &Ingress) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn request_set_header(&mut self, ctx: &mut PassContext<'_>, ingress: &Ingress) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn response_set_header(&mut self, ctx: &mut PassContext<'_>, ingress: &Ingress) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn deny_list(&mut self, ctx: &mut PassContext<'_>, ingress: &Ingress) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn allow_list(&mut self, ctx: &mut PassContext<'_>, ingress: &Ingress) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn http_redirect(&mut self, ctx: &mut PassContext<'_>, ingress: &Ingress) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn proxy_protocol(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn default_certificate(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn https_frontend(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn http_request_rules(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn http_response_rules(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn tcp_request_rules(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn backend_http_request_rules(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn map_files(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn tcp_services(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    fn backend_switching(&mut self, ctx: &mut PassContext<'_>) -> PassOutcome {
        PassOutcome::unchanged()
    }

    /// Called once the cycle's transaction is committed. State a pass keeps
    /// about the live configuration is only promoted here.
    fn committed(&mut self) {}
}

/// Writes the published load-balancer addresses back onto an ingress.
pub trait StatusPublisher: Send {
    fn publish(&self, ingress: &Ingress, service: &PublishService) -> Result<(), SyncError>;
}
