//! Certificate approver for the datapath agents.
//!
//! apinetlet and metalnetlet bootstrap their client certificates through
//! CertificateSigningRequests. A request is approved when it matches one
//! of the recognizers below; anything else is left for a human or another
//! approver.

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestCondition};
use kube::Api;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use serde_json::json;
use tracing::{debug, info};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use super::{Reconciler, name_of};
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use apinet_client::ClientError;

/// Signer of client certificates for the API server.
pub const KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Group of users allowed to request a first certificate.
pub const BOOTSTRAPPERS_GROUP: &str = "system:bootstrappers";

const USAGE_DIGITAL_SIGNATURE: &str = "digital signature";
const USAGE_KEY_ENCIPHERMENT: &str = "key encipherment";
const USAGE_CLIENT_AUTH: &str = "client auth";

const CONDITION_APPROVED: &str = "Approved";
const CONDITION_DENIED: &str = "Denied";

/// Agent identity a CSR may be approved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recognizer {
    /// Required prefix of the subject common name
    pub common_name_prefix: &'static str,
    /// Required subject organization
    pub organization: &'static str,
}

pub const RECOGNIZERS: [Recognizer; 2] = [
    Recognizer {
        common_name_prefix: "apinet:apinetlet:",
        organization: "apinet:apinetlets",
    },
    Recognizer {
        common_name_prefix: "apinet:metalnetlet:",
        organization: "apinet:metalnetlets",
    },
];

/// Writes an approval onto a CSR.
#[async_trait]
pub trait CsrApproval: Send + Sync {
    async fn approve(&self, csr: &CertificateSigningRequest, reason: &str, message: &str) -> Result<(), ClientError>;
}

/// Approves through the `approval` subresource.
pub struct KubeCsrApproval {
    api: Api<CertificateSigningRequest>,
}

impl std::fmt::Debug for KubeCsrApproval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCsrApproval").finish_non_exhaustive()
    }
}

impl KubeCsrApproval {
    pub fn new(client: kube::Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl CsrApproval for KubeCsrApproval {
    async fn approve(&self, csr: &CertificateSigningRequest, reason: &str, message: &str) -> Result<(), ClientError> {
        let name = csr
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClientError::Invalid("CertificateSigningRequest without a name".to_string()))?;
        let mut conditions = csr
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        conditions.push(CertificateSigningRequestCondition {
            type_: CONDITION_APPROVED.to_string(),
            status: "True".to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        });
        let patch = json!({ "status": { "conditions": conditions } });
        self.api
            .patch_approval(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Subject fields read from the PEM-encoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSubject {
    pub common_name: String,
    pub organizations: Vec<String>,
}

/// Why a CSR is not auto-approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Signer,
    Usages,
    Malformed(String),
    UnknownSubject,
    Requester,
}

pub fn parse_subject(pem: &[u8]) -> Result<CsrSubject, Rejection> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem).map_err(|e| Rejection::Malformed(e.to_string()))?;
    let (_, request) =
        X509CertificationRequest::from_der(&pem.contents).map_err(|e| Rejection::Malformed(e.to_string()))?;
    let subject = &request.certification_request_info.subject;

    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Rejection::Malformed("subject has no common name".to_string()))?
        .to_string();
    let organizations = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(ToString::to_string)
        .collect();
    Ok(CsrSubject {
        common_name,
        organizations,
    })
}

fn usages_allowed(usages: &[String]) -> bool {
    let has = |usage: &str| usages.iter().any(|u| u == usage);
    has(USAGE_DIGITAL_SIGNATURE)
        && has(USAGE_CLIENT_AUTH)
        && usages
            .iter()
            .all(|u| [USAGE_DIGITAL_SIGNATURE, USAGE_CLIENT_AUTH, USAGE_KEY_ENCIPHERMENT].contains(&u.as_str()))
}

/// Recognizer matching `csr`, or why none does.
pub fn recognize(csr: &CertificateSigningRequest) -> Result<Recognizer, Rejection> {
    let spec = &csr.spec;
    if spec.signer_name != KUBE_APISERVER_CLIENT_SIGNER {
        return Err(Rejection::Signer);
    }
    if !usages_allowed(spec.usages.as_deref().unwrap_or_default()) {
        return Err(Rejection::Usages);
    }

    let subject = parse_subject(&spec.request.0)?;
    let recognizer = RECOGNIZERS
        .iter()
        .find(|r| {
            subject.common_name.starts_with(r.common_name_prefix)
                && subject.organizations.len() == 1
                && subject.organizations.iter().any(|o| o == r.organization)
        })
        .copied()
        .ok_or(Rejection::UnknownSubject)?;

    // Renewals come from the agent itself, first requests from a bootstrap token.
    let renewal = spec.username.as_deref() == Some(subject.common_name.as_str());
    let bootstrap = spec
        .groups
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|g| g == BOOTSTRAPPERS_GROUP);
    if !renewal && !bootstrap {
        return Err(Rejection::Requester);
    }
    Ok(recognizer)
}

fn is_decided(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == CONDITION_APPROVED || c.type_ == CONDITION_DENIED)
        })
}

impl Reconciler {
    pub async fn reconcile_certificate_signing_request(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<Action, ControllerError> {
        let name = name_of(csr)?;
        if !self.config.csr_approver_enabled || is_decided(csr) {
            return Ok(Action::await_change());
        }

        let recognizer = match recognize(csr) {
            Ok(r) => r,
            Err(rejection) => {
                debug!(csr = name, ?rejection, "Not auto-approving certificate signing request");
                return Ok(Action::await_change());
            }
        };

        let message = format!("Auto approving {} certificate", recognizer.organization);
        self.clients
            .csr_approval
            .approve(csr, "AutoApproved", &message)
            .await?;
        info!(csr = name, organization = recognizer.organization, "Approved certificate signing request");
        self.publish(csr, EventType::Normal, reasons::APPROVED, actions::RECONCILE, message)
            .await;
        Ok(Action::await_change())
    }
}

/// Approval sink remembering approved CSR names, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingCsrApproval {
    approved: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingCsrApproval {
    pub fn approved(&self) -> Vec<String> {
        self.approved.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl CsrApproval for RecordingCsrApproval {
    async fn approve(&self, csr: &CertificateSigningRequest, _reason: &str, _message: &str) -> Result<(), ClientError> {
        if let Ok(mut approved) = self.approved.lock() {
            approved.push(csr.metadata.name.clone().unwrap_or_default());
        }
        Ok(())
    }
}
