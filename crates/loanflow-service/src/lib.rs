#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use loanflow_adapters::LogNotifier;
use loanflow_core::{
    ApprovalEvidence, Contribution, ContributionReceipt, DisbursementEvidence, EngineConfig,
    Loan, LoanFlowError, LoanPhase, NewLoan, PhaseTransition, StorageConfig, TotalsReport,
    TransitionEngine,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<TransitionEngine>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, LoanFlowError> {
        let engine = TransitionEngine::bootstrap(
            config.storage,
            Arc::new(LogNotifier),
            EngineConfig::default(),
        )
        .await?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    /// Wrap an externally constructed engine, e.g. one with a custom
    /// notifier.
    pub fn with_engine(engine: Arc<TransitionEngine>) -> Self {
        Self { engine }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/loans", post(create_loan).get(list_loans))
        .route("/v1/loans/:id", get(get_loan).delete(delete_loan))
        .route("/v1/loans/by-ref/:loan_ref", get(get_loan_by_ref))
        .route("/v1/loans/:id/approve", post(approve_loan))
        .route("/v1/loans/:id/invest", post(invest_in_loan))
        .route("/v1/loans/:id/disburse", post(disburse_loan))
        .route("/v1/loans/:id/history", get(loan_history))
        .route("/v1/loans/:id/contributions", get(loan_contributions))
        .route("/v1/loans/:id/can-advance", get(loan_can_advance))
        .route("/v1/loans/:id/totals", get(loan_totals))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] LoanFlowError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

/// HTTP mapping for the core error taxonomy. `TotalMismatch` is an internal
/// consistency failure and is kept distinct from user errors; `Busy` is
/// retryable contention.
fn status_for(err: &LoanFlowError) -> StatusCode {
    match err {
        LoanFlowError::NotFound => StatusCode::NOT_FOUND,
        LoanFlowError::WrongPhase { .. } => StatusCode::CONFLICT,
        LoanFlowError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        LoanFlowError::ExceedsRemainingCapacity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LoanFlowError::DuplicateContributor { .. } => StatusCode::CONFLICT,
        LoanFlowError::Busy(_) | LoanFlowError::Conflict => StatusCode::SERVICE_UNAVAILABLE,
        LoanFlowError::TotalMismatch { .. }
        | LoanFlowError::Storage(_)
        | LoanFlowError::Serialization(_)
        | LoanFlowError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => (
                status_for(&err),
                Json(serde_json::json!({ "error": err.to_string(), "retryable": err.is_retryable() })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "loanflow-service",
        storage_backend: state.engine.storage_label(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct CreateLoanRequest {
    borrower_id: i64,
    principal_minor: i64,
    #[serde(default)]
    rate: f64,
    #[serde(default)]
    roi: f64,
    #[serde(default)]
    agreement_letter_link: String,
}

async fn create_loan(
    State(state): State<ServiceState>,
    Json(request): Json<CreateLoanRequest>,
) -> Result<(StatusCode, Json<Loan>), ApiError> {
    let loan = state
        .engine
        .create_loan(NewLoan {
            borrower_id: request.borrower_id,
            principal_minor: request.principal_minor,
            rate: request.rate,
            roi: request.roi,
            agreement_letter_link: request.agreement_letter_link,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(loan)))
}

#[derive(Debug, Clone, Deserialize)]
struct ListLoansQuery {
    phase: Option<String>,
    offset: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct LoanListResponse {
    returned: usize,
    items: Vec<Loan>,
}

async fn list_loans(
    State(state): State<ServiceState>,
    Query(query): Query<ListLoansQuery>,
) -> Result<Json<LoanListResponse>, ApiError> {
    let phase = match query.phase.as_deref() {
        None => None,
        Some(value) => Some(LoanPhase::parse(value).ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid phase '{value}'; expected one of: proposed, approved, funded, disbursed"
            ))
        })?),
    };

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(500);
    let items = state.engine.list_loans(phase, offset, limit).await?;
    Ok(Json(LoanListResponse {
        returned: items.len(),
        items,
    }))
}

async fn get_loan(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
) -> Result<Json<Loan>, ApiError> {
    Ok(Json(state.engine.get_loan(id).await?))
}

async fn get_loan_by_ref(
    Path(loan_ref): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<Loan>, ApiError> {
    Ok(Json(state.engine.get_loan_by_ref(loan_ref).await?))
}

async fn delete_loan(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_loan(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, Deserialize)]
struct ApproveRequest {
    validator_employee_id: String,
    proof_image_url: String,
}

async fn approve_loan(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<Loan>, ApiError> {
    let evidence = ApprovalEvidence::new(request.validator_employee_id, request.proof_image_url);
    Ok(Json(state.engine.approve(id, evidence).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct InvestRequest {
    contributor_id: String,
    amount_minor: i64,
}

async fn invest_in_loan(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
    Json(request): Json<InvestRequest>,
) -> Result<Json<ContributionReceipt>, ApiError> {
    Ok(Json(
        state
            .engine
            .contribute(id, &request.contributor_id, request.amount_minor)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct DisburseRequest {
    officer_employee_id: String,
    signed_agreement_url: String,
}

async fn disburse_loan(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
    Json(request): Json<DisburseRequest>,
) -> Result<Json<Loan>, ApiError> {
    let evidence =
        DisbursementEvidence::new(request.officer_employee_id, request.signed_agreement_url);
    Ok(Json(state.engine.disburse(id, evidence).await?))
}

#[derive(Debug, Clone, Serialize)]
struct HistoryResponse {
    items: Vec<PhaseTransition>,
}

async fn loan_history(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
) -> Result<Json<HistoryResponse>, ApiError> {
    Ok(Json(HistoryResponse {
        items: state.engine.history(id).await?,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct ContributionsResponse {
    items: Vec<Contribution>,
}

async fn loan_contributions(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
) -> Result<Json<ContributionsResponse>, ApiError> {
    Ok(Json(ContributionsResponse {
        items: state.engine.contributions(id).await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct CanAdvanceQuery {
    target: String,
}

#[derive(Debug, Clone, Serialize)]
struct CanAdvanceResponse {
    loan_id: i64,
    target: LoanPhase,
    allowed: bool,
}

async fn loan_can_advance(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
    Query(query): Query<CanAdvanceQuery>,
) -> Result<Json<CanAdvanceResponse>, ApiError> {
    let target = LoanPhase::parse(&query.target).ok_or_else(|| {
        ApiError::bad_request(format!(
            "invalid target '{}'; expected one of: proposed, approved, funded, disbursed",
            query.target
        ))
    })?;
    let allowed = state.engine.can_advance(id, target).await?;
    Ok(Json(CanAdvanceResponse {
        loan_id: id,
        target,
        allowed,
    }))
}

async fn loan_totals(
    Path(id): Path<i64>,
    State(state): State<ServiceState>,
) -> Result<Json<TotalsReport>, ApiError> {
    Ok(Json(state.engine.verify_totals(id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig::default())
            .await
            .unwrap();
        build_router(state)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create_loan_with(app: &Router, principal_minor: i64) -> i64 {
        let (status, body) = send(
            app,
            "POST",
            "/v1/loans",
            Some(serde_json::json!({
                "borrower_id": 42,
                "principal_minor": principal_minor,
                "rate": 8.0,
                "roi": 6.5,
                "agreement_letter_link": "https://example.org/agreements/42.pdf"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body.get("id").and_then(|v| v.as_i64()).unwrap()
    }

    async fn approve(app: &Router, id: i64) {
        let (status, _) = send(
            app,
            "POST",
            &format!("/v1/loans/{id}/approve"),
            Some(serde_json::json!({
                "validator_employee_id": "emp-771",
                "proof_image_url": "https://example.org/proofs/visit.jpg"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    fn invest_body(contributor: &str, amount_minor: i64) -> serde_json::Value {
        serde_json::json!({ "contributor_id": contributor, "amount_minor": amount_minor })
    }

    #[tokio::test]
    async fn health_reports_storage_backend() {
        let app = app().await;
        let (status, body) = send(&app, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("status").and_then(|v| v.as_str()), Some("ok"));
        assert_eq!(
            body.get("storage_backend").and_then(|v| v.as_str()),
            Some("memory")
        );
    }

    #[tokio::test]
    async fn full_lifecycle_over_http() {
        let app = app().await;
        let id = create_loan_with(&app, 10_000_000).await;
        approve(&app, id).await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/invest"),
            Some(invest_body("inv-x", 6_000_000)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("funded").and_then(|v| v.as_bool()), Some(false));

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/invest"),
            Some(invest_body("inv-y", 4_000_000)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("funded").and_then(|v| v.as_bool()), Some(true));

        let (status, _) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/disburse"),
            Some(serde_json::json!({
                "officer_employee_id": "emp-302",
                "signed_agreement_url": "https://example.org/agreements/42-signed.pdf"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", &format!("/v1/loans/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body.get("phase").and_then(|v| v.as_str()),
            Some("disbursed")
        );

        let (status, body) = send(&app, "GET", &format!("/v1/loans/{id}/history"), None).await;
        assert_eq!(status, StatusCode::OK);
        let items = body.get("items").and_then(|v| v.as_array()).unwrap();
        let phases: Vec<&str> = items
            .iter()
            .map(|item| item.get("new_phase").and_then(|v| v.as_str()).unwrap())
            .collect();
        assert_eq!(phases, ["approved", "funded", "disbursed"]);

        let (status, body) = send(&app, "GET", &format!("/v1/loans/{id}/totals"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("consistent").and_then(|v| v.as_bool()), Some(true));
    }

    #[tokio::test]
    async fn second_approval_is_a_conflict() {
        let app = app().await;
        let id = create_loan_with(&app, 1_000_000).await;
        approve(&app, id).await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/approve"),
            Some(serde_json::json!({
                "validator_employee_id": "emp-771",
                "proof_image_url": "https://example.org/proofs/visit.jpg"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("requires phase 'proposed'"));
    }

    #[tokio::test]
    async fn overshoot_is_unprocessable() {
        let app = app().await;
        let id = create_loan_with(&app, 10_000_000).await;
        approve(&app, id).await;

        let (status, _) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/invest"),
            Some(invest_body("inv-x", 6_000_000)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/invest"),
            Some(invest_body("inv-y", 5_000_000)),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("4000000"));
    }

    #[tokio::test]
    async fn duplicate_contributor_is_a_conflict() {
        let app = app().await;
        let id = create_loan_with(&app, 1_000_000).await;
        approve(&app, id).await;

        let (status, _) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/invest"),
            Some(invest_body("inv-x", 100)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/invest"),
            Some(invest_body("inv-x", 200)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = send(&app, "GET", &format!("/v1/loans/{id}/contributions"), None).await;
        assert_eq!(
            body.get("items").and_then(|v| v.as_array()).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn bad_input_is_rejected_with_400() {
        let app = app().await;
        let id = create_loan_with(&app, 1_000_000).await;
        approve(&app, id).await;

        let (status, _) = send(
            &app,
            "POST",
            &format!("/v1/loans/{id}/invest"),
            Some(invest_body("inv-x", 0)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/v1/loans",
            Some(serde_json::json!({ "borrower_id": 1, "principal_minor": -5 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_loan_is_404() {
        let app = app().await;
        let (status, _) = send(&app, "GET", "/v1/loans/9999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            "POST",
            "/v1/loans/9999/invest",
            Some(invest_body("inv-x", 100)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn can_advance_consults_the_transition_table() {
        let app = app().await;
        let id = create_loan_with(&app, 1_000_000).await;

        let (status, body) = send(
            &app,
            "GET",
            &format!("/v1/loans/{id}/can-advance?target=approved"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("allowed").and_then(|v| v.as_bool()), Some(true));

        let (_, body) = send(
            &app,
            "GET",
            &format!("/v1/loans/{id}/can-advance?target=funded"),
            None,
        )
        .await;
        assert_eq!(body.get("allowed").and_then(|v| v.as_bool()), Some(false));

        let (status, _) = send(
            &app,
            "GET",
            &format!("/v1/loans/{id}/can-advance?target=signed"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_filters_by_phase() {
        let app = app().await;
        let first = create_loan_with(&app, 1_000).await;
        let _second = create_loan_with(&app, 2_000).await;
        approve(&app, first).await;

        let (status, body) = send(&app, "GET", "/v1/loans?phase=approved", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("returned").and_then(|v| v.as_u64()), Some(1));
        let items = body.get("items").and_then(|v| v.as_array()).unwrap();
        assert_eq!(items[0].get("id").and_then(|v| v.as_i64()), Some(first));

        let (status, _) = send(&app, "GET", "/v1/loans?phase=signed", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lookup_by_external_reference() {
        let app = app().await;
        let id = create_loan_with(&app, 1_000).await;
        let (_, body) = send(&app, "GET", &format!("/v1/loans/{id}"), None).await;
        let loan_ref = body.get("loan_ref").and_then(|v| v.as_str()).unwrap();

        let (status, body) =
            send(&app, "GET", &format!("/v1/loans/by-ref/{loan_ref}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("id").and_then(|v| v.as_i64()), Some(id));
    }

    #[tokio::test]
    async fn funding_notifies_every_contributor() {
        use loanflow_adapters::RecordingNotifier;
        use loanflow_core::{
            MemoryContributionLedger, MemoryLoanStore, MemoryTransitionLog,
        };

        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(MemoryLoanStore::new()),
            Arc::new(MemoryContributionLedger::new()),
            Arc::new(MemoryTransitionLog::new()),
            notifier.clone(),
            EngineConfig::default(),
        ));
        let app = build_router(ServiceState::with_engine(engine));

        let id = create_loan_with(&app, 1_000).await;
        approve(&app, id).await;
        for (contributor, amount) in [("inv-x", 400), ("inv-y", 600)] {
            let (status, _) = send(
                &app,
                "POST",
                &format!("/v1/loans/{id}/invest"),
                Some(invest_body(contributor, amount)),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 2);
        let mut contributors: Vec<&str> =
            sent.iter().map(|n| n.contributor_id.as_str()).collect();
        contributors.sort_unstable();
        assert_eq!(contributors, ["inv-x", "inv-y"]);
    }

    #[tokio::test]
    async fn delete_is_proposed_only() {
        let app = app().await;
        let id = create_loan_with(&app, 1_000).await;
        let (status, _) = send(&app, "DELETE", &format!("/v1/loans/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let id = create_loan_with(&app, 1_000).await;
        approve(&app, id).await;
        let (status, _) = send(&app, "DELETE", &format!("/v1/loans/{id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
