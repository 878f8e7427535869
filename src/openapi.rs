use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::db::SelectionRecord;
use crate::error::ErrorResponse;
use crate::quota::handlers::{SelectionListResponse, SelectionRequest, SelectionResponse};
use crate::quota::models::{ConsumeRequest, ConsumeResponse, DenyReason};
use crate::quota::{QuotaRecord, QuotaState, QuotaStatus};
use crate::scheduler::{RunSummary, SchedulerStatus};

/// OpenAPI documentation for the daily quota API
///
/// Schema-only for now; handlers are not annotated with paths.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Daily Quota API",
        version = "1.0.0",
        description = "Per-user daily selection quotas: consumption, scheduled replenishment and selection history.",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    tags(
        (name = "quotas", description = "Quota status and consumption"),
        (name = "selections", description = "Candidate selections that spend quota"),
        (name = "scheduler", description = "Scheduled quota replenishment")
    ),
    components(
        schemas(
            ErrorResponse,
            QuotaRecord,
            QuotaState,
            QuotaStatus,
            DenyReason,
            ConsumeRequest,
            ConsumeResponse,
            SelectionRecord,
            SelectionRequest,
            SelectionResponse,
            SelectionListResponse,
            RunSummary,
            SchedulerStatus,
        )
    )
)]
pub struct ApiDoc;

/// Create the Swagger UI router
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lists_quota_schemas() {
        let doc = ApiDoc::openapi();
        let schemas = doc.components.expect("components").schemas;
        assert!(schemas.contains_key("QuotaStatus"));
        assert!(schemas.contains_key("ConsumeResponse"));
    }
}
