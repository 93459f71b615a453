//! Request handling for the run/save/browse operations.
//!
//! Each function takes the decoded request body and returns either the
//! response body or a [`ServiceError`] carrying the HTTP status to answer
//! with. Caller identity is resolved by the auth layer before these run.

use serde_derive::{Deserialize, Serialize};

use crate::{
    graph::GraphRequest,
    language::Language,
    submission::{CallerId, NewSubmission, Submission, SubmissionId, SubmissionStore},
    Error, ExecutionRequest, Sandbox,
};

const INVALID_LANGUAGE: &str = "Invalid language. Use 'Python' or 'JavaScript'";
const MISSING_FIELDS: &str = "Code and language are required";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{status}: {message}")]
pub struct ServiceError {
    #[serde(skip)]
    pub status: u16,
    pub message: String,
}

impl ServiceError {
    fn new(status: u16, message: impl Into<String>) -> Self {
        ServiceError {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn forbidden() -> Self {
        Self::new(403, "Access denied")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Submission not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub code: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub output: String,
    pub execution_time: String,
    pub error: String,
    pub graph: Option<String>,
    pub has_graph: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub code: Option<String>,
    pub language: Option<String>,
    pub file_name: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub execution_time: Option<String>,
    pub graph: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionResponse {
    pub message: String,
    pub data: Submission,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionsResponse {
    pub message: String,
    pub count: usize,
    pub data: Vec<Submission>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphResponse {
    pub message: String,
    pub graph: String,
}

fn required(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}

fn client_or_internal(e: Error, internal_message: &str) -> ServiceError {
    match e {
        Error::UnsupportedLanguage { .. } => ServiceError::bad_request(INVALID_LANGUAGE),
        Error::MissingField { .. } => ServiceError::bad_request(MISSING_FIELDS),
        e if e.is_validation() => ServiceError::bad_request(e.to_string()),
        e => {
            log::error!("{}: {}", internal_message, e);
            ServiceError::internal(internal_message)
        }
    }
}

pub async fn run_code(sandbox: &Sandbox, req: RunRequest) -> Result<RunResponse, ServiceError> {
    let (code, language) = match (required(req.code), required(req.language)) {
        (Some(code), Some(language)) => (code, language),
        _ => return Err(ServiceError::bad_request(MISSING_FIELDS)),
    };

    let result = sandbox
        .execute(&ExecutionRequest { code, language })
        .await
        .map_err(|e| client_or_internal(e, "Internal server error"))?;

    let graph = result.rendered_image.as_ref().map(|img| img.to_data_uri());

    Ok(RunResponse {
        output: result.stdout,
        execution_time: format!("{} ms", result.execution_time_ms),
        error: result.stderr,
        has_graph: graph.is_some(),
        graph,
    })
}

pub fn save_code(
    store: &dyn SubmissionStore,
    caller: &CallerId,
    req: SaveRequest,
) -> Result<SubmissionResponse, ServiceError> {
    let (code, language) = match (required(req.code), required(req.language)) {
        (Some(code), Some(language)) => (code, language),
        _ => return Err(ServiceError::bad_request(MISSING_FIELDS)),
    };
    let language: Language = language
        .parse()
        .map_err(|e| client_or_internal(e, "Failed to save code"))?;

    let saved = store.save(NewSubmission {
        code,
        language: language.name().to_string(),
        file_name: required(req.file_name).unwrap_or_else(|| "Untitled".to_string()),
        owner: caller.clone(),
        output: req.output.unwrap_or_default(),
        error: req.error.unwrap_or_default(),
        execution_time: required(req.execution_time).unwrap_or_else(|| "0 ms".to_string()),
        graph: required(req.graph),
    });

    log::debug!("Saved submission {} for {}", saved.id, caller);

    Ok(SubmissionResponse {
        message: "Code saved successfully".to_string(),
        data: saved,
    })
}

pub fn get_submissions(store: &dyn SubmissionStore, caller: &CallerId) -> SubmissionsResponse {
    let data = store.list_for_owner(caller);

    SubmissionsResponse {
        message: "Submissions retrieved successfully".to_string(),
        count: data.len(),
        data,
    }
}

fn owned_submission(
    store: &dyn SubmissionStore,
    caller: &CallerId,
    id: SubmissionId,
) -> Result<Submission, ServiceError> {
    let submission = store.get(id).ok_or_else(ServiceError::not_found)?;
    if !submission.is_owned_by(caller) {
        log::warn!("{} tried to access submission {} of another owner", caller, id);
        return Err(ServiceError::forbidden());
    }
    Ok(submission)
}

pub fn get_submission(
    store: &dyn SubmissionStore,
    caller: &CallerId,
    id: SubmissionId,
) -> Result<SubmissionResponse, ServiceError> {
    let data = owned_submission(store, caller, id)?;

    Ok(SubmissionResponse {
        message: "Submission retrieved successfully".to_string(),
        data,
    })
}

pub fn delete_submission(
    store: &dyn SubmissionStore,
    caller: &CallerId,
    id: SubmissionId,
) -> Result<MessageResponse, ServiceError> {
    owned_submission(store, caller, id)?;
    store.delete(id).ok_or_else(ServiceError::not_found)?;

    Ok(MessageResponse {
        message: "Submission deleted successfully".to_string(),
    })
}

pub async fn generate_graph(sandbox: &Sandbox, req: GraphRequest) -> Result<GraphResponse, ServiceError> {
    let image = sandbox
        .render_graph(&req)
        .await
        .map_err(|e| client_or_internal(e, "Failed to generate graph"))?;

    Ok(GraphResponse {
        message: "Graph generated successfully".to_string(),
        graph: image.to_data_uri(),
    })
}
