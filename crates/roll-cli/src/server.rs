use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use roll_core::{CoreError, Day, IdentityKey, RegisteredFace, RollCall};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct RollServer {
    roll: Arc<RollCall>,
    utc_offset_secs: i64,
    tool_router: ToolRouter<Self>,
}

impl RollServer {
    pub fn new(roll: Arc<RollCall>, utc_offset_secs: i64) -> Self {
        Self {
            roll,
            utc_offset_secs,
            tool_router: Self::tool_router(),
        }
    }

    /// Runs a core call on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce(&RollCall) -> roll_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let roll = self.roll.clone();
        tokio::task::spawn_blocking(move || f(&roll))
            .await
            .map_err(|e| McpError::internal_error(format!("worker failed: {e}"), None))?
            .map_err(core_error)
    }

    fn day(&self, day: Option<&str>) -> Result<Day, McpError> {
        match day {
            Some(raw) => Day::parse(raw).map_err(core_error),
            None => Ok(Day::today(self.utc_offset_secs)),
        }
    }
}

fn core_error(e: CoreError) -> McpError {
    if e.is_validation() {
        return McpError::invalid_params(e.to_string(), None);
    }
    tracing::warn!(error = %e, retryable = e.is_retryable(), "tool call failed");
    McpError::internal_error(e.to_string(), None)
}

fn json_result(value: &impl Serialize) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn parse_identity(raw: &str) -> Result<IdentityKey, McpError> {
    IdentityKey::parse(raw).map_err(core_error)
}

/// Decodes a base64 image, tolerating a `data:image/...;base64,` prefix.
pub fn decode_image_text(text: &str) -> Result<Vec<u8>, CoreError> {
    let text = text.trim();
    let payload = match text.split_once(',') {
        Some((head, body)) if head.starts_with("data:") => body,
        _ => text,
    };
    BASE64
        .decode(payload.trim())
        .map_err(|e| CoreError::Validation(format!("image is not valid base64: {e}")))
}

/// A registered face as shown to callers; the image is base64 when included.
#[derive(Debug, Serialize)]
pub struct RegisteredView {
    pub identity: IdentityKey,
    pub name: String,
    pub enrolled_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl RegisteredView {
    pub fn new(face: RegisteredFace, include_image: bool) -> Self {
        Self {
            image: include_image.then(|| BASE64.encode(&face.image)),
            identity: face.identity,
            name: face.name,
            enrolled_at: face.enrolled_at,
        }
    }
}

// --- Tool parameter types ---

#[derive(Debug, Deserialize, JsonSchema)]
struct RecognizeRequest {
    /// Captured image, base64 (a data URL prefix is accepted)
    image: String,
    /// Attendance day as YYYY-MM-DD; defaults to today
    day: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EnrollRequest {
    /// Registration number of a known student
    identity: String,
    /// Captured image containing exactly one face, base64 (a data URL prefix is accepted)
    image: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct IdentityRequest {
    /// Registration number
    identity: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RegisteredRequest {
    /// Include each captured image as base64
    include_images: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DayRequest {
    /// Attendance day as YYYY-MM-DD; defaults to today
    day: Option<String>,
}

#[tool_router]
impl RollServer {
    #[tool(
        description = "Recognize the single face in a captured image and mark that student present for the day. Returns status marked, already_marked, no_match (with reason empty, above_threshold or ambiguous) or rejected (no face or several faces)."
    )]
    async fn roll_recognize(
        &self,
        Parameters(req): Parameters<RecognizeRequest>,
    ) -> Result<CallToolResult, McpError> {
        let day = self.day(req.day.as_deref())?;
        let image = decode_image_text(&req.image).map_err(core_error)?;
        let recognition = self.call(move |roll| roll.submit_probe(&image, &day)).await?;
        json_result(&recognition)
    }

    #[tool(
        description = "Enroll or replace the face of a known student from a captured image containing exactly one face."
    )]
    async fn roll_enroll(
        &self,
        Parameters(req): Parameters<EnrollRequest>,
    ) -> Result<CallToolResult, McpError> {
        let identity = parse_identity(&req.identity)?;
        let image = decode_image_text(&req.image).map_err(core_error)?;
        let outcome = self
            .call(move |roll| roll.enroll(&identity, &image))
            .await?;
        json_result(&outcome)
    }

    #[tool(description = "Remove a student's enrolled face. Removing an unknown face is not an error.")]
    async fn roll_unenroll(
        &self,
        Parameters(req): Parameters<IdentityRequest>,
    ) -> Result<CallToolResult, McpError> {
        let identity = parse_identity(&req.identity)?;
        let key = identity.clone();
        let removed = self.call(move |roll| roll.unenroll(&key)).await?;
        json_result(&serde_json::json!({
            "identity": identity,
            "removed": removed,
        }))
    }

    #[tool(description = "Remove every enrolled face. Returns how many were removed.")]
    async fn roll_clear_faces(&self) -> Result<CallToolResult, McpError> {
        let removed = self.call(|roll| roll.clear_faces()).await?;
        json_result(&serde_json::json!({ "removed": removed }))
    }

    #[tool(description = "List enrolled faces sorted by registration number.")]
    async fn roll_registered(
        &self,
        Parameters(req): Parameters<RegisteredRequest>,
    ) -> Result<CallToolResult, McpError> {
        let include_images = req.include_images.unwrap_or(false);
        let faces = self.call(|roll| roll.registered()).await?;
        let views: Vec<RegisteredView> = faces
            .into_iter()
            .map(|f| RegisteredView::new(f, include_images))
            .collect();
        json_result(&views)
    }

    #[tool(description = "List known students sorted by registration number.")]
    async fn roll_students(&self) -> Result<CallToolResult, McpError> {
        let students = self.call(|roll| roll.students()).await?;
        json_result(&students)
    }

    #[tool(description = "Attendance records for a day, keyed by registration number.")]
    async fn roll_attendance(
        &self,
        Parameters(req): Parameters<DayRequest>,
    ) -> Result<CallToolResult, McpError> {
        let day = self.day(req.day.as_deref())?;
        let key = day.clone();
        let records = self.call(move |roll| roll.get_day(&key)).await?;
        json_result(&serde_json::json!({
            "day": day,
            "records": records,
        }))
    }

    #[tool(description = "Delete every attendance record of a day. Returns how many were removed.")]
    async fn roll_reset_day(
        &self,
        Parameters(req): Parameters<DayRequest>,
    ) -> Result<CallToolResult, McpError> {
        let day = self.day(req.day.as_deref())?;
        let key = day.clone();
        let removed = self.call(move |roll| roll.reset_day(&key)).await?;
        json_result(&serde_json::json!({
            "day": day,
            "removed": removed,
        }))
    }

    #[tool(description = "Days that currently have attendance records, ascending.")]
    async fn roll_days(&self) -> Result<CallToolResult, McpError> {
        let days = self.call(|roll| roll.days()).await?;
        json_result(&days)
    }
}

#[tool_handler]
impl ServerHandler for RollServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Face-recognition attendance.\n\n\
                 - Enroll each student once with roll_enroll (image with exactly one face). \
                   Enrolling again replaces the stored face.\n\
                 - Submit captured frames to roll_recognize. A student is marked present at most \
                   once per day; repeat captures return already_marked.\n\
                 - no_match and rejected are normal results, not failures. Ask for a new capture.\n\
                 - Images are base64; data URLs are accepted. Days are YYYY-MM-DD."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
