use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use coersion_common::frame::{parse_offset, FrameRequest, RequestError};
use coersion_core::{FrameJob, FramePipeline, MatchError, MatchResult, OutputFormat, TaskError};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pipeline: FramePipeline,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(pipeline: FramePipeline, request_timeout: Duration) -> Self {
        Self {
            pipeline,
            request_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StillQuery {
    s: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameQuery {
    s: Option<String>,
    w: Option<String>,
    h: Option<String>,
    o: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatchQuery {
    s0: Option<String>,
    s1: Option<String>,
    s2: Option<String>,
    w: Option<String>,
    h: Option<String>,
    o: Option<String>,
    v: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("error parsing {name} param: {reason}")]
    BadParam { name: &'static str, reason: String },
    #[error("invalid frame request: {0}")]
    Request(#[from] RequestError),
    #[error("task output failed: {0}")]
    Task(#[from] TaskError),
    #[error("{0}")]
    Match(#[from] MatchError),
    #[error("no pixels compared")]
    EmptyComparison,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadParam { .. } | ApiError::Request(_) => StatusCode::BAD_REQUEST,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Task(_) | ApiError::Match(_) | ApiError::EmptyComparison => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(error = %self, "rejected request");
        }
        (status, Json(self.to_string())).into_response()
    }
}

// ---------------------------------------------------------------------------
// Query helpers
// ---------------------------------------------------------------------------

fn required<'a>(name: &'static str, raw: &'a Option<String>) -> Result<&'a str, ApiError> {
    match raw.as_deref() {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ApiError::BadParam {
            name,
            reason: "missing".into(),
        }),
    }
}

fn parse_u16(name: &'static str, raw: &Option<String>) -> Result<u16, ApiError> {
    required(name, raw)?
        .parse::<u16>()
        .map_err(|e| ApiError::BadParam {
            name,
            reason: e.to_string(),
        })
}

/// Offset is optional: anything unparsable means "from the start".
fn offset(raw: &Option<String>) -> Duration {
    match raw.as_deref().map(parse_offset) {
        Some(Some(offset)) => offset,
        Some(None) => {
            debug!(raw = raw.as_deref(), "ignoring unparsable offset");
            Duration::ZERO
        }
        None => Duration::ZERO,
    }
}

struct Geometry {
    width: u16,
    height: u16,
    offset: Duration,
}

impl Geometry {
    fn parse(w: &Option<String>, h: &Option<String>, o: &Option<String>) -> Result<Self, ApiError> {
        Ok(Self {
            height: parse_u16("height", h)?,
            width: parse_u16("width", w)?,
            offset: offset(o),
        })
    }

    fn request(&self, source: &str) -> Result<FrameRequest, ApiError> {
        Ok(FrameRequest::new(source, self.width, self.height, self.offset)?)
    }
}

impl FrameQuery {
    fn request(&self) -> Result<FrameRequest, ApiError> {
        let source = required("source", &self.s)?;
        Geometry::parse(&self.w, &self.h, &self.o)?.request(source)
    }
}

/// Run `work` under the configured per-request deadline. Producers still
/// running when it expires are detached and killed after their grace period.
async fn bounded<T, E>(
    state: &AppState,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, ApiError>
where
    ApiError: From<E>,
{
    match tokio::time::timeout(state.request_timeout, work).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(timeout_secs = state.request_timeout.as_secs(), "request deadline expired");
            Err(ApiError::Timeout(state.request_timeout))
        }
    }
}

fn percent(result: &MatchResult) -> Result<String, ApiError> {
    let pct = result.match_percent().ok_or(ApiError::EmptyComparison)?;
    Ok(format!("{}% match", format_float(pct)))
}

/// Shortest decimal form of `value`, switching to `1e-05` style exponents
/// below 1e-4 as Go's `%v` does. Percentages never reach the upper switch.
fn format_float(value: f64) -> String {
    if value != 0.0 && value.abs() < 1e-4 {
        let sci = format!("{value:e}");
        if let Some((mantissa, exp)) = sci.split_once('e') {
            if let Ok(exp) = exp.parse::<i32>() {
                let sign = if exp < 0 { '-' } else { '+' };
                return format!("{mantissa}e{sign}{:02}", exp.abs());
            }
        }
        return sci;
    }
    format!("{value}")
}

fn text(body: String) -> Response {
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

fn image_response(content_type: &'static str, bytes: Vec<u8>) -> Response {
    ([(CONTENT_TYPE, content_type)], bytes).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /
async fn hello() -> impl IntoResponse {
    ([(CACHE_CONTROL, "max-age=3600")], Json("hello world"))
}

/// GET /still?s=: first key frame of the source as JPEG
async fn still(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StillQuery>,
) -> Result<Response, ApiError> {
    let source = required("source", &q.s)?.to_string();
    let job = FrameJob::Still { source };
    let bytes = bounded(&state, state.pipeline.extract(job)).await?;
    Ok(image_response("image/jpeg", bytes))
}

/// GET /scale?s=&w=&h=&o=: scaled frame as PNG
async fn scale(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FrameQuery>,
) -> Result<Response, ApiError> {
    let job = FrameJob::Scaled {
        request: q.request()?,
        format: OutputFormat::Png,
    };
    let bytes = bounded(&state, state.pipeline.extract(job)).await?;
    Ok(image_response("image/png", bytes))
}

/// GET /bitmap?s=&w=&h=&o=: scaled frame as BMP
async fn bitmap(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FrameQuery>,
) -> Result<Response, ApiError> {
    let job = FrameJob::bitmap(q.request()?);
    let bytes = bounded(&state, state.pipeline.extract(job)).await?;
    Ok(image_response("image/bmp", bytes))
}

/// GET /pixels?s=&w=&h=&o=: text dump of the decoded frame
async fn pixels(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FrameQuery>,
) -> Result<Response, ApiError> {
    let request = q.request()?;
    let grid = bounded(&state, state.pipeline.pixels(&request)).await?;
    Ok(text(grid.to_string()))
}

/// GET /match2?s0=&s1=&w=&h=&o=&v=
async fn match_two(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MatchQuery>,
) -> Result<Response, ApiError> {
    let s0 = required("s0", &q.s0)?;
    let s1 = required("s1", &q.s1)?;
    let geometry = Geometry::parse(&q.w, &q.h, &q.o)?;
    let tolerance = parse_u16("variation", &q.v)?;
    let (r0, r1) = (geometry.request(s0)?, geometry.request(s1)?);

    let result = bounded(&state, state.pipeline.match_two(&r0, &r1, tolerance)).await?;
    let body = percent(&result)?;
    info!(s0, s1, tolerance, pass = result.pass, fail = result.fail, "two-way match");
    Ok(text(body))
}

/// GET /match3?s0=&s1=&s2=&w=&h=&o=&v=
async fn match_three(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MatchQuery>,
) -> Result<Response, ApiError> {
    let sources = [
        required("s0", &q.s0)?,
        required("s1", &q.s1)?,
        required("s2", &q.s2)?,
    ];
    let geometry = Geometry::parse(&q.w, &q.h, &q.o)?;
    let tolerance = parse_u16("variation", &q.v)?;
    let requests = [
        geometry.request(sources[0])?,
        geometry.request(sources[1])?,
        geometry.request(sources[2])?,
    ];

    let set = bounded(
        &state,
        state
            .pipeline
            .match_three(&requests[0], &requests[1], &requests[2], tolerance),
    )
    .await?;

    let mut lines = Vec::with_capacity(3);
    for (pair, result) in set.pairs() {
        lines.push(format!(
            "{} & {}: {}",
            sources[pair.0],
            sources[pair.1],
            percent(&result)?
        ));
    }
    info!(s0 = sources[0], s1 = sources[1], s2 = sources[2], tolerance, "three-way match");
    Ok(text(lines.join("\n")))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/", get(hello))
        .route("/still", get(still))
        .route("/scale", get(scale))
        .route("/bitmap", get(bitmap))
        .route("/pixels", get(pixels))
        .route("/match2", get(match_two))
        .route("/match3", get(match_three))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_params_are_range_checked() {
        assert_eq!(parse_u16("width", &Some("640".into())).unwrap(), 640);
        let err = parse_u16("width", &Some("70000".into())).unwrap_err();
        assert!(err.to_string().starts_with("error parsing width param:"));
        let err = parse_u16("variation", &None).unwrap_err();
        assert_eq!(err.to_string(), "error parsing variation param: missing");
    }

    #[test]
    fn offset_falls_back_to_zero() {
        assert_eq!(offset(&Some("12".into())), Duration::from_secs(12));
        assert_eq!(offset(&Some("soon".into())), Duration::ZERO);
        assert_eq!(offset(&None), Duration::ZERO);
    }

    #[test]
    fn percent_formats_like_a_plain_float() {
        assert_eq!(percent(&MatchResult { pass: 4, fail: 0 }).unwrap(), "100% match");
        assert_eq!(percent(&MatchResult { pass: 7, fail: 1 }).unwrap(), "87.5% match");
        assert!(matches!(
            percent(&MatchResult::default()),
            Err(ApiError::EmptyComparison)
        ));
    }

    #[test]
    fn tiny_percentages_use_exponents() {
        let one_in_a_hundred_million = MatchResult {
            pass: 1,
            fail: 99_999_999,
        };
        assert_eq!(percent(&one_in_a_hundred_million).unwrap(), "1e-06% match");
        assert_eq!(format_float(0.000125), "0.000125");
        assert_eq!(format_float(0.0000125), "1.25e-05");
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(33.25), "33.25");
    }

    #[test]
    fn zero_dimensions_are_bad_requests() {
        let q = FrameQuery {
            s: Some("clip.mp4".into()),
            w: Some("0".into()),
            h: Some("10".into()),
            o: None,
        };
        let err = q.request().unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
