use std::path::Path as FsPath;
use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::{ImageBuffer, Rgb};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::service::{ReviewService, ServiceError};
use crate::session::SessionOptions;
use crate::store::StoreError;

const CACHE_ONE_HOUR: &str = "public, max-age=3600";
const NO_CACHE: &str = "no-cache";

type AppState = Arc<ReviewService>;

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/video/abort-all", post(abort_all))
        .route("/video/{key}/info", get(info))
        .route("/video/{key}/playlist.m3u8", get(playlist))
        .route("/video/{key}/thumbnails", get(thumbnails))
        .route("/video/{key}/waveform", get(waveform))
        .route("/video/{key}/ebu-r128", get(ebu_r128))
        .route("/video/{key}/progress", get(progress))
        .route("/video/{key}/stream", get(stream_fragment))
        .route("/video/{key}/abort", post(abort_one))
        .route("/video/{key}/{artifact}", get(artifact))
        .with_state(service)
}

pub struct ApiError(ServiceError);

impl<E> From<E> for ApiError
where
    E: Into<ServiceError>,
{
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::NotFound(_) | ServiceError::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::Store(StoreError::Credentials(_)) => StatusCode::UNAUTHORIZED,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn info(
    State(service): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    service.load(&key).await?;
    let record = service.probe(&key).await?;
    Ok(Json(record.as_ref().clone()).into_response())
}

#[derive(Debug, Deserialize)]
struct PlaylistQuery {
    #[serde(rename = "segmentDuration")]
    segment_duration: Option<u32>,
    goniometer: Option<String>,
    #[serde(rename = "ebuR128")]
    ebu_r128: Option<String>,
}

async fn playlist(
    State(service): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<PlaylistQuery>,
) -> Result<Response, ApiError> {
    let mut options = SessionOptions::new(
        query
            .segment_duration
            .unwrap_or(service.config().hls.segment_duration),
    );
    options.goniometer = flag_set(&query.goniometer);
    options.loudness_overlay = flag_set(&query.ebu_r128);
    let bytes = service.playlist(&key, options).await?;
    Response::builder()
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, NO_CACHE)
        .body(Body::from(bytes))
        .map_err(internal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactKind {
    Segment(u32),
    Thumb(u32),
}

fn parse_artifact(name: &str) -> Option<ArtifactKind> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix("segment") {
        ("segment", rest)
    } else if let Some(rest) = name.strip_prefix("thumb") {
        ("thumb", rest)
    } else {
        return None;
    };
    let digits = match kind {
        "segment" => rest.strip_suffix(".ts")?,
        _ => rest.strip_suffix(".jpg")?,
    };
    if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse().ok()?;
    Some(match kind {
        "segment" => ArtifactKind::Segment(index),
        _ => ArtifactKind::Thumb(index),
    })
}

async fn artifact(
    State(service): State<AppState>,
    Path((key, artifact)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    match parse_artifact(&artifact) {
        Some(ArtifactKind::Segment(index)) => {
            let path = service.segment(&key, index)?;
            stream_file(&path, "video/mp2t", CACHE_ONE_HOUR, true).await
        }
        Some(ArtifactKind::Thumb(index)) => match service.thumbnail(&key, index) {
            Ok(path) => stream_file(&path, "image/jpeg", CACHE_ONE_HOUR, false).await,
            Err(ServiceError::NotFound(_)) => {
                // Unknown session or thumbnail not produced yet: always a
                // placeholder, uncached so the client retries once the
                // transcoder catches up.
                Response::builder()
                    .header(header::CONTENT_TYPE, "image/jpeg")
                    .header(header::CACHE_CONTROL, NO_CACHE)
                    .body(Body::from(placeholder_jpeg().to_vec()))
                    .map_err(internal)
            }
            Err(err) => Err(err.into()),
        },
        None => Err(ApiError(ServiceError::BadRequest(format!(
            "unrecognized artifact name: {artifact}"
        )))),
    }
}

async fn thumbnails(
    State(service): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let listing = service.thumbnail_listing(&key)?;
    Ok(Json(listing).into_response())
}

#[derive(Debug, Deserialize)]
struct WaveformQuery {
    samples: Option<usize>,
}

async fn waveform(
    State(service): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<WaveformQuery>,
) -> Result<Response, ApiError> {
    let payload = service
        .waveform(&key, query.samples.unwrap_or(1000))
        .await?;
    Ok(Json(payload.as_ref().clone()).into_response())
}

#[derive(Debug, Deserialize)]
struct LoudnessQuery {
    #[serde(rename = "startTime")]
    start_time: Option<f64>,
    duration: Option<f64>,
}

async fn ebu_r128(
    State(service): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<LoudnessQuery>,
) -> Result<Response, ApiError> {
    let window = service
        .loudness(
            &key,
            query.start_time.unwrap_or(0.0),
            query.duration.unwrap_or(10.0),
        )
        .await?;
    Ok(Json(window.as_ref().clone()).into_response())
}

async fn progress(
    State(service): State<AppState>,
    Path(key): Path<String>,
) -> Json<crate::service::ProgressReport> {
    Json(service.progress(&key))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    t: Option<f64>,
    d: Option<f64>,
}

async fn stream_fragment(
    State(service): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let start = query.t.unwrap_or(0.0).max(0.0);
    let duration = query
        .d
        .unwrap_or(service.config().hls.segment_duration as f64)
        .clamp(0.1, 600.0);
    let bytes = service.stream_fragment(&key, start, duration).await?;
    Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CACHE_CONTROL, NO_CACHE)
        .body(Body::from(bytes))
        .map_err(internal)
}

async fn abort_all(State(service): State<AppState>) -> Json<serde_json::Value> {
    let aborted = service.abort_all().await;
    Json(json!({ "abortedCount": aborted }))
}

async fn abort_one(
    State(service): State<AppState>,
    Path(key): Path<String>,
) -> Json<serde_json::Value> {
    let aborted = service.abort(&key).await;
    Json(json!({ "aborted": aborted }))
}

/// Stream a file off disk. Dropping the response mid-transfer (client
/// disconnect) drops the reader and cancels the I/O.
async fn stream_file(
    path: &FsPath,
    content_type: &str,
    cache_control: &str,
    cors: bool,
) -> Result<Response, ApiError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError(ServiceError::NotFound(
                path.to_string_lossy().to_string(),
            )))
        }
        Err(err) => {
            return Err(ApiError(ServiceError::Internal(format!(
                "failed to open artifact {}: {err}",
                path.display()
            ))))
        }
    };
    let length = file.metadata().await.ok().map(|metadata| metadata.len());
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control);
    if let Some(length) = length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    if cors {
        builder = builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
    }
    builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(internal)
}

fn internal(err: axum::http::Error) -> ApiError {
    ApiError(ServiceError::Internal(format!(
        "failed to build response: {err}"
    )))
}

fn flag_set(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("true") | Some("1"))
}

/// Gradient JPEG served when a thumbnail has not landed yet.
fn placeholder_jpeg() -> &'static [u8] {
    static JPEG: OnceLock<Vec<u8>> = OnceLock::new();
    JPEG.get_or_init(|| {
        let mut buffer = ImageBuffer::<Rgb<u8>, Vec<u8>>::new(320, 180);
        for (x, y, pixel) in buffer.enumerate_pixels_mut() {
            let fx = x as f32 / 320.0;
            let fy = y as f32 / 180.0;
            *pixel = Rgb([
                (20.0 + 80.0 * fx) as u8,
                (20.0 + 60.0 * (1.0 - fx)) as u8,
                (32.0 + 50.0 * fy) as u8,
            ]);
        }
        let mut out = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 70);
        if let Err(err) = image::DynamicImage::ImageRgb8(buffer).write_with_encoder(encoder) {
            warn!(error = %err, "failed to encode placeholder thumbnail");
        }
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_parse_strictly() {
        assert_eq!(parse_artifact("segment000.ts"), Some(ArtifactKind::Segment(0)));
        assert_eq!(parse_artifact("segment042.ts"), Some(ArtifactKind::Segment(42)));
        assert_eq!(parse_artifact("thumb007.jpg"), Some(ArtifactKind::Thumb(7)));
        assert_eq!(parse_artifact("segment42.ts"), None);
        assert_eq!(parse_artifact("segment0000.ts"), None);
        assert_eq!(parse_artifact("segmentabc.ts"), None);
        assert_eq!(parse_artifact("segment000.jpg"), None);
        assert_eq!(parse_artifact("thumb000.ts"), None);
        assert_eq!(parse_artifact("playlist.m3u8"), None);
    }

    #[test]
    fn flags_accept_true_and_one() {
        assert!(flag_set(&Some("true".into())));
        assert!(flag_set(&Some("1".into())));
        assert!(!flag_set(&Some("yes".into())));
        assert!(!flag_set(&None));
    }

    #[test]
    fn placeholder_is_a_jpeg() {
        let bytes = placeholder_jpeg();
        assert!(bytes.len() > 2);
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
    }
}
