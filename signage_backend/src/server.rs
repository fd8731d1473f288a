use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tokio_util::io::ReaderStream;

use crate::config::SignageConfig;
use crate::inference::{GenerationRequest, GenerationResponse, GenerationService};
use crate::metrics::{self, GenerationMetrics};
use crate::pipeline::ComfyPipelineLoader;
use crate::safety::moderate_prompt;

const GALLERY_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

pub struct ServerState {
    pub service: Arc<GenerationService>,
    pub metrics: Arc<GenerationMetrics>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    detail: String,
}

pub async fn serve_generation_api(config: SignageConfig) -> Result<()> {
    let bind_addr = config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid SIGNAGE_BIND (expected host:port)")?;

    let loader = ComfyPipelineLoader::from_config(&config.comfyui, &config.models)?;
    let service = GenerationService::new(
        Arc::new(loader),
        &config.output_dir,
        config.device.clone(),
    )?;
    tracing::info!("Writing generated images to {:?}", service.output_dir());

    let state = Arc::new(ServerState {
        service: Arc::new(service),
        metrics: Arc::new(GenerationMetrics::new()?),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind generation API to {}", bind_addr))?;
    tracing::info!("Signage generation API listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Generation API server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let outputs = ServeDir::new(state.service.output_dir());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_exposition))
        .route("/generate", post(generate_image))
        .route("/generate_bytes", post(generate_image_bytes))
        .route("/gallery", get(gallery))
        .nest_service("/outputs", outputs)
        .with_state(state)
        .layer(CorsLayer::very_permissive())
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn metrics_exposition(State(state): State<Arc<ServerState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, metrics::content_type())], body).into_response(),
        Err(error) => {
            tracing::error!("{:#}", error);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Generation failures come back as an opaque 500; the cause only goes to
/// the log.
async fn generate_image(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, Response> {
    check_moderation(&request)?;
    let model_key = request.model_key;
    state.metrics.record_request(model_key);

    let timer = state.metrics.start_timer(model_key);
    let result = state.service.generate(&request).await;
    timer.observe_duration();

    match result {
        Ok((_path, metadata)) => Ok(Json(GenerationResponse::from_metadata(metadata))),
        Err(error) => {
            state.metrics.record_failure(model_key);
            tracing::error!("Generation failed for {}: {:?}", model_key, error);
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// Same generation as `/generate`, answered with the PNG itself. Failures
/// carry the error and its full cause chain in the response body.
async fn generate_image_bytes(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<Response, Response> {
    check_moderation(&request)?;
    let model_key = request.model_key;
    state.metrics.record_request(model_key);

    let timer = state.metrics.start_timer(model_key);
    let result = state.service.generate(&request).await;
    timer.observe_duration();

    let (path, metadata) = result.map_err(|error| {
        state.metrics.record_failure(model_key);
        tracing::error!("Generation failed for {}: {:#}", model_key, error);
        error_detail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Generation error: {}\n{:?}", error, error),
        )
    })?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) => {
            state.metrics.record_failure(model_key);
            tracing::error!("Generated file {:?} unreadable: {}", path, error);
            return Err(error_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Generation error: failed to open {:?}: {}", path, error),
            ));
        }
    };
    let content_length = file.metadata().await.ok().map(|meta| meta.len());

    let mut response = (
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", metadata.filename),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response();
    if let Some(len) = content_length {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    Ok(response)
}

async fn gallery(State(state): State<Arc<ServerState>>) -> Result<Html<String>, Response> {
    let names = list_gallery_images(state.service.output_dir()).await.map_err(|error| {
        tracing::error!("{:#}", error);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;
    Ok(Html(render_gallery(&names)))
}

fn check_moderation(request: &GenerationRequest) -> Result<(), Response> {
    let verdict = moderate_prompt(&request.prompt, request.negative_prompt.as_deref());
    if verdict.allowed {
        Ok(())
    } else {
        Err(error_detail(StatusCode::BAD_REQUEST, verdict.message))
    }
}

fn error_detail(status: StatusCode, detail: String) -> Response {
    (status, Json(ErrorDetail { detail })).into_response()
}

/// Image files in the output directory, newest first
async fn list_gallery_images(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list {:?}", dir))?;

    let mut images: Vec<(SystemTime, String)> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !has_gallery_extension(&name) {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        images.push((modified, name));
    }

    images.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    Ok(images.into_iter().map(|(_, name)| name).collect())
}

fn has_gallery_extension(name: &str) -> bool {
    PathBuf::from(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| GALLERY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn render_gallery(names: &[String]) -> String {
    let body = if names.is_empty() {
        "<p>No images yet.</p>".to_string()
    } else {
        names
            .iter()
            .map(|name| {
                let name = html_escape(name);
                format!(
                    "<div style=\"display:inline-block;margin:8px;text-align:center\">\
                     <a href=\"/outputs/{name}\" target=\"_blank\">\
                     <img src=\"/outputs/{name}\" style=\"width:256px;height:256px;object-fit:cover;border-radius:8px\"/></a>\
                     <div style=\"font-family:monospace;font-size:12px\">{name}</div>\
                     </div>"
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "<html>\n  <head><title>Outputs</title></head>\n  \
         <body style=\"padding:16px;font-family:system-ui\">\n    \
         <h2>Generated Images</h2>\n    {}\n  </body>\n</html>\n",
        body
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Device;
    use crate::pipeline::testing::FakeLoader;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    struct Harness {
        _dir: tempfile::TempDir,
        loader: Arc<FakeLoader>,
        state: Arc<ServerState>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(FakeLoader::new(Device::Cpu));
        let service = GenerationService::new(loader.clone(), dir.path(), None).unwrap();
        let state = Arc::new(ServerState {
            service: Arc::new(service),
            metrics: Arc::new(GenerationMetrics::new().unwrap()),
        });
        Harness {
            _dir: dir,
            loader,
            state,
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    fn small_request(prompt: &str) -> Value {
        json!({
            "prompt": prompt,
            "negative_prompt": "low quality",
            "model_key": "sdxl",
            "width": 40,
            "height": 24,
            "steps": 4,
            "seed": 5
        })
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let h = harness();
        let response = build_router(h.state).oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn generate_returns_metadata_and_serves_the_file() {
        let h = harness();
        let app = build_router(h.state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/generate", small_request("city street, fresh snowfall")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let filename = body["filename"].as_str().unwrap().to_string();
        assert!(filename.ends_with("_sdxl_40x24.png"));
        assert_eq!(body["url"], format!("/outputs/{}", filename));
        assert_eq!(body["model_key"], "sdxl");
        assert_eq!(body["device"], "cpu");
        assert_eq!(body["nsfw_blocked"], false);

        let served = app
            .oneshot(get(&format!("/outputs/{}", filename)))
            .await
            .unwrap();
        assert_eq!(served.status(), StatusCode::OK);
        let image = image::load_from_memory(&body_bytes(served).await).unwrap();
        assert_eq!((image.width(), image.height()), (40, 24));
    }

    #[tokio::test]
    async fn unknown_model_key_is_served_by_default_model() {
        let h = harness();
        let mut request = small_request("harbor at dusk");
        request["model_key"] = json!("flux");
        let response = build_router(h.state)
            .oneshot(post_json("/generate", request))
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["model_key"], "sd15");
    }

    #[tokio::test]
    async fn blocked_prompt_is_rejected_before_generation() {
        let h = harness();
        let app = build_router(h.state.clone());

        for uri in ["/generate", "/generate_bytes"] {
            let response = app
                .clone()
                .oneshot(post_json(uri, small_request("a GORE scene")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
            assert_eq!(body["detail"], "Prompt blocked by safety policy.");
        }

        assert_eq!(h.loader.loads.load(Ordering::SeqCst), 0);
        let metrics = h.state.metrics.render().unwrap();
        assert!(!metrics.contains("gen_requests_total{"));
    }

    #[tokio::test]
    async fn generate_bytes_streams_the_saved_png() {
        let h = harness();
        let response = build_router(h.state)
            .oneshot(post_json("/generate_bytes", small_request("quiet lane")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("_sdxl_40x24.png"));
        let declared: usize = response.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();

        let body = body_bytes(response).await;
        assert_eq!(body.len(), declared);
        let image = image::load_from_memory(&body).unwrap();
        assert_eq!((image.width(), image.height()), (40, 24));
    }

    #[tokio::test]
    async fn failures_differ_in_shape_between_endpoints() {
        let h = harness();
        h.loader.fail.store(true, Ordering::SeqCst);
        let app = build_router(h.state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/generate", small_request("quiet lane")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_bytes(response).await;
        assert!(!String::from_utf8_lossy(&body).contains("simulated"));

        let response = app
            .oneshot(post_json("/generate_bytes", small_request("quiet lane")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Generation error: "));
        assert!(detail.contains("simulated pipeline failure"));

        let metrics = h.state.metrics.render().unwrap();
        assert!(metrics.contains("gen_failures_total{model=\"sdxl\"} 2"));
        assert!(metrics.contains("gen_requests_total{model=\"sdxl\"} 2"));
        assert!(metrics.contains("gen_latency_seconds_count{model=\"sdxl\"} 2"));
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_text_format() {
        let h = harness();
        let app = build_router(h.state);
        app.clone()
            .oneshot(post_json("/generate", small_request("quiet lane")))
            .await
            .unwrap();

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("gen_requests_total{model=\"sdxl\"} 1"));
        assert!(text.contains("queue_depth 0"));
    }

    #[tokio::test]
    async fn gallery_lists_images_newest_first() {
        let h = harness();
        let dir = h.state.service.output_dir().to_path_buf();
        std::fs::write(dir.join("older.png"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();
        let older = std::fs::File::options()
            .write(true)
            .open(dir.join("older.png"))
            .unwrap();
        older
            .set_modified(SystemTime::now() - std::time::Duration::from_secs(3600))
            .unwrap();
        std::fs::write(dir.join("newer.JPG"), b"x").unwrap();

        let response = build_router(h.state).oneshot(get("/gallery")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = String::from_utf8(body_bytes(response).await).unwrap();
        let newer_at = html.find("/outputs/newer.JPG").unwrap();
        let older_at = html.find("/outputs/older.png").unwrap();
        assert!(newer_at < older_at);
        assert!(!html.contains("notes.txt"));
    }

    #[test]
    fn empty_gallery_says_so() {
        assert!(render_gallery(&[]).contains("<p>No images yet.</p>"));
    }

    #[test]
    fn gallery_escapes_file_names() {
        let html = render_gallery(&["<b>\"x\".png".to_string()]);
        assert!(html.contains("&lt;b&gt;&quot;x&quot;.png"));
        assert!(!html.contains("<b>"));
    }
}
