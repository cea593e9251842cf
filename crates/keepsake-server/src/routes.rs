use std::path::PathBuf;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::ImageFormat;
use serde_json::json;
use tower_http::services::ServeDir;
use tracing::error;

use keepsake_contracts::events::TaskEvent;
use keepsake_contracts::tasks::TaskUpdate;
use keepsake_engine::store::sniff_format;

use crate::state::AppState;
use crate::ws;

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

pub fn router(state: AppState, public_dir: PathBuf) -> Router {
    let generated_dir = public_dir.join("generated");
    Router::new()
        .route("/upload", post(handle_upload))
        .route("/tasks/{id}", get(handle_task))
        .route("/ws", get(ws::handle_upgrade))
        .nest_service("/generated", ServeDir::new(generated_dir))
        .fallback_service(ServeDir::new(public_dir))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

struct Submission {
    bytes: Vec<u8>,
    format: ImageFormat,
    style: String,
}

/// Accepts the upload, creates the task, and answers immediately with the
/// task id while the pipeline continues on a blocking worker. Input errors
/// are the only ones reported synchronously; no task exists for them.
async fn handle_upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let submission = match read_submission(&mut multipart).await {
        Ok(submission) => submission,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response();
        }
    };

    let task = state.registry.create(&submission.style);
    let upload = match state
        .uploads
        .save(&task.id, &submission.bytes, submission.format)
    {
        Ok(upload) => upload,
        Err(err) => {
            let message = format!("{err:#}");
            error!(task_id = %task.id, error = %message, "failed to store upload");
            if let Some(task) = state
                .registry
                .update(&task.id, TaskUpdate::failed(message.clone()))
            {
                state.notifier.publish(TaskEvent::update_from(&task));
            }
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response();
        }
    };

    let pipeline = state.pipeline.clone();
    let task_id = task.id.clone();
    tokio::task::spawn_blocking(move || pipeline.run(&task_id, upload));

    (StatusCode::ACCEPTED, Json(json!({ "taskId": task.id }))).into_response()
}

async fn handle_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(task) => Json(task).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "task not found" })),
        )
            .into_response(),
    }
}

async fn read_submission(multipart: &mut Multipart) -> Result<Submission, String> {
    let mut photo: Option<Vec<u8>> = None;
    let mut style = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(err.to_string()),
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "photo" => match field.bytes().await {
                Ok(bytes) => photo = Some(bytes.to_vec()),
                Err(err) => return Err(err.to_string()),
            },
            "style" => style = field.text().await.unwrap_or_default(),
            _ => {}
        }
    }

    let Some(bytes) = photo.filter(|bytes| !bytes.is_empty()) else {
        return Err("no photo was uploaded".to_string());
    };
    let format = sniff_format(&bytes).map_err(|err| err.to_string())?;
    Ok(Submission {
        bytes,
        format,
        style,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    use keepsake_contracts::events::Notifier;
    use keepsake_contracts::tasks::{TaskRegistry, TaskResult, TaskStatus};
    use keepsake_engine::generate::DryrunGenerator;
    use keepsake_engine::pipeline::Pipeline;
    use keepsake_engine::store::{ArtifactStore, UploadStore};
    use keepsake_engine::vision::SceneAnalyzer;

    use super::*;

    struct StubAnalyzer;

    impl SceneAnalyzer for StubAnalyzer {
        fn describe(&self, _image: &[u8], _mime: &str) -> Result<String> {
            Ok("a test scene".to_string())
        }

        fn caption_visible(&self, _image: &[u8], _mime: &str, _phrase: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn test_router() -> (Router, AppState, tempfile::TempDir) {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(TaskRegistry::new());
        let notifier = Notifier::new(64);
        let artifacts = ArtifactStore::new(temp.path().join("public")).expect("artifact store");
        let uploads =
            Arc::new(UploadStore::new(temp.path().join("uploads")).expect("upload store"));
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(StubAnalyzer),
            Arc::new(DryrunGenerator::new()),
            registry.clone(),
            notifier.clone(),
            artifacts,
            "Happy Birthday",
        ));
        let state = AppState {
            registry,
            notifier,
            pipeline,
            uploads,
        };
        let router = router(state.clone(), temp.path().join("public"));
        (router, state, temp)
    }

    const BOUNDARY: &str = "keepsake-test-boundary";

    fn multipart_request(parts: &[(&str, Option<&str>, Vec<u8>)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, bytes) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; \
filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    fn png_photo() -> Vec<u8> {
        let canvas = image::RgbImage::from_pixel(200, 150, image::Rgb([120, 140, 160]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .expect("fixture png");
        bytes
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn upload_without_photo_is_rejected() {
        let (router, state, _temp) = test_router();
        let response = router
            .oneshot(multipart_request(&[("style", None, b"normal".to_vec())]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert!(body["error"].as_str().is_some_and(|s| !s.is_empty()));
        assert!(body.get("taskId").is_none());
        assert!(
            state.registry.is_empty(),
            "a task was created for a rejected upload"
        );
    }

    #[tokio::test]
    async fn upload_with_unsupported_type_is_rejected() {
        let (router, state, _temp) = test_router();
        let response = router
            .oneshot(multipart_request(&[(
                "photo",
                Some("notes.txt"),
                b"not an image at all".to_vec(),
            )]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .is_some_and(|s| s.contains("unsupported image type")));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn upload_valid_png_runs_card_pipeline_to_completion() {
        let (router, state, temp) = test_router();
        let response = router
            .oneshot(multipart_request(&[
                ("photo", Some("photo.png"), png_photo()),
                ("style", None, b"normal".to_vec()),
            ]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = body_json(response).await;
        let task_id = body["taskId"].as_str().expect("taskId").to_string();

        // The pipeline runs on a blocking worker; poll until terminal.
        let mut task = state.registry.get(&task_id).expect("task exists");
        for _ in 0..400 {
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            task = state.registry.get(&task_id).expect("task exists");
        }

        assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);
        match task.result.expect("result") {
            TaskResult::Card { card_url } => {
                assert_eq!(card_url, format!("/generated/{task_id}-card.png"));
                assert!(temp
                    .path()
                    .join("public/generated")
                    .join(format!("{task_id}-card.png"))
                    .exists());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_upload_store_publishes_terminal_update() {
        let (router, state, temp) = test_router();
        let mut events = state.notifier.subscribe();
        // Removing the upload dir makes the store's write fail.
        std::fs::remove_dir_all(temp.path().join("uploads")).expect("remove uploads dir");

        let response = router
            .oneshot(multipart_request(&[(
                "photo",
                Some("photo.png"),
                png_photo(),
            )]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        match events.try_recv() {
            Ok(TaskEvent::TaskUpdate { task_id, status, error, .. }) => {
                assert_eq!(status, TaskStatus::Error);
                assert!(error.is_some());
                let task = state.registry.get(&task_id).expect("task exists");
                assert_eq!(task.status, TaskStatus::Error);
            }
            other => panic!("expected a terminal task update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_task_returns_not_found() {
        let (router, _state, _temp) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/tasks/does-not-exist")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["error"], "task not found");
    }
}
