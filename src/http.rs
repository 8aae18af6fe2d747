//! The image question-answering endpoint.
//!
//! One route: `POST /` with `multipart/form-data` parts `image_file` and
//! `question_string`, authorized by `Authorization: Bearer <token>`.
//! Responses are JSON:
//!
//! - `200 {"question": ..., "answer": ...}`
//! - `400 {"error": "Both 'image_file' and 'question_string' are required"}`
//! - `401 {"error": "Unauthorized"}`
//! - `500 {"error": <message>}` for any processing failure
//!
//! This is the only boundary in the toolkit that converts failures into
//! structured responses; everything else lets errors terminate the process.

use axum::Router;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use serde_json::json;

use crate::config::VqaParams;
use crate::worker::Worker;

/// One queued question: raw upload bytes plus the question text.
pub struct VqaJob {
    pub image: Vec<u8>,
    pub question: String,
}

/// Shared endpoint state.
#[derive(Clone)]
pub struct AppState {
    worker: Worker<VqaJob, String>,
    api_token: String,
}

impl AppState {
    pub fn new(worker: Worker<VqaJob, String>, api_token: impl Into<String>) -> Self {
        Self {
            worker,
            api_token: api_token.into(),
        }
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(answer_question))
        .with_state(state)
}

/// Decode an upload and answer the question about it. Used by the worker
/// closure the server installs; separated out so tests can stub it.
pub fn answer_upload(moondream: &mut crate::vqa::Moondream, job: VqaJob) -> crate::Result<String> {
    let image = crate::image::decode_image(&job.image)?;
    let params = VqaParams {
        question: job.question,
        ..VqaParams::default()
    };
    moondream.answer(&image, &params)
}

async fn answer_question(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    if !authorized(&headers, &state.api_token) {
        return reply(StatusCode::UNAUTHORIZED, json!({"error": "Unauthorized"}));
    }

    let (image, question) = match read_form(multipart).await {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    let answer = state
        .worker
        .submit(VqaJob {
            image,
            question: question.clone(),
        })
        .await;

    match answer {
        Ok(answer) => reply(
            StatusCode::OK,
            json!({"question": question, "answer": answer}),
        ),
        Err(error) => {
            tracing::error!(%error, "question processing failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": error.to_string()}),
            )
        }
    }
}

/// The token is the last whitespace-separated word of the header, so both
/// `Bearer <token>` and a bare token pass.
fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    value.split_whitespace().next_back() == Some(expected)
}

async fn read_form(mut multipart: Multipart) -> std::result::Result<(Vec<u8>, String), Response> {
    let mut image: Option<Vec<u8>> = None;
    let mut question: Option<String> = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => match field.name().map(str::to_owned).as_deref() {
                Some("image_file") => match field.bytes().await {
                    Ok(bytes) => image = Some(bytes.to_vec()),
                    Err(error) => {
                        return Err(reply(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            json!({"error": error.to_string()}),
                        ));
                    }
                },
                Some("question_string") => match field.text().await {
                    Ok(text) => question = Some(text),
                    Err(error) => {
                        return Err(reply(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            json!({"error": error.to_string()}),
                        ));
                    }
                },
                _ => {}
            },
            Ok(None) => break,
            Err(error) => {
                return Err(reply(
                    StatusCode::BAD_REQUEST,
                    json!({"error": error.to_string()}),
                ));
            }
        }
    }

    match (image, question) {
        (Some(image), Some(question)) => Ok((image, question)),
        _ => Err(reply(
            StatusCode::BAD_REQUEST,
            json!({"error": "Both 'image_file' and 'question_string' are required"}),
        )),
    }
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TOKEN: &str = "secret-token";
    const BOUNDARY: &str = "test-boundary-7MA4YWxkTrZu0gW";

    fn echo_router() -> Router {
        let worker = Worker::spawn(|job: VqaJob| {
            // Decode must succeed, mirroring the real handler's pipeline.
            crate::image::decode_image(&job.image)?;
            Ok(format!("answer to: {}", job.question))
        });
        router(AppState::new(worker, TOKEN))
    }

    fn failing_router() -> Router {
        let worker = Worker::spawn(|_job: VqaJob| -> crate::Result<String> {
            Err(crate::Error::Worker("model exploded".into()))
        });
        router(AppState::new(worker, TOKEN))
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn multipart_body(image: Option<&[u8]>, question: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(image) = image {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image_file\"; \
                     filename=\"input.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(image);
            body.extend_from_slice(b"\r\n");
        }
        if let Some(question) = question {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                     name=\"question_string\"\r\n\r\n{question}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn request(auth: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let body = multipart_body(Some(&png_bytes()), Some("What is this?"));
        let response = echo_router().oneshot(request(None, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await, json!({"error": "Unauthorized"}));
    }

    #[tokio::test]
    async fn test_wrong_token_is_unauthorized() {
        let body = multipart_body(Some(&png_bytes()), Some("What is this?"));
        let response = echo_router()
            .oneshot(request(Some("Bearer wrong"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_field_is_bad_request() {
        for (image, question) in [
            (None, Some("What is this?")),
            (Some(png_bytes()), None),
            (None, None),
        ] {
            let body = multipart_body(image.as_deref(), question);
            let response = echo_router()
                .oneshot(request(Some(&format!("Bearer {TOKEN}")), body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                json_body(response).await,
                json!({"error": "Both 'image_file' and 'question_string' are required"})
            );
        }
    }

    #[tokio::test]
    async fn test_well_formed_request_echoes_question() {
        let body = multipart_body(Some(&png_bytes()), Some("Does it contain a cat?"));
        let response = echo_router()
            .oneshot(request(Some(&format!("Bearer {TOKEN}")), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["question"], "Does it contain a cat?");
        assert_eq!(json["answer"], "answer to: Does it contain a cat?");
    }

    #[tokio::test]
    async fn test_bare_token_passes() {
        let body = multipart_body(Some(&png_bytes()), Some("q"));
        let response = echo_router()
            .oneshot(request(Some(TOKEN), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_processing_failure_is_internal_error() {
        let body = multipart_body(Some(&png_bytes()), Some("q"));
        let response = failing_router()
            .oneshot(request(Some(&format!("Bearer {TOKEN}")), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert!(
            json["error"].as_str().unwrap().contains("model exploded"),
            "error body should carry the failure text, got {json}"
        );
    }

    #[tokio::test]
    async fn test_undecodable_image_is_internal_error() {
        let body = multipart_body(Some(b"not an image"), Some("q"));
        let response = echo_router()
            .oneshot(request(Some(&format!("Bearer {TOKEN}")), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
