mod common;

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{frame, harness, Harness, ScriptedRuntime};
use config_loader::UserEntry;
use scriptbox_runtime::auth::{hash_password, AuthState};
use scriptbox_runtime::server::{create_app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

const BOUNDARY: &str = "scriptbox-test-boundary";
// Lowest cost bcrypt accepts; keeps login fast.
const HASH_COST: u32 = 4;

fn users() -> Vec<UserEntry> {
    vec![
        UserEntry {
            id: 1,
            username: "alice".to_string(),
            password_hash: hash_password("alice-pw", HASH_COST).unwrap(),
        },
        UserEntry {
            id: 2,
            username: "bob".to_string(),
            password_hash: hash_password("bob-pw", HASH_COST).unwrap(),
        },
    ]
}

fn setup(runtime: ScriptedRuntime) -> (Router, Harness) {
    let h = harness(runtime);
    let state = AppState {
        scripts: h.scripts.clone(),
        executions: h.service.clone(),
        auth: AuthState::new(users()),
    };
    (create_app(state), h)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "username": username, "password": password }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cookie.contains("HttpOnly"));
    cookie.split(';').next().unwrap().to_string()
}

fn authed(method: Method, uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}

fn multipart(fields: &[(&str, &str)], file: Option<&str>) -> Body {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            BOUNDARY, name, value
        ));
    }
    if let Some(contents) = file {
        body.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"main\"\r\nContent-Type: application/octet-stream\r\n\r\n{}\r\n",
            BOUNDARY, contents
        ));
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));
    Body::from(body)
}

fn upload_request(cookie: &str, language: &str, file: Option<&str>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/scripts/upload")
        .header(header::COOKIE, cookie)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(multipart(
            &[
                ("name", "greeter"),
                ("description", "says hello"),
                ("language", language),
            ],
            file,
        ))
        .unwrap()
}

async fn upload(app: &Router, cookie: &str) -> String {
    let (status, body) = send(app, upload_request(cookie, "python", Some("print('hello')\n"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let body = json_body(&body);
    assert_eq!(body["message"], "Script uploaded successfully");
    body["id"].as_str().unwrap().to_string()
}

async fn run(app: &Router, cookie: &str, script_id: &str) -> String {
    let (status, body) = send(
        app,
        authed(Method::POST, &format!("/scripts/{}/run", script_id), cookie),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let body = json_body(&body);
    assert_eq!(body["status"], "running");
    body["executionId"].as_str().unwrap().to_string()
}

async fn poll_until_finished(app: &Router, cookie: &str, execution_id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = send(
            app,
            authed(Method::GET, &format!("/executions/{}", execution_id), cookie),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        if body["status"] == "success" || body["status"] == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} did not finish", execution_id);
}

#[tokio::test]
async fn health_needs_no_session() {
    let (app, _h) = setup(ScriptedRuntime::exiting(0));
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn login_rejects_bad_credentials_and_bad_json() {
    let (app, _h) = setup(ScriptedRuntime::exiting(0));

    let wrong = Request::builder()
        .method(Method::POST)
        .uri("/login")
        .body(Body::from(
            json!({ "username": "alice", "password": "nope" }).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, b"Invalid credentials");

    let garbled = Request::builder()
        .method(Method::POST)
        .uri("/login")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, garbled).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn protected_routes_require_a_live_session() {
    let (app, _h) = setup(ScriptedRuntime::exiting(0));

    let anonymous = Request::builder()
        .uri("/executions/anything")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, b"Unauthorized");

    let (status, body) = send(
        &app,
        authed(Method::GET, "/scripts", "session_token=forged"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, b"Invalid username or token.");
}

#[tokio::test]
async fn upload_run_and_read_back_output() {
    let (app, _h) = setup(ScriptedRuntime::exiting(0).with_output(frame(1, "hello\n")));
    let cookie = login(&app, "alice", "alice-pw").await;

    let script_id = upload(&app, &cookie).await;

    let (status, body) = send(&app, authed(Method::GET, "/scripts", &cookie)).await;
    assert_eq!(status, StatusCode::OK);
    let listed = json_body(&body);
    assert_eq!(listed[0]["id"], script_id.as_str());
    assert_eq!(listed[0]["dockerImage"], "python:3.11-alpine");

    let execution_id = run(&app, &cookie, &script_id).await;
    let finished = poll_until_finished(&app, &cookie, &execution_id).await;
    assert_eq!(finished["status"], "success");
    assert_eq!(finished["exitCode"], 0);
    assert_eq!(finished["executableId"], script_id.as_str());
    assert!(finished["finishedAt"].is_string());

    let (status, body) = send(
        &app,
        authed(Method::GET, &format!("/executions/{}/logs", execution_id), &cookie),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let logs = json_body(&body);
    assert_eq!(logs.as_array().unwrap().len(), 1);
    assert_eq!(logs[0]["stream"], "stdout");
    assert_eq!(logs[0]["content"], "hello");

    let (status, body) = send(
        &app,
        authed(
            Method::GET,
            &format!("/executions/{}/logs?format=text", execution_id),
            &cookie,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "[stdout] hello\n");
}

#[tokio::test]
async fn failed_runtime_is_reported_as_sentinel_exit_code() {
    let (app, _h) = setup(ScriptedRuntime::failing_create());
    let cookie = login(&app, "alice", "alice-pw").await;
    let script_id = upload(&app, &cookie).await;

    let execution_id = run(&app, &cookie, &script_id).await;
    let finished = poll_until_finished(&app, &cookie, &execution_id).await;

    assert_eq!(finished["status"], "failed");
    assert_eq!(finished["exitCode"], -1);
}

#[tokio::test]
async fn another_users_execution_is_not_found() {
    let (app, _h) = setup(ScriptedRuntime::exiting(0));
    let alice = login(&app, "alice", "alice-pw").await;
    let bob = login(&app, "bob", "bob-pw").await;

    let script_id = upload(&app, &alice).await;
    let execution_id = run(&app, &alice, &script_id).await;

    for uri in [
        format!("/executions/{}", execution_id),
        format!("/executions/{}/logs", execution_id),
    ] {
        let (status, body) = send(&app, authed(Method::GET, &uri, &bob)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&body), json!({ "error": "Execution not found" }));
    }

    let (status, body) = send(
        &app,
        authed(Method::POST, &format!("/scripts/{}/run", script_id), &bob),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body), json!({ "error": "Script not found" }));
}

#[tokio::test]
async fn upload_validates_language_and_file() {
    let (app, _h) = setup(ScriptedRuntime::exiting(0));
    let cookie = login(&app, "alice", "alice-pw").await;

    let (status, body) = send(&app, upload_request(&cookie, "ruby", Some("puts 1\n"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = json_body(&body)["error"].as_str().unwrap().to_string();
    assert!(message.contains("unsupported language: ruby"));

    let (status, body) = send(&app, upload_request(&cookie, "python", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body), json!({ "error": "file is required" }));
}

#[tokio::test]
async fn deleting_a_script_removes_its_executions() {
    let (app, h) = setup(ScriptedRuntime::exiting(0));
    let cookie = login(&app, "alice", "alice-pw").await;
    let script_id = upload(&app, &cookie).await;
    let execution_id = run(&app, &cookie, &script_id).await;
    poll_until_finished(&app, &cookie, &execution_id).await;

    let (status, _) = send(
        &app,
        authed(Method::DELETE, &format!("/scripts/{}", script_id), &cookie),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        authed(Method::GET, &format!("/executions/{}", execution_id), &cookie),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.scripts.get(&script_id, 1).await.is_none());
}

#[tokio::test]
async fn logout_ends_the_session() {
    let (app, _h) = setup(ScriptedRuntime::exiting(0));
    let cookie = login(&app, "alice", "alice-pw").await;

    let (status, body) = send(&app, authed(Method::POST, "/logout", &cookie)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"Logged out");

    let (status, _) = send(&app, authed(Method::GET, "/scripts", &cookie)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
