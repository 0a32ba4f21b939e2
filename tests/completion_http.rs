use httpmock::prelude::*;
use serde_json::json;
use smartmarks::llm::{default_models, fetch_models, list_models};
use smartmarks::{
    AiSettings, BackoffPolicy, Bookmark, CancelToken, CompletionClient, CompletionRequest, Error,
    OpenAiClient, SmartCategorizer,
};
use std::time::Duration;

fn settings(server: &MockServer) -> AiSettings {
    AiSettings::new("test-key", format!("{}/v1", server.base_url()), "gpt-4")
}

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

fn hello() -> CompletionRequest {
    CompletionRequest::new("system", "hello")
}

#[tokio::test]
async fn integration_client_posts_chat_completion_and_returns_content() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer test-key")
            .json_body_includes(json!({"model": "gpt-4", "temperature": 0.7}).to_string());
        then.status(200).json_body(completion_body("hi there"));
    });

    let client = OpenAiClient::new(settings(&server)).expect("client should be created");
    let content = client.complete(&hello()).await.expect("request should succeed");

    assert_eq!(content, "hi there");
    mock.assert();
}

#[tokio::test]
async fn integration_client_keeps_full_completions_url() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/proxy/chat/completions");
        then.status(200).json_body(completion_body("ok"));
    });

    let client = OpenAiClient::new(AiSettings::new(
        "test-key",
        format!("{}/proxy/chat/completions", server.base_url()),
        "gpt-4",
    ))
    .expect("client should be created");

    assert_eq!(client.complete(&hello()).await.unwrap(), "ok");
    mock.assert_calls(1);
}

#[tokio::test]
async fn regression_client_flags_http_429_as_rate_limited() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(429)
            .json_body(json!({"error": {"message": "Rate limit reached, retry after 20s"}}));
    });

    let client = OpenAiClient::new(settings(&server)).unwrap();
    let error = client.complete(&hello()).await.expect_err("429 should fail");

    match &error {
        Error::Request {
            status,
            message,
            rate_limited,
        } => {
            assert_eq!(*status, Some(429));
            assert!(*rate_limited);
            assert!(message.contains("Rate limit reached"));
        }
        other => panic!("expected Error::Request, got {other:?}"),
    }
}

#[tokio::test]
async fn regression_client_reports_server_errors_without_rate_limit_flag() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(503).body("upstream unavailable");
    });

    let client = OpenAiClient::new(settings(&server)).unwrap();
    let error = client.complete(&hello()).await.expect_err("503 should fail");

    assert!(matches!(error, Error::Request { status: Some(503), .. }));
    assert!(!error.is_rate_limited());
    assert!(error.to_string().contains("server error"));
}

#[tokio::test]
async fn regression_client_treats_error_body_on_200_as_failure() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .json_body(json!({"error": {"message": "model `gpt-9` does not exist"}}));
    });

    let client = OpenAiClient::new(settings(&server)).unwrap();
    let error = client.complete(&hello()).await.expect_err("error body should fail");

    match error {
        Error::Request { message, .. } => assert!(message.contains("does not exist")),
        other => panic!("expected Error::Request, got {other:?}"),
    }
}

#[tokio::test]
async fn regression_client_returns_timeout_when_server_is_slow() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .delay(Duration::from_millis(1_500))
            .json_body(completion_body("late"));
    });

    let client = OpenAiClient::new(settings(&server).with_timeout_secs(1)).unwrap();
    let error = client.complete(&hello()).await.expect_err("request should time out");

    assert!(matches!(error, Error::Timeout { secs: 1 }));
    assert!(error.is_batch_local());
}

#[tokio::test]
async fn integration_categorizer_runs_batches_against_endpoint() {
    let server = MockServer::start();
    let first = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_includes("\\\"id\\\":\\\"a\\\"");
        then.status(200).json_body(completion_body(
            "```json\n[{'name': 'Rust', 'bookmarkIds': ['a', 'b', 'zzz'],}]\n```",
        ));
    });
    let second = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_includes("\\\"id\\\":\\\"c\\\"");
        then.status(500).body("boom");
    });

    let client = OpenAiClient::new(settings(&server)).unwrap();
    let smart = SmartCategorizer::new(client)
        .with_policy(BackoffPolicy::immediate())
        .with_batch_size(2);
    let bookmarks = vec![
        Bookmark::new("a", "The Book", "https://doc.rust-lang.org/book").with_tags(["rust"]),
        Bookmark::new("b", "Docs.rs", "https://docs.rs").with_tags(["rust", "docs"]),
        Bookmark::new("c", "News", "https://news.example").with_summary("Daily news"),
    ];

    let report = smart
        .run(&bookmarks, &CancelToken::new())
        .await
        .expect("run succeeds despite one failed batch");

    first.assert_calls(1);
    second.assert_calls(1);
    assert_eq!(report.batches_total, 2);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.categories[0].name, "Rust");
    assert_eq!(report.categories[0].bookmark_ids, vec!["a", "b"]);
    assert_eq!(
        report.uncategorized().expect("uncategorized bucket").bookmark_ids,
        vec!["c"]
    );
}

#[tokio::test]
async fn integration_models_are_listed_and_sorted() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/models")
            .header("authorization", "Bearer test-key");
        then.status(200).json_body(json!({
            "object": "list",
            "data": [{"id": "gpt-4o"}, {"id": "gpt-3.5-turbo"}, {"id": "gpt-4"}]
        }));
    });

    let settings = AiSettings::new(
        "test-key",
        format!("{}/v1/chat/completions", server.base_url()),
        "gpt-4",
    );
    let ids: Vec<String> = list_models(&settings)
        .await
        .expect("listing succeeds")
        .into_iter()
        .map(|m| m.id)
        .collect();

    assert_eq!(ids, vec!["gpt-3.5-turbo", "gpt-4", "gpt-4o"]);
    mock.assert();
}

#[tokio::test]
async fn regression_models_fall_back_to_defaults_on_failure() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/v1/models");
        then.status(401).body("unauthorized");
    });

    let models = fetch_models(&settings(&server)).await;
    assert_eq!(models, default_models());
}
