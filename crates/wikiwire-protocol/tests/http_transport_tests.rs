#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! HTTP transport tests against a local mock server

mod common;

use common::test_config;
use pretty_assertions::assert_eq;
use serde_json::json;
use wikiwire_protocol::{
    Client, ClientConfig, Error, ModuleInput, PageSetSelector, QueryStatus, TokenKind,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path, query_param, query_param_is_missing},
};

async fn mount_siteinfo(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/w/api.php"))
        .and(query_param("meta", "siteinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batchcomplete": "",
            "query": {
                "general": {"sitename": "Mock Wiki", "generator": "MediaWiki 1.39.4"},
                "dbrepllag": [{"host": "db1", "lag": 0}]
            }
        })))
        .expect(1)
        .mount(server)
        .await;
}

fn config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        endpoint: format!("{}/w/api.php", server.uri()),
        ..test_config()
    }
}

fn members() -> ModuleInput {
    ModuleInput::list("categorymembers", "cm")
        .param("title", "Category:Physics")
        .batch_size(2)
}

#[tokio::test]
async fn test_connect_and_paginate_over_http() {
    let server = MockServer::start().await;
    mount_siteinfo(&server).await;

    Mock::given(method("GET"))
        .and(query_param("list", "categorymembers"))
        .and(query_param("cmlimit", "2"))
        .and(query_param_is_missing("cmcontinue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "continue": {"cmcontinue": "page|B|2", "continue": "-||"},
            "query": {"categorymembers": [{"ns": 0, "title": "A"}, {"ns": 0, "title": "B"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("list", "categorymembers"))
        .and(query_param("cmcontinue", "page|B|2"))
        .and(query_param("continue", "-||"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batchcomplete": true,
            "query": {"categorymembers": [{"ns": 0, "title": "C"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::connect(config(&server)).await.unwrap();
    assert_eq!(client.site().site_name.as_deref(), Some("Mock Wiki"));

    let result = client
        .query(vec![members()], PageSetSelector::None)
        .collect()
        .await
        .unwrap();
    assert_eq!(result.status, QueryStatus::Complete);
    assert_eq!(result.data.list_titles("categorymembers"), vec!["A", "B", "C"]);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    let agent = requests[0]
        .headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(agent.starts_with("wikiwire/"));
}

#[tokio::test]
async fn test_maxlag_with_retry_after_is_retried() {
    let server = MockServer::start().await;
    mount_siteinfo(&server).await;

    Mock::given(method("GET"))
        .and(query_param("list", "categorymembers"))
        .and(query_param("maxlag", "5"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Retry-After", "0")
                .set_body_json(json!({
                    "error": {
                        "code": "maxlag",
                        "info": "Waiting for db2: 7 seconds lagged",
                        "lag": 7,
                    }
                })),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("list", "categorymembers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batchcomplete": true,
            "query": {"categorymembers": [{"ns": 0, "title": "A"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::connect(config(&server)).await.unwrap();
    let result = client
        .query(vec![members()], PageSetSelector::None)
        .collect()
        .await
        .unwrap();
    assert_eq!(result.data.list_titles("categorymembers"), vec!["A"]);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_overloaded_server_is_retried() {
    let server = MockServer::start().await;
    mount_siteinfo(&server).await;

    Mock::given(method("GET"))
        .and(query_param("list", "categorymembers"))
        .respond_with(
            ResponseTemplate::new(503).set_body_string("<html>Service Unavailable</html>"),
        )
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("list", "categorymembers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batchcomplete": true,
            "query": {"categorymembers": []}
        })))
        .mount(&server)
        .await;

    let client = Client::connect(config(&server)).await.unwrap();
    let result = client
        .query(vec![members()], PageSetSelector::None)
        .collect()
        .await
        .unwrap();
    assert_eq!(result.status, QueryStatus::Complete);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_non_json_body_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("<!DOCTYPE html><p>Not an API</p>"),
        )
        .mount(&server)
        .await;

    let err = Client::connect(config(&server)).await.unwrap_err();
    match err {
        Error::Protocol { payload, .. } => assert!(payload.contains("Not an API")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_write_is_posted_with_token_last() {
    let server = MockServer::start().await;
    mount_siteinfo(&server).await;

    Mock::given(method("GET"))
        .and(query_param("meta", "tokens"))
        .and(query_param("type", "csrf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batchcomplete": true,
            "query": {"tokens": {"csrftoken": "abc123+\\"}}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/w/api.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "edit": {"result": "Success", "title": "Sandbox", "newrevid": 42}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::connect(config(&server)).await.unwrap();
    let edit = ModuleInput::action("edit")
        .param("title", "Sandbox")
        .param("text", "a & b")
        .token(TokenKind::Csrf);
    let outcome = client.execute(&edit).await.unwrap();
    assert!(outcome.is_success());

    let requests = server.received_requests().await.unwrap();
    let post = requests
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .unwrap();
    let body = String::from_utf8_lossy(&post.body);
    assert!(body.contains("action=edit"));
    assert!(body.contains("text=a+%26+b"));
    assert!(body.ends_with("token=abc123%2B%5C"));
    assert_eq!(post.url.query(), None);
}
