//! HTTP providers against mock servers.

use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rag_session::embedding::EmbeddingClient;
use rag_session::llm::OpenAiChatModel;
use rag_session::models::{GenerationSettings, Message};
use rag_session::retrieval::{AzureSearchRetriever, HarnessRetriever, IndexFields};
use rag_session::traits::{ChatDelta, ChatModel, ChatRequest, Retriever};

const TIMEOUT: Duration = Duration::from_secs(5);

fn request() -> ChatRequest {
    ChatRequest::new(
        &[Message::system("be brief"), Message::user("which pump?")],
        GenerationSettings::default(),
    )
}

fn completion(text: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }]
    })
}

// ─── Chat completions ───────────────────────────────────────────────

#[tokio::test]
async fn test_openai_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "stream": false,
            "max_tokens": 1000,
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "which pump?" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("The P-40 [1].")))
        .expect(1)
        .mount(&server)
        .await;

    let model = OpenAiChatModel::openai(&server.uri(), "sk-test", "gpt-4o-mini", TIMEOUT).unwrap();
    assert_eq!(model.name(), "gpt-4o-mini");
    let text = model.complete(&request()).await.unwrap();
    assert_eq!(text, "The P-40 [1].");
}

#[tokio::test]
async fn test_azure_completion_uses_deployment_url_and_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt4o/chat/completions"))
        .and(query_param("api-version", "2024-06-01"))
        .and(header("api-key", "az-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let model =
        OpenAiChatModel::azure(&server.uri(), "gpt4o", "2024-06-01", "az-key", TIMEOUT).unwrap();
    assert_eq!(model.complete(&request()).await.unwrap(), "ok");
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("second try")))
        .expect(1)
        .mount(&server)
        .await;

    let model = OpenAiChatModel::openai(&server.uri(), "k", "m", TIMEOUT)
        .unwrap()
        .with_retries(2, Duration::from_millis(1));
    assert_eq!(model.complete(&request()).await.unwrap(), "second try");
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad max_tokens"))
        .expect(1)
        .mount(&server)
        .await;

    let model = OpenAiChatModel::openai(&server.uri(), "k", "m", TIMEOUT)
        .unwrap()
        .with_retries(3, Duration::from_millis(1));
    let err = model.complete(&request()).await.unwrap_err();
    assert!(err.to_string().contains("400"));
    assert!(err.to_string().contains("bad max_tokens"));
}

#[tokio::test]
async fn test_error_body_in_success_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "error": { "message": "content filtered" } })),
        )
        .mount(&server)
        .await;

    let model = OpenAiChatModel::openai(&server.uri(), "k", "m", TIMEOUT).unwrap();
    let err = model.complete(&request()).await.unwrap_err();
    assert!(err.to_string().contains("content filtered"));
}

#[tokio::test]
async fn test_streaming_completion() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"The P-40 \"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"[1].\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let model = OpenAiChatModel::openai(&server.uri(), "k", "m", TIMEOUT).unwrap();
    let deltas: Vec<ChatDelta> = model
        .stream(&request())
        .await
        .unwrap()
        .map(|d| d.unwrap())
        .collect()
        .await;

    assert_eq!(
        deltas,
        vec![
            ChatDelta::Text("The P-40 ".to_string()),
            ChatDelta::Text("[1].".to_string()),
            ChatDelta::Finished {
                finish_reason: Some("stop".to_string())
            },
        ]
    );
}

/// Serves one SSE response over a raw socket, pausing `gap` before each
/// event. Returns the base URL.
async fn spawn_slow_sse_server(events: Vec<String>, gap: Duration) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // read the request head and its body before answering
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        let body_len = loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                break end + 4 + length;
            }
        };
        while request.len() < body_len {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        for event in events {
            tokio::time::sleep(gap).await;
            socket.write_all(event.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
        }
        socket.shutdown().await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_streaming_outlives_request_timeout_while_chunks_arrive() {
    let mut events: Vec<String> = (0..6)
        .map(|i| {
            format!(
                "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"part{} \"}}}}]}}\n\n",
                i
            )
        })
        .collect();
    events.push("data: [DONE]\n\n".to_string());

    // six gaps of 150ms outlast the 400ms timeout; no single gap does
    let base = spawn_slow_sse_server(events, Duration::from_millis(150)).await;
    let model = OpenAiChatModel::openai(&base, "k", "m", Duration::from_millis(400))
        .unwrap()
        .with_retries(0, Duration::from_millis(1));

    let deltas: Vec<ChatDelta> = model
        .stream(&request())
        .await
        .unwrap()
        .map(|d| d.unwrap())
        .collect()
        .await;

    let text: String = deltas
        .iter()
        .filter_map(|d| match d {
            ChatDelta::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "part0 part1 part2 part3 part4 part5 ");
    assert!(matches!(deltas.last(), Some(ChatDelta::Finished { .. })));
}

// ─── Retrievers ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_harness_retriever() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tools/search"))
        .and(body_partial_json(json!({ "query": "pump", "mode": "hybrid", "limit": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": {
                "results": [
                    { "id": "doc-1", "score": 0.9, "title": "Pumps", "snippet": "P-40 delivers 40 bar." },
                    { "id": "doc-2", "score": 0.4, "title": null, "snippet": "Valve notes." }
                ]
            }
        })))
        .mount(&server)
        .await;

    let retriever = HarnessRetriever::new(&server.uri(), TIMEOUT).unwrap();
    let hits = retriever.search("pump", 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].title, "Pumps");
    assert_eq!(hits[0].parent_id, "doc-1");
    assert_eq!(hits[0].text, "P-40 delivers 40 bar.");
    assert_eq!(hits[1].title, "Untitled");
}

#[tokio::test]
async fn test_harness_retriever_surfaces_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let retriever = HarnessRetriever::new(&server.uri(), TIMEOUT).unwrap();
    assert!(retriever.search("pump", 5).await.is_err());
}

#[tokio::test]
async fn test_azure_search_retriever() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/manuals/docs/search"))
        .and(query_param("api-version", "2023-11-01"))
        .and(header("api-key", "search-key"))
        .and(body_partial_json(json!({
            "search": "pump pressure",
            "top": 3,
            "select": "chunk,title,parent_id"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "@search.score": 3.5, "chunk": "P-40 delivers 40 bar.", "title": "P-40", "parent_id": "doc-40" },
                { "@search.score": 1.25, "chunk": "Unnamed passage." }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let retriever = AzureSearchRetriever::new(
        &server.uri(),
        "manuals",
        "2023-11-01",
        "search-key",
        IndexFields::default(),
        TIMEOUT,
    )
    .unwrap();
    let hits = retriever.search("pump pressure", 3).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].title, "P-40");
    assert_eq!(hits[0].relevance, 3.5);
    assert_eq!(hits[1].title, "Untitled");
    assert_eq!(hits[1].parent_id, "");
}

#[tokio::test]
async fn test_azure_search_adds_vector_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "index": 0, "embedding": [0.5, 0.25] }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes/manuals/docs/search"))
        .and(body_partial_json(json!({
            "vectorQueries": [{
                "kind": "vector",
                "vector": [0.5, 0.25],
                "k": 4,
                "fields": "text_vector"
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let embeddings =
        EmbeddingClient::openai(&server.uri(), "k", "text-embedding-3-small", TIMEOUT).unwrap();
    let retriever = AzureSearchRetriever::new(
        &server.uri(),
        "manuals",
        "2023-11-01",
        "search-key",
        IndexFields::default(),
        TIMEOUT,
    )
    .unwrap()
    .with_embeddings(Some(embeddings));

    let hits = retriever.search("pump", 4).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_embedding_failure_falls_back_to_text_search() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes/manuals/docs/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{ "chunk": "text hit", "title": "T", "parent_id": "p" }]
        })))
        .mount(&server)
        .await;

    let embeddings = EmbeddingClient::openai(&server.uri(), "k", "m", TIMEOUT)
        .unwrap()
        .with_retries(0, Duration::from_millis(1));
    let retriever = AzureSearchRetriever::new(
        &server.uri(),
        "manuals",
        "2023-11-01",
        "search-key",
        IndexFields::default(),
        TIMEOUT,
    )
    .unwrap()
    .with_embeddings(Some(embeddings));

    let hits = retriever.search("pump", 4).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, "text hit");
}
