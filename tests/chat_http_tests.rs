use assistant_models::error::{AssistantError, ProviderError};
use assistant_models::services::{
    ClaudeModel, ClaudeService, ModelMessage, ModelService, OpenAIService, RequestOptions,
    ServiceStatus,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

type Captured = Arc<Mutex<Vec<String>>>;

/// Answer every request with `status` and a JSON body, recording the raw requests
async fn serve_json(status: &'static str, body: serde_json::Value) -> (String, Captured) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let body = body.to_string();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let body = body.clone();
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                sink.lock().unwrap().push(request);

                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            });
        }
    });

    (format!("http://{addr}"), captured)
}

/// Read one request: headers, then as many body bytes as Content-Length says
async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    String::from_utf8_lossy(&buf).into_owned()
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn conversation() -> Vec<ModelMessage> {
    vec![ModelMessage::system("Be brief."), ModelMessage::user("What's 2+2?")]
}

#[tokio::test]
async fn test_claude_send_message_over_http() {
    let (url, captured) = serve_json(
        "200 OK",
        json!({
            "id": "msg_01",
            "type": "message",
            "model": "claude-3-haiku-20240307",
            "content": [{ "type": "text", "text": "Four." }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 14, "output_tokens": 3 }
        }),
    )
    .await;

    let mut service = ClaudeService::new(ClaudeModel::Haiku)
        .with_api_key("sk-ant-test")
        .with_base_url(url)
        .with_client(client());
    assert_eq!(service.initialize().await, ServiceStatus::Ready);

    let response = service
        .send_message(&conversation(), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.content, "Four.");
    assert_eq!(response.model.as_deref(), Some("claude-3-haiku-20240307"));
    assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
    assert_eq!(response.total_tokens, Some(17));

    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = requests[0].to_lowercase();
    assert!(request.starts_with("post /v1/messages "));
    assert!(request.contains("x-api-key: sk-ant-test"));
    assert!(request.contains("anthropic-version: 2023-06-01"));
    assert!(requests[0].contains(r#""system":"Be brief.""#));
}

#[tokio::test]
async fn test_claude_unauthorized_is_invalid_api_key() {
    let (url, _captured) = serve_json(
        "401 Unauthorized",
        json!({ "type": "error", "error": { "type": "authentication_error" } }),
    )
    .await;

    let mut service = ClaudeService::new(ClaudeModel::Sonnet)
        .with_api_key("sk-ant-revoked")
        .with_base_url(url)
        .with_client(client());
    service.initialize().await;

    let result = service
        .send_message(&conversation(), &RequestOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(AssistantError::Provider(ProviderError::InvalidApiKey))
    ));
}

#[tokio::test]
async fn test_openai_send_message_over_http() {
    let (url, captured) = serve_json(
        "200 OK",
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "4" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 20, "completion_tokens": 1, "total_tokens": 21 }
        }),
    )
    .await;

    let mut service = OpenAIService::new("gpt-4o")
        .with_api_key("sk-test")
        .with_base_url(url)
        .with_client(client());
    assert_eq!(service.initialize().await, ServiceStatus::Ready);

    let options = RequestOptions {
        temperature: Some(0.1),
        ..RequestOptions::default()
    };
    let response = service.send_message(&conversation(), &options).await.unwrap();
    assert_eq!(response.content, "4");
    assert_eq!(response.model.as_deref(), Some("gpt-4o"));
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    assert_eq!(response.prompt_tokens, Some(20));
    assert_eq!(response.total_tokens, Some(21));

    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = requests[0].to_lowercase();
    assert!(request.starts_with("post /v1/chat/completions "));
    assert!(request.contains("authorization: bearer sk-test"));
    assert!(requests[0].contains(r#""model":"gpt-4o""#));
}

#[tokio::test]
async fn test_openai_error_statuses() {
    let (url, _captured) = serve_json(
        "401 Unauthorized",
        json!({ "error": { "message": "Incorrect API key provided" } }),
    )
    .await;
    let mut service = OpenAIService::new("gpt-4")
        .with_api_key("sk-revoked")
        .with_base_url(url)
        .with_client(client());
    service.initialize().await;

    let result = service
        .send_message(&conversation(), &RequestOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(AssistantError::Provider(ProviderError::InvalidApiKey))
    ));

    let (url, _captured) = serve_json(
        "500 Internal Server Error",
        json!({ "error": { "message": "The server had an error" } }),
    )
    .await;
    let mut service = OpenAIService::new("gpt-4")
        .with_api_key("sk-test")
        .with_base_url(url)
        .with_client(client());
    service.initialize().await;

    let err = service
        .send_message(&conversation(), &RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AssistantError::Provider(ProviderError::ApiError(_))
    ));
    assert!(err.to_string().contains("500"));
}
