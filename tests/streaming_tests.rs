use futures::stream::{self, Stream, StreamExt};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ai_aggregator::{
    errors::AppError,
    providers::{
        anthropic::AnthropicStreamDecoder,
        openai::OpenAIStreamDecoder,
        stream::{StreamDecoder, StreamOutcome, normalize_stream},
    },
};

type Chunk = Result<Vec<u8>, std::io::Error>;

fn byte_stream(parts: Vec<String>) -> impl Stream<Item = Chunk> + Send {
    stream::iter(parts.into_iter().map(|p| Ok(p.into_bytes())))
}

/// Split `body` at random byte offsets (possibly inside a multi-byte char).
fn random_split(body: &str, rng: &mut StdRng) -> Vec<Vec<u8>> {
    let bytes = body.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let len = rng.gen_range(1..=12).min(bytes.len() - start);
        parts.push(bytes[start..start + len].to_vec());
        start += len;
    }
    parts
}

async fn run<D: StreamDecoder>(
    decoder: &mut D,
    parts: Vec<String>,
    prompt_len: usize,
) -> (Result<StreamOutcome, AppError>, Vec<String>) {
    let mut chunks = Vec::new();
    let result = normalize_stream(
        byte_stream(parts),
        decoder,
        prompt_len,
        &CancellationToken::new(),
        &mut |c: &str| chunks.push(c.to_string()),
    )
    .await;
    (result, chunks)
}

fn anthropic_event(event: &str, data: serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

fn anthropic_tool_stream() -> String {
    [
        anthropic_event(
            "message_start",
            json!({"type":"message_start","message":{"model":"claude-3-5-sonnet-20241022","usage":{"input_tokens":42,"output_tokens":1}}}),
        ),
        anthropic_event(
            "content_block_start",
            json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}),
        ),
        anthropic_event(
            "content_block_delta",
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking the "}}),
        ),
        anthropic_event(
            "content_block_delta",
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"weather…"}}),
        ),
        anthropic_event("content_block_stop", json!({"type":"content_block_stop","index":0})),
        anthropic_event("ping", json!({"type":"ping"})),
        anthropic_event(
            "content_block_start",
            json!({"type":"content_block_start","index":2,"content_block":{"type":"tool_use","id":"toolu_01","name":"get_weather","input":{}}}),
        ),
        anthropic_event(
            "content_block_delta",
            json!({"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"city\": "}}),
        ),
        anthropic_event(
            "content_block_delta",
            json!({"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"\"Par"}}),
        ),
        anthropic_event(
            "content_block_delta",
            json!({"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"is\"}"}}),
        ),
        anthropic_event("content_block_stop", json!({"type":"content_block_stop","index":2})),
        anthropic_event(
            "message_delta",
            json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":17}}),
        ),
        anthropic_event("message_stop", json!({"type":"message_stop"})),
    ]
    .concat()
}

fn openai_text_stream(with_usage: bool) -> String {
    let mut body = String::new();
    for piece in ["The ", "quick ", "brown ", "fox ", "jumps ", "über ", "dogs"] {
        body.push_str(&format!(
            "data: {}\n\n",
            json!({"model":"gpt-4o-mini","choices":[{"index":0,"delta":{"content":piece}}]})
        ));
    }
    body.push_str(&format!(
        "data: {}\n\n",
        json!({"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]})
    ));
    if with_usage {
        body.push_str(&format!(
            "data: {}\n\n",
            json!({"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":7}})
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn test_tool_call_arguments_reassembled_from_three_fragments() {
    let (result, chunks) = run(&mut AnthropicStreamDecoder, vec![anthropic_tool_stream()], 0).await;
    let outcome = result.unwrap();

    assert_eq!(outcome.tool_calls.len(), 1);
    let call = &outcome.tool_calls[0];
    assert_eq!(call.id, "toolu_01");
    assert_eq!(call.name, "get_weather");
    assert_eq!(call.arguments, "{\"city\": \"Paris\"}");
    assert_eq!(call.arguments_json().unwrap(), json!({"city": "Paris"}));

    // Argument fragments never reach the chunk callback.
    assert_eq!(chunks, vec!["Checking the ", "weather…"]);
    assert_eq!(outcome.content, "Checking the weather…");
    assert_eq!(outcome.tokens_in, 42);
    assert_eq!(outcome.tokens_out, 17);
    assert!(!outcome.usage_estimated);
    assert_eq!(outcome.finish_reason.as_deref(), Some("tool_use"));
    assert_eq!(outcome.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
}

#[tokio::test]
async fn test_tool_calls_emitted_in_index_order() {
    let body = [
        anthropic_event(
            "content_block_start",
            json!({"type":"content_block_start","index":3,"content_block":{"type":"tool_use","id":"t3","name":"third"}}),
        ),
        anthropic_event(
            "content_block_start",
            json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"first"}}),
        ),
        anthropic_event(
            "content_block_delta",
            json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\":1}"}}),
        ),
        anthropic_event("content_block_stop", json!({"type":"content_block_stop","index":3})),
        anthropic_event("content_block_stop", json!({"type":"content_block_stop","index":1})),
        anthropic_event("message_stop", json!({"type":"message_stop"})),
    ]
    .concat();

    let (result, _) = run(&mut AnthropicStreamDecoder, vec![body], 0).await;
    let outcome = result.unwrap();

    let ids: Vec<&str> = outcome.tool_calls.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t3"]);
    assert_eq!(outcome.tool_calls[1].arguments, "{}");
}

#[tokio::test]
async fn test_unclosed_tool_block_is_dropped() {
    let body = [
        anthropic_event(
            "content_block_start",
            json!({"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t0","name":"cut_off"}}),
        ),
        anthropic_event(
            "content_block_delta",
            json!({"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"x\":"}}),
        ),
    ]
    .concat();

    let (result, _) = run(&mut AnthropicStreamDecoder, vec![body], 0).await;
    assert!(result.unwrap().tool_calls.is_empty());
}

#[tokio::test]
async fn test_chunks_concatenate_to_content_under_random_splits() {
    for seed in 0..25u64 {
        let mut rng = StdRng::seed_from_u64(seed);

        for (family, body) in [("openai", openai_text_stream(true)), ("anthropic", anthropic_tool_stream())] {
            let parts = random_split(&body, &mut rng);
            let mut chunks = Vec::new();
            let source = stream::iter(parts.into_iter().map(Ok::<_, std::io::Error>));
            let cancel = CancellationToken::new();
            let mut on_chunk = |c: &str| chunks.push(c.to_string());

            let outcome = if family == "openai" {
                normalize_stream(source, &mut OpenAIStreamDecoder, 0, &cancel, &mut on_chunk).await
            } else {
                normalize_stream(source, &mut AnthropicStreamDecoder, 0, &cancel, &mut on_chunk).await
            }
            .unwrap();

            assert_eq!(chunks.concat(), outcome.content, "seed {seed} family {family}");
            if family == "openai" {
                assert_eq!(outcome.content, "The quick brown fox jumps über dogs");
            } else {
                assert_eq!(outcome.tool_calls[0].arguments, "{\"city\": \"Paris\"}");
            }
        }
    }
}

#[tokio::test]
async fn test_crlf_framing() {
    let body = openai_text_stream(true).replace('\n', "\r\n");
    let (result, chunks) = run(&mut OpenAIStreamDecoder, vec![body], 0).await;
    let outcome = result.unwrap();
    assert_eq!(chunks.len(), 7);
    assert_eq!(outcome.tokens_in, 9);
    assert_eq!(outcome.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_missing_usage_is_estimated_from_length() {
    let prompt_len = 37;
    let (result, _) = run(&mut OpenAIStreamDecoder, vec![openai_text_stream(false)], prompt_len).await;
    let outcome = result.unwrap();

    assert!(outcome.usage_estimated);
    assert_eq!(outcome.tokens_in, (prompt_len / 4) as u32);
    assert_eq!(outcome.tokens_out, (outcome.content.len() / 4) as u32);
}

#[tokio::test]
async fn test_zero_usage_counts_as_unreported() {
    let body = format!(
        "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
        json!({"choices":[{"delta":{"content":"twelve chars"}}]}),
        json!({"choices":[],"usage":{"prompt_tokens":0,"completion_tokens":0}}),
    );
    let (result, _) = run(&mut OpenAIStreamDecoder, vec![body], 8).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.tokens_in, 2);
    assert_eq!(outcome.tokens_out, 3);
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let body = format!(
        "data: {{\"choices\": [\n\n: comment\nevent: whatever\nretry: 10\ndata: {}\n\ndata: not json at all\n\ndata: [DONE]\n\n",
        json!({"choices":[{"delta":{"content":"survived"}}]}),
    );
    let (result, chunks) = run(&mut OpenAIStreamDecoder, vec![body], 0).await;
    assert_eq!(result.unwrap().content, "survived");
    assert_eq!(chunks, vec!["survived"]);
}

#[tokio::test]
async fn test_fully_malformed_stream_is_empty_not_an_error() {
    let (result, chunks) = run(
        &mut AnthropicStreamDecoder,
        vec!["data: garbage\n\ndata: {}\n\n".to_string()],
        0,
    )
    .await;
    let outcome = result.unwrap();
    assert_eq!(outcome.content, "");
    assert_eq!(outcome.tokens_out, 0);
    assert!(outcome.tool_calls.is_empty());
    assert!(chunks.is_empty());
}

#[tokio::test]
async fn test_done_sentinel_stops_reading() {
    let body = format!(
        "data: {}\n\ndata: [DONE]\n\ndata: {}\n\n",
        json!({"choices":[{"delta":{"content":"kept"}}]}),
        json!({"choices":[{"delta":{"content":"ignored"}}]}),
    );
    let (result, _) = run(&mut OpenAIStreamDecoder, vec![body], 0).await;
    assert_eq!(result.unwrap().content, "kept");
}

#[tokio::test]
async fn test_mid_stream_transport_error_after_partial_output() {
    let first = format!(
        "data: {}\n\n",
        json!({"choices":[{"delta":{"content":"partial"}}]})
    );
    let source = stream::iter(vec![
        Ok(first.into_bytes()),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset")),
    ]);

    let mut chunks = Vec::new();
    let result = normalize_stream(
        source,
        &mut OpenAIStreamDecoder,
        0,
        &CancellationToken::new(),
        &mut |c: &str| chunks.push(c.to_string()),
    )
    .await;

    assert_eq!(chunks, vec!["partial"]);
    match result {
        Err(AppError::ProviderError { message, .. }) => assert!(message.contains("connection reset")),
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_content_block_error_event_fails_stream() {
    let body = [
        anthropic_event(
            "content_block_delta",
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"so far"}}),
        ),
        anthropic_event(
            "error",
            json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}),
        ),
    ]
    .concat();

    let (result, chunks) = run(&mut AnthropicStreamDecoder, vec![body], 0).await;
    assert_eq!(chunks, vec!["so far"]);
    assert!(matches!(result, Err(AppError::ProviderError { .. })));
}

#[tokio::test]
async fn test_cancellation_aborts_read_loop() {
    let first = format!(
        "data: {}\n\n",
        json!({"choices":[{"delta":{"content":"one"}}]})
    );
    // A backend that sends one event and then stalls forever.
    let source = stream::iter(vec![Ok::<_, std::io::Error>(first.into_bytes())])
        .chain(stream::pending());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let result = normalize_stream(
        source,
        &mut OpenAIStreamDecoder,
        0,
        &cancel,
        &mut |_: &str| trigger.cancel(),
    )
    .await;

    assert!(matches!(result, Err(AppError::Cancelled)));
}

#[tokio::test]
async fn test_cancellation_wakes_a_stalled_read() {
    let source = stream::pending::<Chunk>();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = normalize_stream(source, &mut AnthropicStreamDecoder, 0, &cancel, &mut |_: &str| {}).await;
    assert!(matches!(result, Err(AppError::Cancelled)));
}
