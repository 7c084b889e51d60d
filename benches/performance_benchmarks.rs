//! Criterion benchmarks for the hot paths of job processing
//!
//! Stream normalization runs once per streamed completion and cost lookup
//! once per finished job, so both are measured here.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::stream;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use ai_aggregator::{
    pricing::{CostCalculator, FallbackRates, PricingService, ProviderPricing},
    providers::{
        anthropic::AnthropicStreamDecoder,
        openai::OpenAIStreamDecoder,
        stream::{StreamDecoder, StreamOutcome, normalize_stream},
    },
    store::InMemoryPricingStore,
};

/// OpenAI-style body with `deltas` text chunks and one streamed tool call
fn openai_body(deltas: usize) -> String {
    let mut body = String::new();
    for i in 0..deltas {
        let chunk = json!({"choices": [{"delta": {"content": format!("token{} ", i)}}]});
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    for fragment in ["{\"q\":", " \"bench\"", "}"] {
        let chunk = json!({"choices": [{"delta": {"tool_calls": [{
            "index": 0, "id": "call_0", "function": {"name": "search", "arguments": fragment}
        }]}}]});
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str("data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20}}\n\n");
    body.push_str("data: [DONE]\n\n");
    body
}

/// Anthropic-style body with `deltas` text deltas in one block
fn anthropic_body(deltas: usize) -> String {
    let mut body = String::from(
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-5-haiku\",\"usage\":{\"input_tokens\":10}}}\n\n",
    );
    body.push_str("event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n");
    for i in 0..deltas {
        let delta = json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": format!("token{} ", i)}});
        body.push_str(&format!("event: content_block_delta\ndata: {}\n\n", delta));
    }
    body.push_str("event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n");
    body.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    body
}

/// Split a body into fixed-size network chunks
fn chunked(body: &str, size: usize) -> Vec<Vec<u8>> {
    body.as_bytes().chunks(size).map(<[u8]>::to_vec).collect()
}

async fn normalize<D: StreamDecoder>(parts: Vec<Vec<u8>>, mut decoder: D) -> StreamOutcome {
    let source = stream::iter(parts.into_iter().map(Ok::<_, std::io::Error>));
    let cancel = CancellationToken::new();
    normalize_stream(source, &mut decoder, 40, &cancel, &mut |_: &str| {})
        .await
        .unwrap()
}

fn bench_stream_normalization(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("stream_normalization");

    for deltas in [10usize, 100, 1000] {
        let openai = chunked(&openai_body(deltas), 64);
        let anthropic = chunked(&anthropic_body(deltas), 64);
        group.throughput(Throughput::Elements(deltas as u64));

        group.bench_with_input(BenchmarkId::new("openai", deltas), &openai, |b, parts| {
            b.to_async(&rt)
                .iter(|| normalize(parts.clone(), OpenAIStreamDecoder))
        });

        group.bench_with_input(BenchmarkId::new("anthropic", deltas), &anthropic, |b, parts| {
            b.to_async(&rt)
                .iter(|| normalize(parts.clone(), AnthropicStreamDecoder))
        });
    }

    group.finish();
}

fn bench_fallback_rates(c: &mut Criterion) {
    let rates = FallbackRates::openai();

    c.bench_function("fallback_rates_exact", |b| {
        b.iter(|| black_box(rates.token_cost(black_box("gpt-4o"), 1_000, 2_000)))
    });

    c.bench_function("fallback_rates_prefix", |b| {
        b.iter(|| black_box(rates.token_cost(black_box("gpt-4o-mini-2024-07-18"), 1_000, 2_000)))
    });
}

fn bench_cost_calculation(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pricing = Arc::new(PricingService::new(Arc::new(InMemoryPricingStore::new())));
    rt.block_on(async {
        for i in 0..100 {
            pricing
                .create(ProviderPricing::new("openai", format!("model-{}", i), 1.0, 2.0))
                .await
                .unwrap();
        }
    });
    let calculator = CostCalculator::new("openai", Some(pricing), FallbackRates::openai());
    let calculator = &calculator;

    c.bench_function("cost_calculator_cached", |b| {
        b.to_async(&rt).iter(move || async move {
            black_box(calculator.token_cost("model-42", 1_000, 2_000).await)
        })
    });

    c.bench_function("cost_calculator_fallback", |b| {
        b.to_async(&rt).iter(move || async move {
            black_box(calculator.token_cost("gpt-4o", 1_000, 2_000).await)
        })
    });
}

criterion_group!(
    benches,
    bench_stream_normalization,
    bench_fallback_rates,
    bench_cost_calculation
);
criterion_main!(benches);
