use std::sync::Arc;
use std::time::Duration;

use sim_api::app;
use sim_common::config::{Config, FailureKind, LoraModule, Mode};
use sim_core::Simulator;

async fn serve(cfg: Config) -> String {
    let sim = Simulator::start(cfg).await.unwrap();
    serve_sim(sim).await
}

async fn serve_sim(sim: Arc<Simulator>) -> String {
    let app = app(sim);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn base_config() -> Config {
    Config {
        model: "my_model".into(),
        mode: Mode::Echo,
        max_num_seqs: 5,
        seed: Some(100),
        ..Config::default()
    }
}

#[tokio::test]
async fn echo_chat_completion_round_trip() {
    let base = serve(base_config()).await;
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "model": "my_model",
        "messages": [{"role": "user", "content": "This is a test."}]
    });
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["usage"]["prompt_tokens"], 4);
    assert_eq!(json["usage"]["completion_tokens"], 4);
    assert_eq!(json["usage"]["total_tokens"], 8);
    assert_eq!(json["choices"][0]["message"]["content"], "This is a test.");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert_eq!(json["model"], "my_model");
    assert_eq!(json["object"], "chat.completion");
}

#[tokio::test]
async fn context_window_overflow_is_rejected() {
    let mut cfg = base_config();
    cfg.mode = Mode::Random;
    cfg.max_model_len = 10;
    let base = serve(cfg).await;
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "model": "my_model",
        "messages": [{"role": "user", "content": "This is a test message"}],
        "max_tokens": 8
    });
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    let message = json["error"]["message"].as_str().unwrap();
    assert!(message.contains("maximum context length is 10 tokens"), "{message}");
    assert!(message.contains("you requested 13 tokens"), "{message}");
}

#[tokio::test]
async fn fake_metrics_are_served_verbatim() {
    let mut cfg = base_config();
    cfg.fake_metrics = Some(
        serde_json::from_str(
            r#"{"running-requests":10,"waiting-requests":30,"kv-cache-usage":0.4,
                "loras":[{"running":"lora4,lora2","waiting":"lora3","timestamp":1257894567}]}"#,
        )
        .unwrap(),
    );
    let base = serve(cfg).await;
    let text = reqwest::get(format!("{base}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(
        text.contains(r#"vllm:num_requests_running{model_name="my_model"} 10"#),
        "{text}"
    );
    assert!(
        text.contains(r#"vllm:num_requests_waiting{model_name="my_model"} 30"#),
        "{text}"
    );
    assert!(
        text.contains(r#"vllm:gpu_cache_usage_perc{model_name="my_model"} 0.4"#),
        "{text}"
    );
    let lora_line = text
        .lines()
        .find(|l| l.starts_with("vllm:lora_requests_info{"))
        .expect("missing lora_requests_info");
    assert!(lora_line.contains(r#"running_lora_adapters="lora4,lora2""#));
    assert!(lora_line.contains(r#"waiting_lora_adapters="lora3""#));
    assert!(lora_line.ends_with("1257894567"));
}

#[tokio::test]
async fn injected_failures_use_configured_kind() {
    let mut cfg = base_config();
    cfg.failure_injection_rate = 100;
    cfg.failure_types = vec![FailureKind::RateLimit];
    let base = serve(cfg).await;
    let client = reqwest::Client::new();
    for _ in 0..3 {
        let resp = client
            .post(format!("{base}/v1/completions"))
            .json(&serde_json::json!({"model": "my_model", "prompt": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 429);
        let json: serde_json::Value = resp.json().await.unwrap();
        assert!(json["error"]["message"].as_str().unwrap().contains("my_model"));
    }
}

async fn scrape_until(base: &str, needle: &str) -> String {
    for _ in 0..50 {
        let text = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        if text.contains(needle) {
            return text;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("metrics never contained {needle}");
}

fn lora_timestamp(metrics: &str, needle: &str) -> f64 {
    metrics
        .lines()
        .find(|l| l.starts_with("vllm:lora_requests_info{") && l.contains(needle))
        .and_then(|l| l.rsplit(' ').next())
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("no lora snapshot matching {needle}"))
}

#[tokio::test]
async fn lora_gauges_follow_request_lifecycle() {
    let mut cfg = base_config();
    cfg.time_to_first_token = 1500;
    cfg.lora_modules = vec![
        LoraModule {
            name: "lora1".into(),
            path: "/adapters/lora1".into(),
            base_model_name: None,
        },
        LoraModule {
            name: "lora2".into(),
            path: "/adapters/lora2".into(),
            base_model_name: None,
        },
    ];
    let base = serve(cfg).await;
    let client = reqwest::Client::new();

    let post = |model: &str| {
        let client = client.clone();
        let url = format!("{base}/v1/chat/completions");
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hello"}]
        });
        async move { client.post(url).json(&body).send().await.unwrap() }
    };

    let first = tokio::spawn(post("lora1"));
    let during_first = scrape_until(&base, r#"running_lora_adapters="lora1""#).await;
    let t_lora1 = lora_timestamp(&during_first, r#"running_lora_adapters="lora1""#);
    assert_eq!(first.await.unwrap().status(), 200);

    let second = tokio::spawn(post("lora2"));
    let during_second = scrape_until(&base, r#"running_lora_adapters="lora2""#).await;
    let t_lora2 = lora_timestamp(&during_second, r#"running_lora_adapters="lora2""#);
    assert_eq!(second.await.unwrap().status(), 200);

    assert!(t_lora1 <= t_lora2, "lora1 ran at {t_lora1}, lora2 at {t_lora2}");

    // After both finish the latest snapshot has empty adapter lists. Give
    // the updater a beat to drain the final done transition.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let empty_labels = r#"running_lora_adapters="",waiting_lora_adapters="""#;
    let settled = scrape_until(&base, empty_labels).await;
    let t_empty = lora_timestamp(&settled, empty_labels);
    assert!(t_lora2 <= t_empty, "lora2 ran at {t_lora2}, settled at {t_empty}");
}

#[tokio::test]
async fn identical_seeds_give_identical_responses() {
    let mut texts: Vec<String> = Vec::new();
    for _ in 0..8 {
        let mut cfg = base_config();
        cfg.mode = Mode::Random;
        let base = serve(cfg).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/v1/completions"))
            .json(&serde_json::json!({
                "model": "my_model",
                "prompt": "Write me a story",
                "max_tokens": 10
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json: serde_json::Value = resp.json().await.unwrap();
        texts.push(json["choices"][0]["text"].as_str().unwrap().to_string());
    }
    for text in &texts[1..] {
        assert_eq!(text, &texts[0], "seeded responses diverged");
    }
}

#[tokio::test]
async fn streaming_chat_emits_sse_chunks() {
    let base = serve(base_config()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "my_model",
            "messages": [{"role": "user", "content": "one two three"}],
            "stream": true,
            "stream_options": {"include_usage": true}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    let datas: Vec<&str> = body
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();
    assert_eq!(*datas.last().unwrap(), "[DONE]");

    let chunks: Vec<serde_json::Value> = datas[..datas.len() - 1]
        .iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    let mut content = String::new();
    let mut saw_stop = false;
    let mut saw_usage = false;
    for chunk in &chunks {
        assert_eq!(chunk["object"], "chat.completion.chunk");
        if let Some(delta) = chunk["choices"][0]["delta"]["content"].as_str() {
            content.push_str(delta);
        }
        if chunk["choices"][0]["finish_reason"] == "stop" {
            saw_stop = true;
        }
        if chunk["usage"].is_object() {
            assert!(chunk["choices"].as_array().unwrap().is_empty());
            assert_eq!(
                chunk["usage"]["total_tokens"],
                chunk["usage"]["prompt_tokens"].as_u64().unwrap()
                    + chunk["usage"]["completion_tokens"].as_u64().unwrap()
            );
            saw_usage = true;
        }
    }
    assert_eq!(content, "one two three");
    assert!(saw_stop, "missing trailing stop chunk");
    assert!(saw_usage, "missing usage chunk");
}

#[tokio::test]
async fn models_lists_aliases_then_adapters() {
    let mut cfg = base_config();
    cfg.served_model_name = vec!["alias-a".into(), "alias-b".into()];
    cfg.lora_modules = vec![
        LoraModule {
            name: "lora1".into(),
            path: "/adapters/lora1".into(),
            base_model_name: None,
        },
        LoraModule {
            name: "lora2".into(),
            path: "/adapters/lora2".into(),
            base_model_name: None,
        },
    ];
    let base = serve(cfg).await;
    let json: serde_json::Value = reqwest::get(format!("{base}/v1/models"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["object"], "list");
    let data = json["data"].as_array().unwrap();
    let ids: Vec<&str> = data.iter().map(|m| m["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["alias-a", "alias-b", "lora1", "lora2"]);
    assert!(data[0]["parent"].is_null());
    assert!(data[1]["parent"].is_null());
    assert_eq!(data[2]["parent"], "alias-a");
    assert_eq!(data[3]["parent"], "alias-a");
    assert_eq!(data[0]["owned_by"], "vllm");
}

#[tokio::test]
async fn lora_adapters_load_and_unload_via_api() {
    let base = serve(base_config()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "lora9",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{base}/v1/load_lora_adapter"))
        .json(&serde_json::json!({"lora_name": "lora9", "lora_path": "/adapters/lora9"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "lora9",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    // The adapter's explicit name is surfaced, not the base alias.
    assert_eq!(json["model"], "lora9");

    let resp = client
        .post(format!("{base}/v1/unload_lora_adapter"))
        .json(&serde_json::json!({"lora_name": "lora9", "lora_path": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "lora9",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn tokenize_reports_count_and_limit() {
    let mut cfg = base_config();
    cfg.max_model_len = 2048;
    let base = serve(cfg).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/tokenize"))
        .json(&serde_json::json!({"prompt": "This is a test."}))
        .send()
        .await
        .unwrap();
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["count"], 4);
    assert_eq!(json["max_model_len"], 2048);
    assert_eq!(json["tokens"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn validation_rejects_bad_parameters() {
    let base = serve(base_config()).await;
    let client = reqwest::Client::new();

    // Unknown model.
    let resp = client
        .post(format!("{base}/v1/completions"))
        .json(&serde_json::json!({"model": "ghost", "prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Non-positive max_completion_tokens.
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "my_model",
            "messages": [{"role": "user", "content": "hi"}],
            "max_completion_tokens": 0
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Remote decode cannot stream.
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "my_model",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "do_remote_decode": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // ignore_eos without a max-tokens cap.
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "my_model",
            "messages": [{"role": "user", "content": "hi"}],
            "ignore_eos": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn remote_decode_returns_sentinel_envelope() {
    let base = serve(base_config()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/completions"))
        .json(&serde_json::json!({
            "model": "my_model",
            "prompt": "prefill this",
            "do_remote_decode": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["choices"][0]["finish_reason"], "remote_decode");
    assert_eq!(json["remote_engine_id"], "remote-engine");
    assert_eq!(json["remote_host"], "remote-host");
    assert_eq!(json["remote_port"], 1234);
}

#[tokio::test]
async fn tool_calls_are_synthesized_for_required_choice() {
    let mut cfg = base_config();
    cfg.mode = Mode::Random;
    let base = serve(cfg).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "my_model",
            "messages": [{"role": "user", "content": "What is the weather in Paris?"}],
            "tool_choice": "required",
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Get the weather for a city",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "city": {"type": "string"},
                            "unit": {"type": "string", "enum": ["celsius", "fahrenheit"]}
                        },
                        "required": ["city"]
                    }
                }
            }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["choices"][0]["finish_reason"], "tool_calls");
    let calls = json["choices"][0]["message"]["tool_calls"].as_array().unwrap();
    assert!(!calls.is_empty());
    for call in calls {
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "get_weather");
        let args: serde_json::Value =
            serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        assert!(args["city"].is_string());
    }
    assert!(json["choices"][0]["message"]["content"].is_null());
}

#[tokio::test]
async fn response_headers_carry_pod_identity() {
    let mut cfg = base_config();
    cfg.pod_name = Some("sim-pod-0".into());
    cfg.pod_namespace = Some("inference".into());
    let base = serve(cfg).await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-inference-pod"], "sim-pod-0");
    assert_eq!(resp.headers()["x-inference-namespace"], "inference");
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json, serde_json::json!({}));
}
