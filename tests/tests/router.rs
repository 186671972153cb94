use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kiln_foundation::{EngineSet, LoadOptions};
use kiln_kernel::engine::{FinishReason, GenerationConfig};
use kiln_kernel::hardware::{HardwareProfile, HardwareSample, PowerSource};
use kiln_kernel::{ComputeBackend, RuntimeError};
use kiln_runtime::{Runtime, RuntimeConfig};
use kiln_testing::fixtures::write_gguf;
use kiln_testing::{GIB, GatedEngine, apple_silicon_profile, assert_runtime_err, scripted_runtime};

async fn gated_runtime(engine: &GatedEngine, dir: &std::path::Path) -> Runtime {
    let (runtime, _script) = scripted_runtime(
        HardwareProfile::cpu_only(4, 8 * GIB),
        EngineSet::new().with_engine(Arc::new(engine.clone())),
        RuntimeConfig::default(),
    );
    let path = write_gguf(dir, "gated.gguf", 1 << 20).unwrap();
    let handle = runtime.registry().load(&path, LoadOptions::new()).await.unwrap();
    assert_eq!(handle.backend(), ComputeBackend::Cpu);
    runtime
}

#[tokio::test]
async fn concurrent_fail_fast_generation_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let engine = GatedEngine::new(ComputeBackend::Cpu)
        .gated()
        .with_response("first answer");
    let runtime = gated_runtime(&engine, dir.path()).await;

    let router = runtime.router().clone();
    let first = tokio::spawn(async move { router.generate("gated", "one", GenerationConfig::default()).await });
    engine.counters().wait_started(1).await;

    let second = runtime
        .router()
        .generate("gated", "two", GenerationConfig::default())
        .await;
    assert_runtime_err!(second, RuntimeError::InferenceBusy { .. });
    let err = second.unwrap_err();
    assert_eq!(err.status_hint(), 429);
    assert!(err.is_retryable());
    assert_eq!(engine.counters().started(), 1);

    engine.open(1);
    let result = first.await.unwrap().unwrap();
    assert_eq!(result.text, "first answer");
    assert_eq!(result.tokens_generated, 2);

    // Lock is free again once the first generation returned.
    engine.open(1);
    runtime
        .router()
        .generate("gated", "three", GenerationConfig::default())
        .await
        .unwrap();
    assert_eq!(engine.counters().finished(), 2);
}

#[tokio::test]
async fn waiting_generation_runs_after_the_holder_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = GatedEngine::new(ComputeBackend::Cpu).gated();
    let runtime = gated_runtime(&engine, dir.path()).await;

    let router = runtime.router().clone();
    let first = tokio::spawn(async move { router.generate("gated", "one", GenerationConfig::default()).await });
    engine.counters().wait_started(1).await;

    let router = runtime.router().clone();
    let second = tokio::spawn(async move {
        router
            .generate("gated", "two", GenerationConfig::default().waiting(Duration::from_secs(5)))
            .await
    });
    engine.open(2);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(engine.counters().started(), 2);
}

#[tokio::test]
async fn waiting_generation_fails_once_its_model_is_unloaded() {
    let dir = tempfile::tempdir().unwrap();
    let engine = GatedEngine::new(ComputeBackend::Cpu).gated();
    let runtime = gated_runtime(&engine, dir.path()).await;

    let router = runtime.router().clone();
    let holder = tokio::spawn(async move { router.generate("gated", "one", GenerationConfig::default()).await });
    engine.counters().wait_started(1).await;

    // The forced unload queues on the model lock ahead of the waiter.
    let registry = runtime.registry().clone();
    let unload = tokio::spawn(async move { registry.unload("gated", true).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let router = runtime.router().clone();
    let waiter = tokio::spawn(async move {
        router
            .generate("gated", "two", GenerationConfig::default().waiting(Duration::from_secs(5)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    engine.open(2);
    holder.await.unwrap().unwrap();
    unload.await.unwrap().unwrap();
    assert_runtime_err!(waiter.await.unwrap(), RuntimeError::ModelNotFound(_));
    assert!(!runtime.registry().contains("gated"));
    assert_eq!(engine.counters().releases(), 1);
    assert_eq!(engine.counters().started(), 1);
}

#[tokio::test]
async fn waiting_generation_follows_a_reload() {
    let dir = tempfile::tempdir().unwrap();
    let engine = GatedEngine::new(ComputeBackend::Cpu).gated();
    let runtime = gated_runtime(&engine, dir.path()).await;
    let original = runtime.registry().get("gated").unwrap();

    let router = runtime.router().clone();
    let holder = tokio::spawn(async move { router.generate("gated", "one", GenerationConfig::default()).await });
    engine.counters().wait_started(1).await;

    let registry = runtime.registry().clone();
    let path = original.descriptor().path.clone();
    let reload = tokio::spawn(async move { registry.load(&path, LoadOptions::new().force_reload()).await });
    // The reload queues on the old instance's lock right after binding the new one.
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.counters().loads() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("reload never reached the engine");
    let router = runtime.router().clone();
    let waiter = tokio::spawn(async move {
        router
            .generate("gated", "two", GenerationConfig::default().waiting(Duration::from_secs(5)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    engine.open(2);
    holder.await.unwrap().unwrap();
    let reloaded = reload.await.unwrap().unwrap();
    waiter.await.unwrap().unwrap();
    assert!(!reloaded.same_as(&original));
    assert_eq!(reloaded.access_count(), 1);
    assert_eq!(original.access_count(), 1);
    assert_eq!(engine.counters().started(), 2);
}

#[tokio::test]
async fn tiny_model_generates_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "tiny-model.gguf", 100 * 1024 * 1024).unwrap();
    let (runtime, _script) = scripted_runtime(
        apple_silicon_profile(),
        EngineSet::reference(None),
        RuntimeConfig::default(),
    );
    runtime.registry().load(&path, LoadOptions::new()).await.unwrap();

    let result = runtime
        .router()
        .generate("tiny-model", "Hello", GenerationConfig::default().with_max_tokens(16))
        .await
        .unwrap();
    assert_eq!(result.model_id, "tiny-model");
    assert!(result.tokens_generated > 0);
    assert!(result.tokens_generated <= 16);
    assert!(!result.text.is_empty());
    assert!(result.backend.is_concrete());
    assert!(runtime.registry().get("tiny-model").unwrap().access_count() >= 1);
}

#[tokio::test]
async fn cancelled_stream_releases_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let engine = GatedEngine::new(ComputeBackend::Cpu)
        .gated()
        .with_response("one two three four");
    let runtime = gated_runtime(&engine, dir.path()).await;

    engine.open(1);
    let mut stream = runtime
        .router()
        .generate_stream("gated", "count", GenerationConfig::default())
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.text, "one");

    assert_runtime_err!(
        runtime
            .router()
            .generate("gated", "again", GenerationConfig::default())
            .await,
        RuntimeError::InferenceBusy { .. }
    );

    stream.cancel();
    let mut last = None;
    while let Some(item) = stream.next().await {
        last = Some(item.unwrap());
    }
    let last = last.unwrap();
    assert_eq!(last.finish_reason, Some(FinishReason::Cancelled));

    engine.open(1);
    runtime
        .router()
        .generate("gated", "again", GenerationConfig::default().waiting(Duration::from_secs(5)))
        .await
        .unwrap();
}

#[tokio::test]
async fn dropped_stream_releases_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let engine = GatedEngine::new(ComputeBackend::Cpu)
        .gated()
        .with_response("a b c");
    let runtime = gated_runtime(&engine, dir.path()).await;

    let stream = runtime
        .router()
        .generate_stream("gated", "letters", GenerationConfig::default())
        .await
        .unwrap();
    drop(stream);

    engine.open(1);
    let result = runtime
        .router()
        .generate("gated", "again", GenerationConfig::default().waiting(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.text, "a b c");
}

#[tokio::test]
async fn low_battery_caps_unbounded_generations() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "capped.gguf", 1 << 20).unwrap();
    let mut config = RuntimeConfig::default();
    config.router.power_saving_max_tokens = 8;
    let (runtime, _script) = scripted_runtime(apple_silicon_profile(), EngineSet::reference(None), config);
    runtime.registry().load(&path, LoadOptions::new()).await.unwrap();

    runtime
        .monitor()
        .ingest(HardwareSample::new().with_power(PowerSource::LowBattery));
    assert!(runtime.router().advisory().is_active());

    let capped = runtime
        .router()
        .generate("capped", "Hello", GenerationConfig::default())
        .await
        .unwrap();
    assert_eq!(capped.tokens_generated, 8);
    assert_eq!(capped.finish_reason, FinishReason::Length);

    // Explicit limits are left alone.
    let explicit = runtime
        .router()
        .generate("capped", "Hello", GenerationConfig::default().with_max_tokens(12))
        .await
        .unwrap();
    assert_eq!(explicit.tokens_generated, 12);

    runtime
        .monitor()
        .ingest(HardwareSample::new().with_power(PowerSource::Ac));
    assert!(!runtime.router().advisory().is_active());
}

#[tokio::test]
async fn chat_completion_reports_usage() {
    use kiln_foundation::router::ChatResponse;
    use kiln_kernel::chat::ChatMessage;

    let dir = tempfile::tempdir().unwrap();
    let engine = GatedEngine::new(ComputeBackend::Cpu).with_response("hi there friend");
    let runtime = gated_runtime(&engine, dir.path()).await;
    let messages = [ChatMessage::system("be brief"), ChatMessage::user("say hi")];

    let completion = runtime
        .router()
        .chat_completion("gated", &messages, GenerationConfig::default(), false)
        .await
        .unwrap()
        .into_completion()
        .unwrap();
    assert_eq!(completion.message.content, "hi there friend");
    assert_eq!(completion.usage.completion_tokens, 3);
    assert!(completion.usage.prompt_tokens > 0);

    let ChatResponse::Stream(mut stream) = runtime
        .router()
        .chat_completion("gated", &messages, GenerationConfig::default(), true)
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };
    let mut text = String::new();
    let mut usage = None;
    while let Some(delta) = stream.next().await {
        let delta = delta.unwrap();
        text.push_str(&delta.content);
        if delta.usage.is_some() {
            usage = delta.usage;
        }
    }
    assert_eq!(text, "hi there friend");
    assert_eq!(usage.unwrap().completion_tokens, 3);
}
