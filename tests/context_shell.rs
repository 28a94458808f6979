//! Integration tests for the runtime shell: configuration rules, exit
//! codes and clean shutdown through the public API.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use umbra::{Config, ConfigError, Context, RuntimeOptions, Signal};

static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("umbra-shell-{}-{}", std::process::id(), n))
}

fn test_config() -> Config {
    Config {
        bind: "127.0.0.1:0".parse().unwrap(),
        data_dir: test_dir(),
        ..Config::default()
    }
}

#[tokio::test]
async fn configure_twice_is_rejected() {
    let mut context = Context::new();
    assert!(context.configure(test_config()).is_ok());
    assert_eq!(
        context.configure(test_config()),
        Err(ConfigError::AlreadyConfigured)
    );
}

#[tokio::test]
async fn setup_requires_configuration() {
    let mut context = Context::new();
    let err = context
        .setup(&RuntimeOptions::default())
        .await
        .expect_err("setup without configure must fail");
    assert!(err.to_string().contains("no config"));
}

#[tokio::test]
async fn run_without_setup_returns_one() {
    let mut context = Context::new();
    assert_eq!(context.run().await, 1);
}

#[tokio::test]
async fn clean_stop_returns_zero() {
    let mut context = Context::new();
    context.configure(test_config()).unwrap();
    context
        .setup(&RuntimeOptions::default())
        .await
        .expect("router starts");
    assert!(context.is_up());

    context.close_async();
    let code = tokio::time::timeout(Duration::from_secs(10), context.run())
        .await
        .expect("run returns after close");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn interrupt_signal_stops_the_router() {
    let mut context = Context::new();
    context.configure(test_config()).unwrap();
    context
        .setup(&RuntimeOptions::default())
        .await
        .expect("router starts");

    // HUP is a reload placeholder and must not stop anything.
    context.handle_signal(Signal::Hangup);
    assert!(context.is_up());

    context.handle_signal(Signal::Interrupt);
    let code = tokio::time::timeout(Duration::from_secs(10), context.run())
        .await
        .expect("run returns after interrupt");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn name_lookup_without_paths_resolves_none() {
    let mut context = Context::new();
    context.configure(test_config()).unwrap();
    context
        .setup(&RuntimeOptions::default())
        .await
        .expect("router starts");
    let router = context.router().cloned().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    router.resolve_ons(
        "alice.loki".to_string(),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback fires")
        .expect("sender not dropped");
    assert!(result.is_none(), "a fresh node has no paths to query over");

    context.close_async();
    let _ = tokio::time::timeout(Duration::from_secs(10), context.run()).await;
}

#[tokio::test]
async fn invalid_configuration_is_fatal_at_configure() {
    let mut context = Context::new();
    let mut config = test_config();
    config.num_lookup_paths = 0;
    assert!(matches!(
        context.configure(config),
        Err(ConfigError::Invalid(_))
    ));
    assert!(!context.is_configured());
}
