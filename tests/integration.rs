use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use push_rpc::{
    //
    interceptor,
    ConnectionState,
    MemoryConnector,
    Next,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    RpcServer,
    ServicesBuilder,
    ThrottleSettings,
};

/// Tight timings so life cycle tests finish quickly.
fn test_config() -> RpcConfig {
    RpcConfig::default()
        .with_call_timeout(Duration::from_secs(5))
        .with_sweep_interval(Duration::from_millis(25))
        .with_reconnect_delay(Duration::from_millis(50))
        .with_max_error_delay(Duration::from_millis(100))
}

struct TestServer {
    // ---
    server: RpcServer,
    executions: Arc<AtomicU32>,
}

impl TestServer {
    fn new(config: RpcConfig) -> Self {
        // ---
        let executions = Arc::new(AtomicU32::new(0));
        let exec = executions.clone();

        let services = ServicesBuilder::new()
            .scope("math", |s| {
                s.item("add", |req: (i64, i64)| async move { Ok(req.0 + req.1) })
            })
            .item("status", |_filter: Value| async move { Ok(json!({"r": "1"})) })
            .item("todo/list", |filter: Value| async move {
                Ok(json!({"for": filter}))
            })
            .item("slow/echo", |req: Value| async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(req)
            })
            .item("counter/value", move |_req: Value| {
                let exec = exec.clone();
                async move {
                    exec.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("counted"))
                }
            })
            .item("fail/supply", |_filter: Value| async move {
                Err::<Value, _>(RpcError::Application {
                    code: 422,
                    message: "supply failed".into(),
                    details: Some(json!({"hint": "bad filter"})),
                })
            });

        let server = RpcServer::builder()
            .services(services)
            .config(config)
            .build();

        Self { server, executions }
    }

    async fn client(&self, config: RpcConfig) -> Result<RpcClient> {
        // ---
        RpcClient::connect(Arc::new(MemoryConnector::new(&self.server)), config).await
    }
}

/// Subscribe and funnel pushed values into a channel.
async fn subscribe_to_channel(
    client: &RpcClient,
    item: &str,
    filter: Value,
) -> Result<(push_rpc::SubscriptionHandle, mpsc::UnboundedReceiver<Value>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = client
        .item(item)
        .subscribe(filter, move |value| {
            let _ = tx.send(value);
        })
        .await?;
    Ok((handle, rx))
}

async fn recv_within(rx: &mut mpsc::UnboundedReceiver<Value>, window: Duration) -> Value {
    timeout(window, rx.recv())
        .await
        .expect("no update within window")
        .expect("subscription channel closed")
}

#[tokio::test]
async fn test_basic_call() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let sum: i64 = client.item("math/add").call((2, 3)).await?;
    assert_eq!(sum, 5);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_item_is_not_found() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let err = client
        .item("no/such/item")
        .call::<_, Value>(())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotFound(_)), "got {err:?}");

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_application_error_fields_preserved() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let err = client
        .item("fail/supply")
        .call::<_, Value>(())
        .await
        .unwrap_err();

    match err {
        RpcError::Application {
            code,
            message,
            details,
        } => {
            assert_eq!(code, 422);
            assert_eq!(message, "supply failed");
            assert_eq!(details, Some(json!({"hint": "bad filter"})));
        }
        other => panic!("expected application error, got {other:?}"),
    }

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_identical_calls_coalesce() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.item("counter/value").call::<_, Value>(json!("same")).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap()?, json!("counted"));
    }

    // All five in-flight calls shared one execution.
    assert_eq!(fixture.executions.load(Ordering::SeqCst), 1);

    // After settlement a new call re-executes.
    let _: Value = client.item("counter/value").call(json!("same")).await?;
    assert_eq!(fixture.executions.load(Ordering::SeqCst), 2);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_subscribe_receives_initial_and_triggered_values() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let (handle, mut rx) = subscribe_to_channel(&client, "status", Value::Null).await?;
    assert_eq!(
        recv_within(&mut rx, Duration::from_millis(500)).await,
        json!({"r": "1"})
    );

    fixture
        .server
        .item("status")?
        .trigger(None, Some(json!({"r": "2"})))
        .await;
    assert_eq!(
        recv_within(&mut rx, Duration::from_millis(500)).await,
        json!({"r": "2"})
    );

    handle.unsubscribe().await;
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_trigger_without_data_reinvokes_supplier() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let filter = json!({"user": "u1"});
    let (_handle, mut rx) = subscribe_to_channel(&client, "todo/list", filter.clone()).await?;
    assert_eq!(
        recv_within(&mut rx, Duration::from_millis(500)).await,
        json!({"for": {"user": "u1"}})
    );

    // No data supplied: the supplier runs again with the subscription's
    // filter.
    fixture.server.item("todo/list")?.trigger(None, None).await;
    assert_eq!(
        recv_within(&mut rx, Duration::from_millis(500)).await,
        json!({"for": {"user": "u1"}})
    );

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_initial_supply_leaves_nothing_registered() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let err = client
        .item("fail/supply")
        .subscribe(Value::Null, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Application { code: 422, .. }));

    // Server side holds no subscription entry.
    assert!(!fixture.server.item("fail/supply")?.is_subscribed(&Value::Null));

    // Client side holds no consumer entry either: a second subscribe is
    // again the first for the entry, so it reaches the wire and fails the
    // same way (a leaked entry would short-circuit to success).
    let err = client
        .item("fail/supply")
        .subscribe(Value::Null, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Application { code: 422, .. }));

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_trigger_filter_narrowing() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let (_h1, mut rx_u1) =
        subscribe_to_channel(&client, "todo/list", json!({"user": "u1"})).await?;
    let (_h2, mut rx_u2) =
        subscribe_to_channel(&client, "todo/list", json!({"user": "u2"})).await?;
    let (_h3, mut rx_all) = subscribe_to_channel(&client, "todo/list", Value::Null).await?;

    // Drain initial values.
    recv_within(&mut rx_u1, Duration::from_millis(500)).await;
    recv_within(&mut rx_u2, Duration::from_millis(500)).await;
    recv_within(&mut rx_all, Duration::from_millis(500)).await;

    let item = fixture.server.item("todo/list")?;

    // Narrowed trigger: only the matching filter and the wildcard react.
    item.trigger(Some(json!({"user": "u1"})), Some(json!("narrow")))
        .await;
    assert_eq!(
        recv_within(&mut rx_u1, Duration::from_millis(500)).await,
        json!("narrow")
    );
    assert_eq!(
        recv_within(&mut rx_all, Duration::from_millis(500)).await,
        json!("narrow")
    );
    assert!(
        timeout(Duration::from_millis(200), rx_u2.recv()).await.is_err(),
        "u2 must not receive a narrowed trigger for u1"
    );

    // Broadcast reaches everyone.
    item.trigger(None, Some(json!("broadcast"))).await;
    assert_eq!(
        recv_within(&mut rx_u1, Duration::from_millis(500)).await,
        json!("broadcast")
    );
    assert_eq!(
        recv_within(&mut rx_u2, Duration::from_millis(500)).await,
        json!("broadcast")
    );
    assert_eq!(
        recv_within(&mut rx_all, Duration::from_millis(500)).await,
        json!("broadcast")
    );

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_unsubscribe_prunes_only_that_entry() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let (h1, _rx1) = subscribe_to_channel(&client, "todo/list", json!({"user": "u1"})).await?;
    let (_h2, _rx2) = subscribe_to_channel(&client, "todo/list", json!({"user": "u2"})).await?;

    let item = fixture.server.item("todo/list")?;
    assert_eq!(item.subscription_count(), 2);

    h1.unsubscribe().await;

    assert!(!item.is_subscribed(&json!({"user": "u1"})));
    // The sibling filter on the same item is unaffected.
    assert!(item.is_subscribed(&json!({"user": "u2"})));

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_consumers_share_one_wire_subscription() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let (h1, mut rx1) = subscribe_to_channel(&client, "status", Value::Null).await?;
    recv_within(&mut rx1, Duration::from_millis(500)).await;

    // Second consumer joins the existing entry and sees the cached value
    // synchronously.
    let (h2, mut rx2) = subscribe_to_channel(&client, "status", Value::Null).await?;
    assert_eq!(
        recv_within(&mut rx2, Duration::from_millis(500)).await,
        json!({"r": "1"})
    );

    // One server-side entry serves both consumers.
    let item = fixture.server.item("status")?;
    assert_eq!(item.subscription_count(), 1);

    item.trigger(None, Some(json!({"r": "2"}))).await;
    assert_eq!(
        recv_within(&mut rx1, Duration::from_millis(500)).await,
        json!({"r": "2"})
    );
    assert_eq!(
        recv_within(&mut rx2, Duration::from_millis(500)).await,
        json!({"r": "2"})
    );

    // The wire subscription survives until the last consumer leaves.
    h1.unsubscribe().await;
    assert!(item.is_subscribed(&Value::Null));
    h2.unsubscribe().await;
    assert!(!item.is_subscribed(&Value::Null));

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_reconnect_resubscribes_automatically() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let (_handle, mut rx) = subscribe_to_channel(&client, "status", Value::Null).await?;
    recv_within(&mut rx, Duration::from_millis(500)).await;

    let mut states = client.state_changes();

    // Force-drop every connection server-side.
    fixture.server.disconnect_all().await;

    // The client notices, reconnects and resubscribes on its own.
    timeout(Duration::from_secs(5), async {
        loop {
            states.changed().await.expect("state channel closed");
            if *states.borrow() == ConnectionState::Connected {
                break;
            }
        }
    })
    .await
    .expect("client did not reconnect");

    // The resubscribe replays the supplied value to existing consumers.
    assert_eq!(
        recv_within(&mut rx, Duration::from_secs(2)).await,
        json!({"r": "1"})
    );

    // And subsequent triggers flow without any caller-side re-subscribe.
    fixture
        .server
        .item("status")?
        .trigger(None, Some(json!({"r": "after"})))
        .await;
    assert_eq!(
        recv_within(&mut rx, Duration::from_secs(2)).await,
        json!({"r": "after"})
    );

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_call_timeout_rejects_via_sweep() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture
        .client(
            test_config()
                .with_call_timeout(Duration::from_millis(200))
                .with_sweep_interval(Duration::from_millis(50)),
        )
        .await?;

    let started = Instant::now();
    let err = client
        .item("slow/echo")
        .call::<_, Value>(json!("x"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::Timeout), "got {err:?}");
    // Rejected by the sweep, well before the 400ms handler finishes.
    assert!(
        elapsed < Duration::from_millis(390),
        "timed out too late: {elapsed:?}"
    );

    // No dangling pending call: the session keeps working.
    let sum: i64 = client.item("math/add").call((1, 1)).await?;
    assert_eq!(sum, 2);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_throttled_triggers_coalesce() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let item = fixture.server.item("status")?;
    item.throttle(ThrottleSettings::new(Duration::from_millis(150)));

    let (_handle, mut rx) = subscribe_to_channel(&client, "status", Value::Null).await?;
    recv_within(&mut rx, Duration::from_millis(500)).await;

    // Both triggers land inside the window opened by the subscribe: one
    // merged update is flushed, carrying the most recent value.
    item.trigger(None, Some(json!(1))).await;
    item.trigger(None, Some(json!(2))).await;

    assert_eq!(recv_within(&mut rx, Duration::from_secs(1)).await, json!(2));
    assert!(
        timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "coalesced triggers must deliver exactly once"
    );

    // Past the window: delivery is immediate.
    tokio::time::sleep(Duration::from_millis(200)).await;
    item.trigger(None, Some(json!(3))).await;
    assert_eq!(
        recv_within(&mut rx, Duration::from_millis(500)).await,
        json!(3)
    );

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_sync_remote_calls_dispatch_fifo() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture
        .client(test_config().with_sync_remote_calls(true))
        .await?;

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            let _: Value = client.item("slow/echo").call(json!("first")).await.unwrap();
            Instant::now()
        })
    };
    // Let the slow call take the FIFO gate first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = {
        let client = client.clone();
        tokio::spawn(async move {
            let sum: i64 = client.item("math/add").call((1, 2)).await.unwrap();
            assert_eq!(sum, 3);
            Instant::now()
        })
    };

    let slow_done = slow.await.unwrap();
    let fast_done = fast.await.unwrap();
    // The fast call could not dispatch until the slow call's response was
    // observed.
    assert!(fast_done > slow_done);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_get_fetches_without_subscribing() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let value: Value = client.item("todo/list").get(json!({"user": "u9"})).await?;
    assert_eq!(value, json!({"for": {"user": "u9"}}));

    assert_eq!(fixture.server.item("todo/list")?.subscription_count(), 0);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_middleware_and_connection_context() -> Result<()> {
    // ---
    let services = ServicesBuilder::new()
        .item("add", |req: (i64, i64)| async move { Ok(req.0 + req.1) })
        .item_with_ctx("whoami", |_req: Value, ctx: Value| async move { Ok(ctx) });

    let bump = interceptor(|_ctx, next: Next, params: Vec<Value>| async move {
        let bumped = params
            .into_iter()
            .map(|v| match v.as_i64() {
                Some(n) => json!(n + 1),
                None => v,
            })
            .collect();
        next.run(Some(bumped)).await
    });

    let server = RpcServer::builder()
        .services(services)
        .middleware(bump)
        .context_factory(|meta| json!({"via": meta.transport_id}))
        .config(test_config())
        .build();

    let client =
        RpcClient::connect(Arc::new(MemoryConnector::new(&server)), test_config()).await?;

    // (2, 3) passes through the interceptor as (3, 4).
    let sum: i64 = client.item("add").call((2, 3)).await?;
    assert_eq!(sum, 7);

    let ctx: Value = client.item("whoami").call(()).await?;
    assert_eq!(ctx, json!({"via": "memory/b"}));

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_subscription_listeners_fire() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    let item = fixture.server.item("status")?;
    let subscribes = Arc::new(AtomicU32::new(0));
    let unsubscribes = Arc::new(AtomicU32::new(0));
    {
        let subscribes = subscribes.clone();
        item.on_subscribe(move |_, _| {
            subscribes.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let unsubscribes = unsubscribes.clone();
        item.on_unsubscribe(move |_, _| {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (handle, _rx) = subscribe_to_channel(&client, "status", Value::Null).await?;
    assert_eq!(subscribes.load(Ordering::SeqCst), 1);

    handle.unsubscribe().await;
    assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_close_suppresses_reconnection() -> Result<()> {
    // ---
    let fixture = TestServer::new(test_config());
    let client = fixture.client(test_config()).await?;

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.item("math/add").call::<_, i64>((1, 1)).await.unwrap_err();
    assert!(matches!(err, RpcError::Disconnected), "got {err:?}");

    // Give a would-be reconnect loop ample time, then confirm it never ran.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(fixture.server.session_count(), 0);

    Ok(())
}
