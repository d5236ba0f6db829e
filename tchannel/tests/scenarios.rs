//! End-to-end scenarios over real loopback TCP sockets (SPEC_FULL.md §8).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tchannel::call::{CallOptions, RetryPolicy};
use tchannel::runtime::{CallMeta, Runtime, TypedOutcome};
use tchannel::scheme::raw::RawScheme;
use tchannel::{CallArgs, CallError, ErrorCode, ResponseCode};

async fn start_echo_server() -> (Arc<Runtime>, std::net::SocketAddr) {
    let runtime = Runtime::new("echo-service", Some("127.0.0.1:0".to_string()), []);
    runtime.register::<RawScheme, _, _>("echo", |_headers, body, _meta: CallMeta| async move {
        TypedOutcome::Ok { headers: Bytes::new(), body }
    });
    let addr = runtime.listen().await.unwrap();
    (runtime, addr)
}

#[tokio::test]
async fn echo_call_round_trips() {
    let (server, addr) = start_echo_server().await;
    let client = Runtime::new("client", None, []);
    client.add_peer(addr.to_string());

    let (code, _headers, body) = client
        .call::<RawScheme>(
            "echo-service",
            "echo",
            &Bytes::new(),
            &Bytes::from_static(b"hello"),
            CallOptions { hostport: Some(addr.to_string()), ..Default::default() },
        )
        .await
        .unwrap();

    assert_eq!(code, ResponseCode::Ok);
    assert_eq!(body, Bytes::from_static(b"hello"));

    client.close();
    server.close();
}

#[tokio::test]
async fn unknown_endpoint_is_bad_request() {
    let (server, addr) = start_echo_server().await;
    let client = Runtime::new("client", None, []);

    let err = client
        .call::<RawScheme>(
            "echo-service",
            "missing",
            &Bytes::new(),
            &Bytes::new(),
            CallOptions {
                hostport: Some(addr.to_string()),
                retry: RetryPolicy::never(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::BadRequest(_)));

    client.close();
    server.close();
}

#[tokio::test]
async fn deadline_times_out_then_subsequent_call_succeeds() {
    let runtime = Runtime::new("slow-service", Some("127.0.0.1:0".to_string()), []);
    runtime.register::<RawScheme, _, _>("slow", |_headers, body, _meta: CallMeta| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        TypedOutcome::Ok { headers: Bytes::new(), body }
    });
    runtime.register::<RawScheme, _, _>("echo", |_headers, body, _meta: CallMeta| async move {
        TypedOutcome::Ok { headers: Bytes::new(), body }
    });
    let addr = runtime.listen().await.unwrap();
    let client = Runtime::new("client", None, []);

    let err = client
        .call::<RawScheme>(
            "slow-service",
            "slow",
            &Bytes::new(),
            &Bytes::new(),
            CallOptions {
                hostport: Some(addr.to_string()),
                timeout: Duration::from_millis(50),
                retry: RetryPolicy::never(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout));

    // A later call to the same server still succeeds — the timed-out call
    // didn't wedge the connection.
    let (code, _headers, body) = client
        .call::<RawScheme>(
            "slow-service",
            "echo",
            &Bytes::new(),
            &Bytes::from_static(b"still alive"),
            CallOptions { hostport: Some(addr.to_string()), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(code, ResponseCode::Ok);
    assert_eq!(body, Bytes::from_static(b"still alive"));

    client.close();
    runtime.close();
}

#[tokio::test]
async fn large_body_fragments_and_reassembles() {
    let (server, addr) = start_echo_server().await;
    let client = Runtime::new("client", None, []);

    let body = Bytes::from(vec![0x5Au8; 200 * 1024]);
    let (code, _headers, returned) = client
        .call::<RawScheme>(
            "echo-service",
            "echo",
            &Bytes::new(),
            &body,
            CallOptions { hostport: Some(addr.to_string()), ..Default::default() },
        )
        .await
        .unwrap();

    assert_eq!(code, ResponseCode::Ok);
    assert_eq!(returned, body);

    client.close();
    server.close();
}

#[tokio::test]
async fn retry_on_declined_reaches_second_peer() {
    let p1_attempts = Arc::new(AtomicUsize::new(0));
    let p2_attempts = Arc::new(AtomicUsize::new(0));

    let p1 = Runtime::new("svc", Some("127.0.0.1:0".to_string()), []);
    p1.register::<RawScheme, _, _>("warmup", |_h, body, _meta: CallMeta| async move {
        TypedOutcome::Ok { headers: Bytes::new(), body }
    });
    {
        let attempts = p1_attempts.clone();
        p1.register::<RawScheme, _, _>("work", move |_h, _b, _meta: CallMeta| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                TypedOutcome::Rejected { code: ErrorCode::Declined, message: "overloaded".to_string() }
            }
        });
    }
    let addr1 = p1.listen().await.unwrap();

    let p2 = Runtime::new("svc", Some("127.0.0.1:0".to_string()), []);
    {
        let attempts = p2_attempts.clone();
        p2.register::<RawScheme, _, _>("work", move |_h, body, _meta: CallMeta| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                TypedOutcome::Ok { headers: Bytes::new(), body }
            }
        });
    }
    let addr2 = p2.listen().await.unwrap();

    let client = Runtime::new("client", None, [addr1.to_string(), addr2.to_string()]);

    // Warm up a connection to p1 first so peer selection is deterministic:
    // `PeerPool::select`'s score weighs "has a live connection" far more
    // heavily than the jitter term that would otherwise make the first pick
    // between two equally-idle peers a coin flip (tchannel/src/peer.rs).
    // This guarantees the "work" call below hits the declined peer (p1)
    // before the healthy one (p2), actually exercising the retry path.
    client
        .call::<RawScheme>(
            "svc",
            "warmup",
            &Bytes::new(),
            &Bytes::new(),
            CallOptions { hostport: Some(addr1.to_string()), ..Default::default() },
        )
        .await
        .unwrap();

    let (code, _headers, body) = client
        .call::<RawScheme>(
            "svc",
            "work",
            &Bytes::new(),
            &Bytes::from_static(b"payload"),
            CallOptions {
                known_peers: Some(vec![addr1.to_string(), addr2.to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(code, ResponseCode::Ok);
    assert_eq!(body, Bytes::from_static(b"payload"));
    // The warmed-up peer (p1) is selected first, declines, and the driver
    // retries against p2 exactly once each.
    assert_eq!(p1_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(p2_attempts.load(Ordering::SeqCst), 1);

    client.close();
    p1.close();
    p2.close();
}

#[tokio::test]
async fn cancel_resolves_locally_and_connection_stays_usable() {
    let runtime = Runtime::new("slow-service", Some("127.0.0.1:0".to_string()), []);
    runtime.register::<RawScheme, _, _>("slow", |_headers, body, _meta: CallMeta| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        TypedOutcome::Ok { headers: Bytes::new(), body }
    });
    runtime.register::<RawScheme, _, _>("echo", |_headers, body, _meta: CallMeta| async move {
        TypedOutcome::Ok { headers: Bytes::new(), body }
    });
    let addr = runtime.listen().await.unwrap();

    let client = Runtime::new("client", None, []);
    let args = CallArgs {
        arg1: Bytes::from_static(b"slow"),
        arg2: Bytes::new(),
        arg3: Bytes::new(),
    };
    let transport_headers = vec![("cn".to_string(), "client".to_string())];
    let options = CallOptions { hostport: Some(addr.to_string()), ..Default::default() };

    let (handle, rx) = client.driver().call_cancellable("slow-service", args, transport_headers, options).await.unwrap();
    handle.cancel().await.unwrap();
    let result = rx.await.unwrap();
    assert!(matches!(
        result,
        Err(tchannel::ConnectionError::CallFailed { code: tchannel::ErrorCode::Cancelled, .. })
    ));

    // The connection survives the cancel; a fresh call still succeeds.
    let (code, _headers, body) = client
        .call::<RawScheme>(
            "slow-service",
            "echo",
            &Bytes::new(),
            &Bytes::from_static(b"back again"),
            CallOptions { hostport: Some(addr.to_string()), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(code, ResponseCode::Ok);
    assert_eq!(body, Bytes::from_static(b"back again"));

    client.close();
    runtime.close();
}
