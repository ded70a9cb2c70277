//! Socket level scenarios: a router and real clients on the loopback
//! interface, over both transports and all three serializers.

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use rand::RngCore;
use sha2::{Digest, Sha256};

use wampcore::handshake::{connect_transport, join_session};
use wampcore::messages::Message;
use wampcore::router::Router;
use wampcore::{
    CallError, CallOptions, Client, Connection, Invocation, InvocationPolicy, MatchingPolicy,
    Reason, RegisterOptions, SerializerType, Value, URI,
};

const REALM: &str = "test.realm";

fn start_tcp_router() -> (Router, String) {
    let router = Router::new();
    router.add_realm(REALM);
    let (_, addr) = router.listen_tcp("127.0.0.1:0").unwrap();
    (router, format!("tcp://{}", addr))
}

fn start_ws_router() -> (Router, String) {
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let router = Router::new();
    router.add_realm(REALM);
    router.listen_ws(&format!("127.0.0.1:{}", port));
    (router, format!("ws://127.0.0.1:{}", port))
}

fn connect(url: &str) -> Client {
    connect_with(url, None)
}

fn connect_with(url: &str, serializer: Option<SerializerType>) -> Client {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut connection = Connection::new(url, REALM);
        if let Some(serializer) = serializer {
            connection = connection.with_serializers(vec![serializer]);
        }
        match connection.connect() {
            Ok(client) => return client,
            Err(e) => {
                if Instant::now() > deadline {
                    panic!("could not connect to {}: {}", url, e);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn wait_until<F: FnMut() -> bool>(mut condition: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn echo_rpc_round_trip() {
    let (_router, url) = start_tcp_router();

    let mut callee = connect(&url);
    let registration = block_on(callee.register(
        URI::new("io.echo"),
        Box::new(|invocation: Invocation| {
            Ok((Some(invocation.args), Some(invocation.kwargs)))
        }),
    ))
    .unwrap();
    assert_eq!(registration.procedure, URI::new("io.echo"));

    let mut caller = connect(&url);
    let mut kwargs = wampcore::Dict::new();
    kwargs.insert("k".to_string(), Value::String("v".to_string()));
    let (args, kwargs) = block_on(caller.call(
        URI::new("io.echo"),
        Some(vec![
            Value::String("hi".to_string()),
            Value::String("wamp".to_string()),
        ]),
        Some(kwargs),
    ))
    .unwrap();

    assert_eq!(
        args,
        vec![
            Value::String("hi".to_string()),
            Value::String("wamp".to_string())
        ]
    );
    assert_eq!(kwargs.get("k"), Some(&Value::String("v".to_string())));
}

#[test]
fn pubsub_with_acknowledge() {
    let (_router, url) = start_tcp_router();

    let received: Arc<Mutex<Vec<Vec<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let mut subscriber = connect(&url);
    block_on(subscriber.subscribe(
        URI::new("io.t"),
        Box::new(move |event| {
            sink.lock().unwrap().push(event.args);
        }),
    ))
    .unwrap();

    let mut publisher = connect(&url);
    let publication_id = block_on(publisher.publish_and_acknowledge(
        URI::new("io.t"),
        Some(vec![Value::String("h".to_string())]),
        None,
    ))
    .unwrap();
    assert!(publication_id > 0);

    wait_until(|| !received.lock().unwrap().is_empty(), "the event");
    let events = received.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], vec![Value::String("h".to_string())]);
}

#[test]
fn call_to_missing_procedure_fails() {
    let (_router, url) = start_tcp_router();
    let mut caller = connect(&url);

    let error: CallError = block_on(caller.call(URI::new("io.missing"), None, None)).unwrap_err();
    assert_eq!(error.get_reason(), &Reason::NoSuchProcedure);
}

#[test]
fn roundrobin_calls_rotate_through_callees() {
    let (_router, url) = start_tcp_router();

    let mut callees = Vec::new();
    for index in 0..3u64 {
        let mut callee = connect(&url);
        let options = RegisterOptions {
            invocation_policy: InvocationPolicy::RoundRobin,
            ..Default::default()
        };
        block_on(callee.register_with_options(
            URI::new("io.rr"),
            Box::new(move |_invocation| Ok((Some(vec![Value::UnsignedInteger(index)]), None))),
            options,
        ))
        .unwrap();
        callees.push(callee);
    }

    let mut caller = connect(&url);
    let mut counts = [0u32; 3];
    for _ in 0..7 {
        let (args, _) = block_on(caller.call(URI::new("io.rr"), None, None)).unwrap();
        match args[0] {
            Value::UnsignedInteger(index) => counts[index as usize] += 1,
            ref other => panic!("unexpected callee tag {:?}", other),
        }
    }
    assert_eq!(counts, [3, 2, 2]);
}

#[test]
fn callee_disconnect_cancels_the_call() {
    let (_router, url) = start_tcp_router();

    // A bare protocol level callee that registers io.slow and then never
    // answers its invocation.
    let (transport, serializer) =
        connect_transport(&url, &[SerializerType::Cbor]).unwrap();
    let callee = join_session(transport, serializer, REALM, None).unwrap();
    callee
        .send_message(&Message::Register(
            1,
            RegisterOptions::new(),
            URI::new("io.slow"),
        ))
        .unwrap();
    match callee.receive_message().unwrap() {
        Message::Registered(1, _) => {}
        other => panic!("expected Registered, got {:?}", other),
    }

    let mut caller = connect(&url);
    let future = caller.call(URI::new("io.slow"), None, None);
    thread::sleep(Duration::from_millis(100));

    // Drop the callee's transport mid-invocation.
    callee.close();

    let error = block_on(future).unwrap_err();
    assert_eq!(error.get_reason(), &Reason::Canceled);
}

#[test]
fn large_cbor_payloads_round_trip() {
    let (_router, url) = start_tcp_router();

    let mut callee = connect_with(&url, Some(SerializerType::Cbor));
    block_on(callee.register(
        URI::new("io.inv"),
        Box::new(|invocation: Invocation| {
            let payload = match invocation.kwargs.get("payload") {
                Some(Value::String(payload)) => payload.clone(),
                other => {
                    return Err(CallError::new(
                        Reason::InvalidArgument,
                        Some(vec![Value::String(format!("bad payload: {:?}", other))]),
                        None,
                    ))
                }
            };
            let checksum = match invocation.kwargs.get("checksum") {
                Some(Value::String(checksum)) => checksum.clone(),
                _ => return Err(CallError::new(Reason::InvalidArgument, None, None)),
            };
            let digest = hex::encode(Sha256::digest(payload.as_bytes()));
            Ok((Some(vec![Value::Boolean(digest == checksum)]), None))
        }),
    ))
    .unwrap();

    let mut caller = connect_with(&url, Some(SerializerType::Cbor));
    for kib in [1usize, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1023] {
        let mut blob = vec![0u8; kib * 512];
        rand::thread_rng().fill_bytes(&mut blob);
        let payload = hex::encode(&blob); // kib KiB of text
        let checksum = hex::encode(Sha256::digest(payload.as_bytes()));

        let mut kwargs = wampcore::Dict::new();
        kwargs.insert("payload".to_string(), Value::String(payload));
        kwargs.insert("checksum".to_string(), Value::String(checksum));

        let (args, _) = block_on(caller.call(URI::new("io.inv"), None, Some(kwargs))).unwrap();
        assert_eq!(args[0], Value::Boolean(true), "payload of {} KiB", kib);
    }
}

#[test]
fn pattern_subscription_sees_matching_topics() {
    let (_router, url) = start_tcp_router();

    let received: Arc<Mutex<Vec<Option<URI>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let mut subscriber = connect(&url);
    block_on(subscriber.subscribe_with_pattern(
        URI::new("com.x"),
        Box::new(move |event| {
            sink.lock().unwrap().push(event.details.topic);
        }),
        MatchingPolicy::Prefix,
    ))
    .unwrap();

    let mut publisher = connect(&url);
    block_on(publisher.publish_and_acknowledge(URI::new("com.x.y"), None, None)).unwrap();
    block_on(publisher.publish_and_acknowledge(URI::new("com.xy"), None, None)).unwrap();
    block_on(publisher.publish_and_acknowledge(URI::new("com.x.z"), None, None)).unwrap();

    wait_until(|| received.lock().unwrap().len() >= 2, "both events");
    // com.xy must not have matched the com.x prefix.
    let topics = received.lock().unwrap();
    assert_eq!(
        *topics,
        vec![Some(URI::new("com.x.y")), Some(URI::new("com.x.z"))]
    );
}

#[test]
fn leave_is_idempotent() {
    let (_router, url) = start_tcp_router();
    let mut client = connect(&url);

    client.leave().unwrap();
    assert!(!client.is_connected());
    client.leave().unwrap();
}

#[test]
fn transport_ping_measures_latency() {
    let (_router, url) = start_tcp_router();
    let client = connect(&url);

    let latency = client.ping(Duration::from_secs(5)).unwrap();
    assert!(latency >= 0.0);
    assert!(latency < 5000.0);
}

#[test]
fn websocket_round_trip() {
    let (_router, url) = start_ws_router();

    let mut callee = connect(&url);
    block_on(callee.register(
        URI::new("io.add"),
        Box::new(|invocation: Invocation| {
            let mut total = 0i64;
            for value in &invocation.args {
                match value {
                    Value::Integer(n) => total += n,
                    Value::UnsignedInteger(n) => total += *n as i64,
                    other => {
                        return Err(CallError::new(
                            Reason::InvalidArgument,
                            Some(vec![Value::String(format!("not a number: {:?}", other))]),
                            None,
                        ))
                    }
                }
            }
            Ok((Some(vec![Value::Integer(total)]), None))
        }),
    ))
    .unwrap();

    for serializer in [
        SerializerType::Json,
        SerializerType::Cbor,
        SerializerType::MsgPack,
    ] {
        let mut caller = connect_with(&url, Some(serializer));
        let (args, _) = block_on(caller.call(
            URI::new("io.add"),
            Some(vec![Value::Integer(20), Value::Integer(22)]),
            None,
        ))
        .unwrap();
        assert_eq!(args[0], Value::Integer(42), "serializer {:?}", serializer);
    }
}

#[cfg(unix)]
#[test]
fn unix_socket_round_trip() {
    let path = std::env::temp_dir().join(format!("wampcore-test-{}.sock", std::process::id()));
    let router = Router::new();
    router.add_realm(REALM);
    router.listen_unix(&path).unwrap();
    let url = format!("unix://{}", path.display());

    let mut callee = connect(&url);
    block_on(callee.register(
        URI::new("io.echo"),
        Box::new(|invocation: Invocation| Ok((Some(invocation.args), None))),
    ))
    .unwrap();

    let mut caller = connect(&url);
    let (args, _) = block_on(caller.call(
        URI::new("io.echo"),
        Some(vec![Value::String("local".to_string())]),
        None,
    ))
    .unwrap();
    assert_eq!(args, vec![Value::String("local".to_string())]);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn call_timeout_cancels_on_the_caller_side() {
    let (_router, url) = start_tcp_router();

    // The callee parks every invocation forever.
    let (transport, serializer) = connect_transport(&url, &[SerializerType::Json]).unwrap();
    let callee = join_session(transport, serializer, REALM, None).unwrap();
    callee
        .send_message(&Message::Register(
            1,
            RegisterOptions::new(),
            URI::new("io.parked"),
        ))
        .unwrap();
    callee.receive_message().unwrap();

    let mut caller = connect(&url);
    let options = CallOptions {
        timeout: Some(200),
        ..Default::default()
    };
    let (_token, future) =
        caller.call_with_options(URI::new("io.parked"), None, None, options, None);
    let error = block_on(future).unwrap_err();
    assert_eq!(error.get_reason(), &Reason::Timeout);
}
