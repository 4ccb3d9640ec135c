//! Drives a running container over real TCP connections.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use soa_container::network::FrameCodec;
use soa_container::{
    BufferTracker, ContainerConfig, MetricsBatch, MetricsSink, ProcessRecord, SoaContainer,
    StaticConfigSource,
};
use soa_core::{
    DecodedMessage, FnProcessor, MessageType, MsgPackProtocol, ProcessError, Processor,
    ProtocolCodec, Reply, ServiceIdentity, SoaBaseCode, SoaError, SoaHeader,
};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

const MAX_FRAME: usize = 1024 * 1024;

/// Keeps every batch the reporter publishes, including the final flush
/// performed on shutdown.
#[derive(Default)]
struct CollectingSink {
    batches: Mutex<Vec<MetricsBatch>>,
}

#[async_trait]
impl MetricsSink for CollectingSink {
    async fn report(&self, batch: MetricsBatch) -> anyhow::Result<()> {
        self.batches.lock().push(batch);
        Ok(())
    }
}

impl CollectingSink {
    /// Folds every reported period into one record per identity.
    fn totals(&self) -> BTreeMap<ServiceIdentity, ProcessRecord> {
        let mut totals: BTreeMap<ServiceIdentity, ProcessRecord> = BTreeMap::new();
        for (identity, record) in self.batches.lock().iter().flatten() {
            let total = totals.entry(identity.clone()).or_default();
            if total.total_calls == 0 {
                *total = *record;
                continue;
            }
            total.min_latency_ms = total.min_latency_ms.min(record.min_latency_ms);
            total.max_latency_ms = total.max_latency_ms.max(record.max_latency_ms);
            total.total_latency_ms += record.total_latency_ms;
            total.succeeded_calls += record.succeeded_calls;
            total.failed_calls += record.failed_calls;
            total.total_calls += record.total_calls;
            total.request_bytes += record.request_bytes;
            total.response_bytes += record.response_bytes;
        }
        totals
    }
}

struct Running {
    port: u16,
    sink: Arc<CollectingSink>,
    buffers: BufferTracker,
    stop: oneshot::Sender<()>,
    served: JoinHandle<anyhow::Result<()>>,
}

/// What a container recorded over its whole lifetime.
struct Finished {
    records: BTreeMap<ServiceIdentity, ProcessRecord>,
    buffers: BufferTracker,
}

impl Finished {
    fn only_record(&self) -> (&ServiceIdentity, &ProcessRecord) {
        assert_eq!(self.records.len(), 1, "{:?}", self.records);
        self.records.iter().next().unwrap()
    }
}

impl Running {
    /// Shuts the container down; metrics are complete once `serve` returns.
    async fn stop(self) -> Finished {
        let _ = self.stop.send(());
        self.served.await.unwrap().unwrap();
        Finished {
            records: self.sink.totals(),
            buffers: self.buffers,
        }
    }
}

fn config() -> ContainerConfig {
    ContainerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        core_pool_size: 8,
        drain_timeout_ms: 5_000,
        max_frame_length: MAX_FRAME,
        ..ContainerConfig::default()
    }
}

async fn launch(
    config: ContainerConfig,
    processors: Vec<Arc<dyn Processor>>,
    dynamic: StaticConfigSource,
) -> Running {
    let sink = Arc::new(CollectingSink::default());
    let mut container = SoaContainer::builder(config)
        .processors(processors)
        .dynamic_config(Arc::new(dynamic))
        .metrics_sink(Arc::clone(&sink) as Arc<dyn MetricsSink>)
        .build()
        .unwrap();
    let port = container.start().await.unwrap();
    let buffers = container.buffers();
    let (stop, stopped) = oneshot::channel::<()>();
    let served = tokio::spawn(container.serve(async move {
        let _ = stopped.await;
    }));
    Running {
        port,
        sink,
        buffers,
        stop,
        served,
    }
}

async fn connect(port: u16) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    Framed::new(stream, FrameCodec::new(MAX_FRAME))
}

fn request(service: &str, version: &str, method: &str, seq_id: i32, body: &[u8]) -> Bytes {
    MsgPackProtocol
        .encode(
            &SoaHeader::new(service, version, method),
            seq_id,
            MessageType::Call,
            body,
        )
        .unwrap()
}

async fn call(
    conn: &mut Framed<TcpStream, FrameCodec>,
    service: &str,
    version: &str,
    method: &str,
    body: &[u8],
) -> DecodedMessage {
    conn.send(request(service, version, method, 1, body))
        .await
        .unwrap();
    let frame = conn.next().await.unwrap().unwrap();
    MsgPackProtocol.decode(frame).unwrap()
}

fn echo(service: &str) -> Arc<dyn Processor> {
    FnProcessor::new(service, "1.0.0", |_ctx, body| Ok(Reply::new(body))).shared()
}

/// Replies with the name of the thread the call ran on.
fn thread_reporter(service: &str) -> Arc<dyn Processor> {
    FnProcessor::new(service, "1.0.0", |_ctx, _body| {
        let name = std::thread::current()
            .name()
            .unwrap_or_default()
            .to_string();
        Ok(Reply::new(name))
    })
    .shared()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_call_round_trips() {
    let running = launch(config(), vec![echo("order.OrderService")], StaticConfigSource::new()).await;
    let mut conn = connect(running.port).await;

    let reply = call(&mut conn, "order.OrderService", "1.0.0", "create", b"payload").await;
    assert_eq!(reply.message_type, MessageType::Reply);
    assert_eq!(reply.seq_id, 1);
    assert_eq!(reply.header.resp_code(), None);
    assert_eq!(&reply.body[..], b"payload");

    drop(conn);
    let finished = running.stop().await;
    let (identity, record) = finished.only_record();
    assert_eq!(identity.service_name, "order.OrderService");
    assert_eq!(identity.method_name, "create");
    assert_eq!(record.total_calls, 1);
    assert_eq!(record.succeeded_calls, 1);
    assert!(record.request_bytes > 0);
    assert!(record.response_bytes > 0);
    assert_eq!(finished.buffers.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_version_gets_not_found_server() {
    let running = launch(config(), vec![echo("order.OrderService")], StaticConfigSource::new()).await;
    let mut conn = connect(running.port).await;

    let reply = call(&mut conn, "order.OrderService", "2.0.0", "create", b"x").await;
    assert_eq!(reply.header.resp_code(), Some(SoaBaseCode::NOT_FOUND_SERVER.code));
    assert_eq!(
        reply.header.resp_message(),
        Some(SoaBaseCode::NOT_FOUND_SERVER.message)
    );
    assert!(reply.body.is_empty());

    drop(conn);
    let finished = running.stop().await;
    let (identity, record) = finished.only_record();
    assert_eq!(identity.version_name, "2.0.0");
    assert_eq!(record.total_calls, 1);
    assert_eq!(record.failed_calls, 1);
    assert_eq!(finished.buffers.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn domain_and_unexpected_errors_are_mapped() {
    let failing = FnProcessor::new("pay.PayService", "1.0.0", |_ctx, body| {
        if body.as_ref() == b"domain" {
            Err(ProcessError::Domain(SoaError::new("Err-Pay-001", "insufficient funds")))
        } else {
            Err(ProcessError::Unexpected(anyhow::anyhow!("ledger offline")))
        }
    })
    .shared();
    let running = launch(config(), vec![failing], StaticConfigSource::new()).await;
    let mut conn = connect(running.port).await;

    let domain = call(&mut conn, "pay.PayService", "1.0.0", "pay", b"domain").await;
    assert_eq!(domain.header.resp_code(), Some("Err-Pay-001"));
    assert_eq!(domain.header.resp_message(), Some("insufficient funds"));

    let unexpected = call(&mut conn, "pay.PayService", "1.0.0", "pay", b"other").await;
    assert_eq!(unexpected.header.resp_code(), Some(SoaBaseCode::UNKNOWN.code));
    assert_eq!(
        unexpected.header.resp_message(),
        Some(SoaBaseCode::UNKNOWN.message)
    );

    drop(conn);
    let finished = running.stop().await;
    let (_, record) = finished.only_record();
    assert_eq!(record.total_calls, 2);
    assert_eq!(record.failed_calls, 2);
    assert_eq!(record.succeeded_calls, 0);
}

/// Echoes the request body followed by the latency (ms, big-endian u64) the
/// processor observed since the request was accepted.
fn timed_echo(service: &str, delay: fn(&[u8]) -> Duration) -> Arc<dyn Processor> {
    FnProcessor::new(service, "1.0.0", move |ctx, body| {
        std::thread::sleep(delay(&body));
        let observed = u64::try_from(ctx.elapsed().as_millis()).unwrap();
        let mut out = BytesMut::from(&body[..]);
        out.put_u64(observed);
        Ok(Reply::new(out.freeze()))
    })
    .shared()
}

fn split_timed(body: &Bytes) -> (&[u8], u64) {
    let (echoed, observed) = body.split_at(body.len() - 8);
    (echoed, u64::from_be_bytes(observed.try_into().unwrap()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_all_answered_and_counted() {
    const CONNECTIONS: i32 = 4;
    const PER_CONNECTION: i32 = 32;

    let processor = timed_echo("order.OrderService", |body| {
        Duration::from_millis(u64::from(body.last().copied().unwrap_or(0) % 3))
    });
    let running = launch(config(), vec![processor], StaticConfigSource::new()).await;

    let mut clients = Vec::new();
    for _ in 0..CONNECTIONS {
        let port = running.port;
        clients.push(tokio::spawn(async move {
            let mut conn = connect(port).await;
            for seq_id in 0..PER_CONNECTION {
                let body = seq_id.to_be_bytes();
                conn.send(request("order.OrderService", "1.0.0", "create", seq_id, &body))
                    .await
                    .unwrap();
            }
            let mut seen = HashSet::new();
            let mut observed = Vec::new();
            for _ in 0..PER_CONNECTION {
                let reply = MsgPackProtocol
                    .decode(conn.next().await.unwrap().unwrap())
                    .unwrap();
                let (echoed, latency) = split_timed(&reply.body);
                assert_eq!(echoed, &reply.seq_id.to_be_bytes());
                assert!(seen.insert(reply.seq_id));
                observed.push(latency);
            }
            observed
        }));
    }
    let mut observed = Vec::new();
    for client in clients {
        observed.extend(client.await.unwrap());
    }
    let expected = u64::try_from(CONNECTIONS * PER_CONNECTION).unwrap();
    assert_eq!(observed.len() as u64, expected);

    let finished = running.stop().await;
    let (_, record) = finished.only_record();
    assert_eq!(record.total_calls, expected);
    assert_eq!(record.succeeded_calls + record.failed_calls, record.total_calls);
    assert_eq!(record.succeeded_calls, expected);
    // The pipeline measures from accept to after the write, so it never
    // reports less than the processor saw.
    assert!(record.max_latency_ms >= *observed.iter().max().unwrap());
    assert!(record.total_latency_ms >= observed.iter().sum::<u64>());
    assert!(record.min_latency_ms <= record.average_latency_ms());
    assert!(record.average_latency_ms() <= record.max_latency_ms);
    assert_eq!(finished.buffers.acquired(), expected);
    assert_eq!(finished.buffers.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_burst_on_one_connection_is_fully_answered() {
    const CALLS: i32 = 64;

    let config = ContainerConfig {
        core_pool_size: 16,
        ..config()
    };
    let processor = timed_echo("order.OrderService", |_| Duration::from_millis(50));
    let running = launch(config, vec![processor], StaticConfigSource::new()).await;
    let mut conn = connect(running.port).await;

    for seq_id in 0..CALLS {
        conn.send(request("order.OrderService", "1.0.0", "create", seq_id, b"burst"))
            .await
            .unwrap();
    }
    let mut seen = HashSet::new();
    for _ in 0..CALLS {
        let frame = tokio::time::timeout(Duration::from_secs(10), conn.next())
            .await
            .expect("reply within 10s")
            .unwrap()
            .unwrap();
        let reply = MsgPackProtocol.decode(frame).unwrap();
        assert_eq!(reply.header.resp_code(), None);
        assert!(seen.insert(reply.seq_id));
    }
    assert_eq!(seen.len(), CALLS as usize);

    drop(conn);
    let finished = running.stop().await;
    let (_, record) = finished.only_record();
    assert_eq!(record.succeeded_calls, u64::try_from(CALLS).unwrap());
    assert_eq!(record.failed_calls, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thread_pool_flag_selects_where_a_method_runs() {
    let dynamic = StaticConfigSource::from_json(
        r#"{ "svcA.v1.m1.producer": { "ThreadPool": false } }"#,
    )
    .unwrap();
    let processor = FnProcessor::new("svcA", "v1", |_ctx, _body| {
        let name = std::thread::current()
            .name()
            .unwrap_or_default()
            .to_string();
        Ok(Reply::new(name))
    })
    .shared();
    let running = launch(config(), vec![processor], dynamic).await;
    let mut conn = connect(running.port).await;

    let inline = call(&mut conn, "svcA", "v1", "m1", b"").await;
    let inline_thread = String::from_utf8(inline.body.to_vec()).unwrap();
    assert!(!inline_thread.starts_with("trans-pool-"), "{inline_thread}");

    let pooled = call(&mut conn, "svcA", "v1", "m2", b"").await;
    let pooled_thread = String::from_utf8(pooled.body.to_vec()).unwrap();
    assert!(pooled_thread.starts_with("trans-pool-"), "{pooled_thread}");
    assert!(pooled_thread.contains("-thread-"), "{pooled_thread}");

    drop(conn);
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabling_the_pool_runs_everything_inline() {
    let config = ContainerConfig {
        use_thread_pool: false,
        ..config()
    };
    let running = launch(config, vec![thread_reporter("svcB")], StaticConfigSource::new()).await;
    let mut conn = connect(running.port).await;

    let reply = call(&mut conn, "svcB", "1.0.0", "any", b"").await;
    let thread = String::from_utf8(reply.body.to_vec()).unwrap();
    assert!(!thread.starts_with("trans-pool-"), "{thread}");

    drop(conn);
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_frame_closes_the_connection() {
    let running = launch(config(), vec![echo("order.OrderService")], StaticConfigSource::new()).await;
    let stream = TcpStream::connect(("127.0.0.1", running.port)).await.unwrap();
    let mut conn = Framed::new(stream, FrameCodec::new(usize::MAX));

    let declared = u32::try_from(MAX_FRAME + 1).unwrap();
    let mut frame = declared.to_be_bytes().to_vec();
    frame.extend_from_slice(&[0; 16]);
    // The server rejects the prefix before the body arrives.
    let _ = conn.send(Bytes::from(frame)).await;
    assert!(!matches!(conn.next().await, Some(Ok(_))));

    drop(conn);
    let finished = running.stop().await;
    assert!(finished.records.is_empty());
    assert_eq!(finished.buffers.acquired(), 0);
}
