//! End-to-end tests driving a live broker over TCP with hand-encoded Kafka
//! frames: produce/fetch round-trips, offset queries, consumer-group flow
//! across a restart, pipelined response ordering, long-polling, the SASL
//! gate, and retention.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use monolog_broker::{BrokerServer, Config, Engine, Schedulers, Transport, TransportMetrics};
use monolog_protocol::{encode_varint, encode_varlong, RecordBatchHeader, RECORD_BATCH_HEADER_LEN};
use monolog_storage::{Db, GroupStore, TopicStore};

const ERROR_NONE: i16 = 0;
const ERROR_UNKNOWN_MEMBER_ID: i16 = 25;
const ERROR_SASL_AUTHENTICATION_FAILED: i16 = 31;

struct TestBroker {
    addr: SocketAddr,
    data_dir: PathBuf,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<Result<(), monolog_broker::TransportError>>,
    schedulers: Schedulers,
}

impl TestBroker {
    async fn start(config: Config, data_dir: PathBuf) -> Self {
        let db = Db::open(&data_dir).expect("open db");
        let topics = Arc::new(TopicStore::open(db.clone()).expect("topics"));
        let groups = Arc::new(GroupStore::open(db).expect("groups"));
        let engine = Arc::new(Engine::new(topics, groups, config.auto_create_topics));
        let metrics = TransportMetrics::new().expect("metrics");
        let transport = Arc::new(Transport::new(
            Arc::clone(&engine),
            metrics.clone(),
            &config,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let schedulers = Schedulers::start(
            Arc::clone(&engine),
            Arc::clone(&transport),
            &config,
            shutdown_rx.clone(),
        );
        let server = BrokerServer::bind(
            "127.0.0.1:0",
            transport,
            engine,
            metrics,
            config.limits.max_connections,
            config.limits.max_message_size,
        )
        .await
        .expect("bind");
        let addr = server.local_addr().expect("local addr");
        let server = tokio::spawn(server.serve(shutdown_rx));

        Self {
            addr,
            data_dir,
            shutdown,
            server,
            schedulers,
        }
    }

    async fn stop(self) -> PathBuf {
        self.shutdown.send(true).expect("signal shutdown");
        self.server
            .await
            .expect("join server")
            .expect("server exits cleanly");
        self.schedulers.join().await;
        self.data_dir
    }
}

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "monolog-it-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock after unix epoch")
            .as_nanos()
    ))
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.kafka_addr = "127.0.0.1:0".to_string();
    config.scheduler.tick_interval = Duration::from_millis(20);
    config.retention.enabled = false;
    config
}

// ── Tiny wire client ─────────────────────────────────────────────────────────

fn put_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    put_i16(out, value.len() as i16);
    out.extend_from_slice(value.as_bytes());
}

fn put_bytes(out: &mut Vec<u8>, value: &[u8]) {
    put_i32(out, value.len() as i32);
    out.extend_from_slice(value);
}

fn request(api_key: i16, api_version: i16, correlation_id: i32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    put_i16(&mut payload, api_key);
    put_i16(&mut payload, api_version);
    put_i32(&mut payload, correlation_id);
    put_string(&mut payload, "it-client");
    payload.extend_from_slice(body);

    let mut framed = Vec::with_capacity(payload.len() + 4);
    put_i32(&mut framed, payload.len() as i32);
    framed.extend_from_slice(&payload);
    framed
}

async fn send(stream: &mut TcpStream, frame: &[u8]) {
    stream.write_all(frame).await.expect("write frame");
}

/// Read one length-prefixed response, asserting the correlation id.
async fn read_response(stream: &mut TcpStream, correlation_id: i32) -> Vec<u8> {
    let raw = tokio::time::timeout(Duration::from_secs(10), async {
        let mut len_buf = [0_u8; 4];
        stream.read_exact(&mut len_buf).await.expect("read len");
        let len = i32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0_u8; len];
        stream.read_exact(&mut body).await.expect("read body");
        body
    })
    .await
    .expect("response in time");
    let corr = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    assert_eq!(corr, correlation_id, "correlation id mismatch");
    raw[4..].to_vec()
}

struct Cursor {
    data: Vec<u8>,
    pos: usize,
}

impl Cursor {
    fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    fn i16(&mut self) -> i16 {
        let value = i16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        value
    }

    fn i32(&mut self) -> i32 {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        i32::from_be_bytes(raw)
    }

    fn i64(&mut self) -> i64 {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        i64::from_be_bytes(raw)
    }

    fn string(&mut self) -> String {
        let len = self.i16() as usize;
        let value = String::from_utf8(self.data[self.pos..self.pos + len].to_vec()).expect("utf8");
        self.pos += len;
        value
    }

    fn skip(&mut self, count: usize) {
        self.pos += count;
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        let value = self.data[self.pos..self.pos + count].to_vec();
        self.pos += count;
        value
    }
}

// ── Record batches ───────────────────────────────────────────────────────────

/// A well-formed v2 batch with a single record.
fn one_record_batch(key: &[u8], value: &[u8], timestamp_ms: i64) -> Vec<u8> {
    let mut record = Vec::new();
    record.push(0); // attributes
    record.extend_from_slice(&encode_varlong(0)); // timestamp delta
    record.extend_from_slice(&encode_varint(0)); // offset delta
    record.extend_from_slice(&encode_varint(key.len() as i32));
    record.extend_from_slice(key);
    record.extend_from_slice(&encode_varint(value.len() as i32));
    record.extend_from_slice(value);
    record.extend_from_slice(&encode_varint(0)); // headers

    let mut records = Vec::new();
    records.extend_from_slice(&encode_varint(record.len() as i32));
    records.extend_from_slice(&record);

    let header = RecordBatchHeader {
        base_offset: 0,
        batch_length: (RECORD_BATCH_HEADER_LEN - 12 + records.len()) as i32,
        partition_leader_epoch: 0,
        magic: 2,
        crc: 0,
        attributes: 0,
        last_offset_delta: 0,
        base_timestamp: timestamp_ms,
        max_timestamp: timestamp_ms,
        producer_id: -1,
        producer_epoch: -1,
        base_sequence: -1,
        records_count: 1,
    };
    let mut batch = header.encode();
    batch.extend_from_slice(&records);
    batch
}

/// A header-only batch claiming to span `records` logical records, enough
/// for offset-accounting tests.
fn counted_batch(records: i32) -> Vec<u8> {
    RecordBatchHeader {
        base_offset: 0,
        batch_length: (RECORD_BATCH_HEADER_LEN - 12) as i32,
        partition_leader_epoch: 0,
        magic: 2,
        crc: 0,
        attributes: 0,
        last_offset_delta: records - 1,
        base_timestamp: 0,
        max_timestamp: 0,
        producer_id: -1,
        producer_epoch: -1,
        base_sequence: -1,
        records_count: records,
    }
    .encode()
}

// ── Request builders ─────────────────────────────────────────────────────────

fn create_topics_v0(name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    put_i32(&mut body, 1);
    put_string(&mut body, name);
    put_i32(&mut body, 1); // num_partitions
    put_i16(&mut body, 1); // replication_factor
    put_i32(&mut body, 0); // assignments
    put_i32(&mut body, 0); // configs
    put_i32(&mut body, 5_000); // timeout
    body
}

fn produce_v3(topic: &str, batch: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    put_i16(&mut body, -1); // transactional_id = null
    put_i16(&mut body, 1); // acks
    put_i32(&mut body, 5_000);
    put_i32(&mut body, 1);
    put_string(&mut body, topic);
    put_i32(&mut body, 1);
    put_i32(&mut body, 0); // partition index
    put_bytes(&mut body, batch);
    body
}

fn fetch_v4(topic: &str, offset: i64, max_wait_ms: i32) -> Vec<u8> {
    let mut body = Vec::new();
    put_i32(&mut body, -1); // replica_id
    put_i32(&mut body, max_wait_ms);
    put_i32(&mut body, 1); // min_bytes
    put_i32(&mut body, 1 << 20); // max_bytes
    body.push(0); // isolation_level
    put_i32(&mut body, 1);
    put_string(&mut body, topic);
    put_i32(&mut body, 1);
    put_i32(&mut body, 0); // partition index
    put_i64(&mut body, offset);
    put_i32(&mut body, 1 << 16); // partition_max_bytes
    body
}

fn list_offsets_v1(topic: &str, timestamp: i64) -> Vec<u8> {
    let mut body = Vec::new();
    put_i32(&mut body, -1);
    put_i32(&mut body, 1);
    put_string(&mut body, topic);
    put_i32(&mut body, 1);
    put_i32(&mut body, 0);
    put_i64(&mut body, timestamp);
    body
}

fn metadata_v1(topics: Option<&[&str]>) -> Vec<u8> {
    let mut body = Vec::new();
    match topics {
        None => put_i32(&mut body, -1),
        Some(names) => {
            put_i32(&mut body, names.len() as i32);
            for name in names {
                put_string(&mut body, name);
            }
        }
    }
    body
}

fn join_group_v0(group: &str, member_id: &str) -> Vec<u8> {
    let mut body = Vec::new();
    put_string(&mut body, group);
    put_i32(&mut body, 30_000); // session timeout
    put_string(&mut body, member_id);
    put_string(&mut body, "consumer");
    put_i32(&mut body, 1);
    put_string(&mut body, "range");
    put_bytes(&mut body, b"subscription");
    body
}

fn heartbeat_v0(group: &str, generation: i32, member_id: &str) -> Vec<u8> {
    let mut body = Vec::new();
    put_string(&mut body, group);
    put_i32(&mut body, generation);
    put_string(&mut body, member_id);
    body
}

fn offset_commit_v2(group: &str, generation: i32, member_id: &str, topic: &str, offset: i64) -> Vec<u8> {
    let mut body = Vec::new();
    put_string(&mut body, group);
    put_i32(&mut body, generation);
    put_string(&mut body, member_id);
    put_i64(&mut body, -1); // retention
    put_i32(&mut body, 1);
    put_string(&mut body, topic);
    put_i32(&mut body, 1);
    put_i32(&mut body, 0);
    put_i64(&mut body, offset);
    put_i16(&mut body, -1); // metadata = null
    body
}

fn offset_fetch_v1(group: &str, topic: &str) -> Vec<u8> {
    let mut body = Vec::new();
    put_string(&mut body, group);
    put_i32(&mut body, 1);
    put_string(&mut body, topic);
    put_i32(&mut body, 1);
    put_i32(&mut body, 0);
    body
}

/// Parse a v4 fetch response down to the single partition's records blob.
fn parse_fetch_v4(body: Vec<u8>) -> (i16, i64, Option<Vec<u8>>) {
    let mut cursor = Cursor::new(body);
    cursor.i32(); // throttle
    assert_eq!(cursor.i32(), 1); // topics
    cursor.string();
    assert_eq!(cursor.i32(), 1); // partitions
    cursor.i32(); // index
    let error_code = cursor.i16();
    let high_watermark = cursor.i64();
    cursor.i64(); // last stable offset
    assert_eq!(cursor.i32(), 0); // aborted transactions
    let records_len = cursor.i32();
    let records = if records_len < 0 {
        None
    } else {
        Some(cursor.take(records_len as usize))
    };
    (error_code, high_watermark, records)
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn api_versions_lists_the_full_surface() {
    let broker = TestBroker::start(test_config(), temp_dir("api-versions")).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");

    send(&mut conn, &request(18, 0, 1, &[])).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 1).await);
    assert_eq!(cursor.i16(), ERROR_NONE);
    let count = cursor.i32();
    assert_eq!(count, 15);
    let mut saw_fetch = false;
    for _ in 0..count {
        let api_key = cursor.i16();
        let min = cursor.i16();
        let max = cursor.i16();
        if api_key == 1 {
            saw_fetch = true;
            assert_eq!((min, max), (0, 11));
        }
    }
    assert!(saw_fetch);

    broker.stop().await;
}

#[tokio::test]
async fn produce_fetch_and_offsets_roundtrip() {
    let broker = TestBroker::start(test_config(), temp_dir("produce-fetch")).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");

    // Create the topic explicitly.
    send(&mut conn, &request(19, 0, 1, &create_topics_v0("t"))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 1).await);
    assert_eq!(cursor.i32(), 1);
    cursor.string();
    assert_eq!(cursor.i16(), ERROR_NONE);

    // Produce one record {k -> v}.
    let batch = one_record_batch(b"k", b"v", monolog_broker::now_ms());
    send(&mut conn, &request(0, 3, 2, &produce_v3("t", &batch))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 2).await);
    assert_eq!(cursor.i32(), 1);
    cursor.string();
    assert_eq!(cursor.i32(), 1);
    assert_eq!(cursor.i32(), 0);
    assert_eq!(cursor.i16(), ERROR_NONE);
    assert_eq!(cursor.i64(), 0); // base offset

    // Latest offset is now 1 (the next offset to be written).
    send(&mut conn, &request(2, 1, 3, &list_offsets_v1("t", -1))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 3).await);
    assert_eq!(cursor.i32(), 1);
    cursor.string();
    assert_eq!(cursor.i32(), 1);
    assert_eq!(cursor.i32(), 0);
    assert_eq!(cursor.i16(), ERROR_NONE);
    assert_eq!(cursor.i64(), -1); // echoed timestamp
    assert_eq!(cursor.i64(), 1); // next offset

    // Earliest offset is 0.
    send(&mut conn, &request(2, 1, 4, &list_offsets_v1("t", -2))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 4).await);
    cursor.i32();
    cursor.string();
    cursor.i32();
    cursor.i32();
    assert_eq!(cursor.i16(), ERROR_NONE);
    cursor.i64();
    assert_eq!(cursor.i64(), 0);

    // Fetch from 0 returns the batch with the key and value intact.
    send(&mut conn, &request(1, 4, 5, &fetch_v4("t", 0, 0))).await;
    let (error_code, high_watermark, records) =
        parse_fetch_v4(read_response(&mut conn, 5).await);
    assert_eq!(error_code, ERROR_NONE);
    assert_eq!(high_watermark, 1);
    let records = records.expect("records present");
    assert_eq!(&records[..8], &0_i64.to_be_bytes()); // patched base offset
    let payload = String::from_utf8_lossy(&records);
    assert!(payload.contains('k'));
    assert!(payload.contains('v'));

    broker.stop().await;
}

#[tokio::test]
async fn hundred_records_in_ten_batches_fetch_from_midstream() {
    let broker = TestBroker::start(test_config(), temp_dir("midstream")).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");

    for i in 0..10 {
        let corr = 10 + i;
        send(
            &mut conn,
            &request(0, 3, corr, &produce_v3("t", &counted_batch(10))),
        )
        .await;
        let mut cursor = Cursor::new(read_response(&mut conn, corr).await);
        cursor.i32();
        cursor.string();
        cursor.i32();
        cursor.i32();
        assert_eq!(cursor.i16(), ERROR_NONE);
        assert_eq!(cursor.i64(), i64::from(i) * 10); // bases 0, 10, ..., 90
    }

    // Latest is 100.
    send(&mut conn, &request(2, 1, 30, &list_offsets_v1("t", -1))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 30).await);
    cursor.i32();
    cursor.string();
    cursor.i32();
    cursor.i32();
    assert_eq!(cursor.i16(), ERROR_NONE);
    cursor.i64();
    assert_eq!(cursor.i64(), 100);

    // Fetching offset 50 returns the batches based at 50..90, each patched.
    send(&mut conn, &request(1, 4, 31, &fetch_v4("t", 50, 0))).await;
    let (error_code, high_watermark, records) =
        parse_fetch_v4(read_response(&mut conn, 31).await);
    assert_eq!(error_code, ERROR_NONE);
    assert_eq!(high_watermark, 100);
    let records = records.expect("records present");
    assert_eq!(records.len(), 5 * RECORD_BATCH_HEADER_LEN);
    for (index, chunk) in records.chunks(RECORD_BATCH_HEADER_LEN).enumerate() {
        let base = i64::from_be_bytes(chunk[..8].try_into().expect("base"));
        assert_eq!(base, 50 + index as i64 * 10);
    }

    broker.stop().await;
}

#[tokio::test]
async fn pipelined_responses_arrive_in_request_order() {
    let broker = TestBroker::start(test_config(), temp_dir("pipelining")).await;

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let addr = broker.addr;
        tasks.push(tokio::spawn(async move {
            let mut conn = TcpStream::connect(addr).await.expect("connect");
            // Send five requests back to back, then read all five.
            for correlation_id in 1..=5 {
                send(
                    &mut conn,
                    &request(3, 1, correlation_id, &metadata_v1(None)),
                )
                .await;
            }
            for correlation_id in 1..=5 {
                // read_response asserts the correlation id ordering.
                read_response(&mut conn, correlation_id).await;
            }
        }));
    }
    for task in tasks {
        task.await.expect("pipelined connection");
    }

    broker.stop().await;
}

#[tokio::test]
async fn group_flow_and_committed_offset_survive_restart() {
    let data_dir = temp_dir("restart");
    let broker = TestBroker::start(test_config(), data_dir.clone()).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");

    // Join with an empty member id; the broker allocates one.
    send(&mut conn, &request(11, 0, 1, &join_group_v0("g", ""))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 1).await);
    assert_eq!(cursor.i16(), ERROR_NONE);
    let generation = cursor.i32();
    assert!(generation >= 1);
    assert_eq!(cursor.string(), "range");
    let leader = cursor.string();
    let member_id = cursor.string();
    assert_eq!(leader, member_id);
    assert!(member_id.starts_with("g-"));

    // Heartbeat and commit.
    send(
        &mut conn,
        &request(12, 0, 2, &heartbeat_v0("g", generation, &member_id)),
    )
    .await;
    let mut cursor = Cursor::new(read_response(&mut conn, 2).await);
    assert_eq!(cursor.i16(), ERROR_NONE);

    send(
        &mut conn,
        &request(8, 2, 3, &offset_commit_v2("g", generation, &member_id, "t", 42)),
    )
    .await;
    let mut cursor = Cursor::new(read_response(&mut conn, 3).await);
    assert_eq!(cursor.i32(), 1);
    cursor.string();
    assert_eq!(cursor.i32(), 1);
    assert_eq!(cursor.i32(), 0);
    assert_eq!(cursor.i16(), ERROR_NONE);

    drop(conn);
    let data_dir = broker.stop().await;

    // A fresh process sees the committed offset.
    let broker = TestBroker::start(test_config(), data_dir).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");
    send(&mut conn, &request(9, 1, 4, &offset_fetch_v1("g", "t"))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 4).await);
    assert_eq!(cursor.i32(), 1);
    cursor.string();
    assert_eq!(cursor.i32(), 1);
    assert_eq!(cursor.i32(), 0);
    assert_eq!(cursor.i64(), 42);

    broker.stop().await;
}

#[tokio::test]
async fn member_expires_without_heartbeats() {
    let mut config = test_config();
    config.groups.session_timeout = Duration::from_secs(1);
    let broker = TestBroker::start(config, temp_dir("expiry")).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");

    send(&mut conn, &request(11, 0, 1, &join_group_v0("g", ""))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 1).await);
    assert_eq!(cursor.i16(), ERROR_NONE);
    let generation = cursor.i32();
    cursor.string();
    cursor.string();
    let member_id = cursor.string();

    // No heartbeats for well past the session timeout.
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    send(
        &mut conn,
        &request(12, 0, 2, &heartbeat_v0("g", generation, &member_id)),
    )
    .await;
    let mut cursor = Cursor::new(read_response(&mut conn, 2).await);
    assert_eq!(cursor.i16(), ERROR_UNKNOWN_MEMBER_ID);

    broker.stop().await;
}

#[tokio::test]
async fn parked_fetch_wakes_when_data_arrives() {
    let broker = TestBroker::start(test_config(), temp_dir("long-poll")).await;
    let mut consumer = TcpStream::connect(broker.addr).await.expect("connect");
    let mut producer = TcpStream::connect(broker.addr).await.expect("connect");

    send(&mut consumer, &request(19, 0, 1, &create_topics_v0("t"))).await;
    read_response(&mut consumer, 1).await;

    // Long-poll an empty topic, then produce from another connection.
    let started = Instant::now();
    send(&mut consumer, &request(1, 4, 2, &fetch_v4("t", 0, 5_000))).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let batch = one_record_batch(b"key", b"wake", monolog_broker::now_ms());
    send(&mut producer, &request(0, 3, 1, &produce_v3("t", &batch))).await;
    read_response(&mut producer, 1).await;

    let (error_code, _, records) = parse_fetch_v4(read_response(&mut consumer, 2).await);
    assert_eq!(error_code, ERROR_NONE);
    assert!(records.expect("records").len() > RECORD_BATCH_HEADER_LEN);
    // Delivered by the ticker, well before the five-second deadline.
    assert!(started.elapsed() < Duration::from_secs(4));

    broker.stop().await;
}

#[tokio::test]
async fn parked_fetch_times_out_empty() {
    let broker = TestBroker::start(test_config(), temp_dir("long-poll-timeout")).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");

    send(&mut conn, &request(19, 0, 1, &create_topics_v0("t"))).await;
    read_response(&mut conn, 1).await;

    let started = Instant::now();
    send(&mut conn, &request(1, 4, 2, &fetch_v4("t", 0, 300))).await;
    let (error_code, high_watermark, records) =
        parse_fetch_v4(read_response(&mut conn, 2).await);
    assert_eq!(error_code, ERROR_NONE);
    assert_eq!(high_watermark, 0);
    assert!(records.map_or(true, |bytes| bytes.is_empty()));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(280), "returned too early: {elapsed:?}");

    broker.stop().await;
}

#[tokio::test]
async fn auth_gate_requires_the_token() {
    let mut config = test_config();
    config.auth_token = Some("letmein".to_string());
    let broker = TestBroker::start(config, temp_dir("auth")).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");

    // Gated request answers with an auth failure but keeps the connection.
    send(&mut conn, &request(3, 1, 1, &metadata_v1(None))).await;
    let body = read_response(&mut conn, 1).await;
    assert_eq!(
        i16::from_be_bytes([body[0], body[1]]),
        ERROR_SASL_AUTHENTICATION_FAILED
    );

    // Handshake, authenticate, retry.
    let mut handshake = Vec::new();
    put_string(&mut handshake, "PLAIN");
    send(&mut conn, &request(17, 0, 2, &handshake)).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 2).await);
    assert_eq!(cursor.i16(), ERROR_NONE);
    assert_eq!(cursor.i32(), 1);
    assert_eq!(cursor.string(), "PLAIN");

    let mut authenticate = Vec::new();
    put_bytes(&mut authenticate, b"\0user\0letmein");
    send(&mut conn, &request(36, 0, 3, &authenticate)).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 3).await);
    assert_eq!(cursor.i16(), ERROR_NONE);

    send(&mut conn, &request(3, 1, 4, &metadata_v1(None))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 4).await);
    assert_eq!(cursor.i32(), 1); // one broker
    assert_eq!(cursor.i32(), 0); // node id 0
    let host = cursor.string();
    assert!(!host.is_empty());
    cursor.i32(); // port
    cursor.skip(2); // rack = null
    cursor.i32(); // controller id
    // remaining: topics array

    broker.stop().await;
}

#[tokio::test]
async fn retention_sweep_empties_an_aged_topic() {
    let mut config = test_config();
    config.retention.enabled = true;
    config.retention.max_age = Duration::from_millis(1);
    config.retention.check_interval = Duration::from_millis(50);
    let broker = TestBroker::start(config, temp_dir("retention")).await;
    let mut conn = TcpStream::connect(broker.addr).await.expect("connect");

    let batch = one_record_batch(b"k", b"v", 0);
    send(&mut conn, &request(0, 3, 1, &produce_v3("t", &batch))).await;
    let mut cursor = Cursor::new(read_response(&mut conn, 1).await);
    cursor.i32();
    cursor.string();
    cursor.i32();
    cursor.i32();
    assert_eq!(cursor.i16(), ERROR_NONE);

    // Give the sweep a few intervals to run.
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut correlation_id = 2;
    loop {
        send(
            &mut conn,
            &request(1, 4, correlation_id, &fetch_v4("t", 0, 0)),
        )
        .await;
        let (_, _, records) = parse_fetch_v4(read_response(&mut conn, correlation_id).await);
        let empty = records.map_or(true, |bytes| bytes.is_empty());
        if empty {
            break;
        }
        assert!(Instant::now() < deadline, "retention never swept the topic");
        tokio::time::sleep(Duration::from_millis(100)).await;
        correlation_id += 1;
    }

    broker.stop().await;
}
