//! Unit tests for the protocol driver, against a scripted server

use super::*;
use crate::sink::{ChannelSink, CommandEvent};
use shwire_proto::{
    CmdDataPacket, CmdFinalPacket, CmdStartPacket, ResponsePacket, StreamFileResponsePacket,
    WriteFileDonePacket, WriteFileReadyPacket,
};
use shwire_state::ShellVar;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

struct FakeServer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    codec: PacketCodec,
}

impl FakeServer {
    async fn send(&mut self, packet: Packet) {
        PacketCodec::new().write_packet(&mut self.writer, &packet).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        timeout(Duration::from_secs(5), self.codec.read_packet(&mut self.reader))
            .await
            .expect("timed out waiting for the client")
            .unwrap()
            .expect("client closed the stream")
    }
}

fn init_packet(protocol_version: u32) -> Packet {
    Packet::Init(InitPacket {
        protocol_version,
        server_version: "0.1.0".to_string(),
        hostname: "testhost".to_string(),
        user: "tester".to_string(),
        home_dir: "/home/tester".to_string(),
        shell_types: vec![ShellType::Bash],
    })
}

fn fake_pair() -> (DuplexStream, FakeServer) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let (reader, writer) = tokio::io::split(server_io);
    let server = FakeServer {
        reader,
        writer,
        codec: PacketCodec::new(),
    };
    (client_io, server)
}

async fn connected(config: ClientConfig) -> (Client, FakeServer) {
    let (client_io, mut server) = fake_pair();
    server.send(Packet::KeepAlive).await;
    server.send(init_packet(PROTOCOL_VERSION)).await;
    let (reader, writer) = tokio::io::split(client_io);
    let client = Client::connect(reader, writer, config).await.unwrap();
    (client, server)
}

fn base_state() -> ShellState {
    let mut state = ShellState::new("bash v5.2.15(1)-release", "/tmp");
    state.vars.insert("EDITOR".to_string(), ShellVar::exported("vi"));
    state
}

#[tokio::test]
async fn test_handshake() {
    let (client, _server) = connected(ClientConfig::default()).await;
    assert_eq!(client.init().hostname, "testhost");
    assert_eq!(client.init().shell_types, vec![ShellType::Bash]);
}

#[tokio::test]
async fn test_handshake_rejects_other_protocol() {
    let (client_io, mut server) = fake_pair();
    server.send(init_packet(PROTOCOL_VERSION + 1)).await;
    let (reader, writer) = tokio::io::split(client_io);
    let result = Client::connect(reader, writer, ClientConfig::default()).await;
    assert!(matches!(result, Err(ShwireError::Protocol(_))));
}

#[tokio::test]
async fn test_handshake_requires_init_first() {
    let (client_io, mut server) = fake_pair();
    server
        .send(Packet::CmdData(CmdDataPacket {
            ck: CommandKey::generate(Uuid::new_v4()),
            data: Bytes::from_static(b"early"),
        }))
        .await;
    let (reader, writer) = tokio::io::split(client_io);
    let result = Client::connect(reader, writer, ClientConfig::default()).await;
    assert!(matches!(result, Err(ShwireError::Protocol(_))));
}

#[tokio::test]
async fn test_handshake_on_closed_stream() {
    let (client_io, server) = fake_pair();
    drop(server);
    let (reader, writer) = tokio::io::split(client_io);
    let result = Client::connect(reader, writer, ClientConfig::default()).await;
    assert!(matches!(result, Err(ShwireError::Connection(_))));
}

#[tokio::test]
async fn test_answers_are_matched_by_request_id() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let client = Arc::new(client);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.chdir("/", "a").await }
    });
    let first_id = match server.recv().await {
        Packet::Chdir(chdir) => chdir.req_id,
        other => panic!("Expected chdir, got {:?}", other),
    };
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.chdir("/", "b").await }
    });
    let second_id = match server.recv().await {
        Packet::Chdir(chdir) => chdir.req_id,
        other => panic!("Expected chdir, got {:?}", other),
    };

    server
        .send(Packet::response(second_id, ResponseData::Cwd("/b".to_string())))
        .await;
    server
        .send(Packet::error_response(
            first_id,
            ErrorDetails::new(ErrorCode::NotFound, "no such directory"),
        ))
        .await;

    assert_eq!(second.await.unwrap().unwrap(), "/b");
    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err.remote_details().map(|d| d.code), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn test_request_timeout_clears_pending() {
    let config = ClientConfig {
        request_timeout: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let (client, mut server) = connected(config).await;
    let result = client.chdir("/", "slow").await;
    assert!(matches!(result, Err(ShwireError::Timeout { .. })));
    assert!(matches!(server.recv().await, Packet::Chdir(_)));
    assert!(client.shared.pending.read().await.is_empty());
}

#[tokio::test]
async fn test_run_events_and_final_state() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let (sink, mut events) = ChannelSink::new();
    let base = Arc::new(base_state());
    let request = RunRequest::new(Uuid::new_v4(), ShellType::Bash, base.clone(), "cd /srv");
    let ck = request.ck;

    client.run(request, sink.clone()).await.unwrap();
    let run = match server.recv().await {
        Packet::Run(run) => run,
        other => panic!("Expected run, got {:?}", other),
    };
    assert_eq!(run.ck, ck);
    assert!(matches!(run.state, StateInput::Full(ref state) if **state == *base));

    let mut target = base_state();
    target.cwd = "/srv".to_string();
    target.vars.insert("OLDPWD".to_string(), ShellVar::exported("/tmp"));
    let diff = ShellStateDiff::between(&base, &target).unwrap();

    server
        .send(Packet::CmdStart(CmdStartPacket {
            ck,
            req_id: run.req_id,
            pid: 4242,
        }))
        .await;
    server
        .send(Packet::CmdData(CmdDataPacket {
            ck,
            data: Bytes::from_static(b"done\r\n"),
        }))
        .await;
    server
        .send(Packet::CmdDone(CmdDonePacket {
            ck,
            exit_code: 0,
            duration_ms: 12,
            final_state: Some(diff),
            state_error: None,
        }))
        .await;

    assert_eq!(events.recv().await, Some((ck, CommandEvent::Started { pid: 4242 })));
    assert_eq!(
        events.recv().await,
        Some((ck, CommandEvent::Data(Bytes::from_static(b"done\r\n"))))
    );
    let done = match events.recv().await {
        Some((_, CommandEvent::Done(done))) => done,
        other => panic!("Expected done, got {:?}", other),
    };
    assert_eq!(done.exit_code, 0);
    assert_eq!(done.duration, Duration::from_millis(12));
    assert_eq!(done.state.as_deref(), Some(&target));
    let target_hash = target.hash().unwrap();
    assert_eq!(done.state_hash.as_deref(), Some(target_hash.as_str()));
    assert!(client.states().contains(ShellType::Bash, &target_hash).await);

    // The server now holds the final state, so a follow-up run names it by hash.
    let follow = RunRequest::new(Uuid::new_v4(), ShellType::Bash, Arc::new(target.clone()), "true");
    client.run(follow, sink).await.unwrap();
    match server.recv().await {
        Packet::Run(run) => assert_eq!(run.state, StateInput::Hash(target_hash)),
        other => panic!("Expected run, got {:?}", other),
    }
}

#[tokio::test]
async fn test_run_rejection_reaches_sink() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let (sink, mut events) = ChannelSink::new();
    let request = RunRequest::new(Uuid::new_v4(), ShellType::Bash, Arc::new(base_state()), "ls");
    let ck = request.ck;
    client.run(request.clone(), sink.clone()).await.unwrap();

    let duplicate = client.run(request, sink).await;
    assert!(matches!(duplicate, Err(ShwireError::Protocol(_))));

    let req_id = match server.recv().await {
        Packet::Run(run) => run.req_id,
        other => panic!("Expected run, got {:?}", other),
    };
    server
        .send(Packet::error_response(
            req_id,
            ErrorDetails::new(ErrorCode::VersionMismatch, "wrong shell"),
        ))
        .await;

    match events.recv().await {
        Some((got, CommandEvent::Failed(error))) => {
            assert_eq!(got, ck);
            assert_eq!(error.code, ErrorCode::VersionMismatch);
        }
        other => panic!("Expected failure, got {:?}", other),
    }
    assert!(client.shared.commands.read().await.is_empty());
}

#[tokio::test]
async fn test_evicted_state_is_resent_in_full_once() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let state = base_state();
    let hash = state.hash().unwrap();
    client.shared.remote.write().await.insert((ShellType::Bash, hash.clone()));

    let (sink, mut events) = ChannelSink::new();
    let request = RunRequest::new(Uuid::new_v4(), ShellType::Bash, Arc::new(state.clone()), "ls");
    let ck = request.ck;
    client.run(request, sink).await.unwrap();

    let first = match server.recv().await {
        Packet::Run(run) => run,
        other => panic!("Expected run, got {:?}", other),
    };
    assert_eq!(first.state, StateInput::Hash(hash.clone()));
    server
        .send(Packet::error_response(
            first.req_id,
            ErrorDetails::new(ErrorCode::NotFound, "unknown shell state"),
        ))
        .await;

    let retry = match server.recv().await {
        Packet::Run(run) => run,
        other => panic!("Expected a resent run, got {:?}", other),
    };
    assert_eq!(retry.ck, ck);
    assert_ne!(retry.req_id, first.req_id);
    assert!(matches!(retry.state, StateInput::Full(ref full) if **full == state));
    assert!(!client.shared.remote.read().await.contains(&(ShellType::Bash, hash)));

    // A second miss is not retried again.
    server
        .send(Packet::error_response(
            retry.req_id,
            ErrorDetails::new(ErrorCode::NotFound, "still unknown"),
        ))
        .await;
    match events.recv().await {
        Some((got, CommandEvent::Failed(error))) => {
            assert_eq!(got, ck);
            assert_eq!(error.message, "still unknown");
        }
        other => panic!("Expected failure, got {:?}", other),
    }
    assert!(client.shared.commands.read().await.is_empty());
}

#[tokio::test]
async fn test_full_state_run_is_not_retried() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let (sink, mut events) = ChannelSink::new();
    let request = RunRequest::new(Uuid::new_v4(), ShellType::Bash, Arc::new(base_state()), "ls");
    client.run(request, sink).await.unwrap();

    let req_id = match server.recv().await {
        Packet::Run(run) => run.req_id,
        other => panic!("Expected run, got {:?}", other),
    };
    server
        .send(Packet::error_response(req_id, ErrorDetails::new(ErrorCode::NotFound, "gone")))
        .await;
    assert!(matches!(events.recv().await, Some((_, CommandEvent::Failed(_)))));
}

#[tokio::test]
async fn test_diff_sent_against_current_state() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let base = base_state();
    let base_hash = base.hash().unwrap();

    let fetch = {
        let state = base.clone();
        let hash = base_hash.clone();
        async move {
            let req_id = match server.recv().await {
                Packet::Reinit(reinit) => reinit.req_id,
                other => panic!("Expected reinit, got {:?}", other),
            };
            server
                .send(Packet::response(
                    req_id,
                    ResponseData::State {
                        hash,
                        state: Box::new(state),
                    },
                ))
                .await;
            server
        }
    };
    let (reinit, mut server) = tokio::join!(client.reinit(ShellType::Bash), fetch);
    let (hash, _) = reinit.unwrap();
    assert_eq!(hash, base_hash);

    let mut changed = base_state();
    changed.vars.insert("PAGER".to_string(), ShellVar::exported("less"));
    let (sink, _events) = ChannelSink::new();
    client
        .run(
            RunRequest::new(Uuid::new_v4(), ShellType::Bash, Arc::new(changed), "env"),
            sink,
        )
        .await
        .unwrap();
    match server.recv().await {
        Packet::Run(run) => match run.state {
            StateInput::Diff(diff) => assert_eq!(diff.base_hash, base_hash),
            other => panic!("Expected diff, got {:?}", other),
        },
        other => panic!("Expected run, got {:?}", other),
    }
}

#[tokio::test]
async fn test_state_hash_is_verified() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let answer = async move {
        let req_id = match server.recv().await {
            Packet::GetState(get) => get.req_id,
            other => panic!("Expected getstate, got {:?}", other),
        };
        server
            .send(Packet::response(
                req_id,
                ResponseData::State {
                    hash: "bogus".to_string(),
                    state: Box::new(base_state()),
                },
            ))
            .await;
        server
    };
    let (result, _server) = tokio::join!(client.get_state(ShellType::Bash, None), answer);
    assert!(matches!(result, Err(ShwireError::Protocol(_))));
}

#[tokio::test]
async fn test_stream_file_collects_chunks() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let answer = async move {
        let req_id = match server.recv().await {
            Packet::StreamFile(stream) => {
                assert_eq!(stream.byte_range, vec![-6]);
                stream.req_id
            }
            other => panic!("Expected streamfile, got {:?}", other),
        };
        server
            .send(Packet::StreamFileResponse(StreamFileResponsePacket {
                req_id,
                info: Some(FileInfo {
                    name: "notes.txt".to_string(),
                    size: 11,
                    mode: 0o644,
                    mod_ts: 0,
                    is_dir: false,
                }),
                done: false,
                error: None,
            }))
            .await;
        server
            .send(Packet::FileData(FileDataPacket::chunk(req_id, Bytes::from_static(b" wo"))))
            .await;
        server
            .send(Packet::FileData(FileDataPacket::chunk(req_id, Bytes::from_static(b"rld"))))
            .await;
        server.send(Packet::FileData(FileDataPacket::eof(req_id, None))).await;
        server
    };
    let (result, _server) = tokio::join!(client.read_file("notes.txt", vec![-6]), answer);
    let (info, data) = result.unwrap();
    assert_eq!(info.size, 11);
    assert_eq!(&data[..], b" world");
    assert!(client.shared.streams.read().await.is_empty());
}

#[tokio::test]
async fn test_stream_error_after_start() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let answer = async move {
        let req_id = match server.recv().await {
            Packet::StreamFile(stream) => stream.req_id,
            other => panic!("Expected streamfile, got {:?}", other),
        };
        server
            .send(Packet::StreamFileResponse(StreamFileResponsePacket {
                req_id,
                info: Some(FileInfo {
                    name: "log".to_string(),
                    size: 100,
                    mode: 0o644,
                    mod_ts: 0,
                    is_dir: false,
                }),
                done: false,
                error: None,
            }))
            .await;
        server
            .send(Packet::FileData(FileDataPacket::eof(req_id, Some("read failed".to_string()))))
            .await;
        server
    };
    let (result, _server) = tokio::join!(client.read_file("log", Vec::new()), answer);
    assert!(matches!(result, Err(ShwireError::Transfer(msg)) if msg == "read failed"));
}

#[tokio::test]
async fn test_write_file_chunks_then_eof() {
    let config = ClientConfig {
        write_chunk_size: 4,
        ..ClientConfig::default()
    };
    let (client, mut server) = connected(config).await;
    let answer = async move {
        let req_id = match server.recv().await {
            Packet::WriteFile(write) => {
                assert!(write.use_temp);
                write.req_id
            }
            other => panic!("Expected writefile, got {:?}", other),
        };
        server
            .send(Packet::WriteFileReady(WriteFileReadyPacket { req_id, error: None }))
            .await;
        let mut received = Vec::new();
        loop {
            match server.recv().await {
                Packet::FileData(chunk) => {
                    assert!(chunk.data.len() <= 4);
                    received.extend_from_slice(&chunk.data);
                    if chunk.eof {
                        break;
                    }
                }
                other => panic!("Expected file data, got {:?}", other),
            }
        }
        server
            .send(Packet::WriteFileDone(WriteFileDonePacket { req_id, error: None }))
            .await;
        received
    };
    let (result, received) = tokio::join!(
        client.write_file("/tmp/out", Bytes::from_static(b"0123456789"), true),
        answer
    );
    result.unwrap();
    assert_eq!(received, b"0123456789");
}

#[tokio::test]
async fn test_write_file_stops_at_early_failure() {
    let config = ClientConfig {
        write_chunk_size: 4,
        write_chunk_delay: Duration::from_millis(5),
        ..ClientConfig::default()
    };
    let (client, mut server) = connected(config).await;
    let answer = async move {
        let req_id = match server.recv().await {
            Packet::WriteFile(write) => write.req_id,
            other => panic!("Expected writefile, got {:?}", other),
        };
        server
            .send(Packet::WriteFileReady(WriteFileReadyPacket { req_id, error: None }))
            .await;
        assert!(matches!(server.recv().await, Packet::FileData(_)));
        server
            .send(Packet::WriteFileDone(WriteFileDonePacket {
                req_id,
                error: Some(ErrorDetails::new(ErrorCode::ResourceExhausted, "write queue full")),
            }))
            .await;
        server
    };
    let payload = Bytes::from(vec![b'x'; 400]);
    let (result, mut server) = tokio::join!(client.write_file("/tmp/big", payload, false), answer);
    let err = result.unwrap_err();
    assert_eq!(err.remote_details().map(|d| d.code), Some(ErrorCode::ResourceExhausted));

    let mut chunks = 1;
    while let Ok(packet) = timeout(Duration::from_millis(100), server.codec.read_packet(&mut server.reader)).await {
        match packet.unwrap() {
            Some(Packet::FileData(chunk)) => {
                assert!(!chunk.eof);
                chunks += 1;
            }
            other => panic!("Expected file data, got {:?}", other),
        }
    }
    assert!(chunks < 100);
}

#[tokio::test]
async fn test_write_file_rejected_before_data() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let answer = async move {
        let req_id = match server.recv().await {
            Packet::WriteFile(write) => write.req_id,
            other => panic!("Expected writefile, got {:?}", other),
        };
        server
            .send(Packet::WriteFileReady(WriteFileReadyPacket {
                req_id,
                error: Some(ErrorDetails::new(ErrorCode::PermissionDenied, "read-only")),
            }))
            .await;
        server
    };
    let (result, _server) = tokio::join!(client.write_file("/ro/file", Bytes::from_static(b"x"), false), answer);
    let err = result.unwrap_err();
    assert_eq!(err.remote_details().map(|d| d.code), Some(ErrorCode::PermissionDenied));
}

#[tokio::test]
async fn test_closed_connection_fails_waiters() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let (sink, mut events) = ChannelSink::new();
    let request = RunRequest::new(Uuid::new_v4(), ShellType::Bash, Arc::new(base_state()), "sleep 100");
    let ck = request.ck;
    client.run(request, sink).await.unwrap();
    assert!(matches!(server.recv().await, Packet::Run(_)));

    let closer = async move {
        assert!(matches!(server.recv().await, Packet::Chdir(_)));
        drop(server);
    };
    let (result, ()) = tokio::join!(client.chdir("/", "x"), closer);
    assert!(matches!(result, Err(ShwireError::Connection(_))));

    match events.recv().await {
        Some((got, CommandEvent::Failed(error))) => {
            assert_eq!(got, ck);
            assert_eq!(error.code, ErrorCode::Internal);
        }
        other => panic!("Expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_final_packet_and_stray_packets() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    let (sink, mut events) = ChannelSink::new();
    let request = RunRequest::new(Uuid::new_v4(), ShellType::Bash, Arc::new(base_state()), "boom");
    let ck = request.ck;
    client.run(request, sink).await.unwrap();
    assert!(matches!(server.recv().await, Packet::Run(_)));

    let stray = CommandKey::generate(Uuid::new_v4());
    server
        .send(Packet::CmdData(CmdDataPacket {
            ck: stray,
            data: Bytes::from_static(b"lost"),
        }))
        .await;
    server
        .send(Packet::Response(ResponsePacket {
            req_id: Uuid::new_v4(),
            result: Ok(ResponseData::Empty),
        }))
        .await;
    server
        .send(Packet::CmdFinal(CmdFinalPacket {
            ck,
            error: ErrorDetails::new(ErrorCode::Panicked, "executor panicked"),
        }))
        .await;

    match events.recv().await {
        Some((got, CommandEvent::Failed(error))) => {
            assert_eq!(got, ck);
            assert_eq!(error.code, ErrorCode::Panicked);
        }
        other => panic!("Expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_shutdown_closes_stream() {
    let (client, mut server) = connected(ClientConfig::default()).await;
    client.shutdown().await.unwrap();
    let closed = timeout(Duration::from_secs(5), server.codec.read_packet(&mut server.reader))
        .await
        .unwrap()
        .unwrap();
    assert!(closed.is_none());
    assert!(matches!(client.chdir("/", "x").await, Err(ShwireError::Connection(_))));
}
