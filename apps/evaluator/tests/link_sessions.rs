use std::{path::PathBuf, sync::Arc, time::Duration};

use rail_analysis::EvaluationPlan;
use rail_evaluator::{ConnectionState, EvaluatorServer, EvaluatorSettings};
use rail_link_core::*;
use rail_link_tcp::connect;
use rail_model::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

const IO: Duration = Duration::from_secs(1);

fn settings(out_dir: Option<PathBuf>, heartbeat: Duration) -> EvaluatorSettings {
    EvaluatorSettings {
        curves: Arc::new(CurveSet {
            target: CurveProfile::flat(20.0).unwrap(),
            ceiling: CurveProfile::flat(25.0).unwrap(),
            traction: CurveProfile::flat(200_000.0).unwrap(),
            brake: CurveProfile::flat(200_000.0).unwrap(),
        }),
        plan: EvaluationPlan::default(),
        heartbeat,
        io_timeout: IO,
        out_dir,
    }
}

fn sample(session_id: Uuid, tick: u64, velocity_mps: f64) -> Frame {
    Frame::Sample(SampleRecord {
        session_id,
        tick,
        timestamp_ms: (tick + 1) * 100,
        position_m: tick as f64 * 2.0,
        velocity_mps,
        acceleration_mps2: 0.0,
        mode: ControlMode::Coast,
        level: 0,
    })
}

#[tokio::test]
async fn replies_follow_sample_order() {
    let dir = tempfile::tempdir().unwrap();
    let server = EvaluatorServer::bind("127.0.0.1:0", settings(Some(dir.path().to_path_buf()), Duration::from_secs(30)))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let client = tokio::spawn(async move {
        let mut s = connect(&addr, IO).await.unwrap();
        let id = Uuid::new_v4();
        for t in 0..20 {
            let v = if t == 10 { 30.0 } else { 22.0 };
            s.send(&sample(id, t, v), IO).await.unwrap();
        }
        let mut replies = Vec::new();
        while replies.len() < 20 {
            match s.recv().await {
                Ok(Some(Ok(Frame::Score(r)))) => replies.push(r),
                Ok(Some(Ok(Frame::Heartbeat(_)))) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        let end = EndOfSession { session_id: id, tick: 19, timestamp_ms: 2_000, position_m: 38.0 };
        s.send(&Frame::End(end), IO).await.unwrap();
        // the evaluator closes its side once the session is scored
        assert!(matches!(s.recv().await, Ok(None)));
        (id, replies)
    });

    let score = server.serve_one().await.unwrap();
    let (id, replies) = client.await.unwrap();

    let ticks: Vec<u64> = replies.iter().map(|r| r.tick).collect();
    assert_eq!(ticks, (0..20).collect::<Vec<_>>());
    assert!((replies[10].overshoot_pct - 50.0).abs() < 1e-9);
    assert!((replies[0].overshoot_pct - 10.0).abs() < 1e-9);
    assert!(replies[..10].iter().all(|r| !r.cumulative_flag));
    assert!(replies[10..].iter().all(|r| r.cumulative_flag));

    assert!(score.complete);
    assert_eq!(score.session_id, Some(id));
    assert_eq!(score.samples_scored, 20);
    assert_eq!(score.ceiling_violations, 1);
    assert!((score.peak_overshoot_pct - 50.0).abs() < 1e-9);
    assert!(dir.path().join(format!("evaluation_{}.json", id.simple())).is_file());
}

#[tokio::test]
async fn dropped_link_leaves_session_incomplete() {
    let dir = tempfile::tempdir().unwrap();
    let server = EvaluatorServer::bind("127.0.0.1:0", settings(Some(dir.path().to_path_buf()), Duration::from_secs(30)))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let registry = server.registry();

    let client = tokio::spawn(async move {
        let mut s = connect(&addr, IO).await.unwrap();
        let id = Uuid::new_v4();
        for t in 0..5 {
            s.send(&sample(id, t, 15.0), IO).await.unwrap();
            assert!(matches!(s.recv().await, Ok(Some(Ok(Frame::Score(_))))));
        }
        id
        // stream dropped here, mid-session
    });

    let score = server.serve_one().await.unwrap();
    let id = client.await.unwrap();
    assert!(!score.complete);
    assert_eq!(score.samples_scored, 5);

    let status = registry.snapshot();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, ConnectionState::Incomplete);
    assert_eq!(status[0].session_id, Some(id));

    let written = rail_io::import_score_json(&dir.path().join(format!("evaluation_{}.json", id.simple()))).unwrap();
    assert!(!written.complete);
    assert_eq!(written.samples_scored, 5);
}

#[tokio::test]
async fn end_record_from_another_session_is_ignored() {
    let server = EvaluatorServer::bind("127.0.0.1:0", settings(None, Duration::from_secs(30))).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let client = tokio::spawn(async move {
        let mut s = connect(&addr, IO).await.unwrap();
        let id = Uuid::new_v4();
        for t in 0..3 {
            s.send(&sample(id, t, 18.0), IO).await.unwrap();
        }
        let stray = EndOfSession { session_id: Uuid::new_v4(), tick: 2, timestamp_ms: 300, position_m: 4.0 };
        s.send(&Frame::End(stray), IO).await.unwrap();
        s.send(&sample(id, 3, 18.0), IO).await.unwrap();
        let mut ticks = Vec::new();
        while ticks.len() < 4 {
            match s.recv().await {
                Ok(Some(Ok(Frame::Score(r)))) => ticks.push(r.tick),
                other => panic!("unexpected {other:?}"),
            }
        }
        let end = EndOfSession { session_id: id, tick: 3, timestamp_ms: 400, position_m: 6.0 };
        s.send(&Frame::End(end), IO).await.unwrap();
        assert!(matches!(s.recv().await, Ok(None)));
        ticks
    });

    let (score, ticks) = tokio::join!(server.serve_one(), client);
    // the session kept running past the stray end record
    assert_eq!(ticks.unwrap(), vec![0, 1, 2, 3]);
    let score = score.unwrap();
    assert!(score.complete);
    assert_eq!(score.samples_scored, 4);
    assert_eq!(score.samples_dropped, 1);
    assert_eq!(score.end_position_m, Some(6.0));
}

#[tokio::test]
async fn malformed_bytes_are_skipped() {
    let server = EvaluatorServer::bind("127.0.0.1:0", settings(None, Duration::from_secs(30))).await.unwrap();
    let addr = server.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut bytes = b"garbage!!".to_vec();
        bytes.extend(encode_to_vec(&sample(Uuid::new_v4(), 7, 12.0)));
        sock.write_all(&bytes).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let reply = loop {
            if let Some(res) = decoder.decode_next() {
                break res.unwrap();
            }
            let n = sock.read_buf(decoder.buffer_mut()).await.unwrap();
            assert!(n > 0, "evaluator closed early");
        };
        reply
    });

    let (score, reply) = tokio::join!(server.serve_one(), client);
    assert!(matches!(reply.unwrap(), Frame::Score(ScoreReply { tick: 7, .. })));
    // the client hung up without an end record
    let score = score.unwrap();
    assert!(!score.complete);
    assert_eq!(score.samples_scored, 1);
    assert_eq!(score.samples_dropped, 1);
}

#[tokio::test]
async fn idle_link_gets_heartbeats() {
    let server = EvaluatorServer::bind("127.0.0.1:0", settings(None, Duration::from_millis(50))).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let client = tokio::spawn(async move {
        let mut s = connect(&addr, IO).await.unwrap();
        let mut seqs = Vec::new();
        while seqs.len() < 2 {
            match tokio::time::timeout(IO, s.recv()).await {
                Ok(Ok(Some(Ok(Frame::Heartbeat(hb))))) => seqs.push(hb.seq),
                other => panic!("expected heartbeat, got {other:?}"),
            }
        }
        seqs
    });
    let serve = server.serve_one();
    let (score, seqs) = tokio::join!(serve, client);
    assert_eq!(seqs.unwrap(), vec![1, 2]);
    assert_eq!(score.unwrap().samples_scored, 0);
}

#[tokio::test]
async fn concurrent_sessions_do_not_mix() {
    let server = EvaluatorServer::bind("127.0.0.1:0", settings(None, Duration::from_secs(30))).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let registry = server.registry();
    tokio::spawn(server.serve());

    let mut a = connect(&addr, IO).await.unwrap();
    let mut b = connect(&addr, IO).await.unwrap();
    let (ida, idb) = (Uuid::new_v4(), Uuid::new_v4());
    for t in 0..5 {
        a.send(&sample(ida, t, 21.0), IO).await.unwrap();
        if t < 3 {
            b.send(&sample(idb, t, 40.0), IO).await.unwrap();
        }
    }
    for _ in 0..5 {
        match a.recv().await {
            Ok(Some(Ok(Frame::Score(r)))) => assert!(!r.cumulative_flag),
            other => panic!("unexpected {other:?}"),
        }
    }
    for _ in 0..3 {
        match b.recv().await {
            Ok(Some(Ok(Frame::Score(r)))) => assert!(r.cumulative_flag),
            other => panic!("unexpected {other:?}"),
        }
    }
    a.send(&Frame::End(EndOfSession { session_id: ida, tick: 4, timestamp_ms: 500, position_m: 8.0 }), IO).await.unwrap();
    drop(b);

    let mut settled = Vec::new();
    for _ in 0..100 {
        settled = registry.snapshot();
        if settled.len() == 2 && settled.iter().all(|c| c.state != ConnectionState::Active) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let by_id = |id: Uuid| settled.iter().find(|c| c.session_id == Some(id)).cloned().unwrap();
    assert_eq!(by_id(ida).state, ConnectionState::Complete);
    assert_eq!(by_id(ida).samples, 5);
    assert_eq!(by_id(idb).state, ConnectionState::Incomplete);
    assert_eq!(by_id(idb).samples, 3);
}
