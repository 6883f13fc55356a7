use std::{path::Path, sync::Arc, time::Duration};

use rail_analysis::EvaluationPlan;
use rail_control::Unpaced;
use rail_driver::{commands, open_session, DriverInput, EndReason};
use rail_evaluator::{EvaluatorServer, EvaluatorSettings};
use rail_io::{ArtifactKind, RailConfig};
use rail_model::*;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

fn flat_curves() -> Arc<CurveSet> {
    Arc::new(CurveSet {
        target: CurveProfile::flat(15.0).unwrap(),
        ceiling: CurveProfile::flat(20.0).unwrap(),
        traction: CurveProfile::flat(200_000.0).unwrap(),
        brake: CurveProfile::flat(200_000.0).unwrap(),
    })
}

fn config(out_dir: &Path, duration_s: f64) -> RailConfig {
    let mut cfg = RailConfig::default();
    cfg.session.duration_s = Some(duration_s);
    cfg.session.out_dir = out_dir.to_path_buf();
    cfg.link.connect_timeout_ms = 1_000;
    cfg.link.linger_ms = 2_000;
    cfg
}

fn log_events(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn coast_session_writes_one_report_triple() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 60.0);
    let (_tx, rx) = commands::channel();
    let session = open_session(&cfg, flat_curves(), false, rx).await;
    let summary = session.run(&mut Unpaced).await;

    assert_eq!(summary.end_reason, EndReason::Duration);
    assert_eq!(summary.samples.len(), 600);
    assert!((summary.final_state.time_s - 60.0).abs() < 1e-6);
    assert!(summary.samples.windows(2).all(|w| w[1].state.velocity_mps >= w[0].state.velocity_mps));
    assert!(summary.samples.windows(2).all(|w| w[1].state.time_s > w[0].state.time_s));
    assert_eq!(summary.local_score.overshoot_pct, 0.0);
    assert!(!summary.link_lost);

    assert!(summary.report.is_complete());
    assert_eq!(summary.report.written.len(), 3);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    let events = log_events(&summary.report.written[1]);
    assert_eq!(events.first().map(String::as_str), Some("session_started"));
    assert!(!events.iter().any(|e| e == "ceiling_exceeded"));
    assert!(events.iter().any(|e| e == "session_ended"));
}

#[tokio::test]
async fn autopilot_session_scored_by_evaluator() {
    let dir = tempfile::tempdir().unwrap();
    let eval_dir = tempfile::tempdir().unwrap();
    let server = EvaluatorServer::bind(
        "127.0.0.1:0",
        EvaluatorSettings {
            curves: flat_curves(),
            plan: EvaluationPlan::default(),
            heartbeat: Duration::from_secs(30),
            io_timeout: Duration::from_secs(1),
            out_dir: Some(eval_dir.path().to_path_buf()),
        },
    )
    .await
    .unwrap();

    let mut cfg = config(dir.path(), 120.0);
    cfg.link.port = server.local_addr().unwrap().port();
    cfg.control.autopilot_on_start = true;
    let (_tx, rx) = commands::channel();
    let session = open_session(&cfg, flat_curves(), true, rx).await;
    let id = session.id();

    let mut pacer = Unpaced;
    let (score, summary) = tokio::join!(server.serve_one(), session.run(&mut pacer));
    let score = score.unwrap();

    assert!(!summary.link_lost);
    assert_eq!(summary.samples.len(), 1_200);
    assert_eq!(summary.replies, 1_200);
    let tail = &summary.samples[900..];
    assert!(tail.iter().all(|s| (s.state.velocity_mps - 15.0).abs() < 0.5));

    assert!(score.complete);
    assert_eq!(score.session_id, Some(id));
    assert_eq!(score.samples_scored, 1_200);
    assert_eq!(score.ceiling_violations, 0);
    assert!(score.peak_overshoot_pct < 10.0);
    assert_eq!(summary.local_score.overshoot_pct, score.peak_overshoot_pct);
    assert!(eval_dir.path().join(format!("evaluation_{}.json", id.simple())).is_file());
}

#[tokio::test]
async fn evaluator_loss_does_not_stop_driving() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = config(dir.path(), 60.0);
    cfg.link.port = listener.local_addr().unwrap().port();
    cfg.control.autopilot_on_start = true;

    // takes a few records, then vanishes mid-session
    let fake = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 640];
        sock.read_exact(&mut buf).await.unwrap();
    });

    let (_tx, rx) = commands::channel();
    let session = open_session(&cfg, flat_curves(), true, rx).await;
    let summary = session.run(&mut Unpaced).await;
    fake.await.unwrap();

    assert_eq!(summary.end_reason, EndReason::Duration);
    assert_eq!(summary.samples.len(), 600);
    assert!(summary.link_lost);
    assert_eq!(summary.report.written.len(), 3);
    let events = log_events(&summary.report.written[1]);
    assert!(events.iter().any(|e| e == "link_down"));
}

#[tokio::test]
async fn unreachable_evaluator_is_logged_and_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = config(dir.path(), 5.0);
    cfg.link.port = listener.local_addr().unwrap().port();
    drop(listener);

    let (_tx, rx) = commands::channel();
    let summary = open_session(&cfg, flat_curves(), true, rx).await.run(&mut Unpaced).await;
    assert!(summary.link_lost);
    assert_eq!(summary.samples.len(), 50);
    let events = log_events(&summary.report.written[1]);
    assert_eq!(&events[..2], &["session_started".to_string(), "link_down".to_string()]);
}

#[tokio::test]
async fn driver_inputs_apply_in_order_and_quit_ends_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 60.0);
    let (tx, rx) = commands::channel();
    for input in [
        DriverInput::SetMode(ControlMode::Traction),
        DriverInput::LevelUp,
        DriverInput::LevelUp,
        DriverInput::LevelUp,
        DriverInput::Quit,
    ] {
        tx.send(input).unwrap();
    }
    let summary = open_session(&cfg, flat_curves(), false, rx).await.run(&mut Unpaced).await;
    assert_eq!(summary.end_reason, EndReason::DriverQuit);
    assert_eq!(summary.samples.len(), 1);
    let first = summary.samples[0].state;
    assert_eq!((first.mode, first.level), (ControlMode::Traction, 3));
    assert!(first.velocity_mps > 0.0);
    let events = log_events(&summary.report.written[1]);
    assert_eq!(events.iter().filter(|e| *e == "level_adjusted").count(), 3);
    assert_eq!(events.iter().filter(|e| *e == "mode_changed").count(), 1);
}

#[tokio::test]
async fn terminal_stop_ends_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 300.0);
    cfg.session.terminal_position_m = Some(200.0);
    cfg.control.autopilot_on_start = true;
    let curves = Arc::new(CurveSet {
        target: CurveProfile::from_pairs(&[(0.0, 10.0), (150.0, 10.0), (200.0, 0.0)]).unwrap(),
        ..(*flat_curves()).clone()
    });
    let (_tx, rx) = commands::channel();
    let summary = open_session(&cfg, curves, false, rx).await.run(&mut Unpaced).await;
    assert_eq!(summary.end_reason, EndReason::TerminalStop);
    assert!(summary.final_state.velocity_mps <= rail_analysis::STOPPED_MPS);
    assert!((summary.final_state.position_m - 200.0).abs() <= 50.0);
    assert!(summary.final_state.time_s < 300.0);
}

#[tokio::test]
async fn ceiling_crossings_are_logged_once_each_way() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 80.0);
    cfg.control.autopilot_on_start = true;
    let curves = Arc::new(CurveSet {
        ceiling: CurveProfile::from_pairs(&[
            (0.0, 20.0),
            (100.0, 20.0),
            (101.0, 5.0),
            (300.0, 5.0),
            (301.0, 20.0),
            (600.0, 20.0),
            (601.0, 5.0),
            (700.0, 5.0),
            (701.0, 20.0),
        ])
        .unwrap(),
        ..(*flat_curves()).clone()
    });
    let (_tx, rx) = commands::channel();
    let summary = open_session(&cfg, curves, false, rx).await.run(&mut Unpaced).await;
    assert!(summary.final_state.position_m > 750.0);

    let events = log_events(&summary.report.written[1]);
    let ceiling: Vec<&str> =
        events.iter().map(String::as_str).filter(|e| e.starts_with("ceiling_")).collect();
    assert_eq!(ceiling, ["ceiling_exceeded", "ceiling_cleared", "ceiling_exceeded", "ceiling_cleared"]);
}

#[tokio::test]
async fn demo_autopilot_serves_both_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = RailConfig::load(concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/railsim.toml")).unwrap();
    let curves = Arc::new(cfg.load_curves().unwrap());
    cfg.session.duration_s = Some(900.0);
    cfg.session.out_dir = dir.path().to_path_buf();
    cfg.control.autopilot_on_start = true;
    let (_tx, rx) = commands::channel();
    let summary = open_session(&cfg, curves, false, rx).await.run(&mut Unpaced).await;

    assert_eq!(summary.end_reason, EndReason::TerminalStop);
    assert!(summary.final_state.time_s < 400.0 + 180.0);
    assert!(summary.local_score.on_time);
    assert!(summary.local_score.stop_error_m.unwrap() < 5.0);

    let events = log_events(&summary.report.written[1]);
    assert_eq!(events.iter().filter(|e| *e == "dwell_started").count(), 2);
    assert_eq!(events.iter().filter(|e| *e == "dwell_ended").count(), 1);
    let midway = summary.samples.iter().position(|s| s.state.position_m > 2_450.0).unwrap();
    assert!(summary.samples[..midway].iter().any(|s| s.state.velocity_mps <= rail_analysis::STOPPED_MPS
        && (s.state.position_m - 2_400.0).abs() <= 50.0));
}

#[test]
fn artifact_names_share_the_session_stamp() {
    let gen = rail_io::ReportGenerator::new("logs", "20240102_030405");
    let names: Vec<String> = ArtifactKind::ALL
        .iter()
        .map(|k| gen.path_for(*k).file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["simulation_20240102_030405.png", "simulation_20240102_030405.log", "simulation_20240102_030405.csv"]);
}
