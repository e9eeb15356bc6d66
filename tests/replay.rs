use std::{
  sync::{Arc, Mutex},
  thread,
  time::{Duration, Instant},
};

use jingtou::{
  FromUrl,
  buffer::{BufferHandle, BufferKind, NativeBuffer},
  native::{NativeError, ReplayAnalyzer, ReplayScript, ScriptedOutcome},
  notify::{ListenerError, NotificationBus},
  observation::{Orientation, Point},
  orchestrator::{EvaluationError, Orchestrator},
  request::RequestConfiguration,
  task::{ContinuousTask, OneShotTask, Task},
};
use url::Url;

struct TestFrame {
  handle: BufferHandle,
  kind: BufferKind,
}

impl NativeBuffer for TestFrame {
  fn native_handle(&self) -> BufferHandle {
    self.handle
  }

  fn buffer_kind(&self) -> BufferKind {
    self.kind
  }
}

fn frames(kind: BufferKind) -> impl Iterator<Item = TestFrame> {
  (1usize..).filter_map(move |raw| {
    BufferHandle::from_raw(raw << 4).map(|handle| TestFrame { handle, kind })
  })
}

fn collect<E: Clone + Send + Sync + 'static>(bus: &NotificationBus<E>) -> Arc<Mutex<Vec<E>>> {
  let events = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&events);
  bus.subscribe(Arc::new(move |event: &E| -> Result<(), ListenerError> {
    sink.lock().unwrap().push(event.clone());
    Ok(())
  }));
  events
}

/// 回调在回放线程上到达，轮询等待
fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let start = Instant::now();
  while !condition() {
    if start.elapsed() >= limit {
      return false;
    }
    thread::sleep(Duration::from_millis(1));
  }
  true
}

fn config(url: &str) -> RequestConfiguration {
  RequestConfiguration::from_url(&Url::parse(url).unwrap()).unwrap()
}

#[test]
fn continuous_task_replays_rectangles() {
  let script = ReplayScript::from_json(
    r#"{
      "latency_ms": 3,
      "outcomes": [
        { "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.8], [0.1, 0.8]] }
      ]
    }"#,
  )
  .unwrap();
  let orchestrator = Orchestrator::new(ReplayAnalyzer::new(script).unwrap());
  orchestrator
    .configure(config("vision://rectangles?max_observations=1"))
    .unwrap();
  let rectangles = collect(orchestrator.rectangles());
  let failures = collect(orchestrator.failures());

  let summary = ContinuousTask::default()
    .with_frame_number(Some(20))
    .with_frame_interval(Some(Duration::from_millis(1)))
    .with_settle(Some(Duration::from_secs(2)))
    .run_task(frames(BufferKind::PixelBufferBacked), &orchestrator)
    .unwrap();

  assert_eq!(summary.frames, 20);
  assert_eq!(summary.accepted + summary.dropped, 20);
  assert!(summary.accepted >= 1);
  assert!(!summary.unsettled);

  assert!(wait_until(Duration::from_secs(2), || {
    rectangles.lock().unwrap().len() == summary.accepted
  }));
  assert!(failures.lock().unwrap().is_empty());

  let rectangles = rectangles.lock().unwrap();
  let rect = rectangles[0].largest().unwrap();
  assert_eq!(rect.top_left, Point::new(0.1, 0.8));
  assert_eq!(rect.bottom_right, Point::new(0.9, 0.1));
  assert!((rect.area - 0.56).abs() < 1e-5);

  let diagnostics = orchestrator.diagnostics();
  assert_eq!(diagnostics.accepted, summary.accepted);
  assert_eq!(diagnostics.dropped, summary.dropped);
  assert_eq!(diagnostics.completed, summary.accepted);
}

#[test]
fn landscape_right_replay_is_reflected() {
  let script = ReplayScript {
    latency_ms: 0,
    outcomes: vec![ScriptedOutcome::Points(vec![
      [0.0, 0.0],
      [0.5, 0.0],
      [0.5, 0.25],
      [0.0, 0.25],
    ])],
  };
  let orchestrator = Orchestrator::new(ReplayAnalyzer::new(script).unwrap());
  orchestrator
    .configure(RequestConfiguration::rectangles(1).unwrap())
    .unwrap();
  orchestrator.set_orientation(Orientation::LandscapeRight);
  let rectangles = collect(orchestrator.rectangles());

  let summary = OneShotTask::default()
    .run_task(frames(BufferKind::FrameBacked), &orchestrator)
    .unwrap();
  assert_eq!(summary.accepted, 1);
  assert!(wait_until(Duration::from_secs(2), || {
    !rectangles.lock().unwrap().is_empty()
  }));

  let rectangles = rectangles.lock().unwrap();
  assert_eq!(rectangles[0].orientation, Orientation::LandscapeRight);
  let rect = &rectangles[0].rectangles[0];
  assert_eq!(rect.top_left, Point::new(0.5, 1.0));
  assert_eq!(rect.top_right, Point::new(1.0, 1.0));
  assert_eq!(rect.bottom_left, Point::new(0.5, 0.75));
  assert_eq!(rect.bottom_right, Point::new(1.0, 0.75));
  assert!((rect.area - 0.125).abs() < 1e-6);
}

#[test]
fn stalled_request_times_out() {
  let script = ReplayScript {
    latency_ms: 0,
    outcomes: vec![
      ScriptedOutcome::Stall,
      ScriptedOutcome::Classifications(vec![("cup".to_string(), 0.7)]),
    ],
  };
  let orchestrator = Orchestrator::new(ReplayAnalyzer::new(script).unwrap());
  orchestrator
    .configure(config("vision://classification?max=2&timeout_ms=30"))
    .unwrap();
  let failures = collect(orchestrator.failures());
  let classifications = collect(orchestrator.classifications());

  let summary = OneShotTask::default()
    .with_wait(Duration::from_secs(2))
    .run_task(frames(BufferKind::PixelBufferBacked), &orchestrator)
    .unwrap();
  assert!(!summary.unsettled);
  assert!(wait_until(Duration::from_secs(2), || {
    !failures.lock().unwrap().is_empty()
  }));
  assert_eq!(
    failures.lock().unwrap()[0].error,
    EvaluationError::Timeout(Duration::from_millis(30))
  );
  assert_eq!(orchestrator.diagnostics().timed_out, 1);

  // 超时之后可以继续提交
  let summary = OneShotTask::default()
    .run_task(frames(BufferKind::PixelBufferBacked), &orchestrator)
    .unwrap();
  assert_eq!(summary.accepted, 1);
  assert!(wait_until(Duration::from_secs(2), || {
    !classifications.lock().unwrap().is_empty()
  }));
  assert_eq!(classifications.lock().unwrap()[0].observations[0].identifier, "cup");
}

#[test]
fn rejected_buffer_kind_fails_synchronously() {
  let script = ReplayScript {
    latency_ms: 0,
    outcomes: vec![ScriptedOutcome::Points(vec![])],
  };
  let analyzer = ReplayAnalyzer::new(script)
    .unwrap()
    .rejecting(BufferKind::TextureBacked);
  let orchestrator = Orchestrator::new(analyzer);
  orchestrator
    .configure(RequestConfiguration::rectangles(1).unwrap())
    .unwrap();
  let failures = collect(orchestrator.failures());

  let summary = OneShotTask::default()
    .run_task(frames(BufferKind::TextureBacked), &orchestrator)
    .unwrap();
  assert_eq!(summary.accepted, 1);
  assert!(!orchestrator.is_in_progress());
  assert_eq!(
    failures.lock().unwrap()[0].error,
    EvaluationError::NativeEvaluation(NativeError::UnsupportedBufferKind(
      BufferKind::TextureBacked
    ))
  );
}

#[test]
fn scripted_error_is_reported() {
  let script =
    ReplayScript::from_json(r#"{ "outcomes": [{ "error": "analyzer busy" }] }"#).unwrap();
  let orchestrator = Orchestrator::new(ReplayAnalyzer::new(script).unwrap());
  orchestrator
    .configure(RequestConfiguration::classification(1).unwrap())
    .unwrap();
  let failures = collect(orchestrator.failures());

  OneShotTask::default()
    .run_task(frames(BufferKind::FrameBacked), &orchestrator)
    .unwrap();
  assert!(wait_until(Duration::from_secs(2), || {
    !failures.lock().unwrap().is_empty()
  }));
  assert_eq!(
    failures.lock().unwrap()[0].error,
    EvaluationError::NativeEvaluation(NativeError::Analyzer("analyzer busy".to_string()))
  );
}
