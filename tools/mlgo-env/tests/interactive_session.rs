mod common;

use common::{mock_module, MockTask, ScriptedCompiler, CLANG_PATH, NUM_STEPS};
use mlgo_env::env::{EnvironmentSettings, MlgoEnvironment, TimeStep};
use mlgo_env::errors::MlgoError;
use mlgo_env::log_reader::LogHeader;
use mlgo_env::session::{ProcessSession, SessionOptions, SessionRuntime};
use mlgo_env::tensor::{DType, TensorSpec, TensorValue};
use mlgo_env::types::{Lifecycle, StepType};
use std::path::Path;
use std::sync::Arc;

fn open_session(compiler: &ScriptedCompiler, interactive: bool, options: &SessionOptions) -> ProcessSession {
    ProcessSession::open(
        SessionRuntime::with_runner(Arc::new(compiler.clone())),
        Path::new(CLANG_PATH),
        &mock_module(),
        Arc::new(MockTask),
        interactive,
        options,
    )
    .expect("open session")
}

fn action() -> TensorValue {
    TensorValue::from_slice("advice", vec![1], &[1i64]).expect("action")
}

#[test]
fn batch_session_runs_the_task_command_line() {
    let compiler = ScriptedCompiler::default();
    let session = open_session(&compiler, false, &SessionOptions::default());

    let spawned = compiler.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(
        spawned[0].command_line(),
        vec![CLANG_PATH, "--opt_a", "a", "--opt_b", "b"]
    );
    assert!(!session.is_interactive());
    session.close();
}

#[test]
fn interactive_session_streams_one_observation_per_frame() {
    let compiler = ScriptedCompiler::default();
    let mut session = open_session(&compiler, true, &SessionOptions::default());
    let prefix = session.pipe_prefix().expect("prefix").to_path_buf();
    assert!(prefix.starts_with(session.working_dir()));
    assert!(compiler.spawned()[0]
        .args
        .contains(&format!("--interactive={}", prefix.display())));
    assert_eq!(session.lifecycle(), Lifecycle::Communicating);

    for idx in 0..NUM_STEPS as i64 {
        let observation = session.get_observation().expect("read").expect("observation");
        assert_eq!(observation.context, format!("context_{idx}"));
        assert_eq!(
            observation.feature("times_called").expect("feature").values::<i64>().expect("ints"),
            vec![idx]
        );
        assert!((observation.reward.to_f64_vec()[0] - 3.14).abs() < 1e-5);
        session.send_action(&action()).expect("action");
    }
    assert!(session.get_observation().expect("end").is_none());
    assert!(session.get_observation().expect("still ended").is_none());

    let sent = std::fs::read(prefix.with_extension("in")).expect("actions");
    assert_eq!(sent.len(), NUM_STEPS as usize * 8);
    session.close();
}

#[test]
fn ephemeral_working_dir_lives_exactly_as_long_as_the_session() {
    let compiler = ScriptedCompiler::default();
    let mut session = open_session(&compiler, true, &SessionOptions::default());
    let mut working_dir = None;
    for _ in 0..NUM_STEPS {
        let observation = session.get_observation().expect("read").expect("observation");
        assert!(observation.working_dir.exists());
        working_dir = Some(observation.working_dir);
    }
    drop(session);
    assert!(!working_dir.expect("seen").exists());
}

#[test]
fn explicit_temps_dir_outlives_the_session() {
    let root = tempfile::tempdir().expect("tempdir");
    let options = SessionOptions {
        explicit_temps_dir: Some(root.path().to_path_buf()),
        ..SessionOptions::default()
    };
    let compiler = ScriptedCompiler::default();
    let mut session = open_session(&compiler, true, &options);
    let mut working_dir = None;
    for _ in 0..NUM_STEPS {
        let observation = session.get_observation().expect("read").expect("observation");
        assert!(observation.working_dir.exists());
        working_dir = Some(observation.working_dir);
    }
    session.close();
    let working_dir = working_dir.expect("seen");
    assert!(working_dir.exists());
    assert!(working_dir.starts_with(root.path()));
}

#[test]
fn advice_size_mismatch_is_rejected_before_writing() {
    let header = LogHeader {
        advice: Some(TensorSpec::new("advice", vec![1], DType::Int32)),
        ..common::times_called_header()
    };
    let compiler = ScriptedCompiler::with_header(header);
    let mut session = open_session(&compiler, true, &SessionOptions::default());
    session.get_observation().expect("read").expect("observation");
    assert!(session.header().and_then(|h| h.advice.as_ref()).is_some());

    let err = session.send_action(&action()).expect_err("8 bytes vs 4");
    assert!(matches!(err, MlgoError::InvalidAction(_)));
    let ok = TensorValue::from_slice("advice", vec![1], &[1i32]).expect("i32");
    session.send_action(&ok).expect("matching size");
}

#[test]
fn trace_dir_records_the_stream_with_a_digest() {
    let traces = tempfile::tempdir().expect("tempdir");
    let options = SessionOptions {
        trace_dir: Some(traces.path().to_path_buf()),
        ..SessionOptions::default()
    };
    let compiler = ScriptedCompiler::default();
    let mut session = open_session(&compiler, true, &options);
    while session.get_observation().expect("read").is_some() {}
    let trace = session.trace_path().expect("trace");
    session.close();

    assert!(trace.starts_with(traces.path()));
    mlgo_env::replay::replayer::verify_trace_digest(&trace).expect("digest");
    let records = mlgo_env::log_reader::read_log(&trace)
        .expect("open")
        .collect::<Result<Vec<_>, _>>()
        .expect("records");
    assert_eq!(records.len(), NUM_STEPS as usize);
}

fn times_called(step: &TimeStep) -> i64 {
    let values = step
        .observation()
        .and_then(|observation| observation.feature("times_called"))
        .expect("times_called feature")
        .values::<i64>()
        .expect("int64 feature");
    values[0]
}

fn run_episodes(interactive_only: bool) {
    let compiler = ScriptedCompiler::default();
    let mut settings = EnvironmentSettings::new(CLANG_PATH);
    settings.interactive_only = interactive_only;
    let mut env = MlgoEnvironment::new(
        settings,
        Arc::new(MockTask),
        SessionRuntime::with_runner(Arc::new(compiler.clone())),
    );
    let module = mock_module();

    for _ in 0..3 {
        let step = env.reset(&module).expect("reset");
        assert_eq!(step.step_type, StepType::First);
        assert_eq!(
            step.observation().map(|o| o.context.as_str()),
            Some("context_0")
        );

        assert_eq!(times_called(&step), 0);

        for expected in 1..NUM_STEPS as i64 {
            let step = env.step(&action()).expect("step");
            assert_eq!(step.step_type, StepType::Mid);
            assert_eq!(times_called(&step), expected);
        }

        let step = env.step(&action()).expect("final step");
        assert_eq!(step.step_type, StepType::Last);
        let score = step.score().expect("score");
        assert_eq!(score.module_scores.get("default"), Some(&47.0));
        assert_eq!(score.session_id, env.scoring_session_id());

        if interactive_only {
            assert_eq!(env.interactive_session_id(), env.scoring_session_id());
        } else {
            assert_ne!(env.interactive_session_id(), env.scoring_session_id());
        }
        let err = env.step(&action()).expect_err("episode over");
        assert!(matches!(err, MlgoError::Transition(_)));
    }

    let spawned = compiler.spawned().len();
    assert_eq!(spawned, if interactive_only { 3 } else { 6 });
    env.close();
    assert_eq!(env.phase(), None);
}

#[test]
fn environment_runs_full_episodes_with_a_separate_scoring_compile() {
    run_episodes(false);
}

#[test]
fn environment_runs_full_episodes_interactive_only() {
    run_episodes(true);
}

#[test]
fn failing_scoring_compile_resets_the_environment() {
    let compiler = ScriptedCompiler::default().exiting_with(1);
    let mut env = MlgoEnvironment::new(
        EnvironmentSettings::new(CLANG_PATH),
        Arc::new(MockTask),
        SessionRuntime::with_runner(Arc::new(compiler.clone())),
    );
    env.reset(&mock_module()).expect("reset");
    for _ in 0..NUM_STEPS - 1 {
        env.step(&action()).expect("step");
    }
    let err = env.step(&action()).expect_err("scoring fails");
    assert!(format!("{err}").contains("scripted failure"));
    assert_eq!(env.phase(), None);
    assert_eq!(env.interactive_session_id(), None);

    let err = env.step(&action()).expect_err("uninitialized");
    assert!(matches!(err, MlgoError::Transition(_)));
}
