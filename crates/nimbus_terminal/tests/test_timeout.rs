#![cfg(unix)]

use std::time::{Duration, Instant};

use nimbus_core::{BroadcastHub, LogicalEnv, MessageType, ProviderKind, TIMEOUT_EXIT_STATUS};
use nimbus_terminal::{CommandRunner, CommandSpec, TokioCommandRunner};

fn spec(args: &[&str]) -> CommandSpec {
    CommandSpec::new(
        ProviderKind::Kubernetes,
        LogicalEnv::new("dev").unwrap(),
        "exec-scenario",
        args.iter().copied(),
    )
}

fn process_exists(pid: i32) -> bool {
    // An unreaped zombie counts as gone; it can no longer run.
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        if let Some(rest) = stat.rsplit_once(')').map(|(_, r)| r.trim_start()) {
            return !rest.starts_with('Z');
        }
    }
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[tokio::test]
async fn ten_second_command_with_five_second_timeout_is_terminated() {
    let start = Instant::now();
    let stream = TokioCommandRunner::new()
        .run(spec(&["sleep", "10"]).with_timeout(Duration::from_secs(5)), None)
        .await
        .expect("sleep should launch");
    let pid = stream.process_group().expect("real child has a pid");

    let (_, outcome) = stream.collect_all().await;
    let elapsed = start.elapsed();

    assert!(outcome.timed_out);
    assert_eq!(outcome.exit_status, Some(TIMEOUT_EXIT_STATUS));
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(9), "took {elapsed:?}");
    assert!(!process_exists(pid), "child must be gone after timeout");
}

#[tokio::test]
async fn grandchildren_die_with_the_group() {
    let stream = TokioCommandRunner::new()
        .run(
            spec(&["sh", "-c", "sleep 30 & echo $!; wait"]).with_timeout(Duration::from_millis(500)),
            None,
        )
        .await
        .unwrap();
    let (chunks, outcome) = stream.collect_all().await;
    assert!(outcome.timed_out);

    let grandchild: i32 = chunks[0].line.trim().parse().expect("pid line");
    let deadline = Instant::now() + Duration::from_secs(3);
    while process_exists(grandchild) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!process_exists(grandchild), "background child escaped the group kill");
}

#[tokio::test]
async fn every_subscriber_sees_lines_in_production_order() {
    let hub = BroadcastHub::default();
    let mut first = hub.subscribe();
    let mut second = hub.subscribe();

    let stream = TokioCommandRunner::new()
        .run(spec(&["seq", "1", "200"]), Some(&hub))
        .await
        .unwrap();
    let (chunks, outcome) = stream.collect_all().await;
    assert!(outcome.success());
    assert_eq!(chunks.len(), 200);

    for sub in [&mut first, &mut second] {
        let mut lines = Vec::new();
        while let Some(msg) = sub.try_recv() {
            assert_eq!(msg.kind, MessageType::CommandOutput);
            assert_eq!(msg.data["provider_kind"], "k8s");
            lines.push(msg.data["line"].as_str().unwrap().parse::<u32>().unwrap());
        }
        assert_eq!(lines, (1..=200).collect::<Vec<_>>());
    }
}
