use std::sync::Arc;
use std::time::Duration;

use nimbus_core::{
    BroadcastHub, BroadcastMessage, ContextMapping, ContextStatus, LoginMode, LogicalEnv,
    MessageType, NimbusError, ProviderKind, Subscription, TIMEOUT_EXIT_STATUS,
};
use nimbus_integrations::{Driver, Provider, ProviderSettings};
use nimbus_terminal::{LaunchEvent, ScriptedResponse, ScriptedRunner};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn env(name: &str) -> LogicalEnv {
    LogicalEnv::new(name).unwrap()
}

fn settings() -> ProviderSettings {
    ProviderSettings {
        freshness: Duration::from_secs(300),
        command_timeout: Duration::from_secs(5),
        lock_timeout: Duration::from_secs(1),
        login_timeout: Duration::from_secs(1),
        login_mode: LoginMode::Interactive,
    }
}

fn provider(
    kind: ProviderKind,
    mappings: Vec<ContextMapping>,
    settings: ProviderSettings,
    runner: &ScriptedRunner,
    hub: &BroadcastHub,
) -> Arc<Provider> {
    let provider = Provider::new(
        Driver::for_kind(kind, kind.default_program()),
        mappings,
        settings,
        Arc::new(runner.clone()),
    )
    .unwrap();
    provider.set_broadcast_hub(Some(hub.clone()));
    Arc::new(provider)
}

fn aws_dev() -> ContextMapping {
    ContextMapping::new(ProviderKind::Aws, env("dev"), "dev", "111111111111")
}

fn gcp_dev() -> ContextMapping {
    ContextMapping::new(ProviderKind::Gcp, env("dev"), "dev", "acme-dev")
}

fn sts(account: &str) -> ScriptedResponse {
    ScriptedResponse::stdout(&format!(
        r#"{{"UserId": "AIDAEXAMPLE", "Account": "{account}", "Arn": "arn:aws:iam::{account}:user/ci"}}"#
    ))
}

fn gcloud_info(project: &str, configuration: &str) -> ScriptedResponse {
    ScriptedResponse::stdout(&format!(
        r#"{{"config": {{"project": "{project}", "active_config_name": "{configuration}", "account": "ops@acme.dev"}}}}"#
    ))
}

fn kubeconfig(context: &str, cluster: &str) -> ScriptedResponse {
    ScriptedResponse::stdout(&format!(
        r#"{{"current-context": "{context}", "contexts": [{{"name": "{context}", "context": {{"cluster": "{cluster}"}}}}]}}"#
    ))
}

fn drain(sub: &mut Subscription) -> Vec<BroadcastMessage> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

fn count(messages: &[BroadcastMessage], kind: MessageType) -> usize {
    messages.iter().filter(|m| m.kind == kind).count()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mismatched_account_is_switched_and_verified() {
    let runner = ScriptedRunner::new();
    runner
        .push("sts get-caller-identity", sts("999999999999"))
        .push("configure list --profile dev", ScriptedResponse::stdout("profile dev"))
        .push("sts get-caller-identity", sts("111111111111"))
        .always("s3 ls", ScriptedResponse::stdout("2024-01-01 logs"));
    let hub = BroadcastHub::default();
    let mut sub = hub.subscribe();
    let aws = provider(ProviderKind::Aws, vec![aws_dev()], settings(), &runner, &hub);

    let execution = aws.execute(&env("dev"), "aws s3 ls", None).await.unwrap();

    assert!(execution.succeeded());
    assert_eq!(execution.stdout(), "2024-01-01 logs");
    assert_eq!(
        runner.launches(),
        vec![
            "aws sts get-caller-identity --output json",
            "aws configure list --profile dev",
            "aws sts get-caller-identity --output json --profile dev",
            "aws --profile dev s3 ls",
        ]
    );

    let state = aws.context_state();
    assert_eq!(state.status, ContextStatus::Verified);
    assert_eq!(state.current_identity.unwrap().principal, "111111111111");

    let messages = drain(&mut sub);
    assert_eq!(count(&messages, MessageType::ContextSwitchStarted), 1);
    assert_eq!(count(&messages, MessageType::ContextSwitchFailed), 0);
    // Probe and switch output stays off the hub.
    let outputs: Vec<&str> = messages
        .iter()
        .filter(|m| m.kind == MessageType::CommandOutput)
        .filter_map(|m| m.data["line"].as_str())
        .collect();
    assert_eq!(outputs, vec!["2024-01-01 logs"]);
}

#[tokio::test]
async fn second_mismatch_fails_without_running_the_command() {
    let runner = ScriptedRunner::new();
    runner
        .push("sts get-caller-identity", sts("999999999999"))
        .push("configure list --profile dev", ScriptedResponse::stdout("profile dev"))
        .push("sts get-caller-identity", sts("999999999999"))
        .always("s3 ls", ScriptedResponse::stdout("should never run"));
    let hub = BroadcastHub::default();
    let mut sub = hub.subscribe();
    let aws = provider(ProviderKind::Aws, vec![aws_dev()], settings(), &runner, &hub);

    let err = aws.execute(&env("dev"), "aws s3 ls", None).await.unwrap_err();

    match &err {
        NimbusError::ContextMismatch {
            expected, actual, ..
        } => {
            assert!(expected.contains("111111111111"));
            assert!(actual.contains("999999999999"));
        }
        other => panic!("expected ContextMismatch, got {other:?}"),
    }
    assert!(err.is_context_error());
    assert_eq!(runner.count_matching("s3 ls"), 0);
    assert_eq!(aws.context_state().status, ContextStatus::Failed);

    let messages = drain(&mut sub);
    assert_eq!(count(&messages, MessageType::ContextSwitchFailed), 1);
}

#[tokio::test]
async fn expired_login_during_switch_is_announced_once() {
    let runner = ScriptedRunner::new();
    runner
        .push("sts get-caller-identity", sts("999999999999"))
        .push(
            "configure list --profile dev",
            ScriptedResponse::stderr(
                "Error loading SSO Token: Token for dev does not exist. Run aws sso login",
                255,
            ),
        )
        .push(
            "sso login --profile dev",
            ScriptedResponse::stdout("Successfully logged into Start URL: https://acme.awsapps.com/start"),
        )
        .push("configure list --profile dev", ScriptedResponse::stdout("profile dev"))
        .push("sts get-caller-identity", sts("111111111111"));
    let hub = BroadcastHub::default();
    let mut sub = hub.subscribe();
    let aws = provider(ProviderKind::Aws, vec![aws_dev()], settings(), &runner, &hub);

    let state = aws.ensure_context(&env("dev")).await.unwrap();

    assert_eq!(state.status, ContextStatus::Verified);
    let messages = drain(&mut sub);
    assert_eq!(count(&messages, MessageType::AuthRequired), 1);
    let auth = messages
        .iter()
        .find(|m| m.kind == MessageType::AuthRequired)
        .unwrap();
    assert_eq!(auth.data["login_hint"], "aws sso login --profile dev");
    // The login command's output is streamed for the operator.
    assert!(
        messages
            .iter()
            .any(|m| m.kind == MessageType::CommandOutput
                && m.data["line"].as_str().unwrap_or("").contains("Successfully logged"))
    );
}

#[tokio::test]
async fn failed_login_ends_in_auth_required_error() {
    let runner = ScriptedRunner::new();
    runner
        .push("sts get-caller-identity", sts("999999999999"))
        .push(
            "configure list --profile dev",
            ScriptedResponse::stderr("You are not logged in", 255),
        )
        .push("sso login", ScriptedResponse::stderr("login aborted", 1));
    let hub = BroadcastHub::default();
    let mut sub = hub.subscribe();
    let aws = provider(ProviderKind::Aws, vec![aws_dev()], settings(), &runner, &hub);

    let err = aws.ensure_context(&env("dev")).await.unwrap_err();

    assert!(matches!(err, NimbusError::AuthRequired { .. }));
    assert_eq!(aws.context_state().status, ContextStatus::Failed);
    assert_eq!(count(&drain(&mut sub), MessageType::AuthRequired), 1);
}

#[tokio::test]
async fn timed_out_command_reports_sentinel_status() {
    let runner = ScriptedRunner::new();
    runner
        .always("gcloud info", gcloud_info("acme-dev", "dev"))
        .always(
            "compute instances list",
            ScriptedResponse::stdout("[]").with_delay(Duration::from_millis(300)),
        );
    let hub = BroadcastHub::default();
    let gcp = provider(ProviderKind::Gcp, vec![gcp_dev()], settings(), &runner, &hub);

    let execution = gcp
        .execute(
            &env("dev"),
            "gcloud compute instances list",
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    assert!(execution.timed_out);
    assert_eq!(execution.exit_status, Some(TIMEOUT_EXIT_STATUS));
    assert!(matches!(
        execution.check_timeout(),
        Err(NimbusError::Timeout { .. })
    ));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_ensure_within_window_probes_once() {
    let runner = ScriptedRunner::new();
    runner.always("gcloud info", gcloud_info("acme-dev", "dev"));
    let hub = BroadcastHub::default();
    let gcp = provider(ProviderKind::Gcp, vec![gcp_dev()], settings(), &runner, &hub);

    let first = gcp.ensure_context(&env("dev")).await.unwrap();
    let second = gcp.ensure_context(&env("dev")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(runner.count_matching("gcloud info"), 1);

    gcp.invalidate().await;
    gcp.ensure_context(&env("dev")).await.unwrap();
    assert_eq!(runner.count_matching("gcloud info"), 2);
}

#[tokio::test]
async fn expired_window_probes_again() {
    let runner = ScriptedRunner::new();
    runner.always("gcloud info", gcloud_info("acme-dev", "dev"));
    let hub = BroadcastHub::default();
    let gcp = provider(
        ProviderKind::Gcp,
        vec![gcp_dev()],
        ProviderSettings {
            freshness: Duration::ZERO,
            ..settings()
        },
        &runner,
        &hub,
    );

    gcp.ensure_context(&env("dev")).await.unwrap();
    gcp.ensure_context(&env("dev")).await.unwrap();
    assert_eq!(runner.count_matching("gcloud info"), 2);
}

#[tokio::test]
async fn matching_identity_under_other_selector_still_switches() {
    let runner = ScriptedRunner::new();
    runner
        .push("gcloud info --format=json", gcloud_info("acme-dev", "scratch"))
        .push("configurations activate dev", ScriptedResponse::stdout("Activated [dev]."))
        .push("gcloud info --format=json --configuration dev", gcloud_info("acme-dev", "dev"));
    let hub = BroadcastHub::default();
    let gcp = provider(ProviderKind::Gcp, vec![gcp_dev()], settings(), &runner, &hub);

    let state = gcp.ensure_context(&env("dev")).await.unwrap();

    assert_eq!(state.status, ContextStatus::Verified);
    assert_eq!(state.active_selector.as_deref(), Some("dev"));
    assert_eq!(runner.count_matching("configurations activate dev"), 1);
}

#[tokio::test]
async fn failed_switch_launches_nothing_for_the_command() {
    let runner = ScriptedRunner::new();
    runner
        .push("gcloud info", ScriptedResponse::stderr("ERROR: (gcloud.info) config missing", 1))
        .push(
            "configurations activate dev",
            ScriptedResponse::stderr("ERROR: Cannot activate configuration [dev], it does not exist.", 1),
        )
        .always("compute instances list", ScriptedResponse::stdout("[]"));
    let hub = BroadcastHub::default();
    let mut sub = hub.subscribe();
    let gcp = provider(ProviderKind::Gcp, vec![gcp_dev()], settings(), &runner, &hub);

    let err = gcp
        .execute(&env("dev"), "gcloud compute instances list", None)
        .await
        .unwrap_err();

    assert!(matches!(err, NimbusError::SwitchFailed { .. }));
    assert!(err.to_string().contains("does not exist"));
    assert_eq!(runner.count_matching("compute instances list"), 0);
    assert_eq!(count(&drain(&mut sub), MessageType::ContextSwitchFailed), 1);
}

#[tokio::test]
async fn missing_mapping_and_bad_command_launch_nothing() {
    let runner = ScriptedRunner::new();
    let hub = BroadcastHub::default();
    let gcp = provider(ProviderKind::Gcp, vec![gcp_dev()], settings(), &runner, &hub);

    let err = gcp.ensure_context(&env("qa")).await.unwrap_err();
    assert!(matches!(err, NimbusError::MissingMapping { .. }));

    let err = gcp
        .execute(&env("dev"), "gcloud info; rm -rf ~", None)
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::InvalidCommand { .. }));

    let err = gcp
        .execute(&env("dev"), "gcloud info --project other", None)
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::InvalidCommand { .. }));

    assert_eq!(runner.launch_count(), 0);
}

#[tokio::test]
async fn missing_executable_is_a_launch_error() {
    let runner = ScriptedRunner::new();
    runner.always("gcloud info", ScriptedResponse::launch_failure("not found on PATH"));
    let hub = BroadcastHub::default();
    let gcp = provider(ProviderKind::Gcp, vec![gcp_dev()], settings(), &runner, &hub);

    let err = gcp.ensure_context(&env("dev")).await.unwrap_err();

    assert!(matches!(err, NimbusError::Launch { .. }));
    assert_eq!(gcp.context_state().status, ContextStatus::Failed);
}

#[tokio::test]
async fn login_prompt_in_command_output_forces_reverification() {
    let runner = ScriptedRunner::new();
    runner
        .always("gcloud info", gcloud_info("acme-dev", "dev"))
        .push(
            "compute instances list",
            ScriptedResponse::stderr(
                "ERROR: (gcloud.compute.instances.list) There was a problem refreshing your current auth tokens: Reauthentication failed.",
                1,
            ),
        );
    let hub = BroadcastHub::default();
    let gcp = provider(ProviderKind::Gcp, vec![gcp_dev()], settings(), &runner, &hub);

    let execution = gcp
        .execute(&env("dev"), "gcloud compute instances list", None)
        .await
        .unwrap();

    assert!(!execution.succeeded());
    assert_ne!(gcp.context_state().status, ContextStatus::Verified);
    gcp.ensure_context(&env("dev")).await.unwrap();
    assert_eq!(runner.count_matching("gcloud info"), 2);
}

#[tokio::test]
async fn concurrent_envs_never_interleave() {
    let runner = ScriptedRunner::new();
    runner
        .always(
            "config view --minify -o json --context kind-dev",
            kubeconfig("kind-dev", "dev-cluster"),
        )
        .always(
            "config view --minify -o json --context kind-stage",
            kubeconfig("kind-stage", "stage-cluster"),
        )
        .always("config view --minify -o json", kubeconfig("kind-dev", "dev-cluster"))
        .always("use-context", ScriptedResponse::stdout("Switched to context."))
        .always(
            "get pods",
            ScriptedResponse::stdout("{\"items\": []}").with_delay(Duration::from_millis(30)),
        );
    let hub = BroadcastHub::default();
    let k8s = provider(
        ProviderKind::Kubernetes,
        vec![
            ContextMapping::new(ProviderKind::Kubernetes, env("dev"), "kind-dev", "dev-cluster"),
            ContextMapping::new(
                ProviderKind::Kubernetes,
                env("stage"),
                "kind-stage",
                "stage-cluster",
            ),
        ],
        settings(),
        &runner,
        &hub,
    );

    let mut handles = Vec::new();
    for name in ["dev", "stage", "dev", "stage"] {
        let k8s = Arc::clone(&k8s);
        handles.push(tokio::spawn(async move {
            k8s.execute(&env(name), "kubectl get pods -o json", None).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().succeeded());
    }

    // Every launch finishes before the next one starts.
    let events = runner.events();
    assert!(!events.is_empty());
    for pair in events.chunks(2) {
        match pair {
            [LaunchEvent::Started(a), LaunchEvent::Finished(b)] => assert_eq!(a, b),
            other => panic!("interleaved launches: {other:?}"),
        }
    }
    for spec in runner.launched_specs() {
        if spec.command_text.contains("get pods") {
            let expected = format!("--context kind-{}", spec.logical_env);
            assert!(spec.command_text.contains(&expected), "{}", spec.command_text);
        }
    }
}

#[tokio::test]
async fn busy_provider_times_out_waiting_for_the_lock() {
    let runner = ScriptedRunner::new();
    runner.always("gcloud info", gcloud_info("acme-dev", "dev")).always(
        "compute instances list",
        ScriptedResponse::stdout("[]").with_delay(Duration::from_millis(600)),
    );
    let hub = BroadcastHub::default();
    let gcp = provider(
        ProviderKind::Gcp,
        vec![gcp_dev()],
        ProviderSettings {
            lock_timeout: Duration::from_millis(100),
            ..settings()
        },
        &runner,
        &hub,
    );

    let busy = {
        let gcp = Arc::clone(&gcp);
        tokio::spawn(async move {
            gcp.execute(&env("dev"), "gcloud compute instances list", None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = gcp.ensure_context(&env("dev")).await.unwrap_err();
    assert!(matches!(err, NimbusError::LockTimeout { .. }));
    assert!(busy.await.unwrap().unwrap().succeeded());
}

#[tokio::test]
async fn external_login_completion_resumes_verification() {
    let runner = ScriptedRunner::new();
    runner
        .push(
            "config view",
            ScriptedResponse::stderr("error: You must be logged in to the server (Unauthorized)", 1),
        )
        .push("config view", kubeconfig("kind-dev", "dev-cluster"));
    let hub = BroadcastHub::default();
    let mut sub = hub.subscribe();
    let k8s = provider(
        ProviderKind::Kubernetes,
        vec![ContextMapping::new(
            ProviderKind::Kubernetes,
            env("dev"),
            "kind-dev",
            "dev-cluster",
        )],
        ProviderSettings {
            login_mode: LoginMode::External,
            login_timeout: Duration::from_secs(5),
            ..settings()
        },
        &runner,
        &hub,
    );

    let pending = {
        let k8s = Arc::clone(&k8s);
        tokio::spawn(async move { k8s.ensure_context(&env("dev")).await })
    };
    while k8s.context_state().status != ContextStatus::AuthRequired {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Status never waits on the parked login.
    assert!(!k8s.status().await.is_healthy());
    while !k8s.complete_login(true) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let state = pending.await.unwrap().unwrap();
    assert_eq!(state.status, ContextStatus::Verified);
    assert_eq!(count(&drain(&mut sub), MessageType::AuthRequired), 1);
}

#[tokio::test]
async fn unanswered_external_login_fails() {
    let runner = ScriptedRunner::new();
    runner.always(
        "config view",
        ScriptedResponse::stderr("error: You must be logged in to the server (Unauthorized)", 1),
    );
    let hub = BroadcastHub::default();
    let k8s = provider(
        ProviderKind::Kubernetes,
        vec![ContextMapping::new(
            ProviderKind::Kubernetes,
            env("dev"),
            "kind-dev",
            "dev-cluster",
        )],
        ProviderSettings {
            login_timeout: Duration::from_millis(50),
            ..settings()
        },
        &runner,
        &hub,
    );

    let err = k8s.ensure_context(&env("dev")).await.unwrap_err();
    match err {
        NimbusError::AuthRequired { login_hint, .. } => assert!(login_hint.contains("kind-dev")),
        other => panic!("expected AuthRequired, got {other:?}"),
    }
    assert_eq!(k8s.context_state().status, ContextStatus::Failed);
    assert_eq!(runner.count_matching("config view"), 1);
}
