use std::env;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use folio_chat::{ChatClient, ChatError, MessageStatus, Role};
use folio_remote::{ScriptedConversationService, StreamFrame};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SendRoundtrip,
    SendRollback,
    EditBranch,
    SwitchRestoresDepth,
    StreamErrorPartial,
    StreamCancel,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "send_roundtrip" => Some(Self::SendRoundtrip),
            "send_rollback" => Some(Self::SendRollback),
            "edit_branch" => Some(Self::EditBranch),
            "switch_restores_depth" => Some(Self::SwitchRestoresDepth),
            "stream_error_partial" => Some(Self::StreamErrorPartial),
            "stream_cancel" => Some(Self::StreamCancel),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SendRoundtrip => "send_roundtrip",
            Self::SendRollback => "send_rollback",
            Self::EditBranch => "edit_branch",
            Self::SwitchRestoresDepth => "switch_restores_depth",
            Self::StreamErrorPartial => "stream_error_partial",
            Self::StreamCancel => "stream_cancel",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("engine call failed: {source}"))]
    EngineCall {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    match args.scenario {
        Scenario::SendRoundtrip => run_send_roundtrip().await,
        Scenario::SendRollback => run_send_rollback().await,
        Scenario::EditBranch => run_edit_branch().await,
        Scenario::SwitchRestoresDepth => run_switch_restores_depth().await,
        Scenario::StreamErrorPartial => run_stream_error_partial().await,
        Scenario::StreamCancel => run_stream_cancel().await,
        Scenario::All => run_all().await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut pending = args.into_iter();

    // The parser is intentionally strict to keep scenario execution deterministic in CI.
    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
    })
}

async fn run_all() -> RunnerResult<()> {
    run_send_roundtrip().await?;
    run_send_rollback().await?;
    run_edit_branch().await?;
    run_switch_restores_depth().await?;
    run_stream_error_partial().await?;
    run_stream_cancel().await?;

    println!("all_passed=true");
    Ok(())
}

fn delta(text: &str) -> StreamFrame {
    StreamFrame::Delta {
        text: text.to_string(),
    }
}

async fn wait_for_stream_idle(client: &ChatClient, scenario: &'static str) -> RunnerResult<()> {
    for _ in 0..400 {
        if !client.is_stream_in_flight() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    ScenarioFailedSnafu {
        stage: "wait-for-stream-idle",
        scenario,
        reason: "stream never reached an idle state".to_string(),
    }
    .fail()
}

async fn run_send_roundtrip() -> RunnerResult<()> {
    let service = Arc::new(ScriptedConversationService::new());
    service.seed_conversation();
    let confirmed = service.queue_send_success();
    service.script_frames(
        confirmed.assistant_message_id,
        vec![delta("Hello"), delta("!"), StreamFrame::Done],
    );

    let client = ChatClient::open(service.clone(), None)
        .await
        .context(EngineCallSnafu {
            stage: "scenario-send-roundtrip-open",
        })?;
    client.send("hi", None).await.context(EngineCallSnafu {
        stage: "scenario-send-roundtrip-send",
    })?;
    wait_for_stream_idle(&client, "send_roundtrip").await?;

    let thread = client.active_thread();
    let thread_shape_ok = thread.len() == 3
        && thread[0].role == Role::System
        && thread[1].role == Role::User
        && thread[2].role == Role::Assistant;
    let identities_confirmed = thread.iter().all(|view| !view.key.is_local());
    let streamed_content_ok =
        thread.last().map(|view| view.content.as_str()) == Some("Hello!")
            && thread.last().map(|view| view.status.clone()) == Some(MessageStatus::Done);

    println!("thread_shape_ok={thread_shape_ok}");
    println!("identities_confirmed={identities_confirmed}");
    println!("streamed_content_ok={streamed_content_ok}");

    if !thread_shape_ok || !identities_confirmed || !streamed_content_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-send-roundtrip-assert",
            scenario: "send_roundtrip",
            reason: "confirmed thread or streamed content does not match the scripted exchange"
                .to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_send_rollback() -> RunnerResult<()> {
    let service = Arc::new(ScriptedConversationService::new());
    service.seed_conversation();
    service.queue_send_failure("backend unavailable");

    let client = ChatClient::open(service.clone(), None)
        .await
        .context(EngineCallSnafu {
            stage: "scenario-send-rollback-open",
        })?;
    let before: Vec<_> = client.active_thread().iter().map(|view| view.key).collect();

    let send_result = client.send("hi", None).await;
    let failure_surfaced = matches!(send_result, Err(ChatError::Remote { .. }));

    let after: Vec<_> = client.active_thread().iter().map(|view| view.key).collect();
    let thread_restored = before == after;
    let flags_cleared = !client.is_mutation_in_flight() && !client.is_stream_in_flight();

    println!("failure_surfaced={failure_surfaced}");
    println!("thread_restored={thread_restored}");
    println!("flags_cleared={flags_cleared}");

    if !failure_surfaced || !thread_restored || !flags_cleared {
        return ScenarioFailedSnafu {
            stage: "scenario-send-rollback-assert",
            scenario: "send_rollback",
            reason: "transport failure did not restore the pre-send state".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_edit_branch() -> RunnerResult<()> {
    let service = Arc::new(ScriptedConversationService::new());
    service.seed_conversation();
    let send_confirmed = service.queue_send_success();
    service.script_frames(
        send_confirmed.assistant_message_id,
        vec![delta("first reply"), StreamFrame::Done],
    );

    let client = ChatClient::open(service.clone(), None)
        .await
        .context(EngineCallSnafu {
            stage: "scenario-edit-branch-open",
        })?;
    client.send("draft", None).await.context(EngineCallSnafu {
        stage: "scenario-edit-branch-send",
    })?;
    wait_for_stream_idle(&client, "edit_branch").await?;

    let original_key = client.active_thread()[1].key;
    let edit_confirmed = service.queue_edit_success();
    service.script_frames(
        edit_confirmed.assistant_message_id,
        vec![delta("second reply"), StreamFrame::Done],
    );

    client
        .edit(original_key, "revised draft")
        .await
        .context(EngineCallSnafu {
            stage: "scenario-edit-branch-edit",
        })?;
    wait_for_stream_idle(&client, "edit_branch").await?;

    let revised_thread = client.active_thread();
    let branch_created = revised_thread[1].content == "revised draft"
        && revised_thread[1].sibling_count == 2
        && revised_thread[2].content == "second reply";

    client
        .switch_version(original_key)
        .context(EngineCallSnafu {
            stage: "scenario-edit-branch-switch-back",
        })?;
    let original_thread = client.active_thread();
    let original_intact = original_thread[1].content == "draft"
        && original_thread[2].content == "first reply";

    println!("branch_created={branch_created}");
    println!("original_intact={original_intact}");

    if !branch_created || !original_intact {
        return ScenarioFailedSnafu {
            stage: "scenario-edit-branch-assert",
            scenario: "edit_branch",
            reason: "editing did not fork a sibling branch with the original preserved".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_switch_restores_depth() -> RunnerResult<()> {
    let service = Arc::new(ScriptedConversationService::new());
    service.seed_conversation();

    let client = {
        let first = service.queue_send_success();
        service.script_frames(
            first.assistant_message_id,
            vec![delta("first"), StreamFrame::Done],
        );
        let client = ChatClient::open(service.clone(), None)
            .await
            .context(EngineCallSnafu {
                stage: "scenario-switch-depth-open",
            })?;
        client.send("one", None).await.context(EngineCallSnafu {
            stage: "scenario-switch-depth-send-one",
        })?;
        wait_for_stream_idle(&client, "switch_restores_depth").await?;
        client
    };

    let second = service.queue_send_success();
    service.script_frames(
        second.assistant_message_id,
        vec![delta("second"), StreamFrame::Done],
    );
    client.send("two", None).await.context(EngineCallSnafu {
        stage: "scenario-switch-depth-send-two",
    })?;
    wait_for_stream_idle(&client, "switch_restores_depth").await?;

    let deep_thread: Vec<_> = client.active_thread().iter().map(|view| view.key).collect();
    let first_user = client.active_thread()[1].key;

    let edit_confirmed = service.queue_edit_success();
    service.script_frames(
        edit_confirmed.assistant_message_id,
        vec![delta("forked"), StreamFrame::Done],
    );
    client
        .edit(first_user, "one-edited")
        .await
        .context(EngineCallSnafu {
            stage: "scenario-switch-depth-edit",
        })?;
    wait_for_stream_idle(&client, "switch_restores_depth").await?;

    let forked_len = client.active_thread().len();
    client.switch_version(first_user).context(EngineCallSnafu {
        stage: "scenario-switch-depth-switch",
    })?;
    let restored: Vec<_> = client.active_thread().iter().map(|view| view.key).collect();

    let depth_restored = restored == deep_thread;
    println!("forked_thread_len={forked_len}");
    println!("restored_thread_len={}", restored.len());
    println!("depth_restored={depth_restored}");

    if !depth_restored {
        return ScenarioFailedSnafu {
            stage: "scenario-switch-depth-assert",
            scenario: "switch_restores_depth",
            reason: "switching back did not restore the deepest previous continuation".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_stream_error_partial() -> RunnerResult<()> {
    let service = Arc::new(ScriptedConversationService::new());
    service.seed_conversation();
    let confirmed = service.queue_send_success();
    // No terminal frame: the feed closes abnormally after one delta.
    service.script_frames(confirmed.assistant_message_id, vec![delta("par")]);

    let client = ChatClient::open(service.clone(), None)
        .await
        .context(EngineCallSnafu {
            stage: "scenario-stream-error-open",
        })?;
    client.send("hi", None).await.context(EngineCallSnafu {
        stage: "scenario-stream-error-send",
    })?;
    wait_for_stream_idle(&client, "stream_error_partial").await?;

    let thread = client.active_thread();
    let partial_preserved = thread[2].content == "par";
    let node_flagged = matches!(thread[2].status, MessageStatus::Error(_));

    println!("partial_preserved={partial_preserved}");
    println!("node_flagged={node_flagged}");

    if !partial_preserved || !node_flagged {
        return ScenarioFailedSnafu {
            stage: "scenario-stream-error-assert",
            scenario: "stream_error_partial",
            reason: "abnormal feed close did not preserve partial content with an error flag"
                .to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_stream_cancel() -> RunnerResult<()> {
    let service = Arc::new(ScriptedConversationService::new());
    service.seed_conversation();
    let confirmed = service.queue_send_success();
    service.script_frames(
        confirmed.assistant_message_id,
        vec![delta("Hel"), delta("lo"), StreamFrame::Done],
    );

    let client = ChatClient::open(service.clone(), None)
        .await
        .context(EngineCallSnafu {
            stage: "scenario-stream-cancel-open",
        })?;

    // Cancelling with nothing live must be a no-op.
    client.cancel_stream();

    client.send("hi", None).await.context(EngineCallSnafu {
        stage: "scenario-stream-cancel-send",
    })?;
    client.cancel_stream();
    wait_for_stream_idle(&client, "stream_cancel").await?;

    let thread = client.active_thread();
    let terminal_state_ok = matches!(
        thread[2].status,
        MessageStatus::Cancelled | MessageStatus::Done
    );
    let content_is_prefix = "Hello".starts_with(thread[2].content.as_str());

    println!("terminal_state_ok={terminal_state_ok}");
    println!("content_is_prefix={content_is_prefix}");

    if !terminal_state_ok || !content_is_prefix {
        return ScenarioFailedSnafu {
            stage: "scenario-stream-cancel-assert",
            scenario: "stream_cancel",
            reason: "cancellation corrupted the streamed node".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}
