use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use parlor::{
    ConversationId, Direction, GatewayError, ManualClock, MemoryGateway, MessageId,
    MessengerError, MessengerSession, MessengerSettings, Participant, SettingsError, SettingsStore,
    TimelineEntry,
};

const BUILTIN_FIXTURE: &str = r#"{
    "conversations": [
        {
            "id": "c1",
            "participants": [
                {"id": "u1", "display_name": "Alice"},
                {"id": "u2", "display_name": "Bob"}
            ],
            "messages": [
                {
                    "id": "1",
                    "sender_id": "u2",
                    "sender_name": "Bob",
                    "content": "hello",
                    "timestamp": "2024-01-01T10:00:00Z"
                }
            ]
        },
        {
            "id": "c2",
            "title": "Weekend plans",
            "participants": [
                {"id": "u1", "display_name": "Alice"},
                {"id": "u2", "display_name": "Bob"},
                {"id": "u3", "display_name": "Carol"}
            ],
            "messages": [
                {
                    "id": "20",
                    "sender_id": "u3",
                    "sender_name": "Carol",
                    "content": "hike on saturday?",
                    "timestamp": "2024-01-01T18:00:00Z"
                },
                {
                    "id": "21",
                    "sender_id": "u1",
                    "sender_name": "Alice",
                    "content": "sure",
                    "timestamp": "2024-01-02T08:15:00Z"
                }
            ]
        }
    ]
}"#;

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    fixture_path: Option<String>,
    settings_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    CacheHit,
    OptimisticOrder,
    Rollback,
    SingleFlight,
    DateGrouping,
    EndToEnd,
    SettingsRoundtrip,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "cache_hit" => Some(Self::CacheHit),
            "optimistic_order" => Some(Self::OptimisticOrder),
            "rollback" => Some(Self::Rollback),
            "single_flight" => Some(Self::SingleFlight),
            "date_grouping" => Some(Self::DateGrouping),
            "end_to_end" => Some(Self::EndToEnd),
            "settings_roundtrip" => Some(Self::SettingsRoundtrip),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::CacheHit => "cache_hit",
            Self::OptimisticOrder => "optimistic_order",
            Self::Rollback => "rollback",
            Self::SingleFlight => "single_flight",
            Self::DateGrouping => "date_grouping",
            Self::EndToEnd => "end_to_end",
            Self::SettingsRoundtrip => "settings_roundtrip",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("scenario '{scenario}' needs --settings <path>"))]
    MissingSettingsPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("failed to read fixture at '{path}': {source}"))]
    FixtureIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("fixture is invalid: {source}"))]
    Fixture {
        stage: &'static str,
        source: GatewayError,
    },
    #[snafu(display("settings operation failed: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("messenger operation failed: {source}"))]
    Messenger {
        stage: &'static str,
        source: MessengerError,
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
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    let fixture = match args.fixture_path.as_deref() {
        Some(path) => {
            println!("fixture_path={path}");
            std::fs::read_to_string(path).context(FixtureIoSnafu {
                stage: "read-fixture-file",
                path: path.to_string(),
            })?
        }
        None => BUILTIN_FIXTURE.to_string(),
    };

    let settings = match args.settings_path.as_deref() {
        Some(path) => SettingsStore::new(PathBuf::from(path)),
        None => SettingsStore::load(),
    };
    println!("settings_path={}", settings.config_path().display());
    let effective = settings.settings();
    println!("fetch_timeout_ms={}", effective.fetch_timeout_ms.unwrap_or(0));
    println!("send_timeout_ms={}", effective.send_timeout_ms.unwrap_or(0));

    let runner = Runner {
        fixture,
        settings,
        settings_given: args.settings_path.is_some(),
    };

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::CacheHit => runner.cache_hit().await,
        Scenario::OptimisticOrder => runner.optimistic_order().await,
        Scenario::Rollback => runner.rollback().await,
        Scenario::SingleFlight => runner.single_flight().await,
        Scenario::DateGrouping => runner.date_grouping().await,
        Scenario::EndToEnd => runner.end_to_end().await,
        Scenario::SettingsRoundtrip => runner.settings_roundtrip(),
        Scenario::All => runner.all().await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut fixture_path = None;
    let mut settings_path = None;
    let mut pending = args.into_iter();

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
            "--fixture" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-fixture-value",
                    arg: "--fixture",
                })?;
                fixture_path = Some(value);
            }
            "--settings" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-settings-value",
                    arg: "--settings",
                })?;
                settings_path = Some(value);
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
        fixture_path,
        settings_path,
    })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let local = MessageId::local();
    let reparsed: MessageId = local.to_string().into();
    let local_ok = reparsed == local && reparsed.is_local() && reparsed.local_uuid().is_ok();
    let remote_ok = !MessageId::new("42").is_local();

    println!("local_id_roundtrip={local_ok}");
    println!("remote_id_not_local={remote_ok}");
    ensure(local_ok && remote_ok, "id_roundtrip", "message id classification mismatch")?;
    println!("runner_ok=true");
    Ok(())
}

struct Runner {
    fixture: String,
    settings: SettingsStore,
    settings_given: bool,
}

impl Runner {
    fn gateway(&self) -> RunnerResult<Arc<MemoryGateway>> {
        MemoryGateway::from_fixture_json(&self.fixture)
            .map(Arc::new)
            .context(FixtureSnafu {
                stage: "build-memory-gateway",
            })
    }

    fn session(&self, gateway: Arc<MemoryGateway>) -> MessengerSession {
        let now = Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 5, 0)
            .single()
            .unwrap_or_else(Utc::now);
        MessengerSession::with_clock(
            Participant::new("u1", "Alice"),
            gateway,
            self.settings.settings(),
            Arc::new(ManualClock::new(now)),
        )
    }

    async fn loaded(
        &self,
    ) -> RunnerResult<(Arc<MemoryGateway>, MessengerSession, ConversationId)> {
        let gateway = self.gateway()?;
        let session = self.session(gateway.clone());
        let conversations = session.load_conversations().await.context(MessengerSnafu {
            stage: "load-conversations",
        })?;
        let first = conversations.first().context(ScenarioFailedSnafu {
            stage: "select-first",
            scenario: "setup",
            reason: "fixture has no conversations".to_string(),
        })?;
        if session.active_conversation_id().is_none() {
            session
                .select_conversation(first)
                .await
                .context(MessengerSnafu {
                    stage: "select-first",
                })?;
        }
        Ok((gateway, session, first.id.clone()))
    }

    async fn cache_hit(&self) -> RunnerResult<()> {
        let (gateway, session, first) = self.loaded().await?;
        for conversation in session.conversations() {
            session
                .select_conversation(&conversation)
                .await
                .context(MessengerSnafu {
                    stage: "cache-hit-select",
                })?;
        }
        session
            .select_conversation_by_id(&first)
            .await
            .context(MessengerSnafu {
                stage: "cache-hit-reselect",
            })?;

        let calls = gateway.list_messages_calls(&first);
        println!("list_messages_calls={calls}");
        ensure(calls == 1, "cache_hit", "revisit fetched messages again")?;
        println!("runner_ok=true");
        Ok(())
    }

    async fn optimistic_order(&self) -> RunnerResult<()> {
        let (gateway, session, active) = self.loaded().await?;
        gateway.pause_sends();

        let pending_send = session
            .begin_send(&active, "on my way")
            .context(MessengerSnafu {
                stage: "optimistic-order-begin",
            })?
            .context(ScenarioFailedSnafu {
                stage: "optimistic-order-begin",
                scenario: "optimistic_order",
                reason: "send was not accepted".to_string(),
            })?;

        let tail_ok = session
            .messages(&active)
            .and_then(|messages| messages.last().cloned())
            .is_some_and(|tail| &tail == pending_send.message());
        let gated = session.begin_send(&active, "again").ok().flatten().is_none();
        println!("optimistic_tail={tail_ok}");
        println!("second_send_ignored={gated}");

        gateway.resume_sends();
        pending_send.dispatch().await.context(MessengerSnafu {
            stage: "optimistic-order-dispatch",
        })?;

        ensure(tail_ok && gated, "optimistic_order", "optimistic append not observed")?;
        println!("runner_ok=true");
        Ok(())
    }

    async fn rollback(&self) -> RunnerResult<()> {
        let (gateway, session, active) = self.loaded().await?;
        let before = session.messages(&active);
        gateway.fail_next_send();

        let rejected = session.send_message(&active, "hi").await.is_err();
        let restored = session.messages(&active) == before;
        let notices = session.notices().len();
        println!("send_rejected={rejected}");
        println!("list_restored={restored}");
        println!("notices={notices}");

        ensure(
            rejected && restored && notices == 1,
            "rollback",
            "rejected send left residue",
        )?;
        println!("runner_ok=true");
        Ok(())
    }

    async fn single_flight(&self) -> RunnerResult<()> {
        let (gateway, session, active) = self.loaded().await?;
        gateway.pause_sends();

        let first = session
            .begin_send(&active, "one")
            .context(MessengerSnafu {
                stage: "single-flight-first",
            })?;
        let second = session
            .begin_send(&active, "two")
            .context(MessengerSnafu {
                stage: "single-flight-second",
            })?;
        let accepted = usize::from(first.is_some()) + usize::from(second.is_some());
        println!("accepted_sends={accepted}");

        gateway.resume_sends();
        if let Some(pending_send) = first {
            pending_send.dispatch().await.context(MessengerSnafu {
                stage: "single-flight-dispatch",
            })?;
        }

        ensure(accepted == 1, "single_flight", "concurrent sends were both accepted")?;
        println!("runner_ok=true");
        Ok(())
    }

    async fn date_grouping(&self) -> RunnerResult<()> {
        let (_, session, _) = self.loaded().await?;

        let mut headers = Vec::new();
        for conversation in session.conversations() {
            session
                .select_conversation(&conversation)
                .await
                .context(MessengerSnafu {
                    stage: "date-grouping-select",
                })?;
            let view = session.projected_view(&conversation.id);
            let consistent = view.first().is_none_or(|entry| entry.as_date_header().is_some());
            ensure(consistent, "date_grouping", "timeline does not open with a header")?;
            headers.extend(
                view.iter()
                    .filter_map(TimelineEntry::as_date_header)
                    .map(|header| header.label.clone()),
            );
        }

        println!("date_headers={}", headers.join("|"));
        println!("runner_ok=true");
        Ok(())
    }

    async fn end_to_end(&self) -> RunnerResult<()> {
        let (gateway, session, active) = self.loaded().await?;
        let before = session.projected_view(&active);

        gateway.fail_next_send();
        let pending_send = session
            .begin_send(&active, "hi")
            .context(MessengerSnafu {
                stage: "end-to-end-begin",
            })?
            .context(ScenarioFailedSnafu {
                stage: "end-to-end-begin",
                scenario: "end_to_end",
                reason: "send was not accepted".to_string(),
            })?;

        let optimistic = session.projected_view(&active);
        let sent_tail = optimistic
            .last()
            .and_then(TimelineEntry::as_message)
            .is_some_and(|view| view.direction == Direction::Sent && view.pending);
        println!("optimistic_entries={}", optimistic.len());
        println!("optimistic_tail_sent={sent_tail}");

        let rejected = pending_send.dispatch().await.is_err();
        let restored = session.projected_view(&active) == before;
        println!("rolled_back={}", rejected && restored);

        ensure(
            sent_tail && rejected && restored,
            "end_to_end",
            "projection did not return to its pre-send state",
        )?;
        println!("runner_ok=true");
        Ok(())
    }

    fn settings_roundtrip(&self) -> RunnerResult<()> {
        if !self.settings_given {
            return MissingSettingsPathSnafu {
                stage: "settings-roundtrip-path",
                scenario: "settings_roundtrip",
            }
            .fail();
        }

        let current = self.settings.settings();
        let edited = MessengerSettings {
            fetch_timeout_ms: Some(current.fetch_timeout_ms.unwrap_or(0) + 1_000),
            date_label_format: "%Q".to_string(),
            ..(*current).clone()
        };
        let stored = self.settings.update(edited).context(SettingsSnafu {
            stage: "settings-roundtrip-update",
        })?;
        let reread = SettingsStore::new(self.settings.config_path().to_path_buf()).settings();

        let persisted = reread == stored;
        let format_repaired = stored.date_label_format != "%Q";
        println!("settings_persisted={persisted}");
        println!("invalid_format_repaired={format_repaired}");

        // Put the previous values back.
        self.settings
            .update((*current).clone())
            .context(SettingsSnafu {
                stage: "settings-roundtrip-restore",
            })?;

        ensure(
            persisted && format_repaired,
            "settings_roundtrip",
            "settings did not survive a write and reread",
        )?;
        println!("runner_ok=true");
        Ok(())
    }

    async fn all(&self) -> RunnerResult<()> {
        run_id_roundtrip()?;
        self.cache_hit().await?;
        self.optimistic_order().await?;
        self.rollback().await?;
        self.single_flight().await?;
        self.date_grouping().await?;
        self.end_to_end().await?;
        if self.settings_given {
            self.settings_roundtrip()?;
        }
        println!("all_passed=true");
        Ok(())
    }
}

fn ensure(condition: bool, scenario: &'static str, reason: &str) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }

    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason: reason.to_string(),
    }
    .fail()
}
