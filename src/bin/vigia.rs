use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vigia_monitor::app::Monitor;
use vigia_monitor::config::{MonitorConfig, DEFAULT_CONFIG_PATH};
use vigia_monitor::db::{Company, ComplianceConfig, EventKind, MemoryStore, MonitoringStore, PgStore, Post};
use vigia_monitor::monitoring::{PresenceEvent, SessionState};
use vigia_monitor::notifications::{MailService, Notice};
use vigia_monitor::realtime::TerminalBell;
use vigia_monitor::tasks::TaskHandle;
use vigia_monitor::version::VERSION;

#[derive(Parser, Debug)]
#[command(name = "vigia", version = VERSION, about = "Presence and compliance monitoring for guarded posts")]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Run against an in-memory store with sample data.
    #[arg(long)]
    demo: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Guard a post until Ctrl-C.
    Guard {
        #[arg(long)]
        post: i64,
        #[arg(long)]
        secret: String,
    },
    /// Follow the event timeline as a company viewer until Ctrl-C.
    Watch {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Send the fixed test message through the configured mail provider.
    TestEmail { to: String },
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    // Daily-rotated JSON file plus human-readable stdout.
    let (file_writer, guard) = tracing_appender::non_blocking(rolling::daily("logs", "vigia.log"));
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false).json();
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
    guard
}

fn demo_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.add_company(Company {
        id: 1,
        name: "DeltaNuvem".to_string(),
        username: "admin".to_string(),
        password: "admin".to_string(),
        blocked: false,
    });
    store.add_company(Company {
        id: 2,
        name: "Condomínio Aurora".to_string(),
        username: "aurora".to_string(),
        password: "aurora".to_string(),
        blocked: false,
    });
    for (id, name) in [(1, "Portaria Principal"), (2, "Garagem")] {
        store.add_post(Post {
            id,
            company_id: 2,
            name: name.to_string(),
            location: "Bloco A".to_string(),
            blocked: false,
            access_secret: "demo".to_string(),
            last_heartbeat: None,
        });
        store.put_compliance_config(ComplianceConfig::default_for(id));
        store.put_failure_count(id, 0);
    }
    Arc::new(store)
}

async fn open_store(config: &MonitorConfig, demo: bool) -> Result<Arc<dyn MonitoringStore>, Box<dyn Error>> {
    if demo {
        info!("Demo mode: using the in-memory store.");
        return Ok(demo_store());
    }
    let store = PgStore::connect(config.database_url()?, config.database.max_connections).await?;
    store.migrate().await?;
    info!("Connected to the monitoring database.");
    Ok(Arc::new(store))
}

/// Logs notices until the channel closes. Errors go to the operator on stderr.
fn spawn_notice_printer(mut notices: broadcast::Receiver<Notice>) -> TaskHandle {
    TaskHandle::spawn("notices", move |mut shutdown| async move {
        loop {
            tokio::select! {
                received = notices.recv() => match received {
                    Ok(notice) if notice.is_error() => eprintln!("[{}] {}", notice.title(), notice.message()),
                    Ok(notice) => println!("[{}] {}", notice.title(), notice.message()),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.triggered() => break,
            }
        }
    })
}

async fn stop_all(tasks: Vec<TaskHandle>) {
    let names: Vec<&'static str> = tasks.iter().map(TaskHandle::name).collect();
    join_all(tasks.into_iter().map(TaskHandle::stop)).await;
    info!(tasks = ?names, "Background tasks stopped.");
}

async fn run_guard(monitor: Monitor, post_id: i64, secret: &str) -> Result<(), Box<dyn Error>> {
    monitor.load().await?;
    let mut tasks = vec![
        spawn_notice_printer(monitor.subscribe_notices()),
        monitor.spawn_offline_sync(),
    ];
    tasks.extend(monitor.spawn_probe());

    let session = monitor.start_session(post_id, secret).await?;
    println!(
        "Guarding '{}'. Commands: <enter> confirm presence, 'activate', 'panic', 'exit'.",
        session.post().name
    );
    let mut presence = monitor.start_presence(&session).await;
    let mut presence_events = presence.take_events();
    let mut state = session.watch_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received.");
                break;
            }
            changed = state.changed() => {
                let current = *state.borrow_and_update();
                if changed.is_err() || current != SessionState::Active {
                    warn!(post_id, state = ?current, "Session is no longer active.");
                    break;
                }
            }
            Some(event) = async {
                match presence_events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match event {
                PresenceEvent::Prompt { answer_window } => {
                    print!("\x07");
                    println!("Presence check: press <enter> within {}s.", answer_window.as_secs());
                }
                PresenceEvent::Confirmed => println!("Presence confirmed."),
                PresenceEvent::Missed(outcome) => println!("Presence check missed: {outcome:?}"),
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "" => {
                        if !presence.confirm() {
                            warn!("No presence prompt is running.");
                        }
                    }
                    "activate" => {
                        if let Err(e) = session.system_event(EventKind::SystemActivated).await {
                            error!(error = %e, "System activation not recorded.");
                        }
                    }
                    "panic" => {
                        if let Err(e) = session.panic().await {
                            error!(error = %e, "Panic event not recorded.");
                        }
                    }
                    "exit" => break,
                    other => println!("Unknown command '{other}'."),
                },
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to read stdin.");
                    break;
                }
            },
        }
    }

    presence.stop().await;
    session.exit().await;
    stop_all(tasks).await;
    Ok(())
}

async fn run_watch(monitor: Monitor, username: &str, password: &str) -> Result<(), Box<dyn Error>> {
    monitor.load().await?;
    let viewer = monitor.sign_in(username, password).await?;
    println!("Signed in as {} ({}).", viewer.company_name, viewer.username);
    for entry in monitor.visible_timeline(None).await.iter().take(20) {
        println!(
            "{}  {:<24} {:<20} {}",
            entry.event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.post_name,
            entry.event.kind,
            entry.event.status
        );
    }

    let mut tasks = vec![
        spawn_notice_printer(monitor.subscribe_notices()),
        monitor.spawn_reconciler(Arc::new(TerminalBell)).await?,
        monitor.spawn_compliance(),
        monitor.spawn_offline_sync(),
    ];
    tasks.extend(monitor.spawn_probe());

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received.");
    monitor.sign_out();
    stop_all(tasks).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    dotenv::dotenv().ok();
    let _log_guard = init_logging();
    info!(version = VERSION, "Starting vigia...");

    let config = match MonitorConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Critical error loading configuration. Exiting.");
            return Err(e.into());
        }
    };

    if let Command::TestEmail { to } = &args.command {
        let mailer = MailService::from_config(&config.mail)?;
        mailer.send_test_email(to).await?;
        println!("Test email sent to {to}.");
        return Ok(());
    }

    let store = open_store(&config, args.demo).await?;
    let monitor = Monitor::new(store, config)?;

    let result = match &args.command {
        Command::Guard { post, secret } => run_guard(monitor, *post, secret).await,
        Command::Watch { username, password } => run_watch(monitor, username, password).await,
        Command::TestEmail { .. } => Ok(()),
    };
    if let Err(e) = &result {
        error!(error = %e, "vigia stopped with an error.");
    }
    result
}
