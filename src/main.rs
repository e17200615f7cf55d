use std::time::Duration;

use clap::Parser;
use colored::*;
use tokio::io::BufReader;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use wolf_collab::cli::{input_lines, Args, Command, WatchArgs};
use wolf_collab::presence::{CollaborationView, Tab};
use wolf_collab::protocol::{Inbound, UserRef, WireMessage};
use wolf_collab::{server, ConnectionManager, Session, SessionEvent, SessionOptions};

const SIMULATION_TICK: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wolf_collab=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Serve(serve) => server::serve(serve.resolve()?).await?,
        Command::Watch(watch) => run_watch(watch).await?,
    }
    Ok(())
}

fn redraw(view: &CollaborationView, tab: Tab, manager: &ConnectionManager) {
    let state = view.current();
    let mode = if view.is_simulation() { " [simulation]" } else { "" };
    println!(
        "{}",
        format!(
            "── {tab} · {} active · {}{mode} ──",
            state.active_count(),
            manager.state()
        )
        .bright_blue()
        .bold()
    );
    for line in view.render(tab) {
        if line.starts_with('○') {
            println!("  {}", line.dimmed());
        } else {
            println!("  {line}");
        }
    }
}

fn print_help() {
    eprintln!(
        "{}",
        "  /tab activity|users|chat · /sim · /stats · /quit · anything else is sent as chat"
            .dimmed()
    );
}

async fn run_watch(args: WatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.resolve()?;
    let delay = config.auto_connect_delay();
    let capacity = config.event_log_capacity;
    let manager = ConnectionManager::new(config)?;

    let mut session = Session::with_options(
        &manager,
        SessionOptions {
            auto_connect: false,
            request_roster_on_connect: true,
        },
    );
    let _error_sub = manager.on_error(|e| {
        eprintln!("{}", format!("  connection error: {e}").red());
    });
    let auto_connect = manager.connect_after(delay);

    let mut view = CollaborationView::new(capacity);
    view.set_simulation(args.simulate);
    let mut tab = args.tab;
    let fallback_user = UserRef::new(
        args.id.clone().unwrap_or_default(),
        args.name.clone().unwrap_or_else(|| "me".to_string()),
    );

    let mut stdin = input_lines(BufReader::new(tokio::io::stdin()));
    let mut sim_tick = tokio::time::interval(SIMULATION_TICK);

    print_help();
    redraw(&view, tab, &manager);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            event = session.recv() => {
                match event {
                    Some(SessionEvent::Connected) => {
                        eprintln!("{}", "  connected".green());
                    }
                    Some(SessionEvent::Disconnected) => {
                        eprintln!("{}", "  disconnected; retrying".yellow());
                    }
                    Some(SessionEvent::Message(Inbound::Message(msg))) => {
                        if let WireMessage::Error(body) = &msg {
                            eprintln!("{}", format!("  relay error: {}", body.message).red());
                            continue;
                        }
                        if let Some(notice) = view.apply(&msg) {
                            eprintln!("{}", format!("  {notice}").bright_yellow());
                        }
                        if !view.is_simulation() {
                            redraw(&view, tab, &manager);
                        }
                    }
                    Some(SessionEvent::Message(other)) => {
                        eprintln!("{}", format!("  unhandled frame: {other:?}").dimmed());
                    }
                    None => break,
                }
            }

            _ = sim_tick.tick() => {
                if view.is_simulation() {
                    if let Some(notice) = view.tick_simulation(chrono::Utc::now()) {
                        eprintln!("{}", format!("  {notice}").bright_yellow());
                    }
                    redraw(&view, tab, &manager);
                }
            }

            line = stdin.next() => {
                let Some(Ok(line)) = line else { break };
                let line = line.trim();
                match line.split_once(' ').unwrap_or((line, "")) {
                    ("", _) => {}
                    ("/quit", _) => break,
                    ("/sim", _) => {
                        view.toggle_simulation();
                        redraw(&view, tab, &manager);
                    }
                    ("/stats", _) => {
                        let stats = serde_json::to_string_pretty(&manager.stats())?;
                        eprintln!("{stats}");
                    }
                    ("/tab", name) => match <Tab as clap::ValueEnum>::from_str(name.trim(), true) {
                        Ok(next) => {
                            tab = next;
                            redraw(&view, tab, &manager);
                        }
                        Err(_) => print_help(),
                    },
                    (cmd, _) if cmd.starts_with('/') => print_help(),
                    _ => {
                        let me = view.live().me().cloned().unwrap_or_else(|| fallback_user.clone());
                        if !session.send(&WireMessage::chat(me, line)) {
                            eprintln!("{}", "  not connected; message dropped".yellow());
                        }
                    }
                }
            }
        }
    }

    auto_connect.abort();
    drop(session);
    manager.close();
    Ok(())
}
