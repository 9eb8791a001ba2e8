use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;

use orcterm_core::config::{SessionSettings, paths};
use orcterm_core::ssh::{
    ChallengeReason, ChannelChallengeHandler, ChannelListener, Credentials, Endpoint,
    HostKeyStore, HostKeyVerifier, RusshTransport, SessionConnector, SessionId, SessionRegistry,
    TerminalEvent, TerminalSession, TrustDecision, VerifyChallenge,
};

const USAGE: &str = "usage: orcterm-connect user@host[:port] [private_key_path]";

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = paths::ensure_log_dir().ok();
    let _guard = orcterm_core::logging::init_logging(log_dir);

    let mut args = std::env::args().skip(1);
    let target = args.next().context(USAGE)?;
    let endpoint = Endpoint::parse(&target)
        .with_context(|| format!("invalid target '{target}'\n{USAGE}"))?;

    let settings = SessionSettings::load().unwrap_or_else(|e| {
        tracing::warn!("Using default settings: {}", e);
        SessionSettings::default()
    });

    paths::ensure_config_dir().context("creating config directory")?;
    let known_hosts = paths::known_hosts_file().context("no config directory for known_hosts")?;

    let mut stdin_lines = spawn_stdin_reader();
    let credentials = match args.next() {
        Some(key_path) => Credentials::private_key(
            paths::expand_tilde(&key_path),
            std::env::var("ORCTERM_PASSPHRASE").ok(),
        ),
        None => match std::env::var("ORCTERM_PASSWORD") {
            Ok(password) => Credentials::password(password),
            Err(_) => {
                eprint!("{}'s password: ", endpoint);
                std::io::stderr().flush()?;
                let password = stdin_lines.recv().await.context("stdin closed")?;
                Credentials::password(password)
            }
        },
    };

    let (challenge_handler, mut challenges) = ChannelChallengeHandler::new(1);
    let verifier = HostKeyVerifier::new(HostKeyStore::open(known_hosts))
        .with_decision_timeout(settings.decision_timeout());
    let transport = Arc::new(RusshTransport::new());
    let registry = Arc::new(SessionRegistry::new());
    let connector = Arc::new(SessionConnector::new(
        transport,
        Arc::new(verifier),
        registry,
        Arc::new(challenge_handler),
        settings,
    ));

    let terminal = TerminalSession::new(SessionId(1), endpoint.to_string(), connector);
    let (listener, mut events) = ChannelListener::new();
    terminal.add_listener(listener);
    tracing::info!("Connecting to {}", endpoint);
    let _connecting = terminal.connect(endpoint.clone(), credentials);

    let mut stdout = std::io::stdout();
    let mut connected_once = false;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(pending) = challenges.recv() => {
                print_challenge(&pending.challenge);
                let answer = stdin_lines.recv().await.unwrap_or_default();
                pending.respond(parse_decision(&answer));
            }
            event = events.recv() => match event {
                Some(TerminalEvent::Connected) => {
                    connected_once = true;
                    eprintln!("Connected to {endpoint}");
                }
                Some(TerminalEvent::Data(bytes)) => {
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
                Some(TerminalEvent::Error(message)) => {
                    if !connected_once {
                        bail!(message);
                    }
                    eprintln!("{message}");
                }
                Some(TerminalEvent::Disconnected) | None => break,
            },
            line = stdin_lines.recv(), if stdin_open && terminal.is_connected() => match line {
                Some(mut line) => {
                    line.push('\n');
                    terminal.write(line.as_bytes()).await?;
                }
                None => {
                    stdin_open = false;
                    terminal.disconnect().await;
                }
            },
        }
    }

    eprintln!("Connection to {endpoint} closed");
    Ok(())
}

/// Read stdin lines on a plain thread so prompts and the shell can share them.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_challenge(challenge: &VerifyChallenge) {
    match challenge.reason {
        ChallengeReason::FirstUse => {
            eprintln!(
                "The authenticity of host '{}' (port {}) can't be established.",
                challenge.host, challenge.port
            );
        }
        ChallengeReason::Changed => {
            eprintln!("WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!");
            eprintln!(
                "The host key for '{}' (port {}) differs from the one on record.",
                challenge.host, challenge.port
            );
            if let Some(previous) = &challenge.previous_fingerprint {
                eprintln!("Previous fingerprint: {previous}");
            }
        }
    }
    eprintln!(
        "{} key fingerprint is {}.",
        challenge.key_type, challenge.fingerprint
    );
    eprint!("Trust it? [y]es and remember / [o]nce / [N]o: ");
    let _ = std::io::stderr().flush();
}

fn parse_decision(answer: &str) -> TrustDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => TrustDecision::TrustAndSave,
        "o" | "once" => TrustDecision::TrustOnce,
        _ => TrustDecision::Reject,
    }
}
