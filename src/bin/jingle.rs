//! Jingle CLI binary.
//!
//! # Commands
//!
//! - `demo` - Negotiate a file-transfer session between two local endpoints
//! - `config` - Print the effective configuration

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jingle::{
    driver::{loopback, Driver, DriverHandle, LocalContent},
    Condition, Config, FileMeta, FileTransfer, Origin, Reason, SessionEvent, VERSION,
};

#[derive(Parser)]
#[command(name = "jingle")]
#[command(version = VERSION)]
#[command(about = "Jingle session negotiation engine", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/jingle/config.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Negotiate a file transfer between two endpoints over a loopback channel
    Demo {
        /// Name of the offered file
        #[arg(short, long, default_value = "hello.txt")]
        file: String,

        /// Size of the generated file in bytes
        #[arg(short, long, default_value = "1024")]
        size: usize,

        /// Let the responder decline the session
        #[arg(long)]
        reject: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Demo { file, size, reject } => cmd_demo(&config, file, size, reject),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        },
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = path.or_else(|| Config::default_path().filter(|p| p.exists()));
    let base = match path {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    let config = base.merge(Config::from_env());
    config.validate()?;
    Ok(config)
}

fn cmd_demo(config: &Config, file: String, size: usize, reject: bool) -> anyhow::Result<()> {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let meta = FileMeta::from_bytes(file, &data).with_media_type("application/octet-stream");

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (alice_link, bob_link) = loopback();
        let (alice, mut alice_handle) = Driver::new("alice@localhost/demo", "bob@localhost/demo", alice_link, config)?;
        let (bob, mut bob_handle) = Driver::new("bob@localhost/demo", "alice@localhost/demo", bob_link, config)?;
        let alice_task = tokio::spawn(alice.run());
        let bob_task = tokio::spawn(bob.run());

        let offer = LocalContent::new("file", Origin::Initiator, Box::new(FileTransfer::offer(meta)));
        let sid = alice_handle.initiate(vec![offer]).await?;
        tracing::info!(sid = %sid, "offer sent");

        bob_handle
            .wait_for(|e| matches!(e.event, SessionEvent::NewContentReceived(_)))
            .await
            .context("responder never saw the offer")?;
        if reject {
            bob_handle.terminate(&sid, Reason::with_text(Condition::Decline, "not today")).await?;
        } else {
            bob_handle.accept(&sid).await?;
            wait_active(&mut alice_handle).await?;
            wait_active(&mut bob_handle).await?;
            for (who, handle) in [("initiator", &alice_handle), ("responder", &bob_handle)] {
                let snapshot = handle.snapshot(&sid).await?;
                println!("{who}: {}", serde_json::to_string_pretty(&snapshot)?);
            }
            alice_handle.terminate(&sid, Reason::with_text(Condition::Success, "done")).await?;
        }

        let outcome = alice_handle
            .wait_for(|e| matches!(e.event, SessionEvent::Terminated(_)))
            .await
            .context("session never terminated")?;
        if let SessionEvent::Terminated(reason) = outcome.event {
            match reason {
                Some(reason) => println!("session {sid} terminated: {reason}"),
                None => println!("session {sid} terminated"),
            }
        }

        drop(alice_handle);
        drop(bob_handle);
        alice_task.await??;
        bob_task.await??;
        Ok::<_, anyhow::Error>(())
    })
}

async fn wait_active(handle: &mut DriverHandle) -> anyhow::Result<()> {
    let event = handle
        .wait_for(|e| {
            matches!(
                e.event,
                SessionEvent::ContentActive(_) | SessionEvent::Terminated(_)
            )
        })
        .await
        .context("driver stopped")?;
    match event.event {
        SessionEvent::ContentActive(key) => {
            tracing::info!(content = %key, "content active");
            Ok(())
        },
        other => anyhow::bail!("session ended before the content connected: {other:?}"),
    }
}
