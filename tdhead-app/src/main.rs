//! tdhead: headless Telegram client in the terminal.
//!
//! Logs in (asking for the code and 2FA password as needed), prints every
//! incoming message, appends it to a log file, and lets you send text
//! messages by chat id or `@username`.
//!
//!   tdhead --api-id 12345 --api-hash 0123abcd --phone +15550001111
//!
//! Point `--library` at `libtdjson` when it is not on the system search path.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tdhead_client::{
    AuthorizationState, Client, ClientRegistry, Config, ConsoleDelivery, InputKind,
    InputProvider, InputRequest, SessionStore, spawn_delivery,
};
use tdhead_native::TdJsonLibrary;
use tokio::sync::{Mutex, mpsc};

/// Run a headless Telegram client using TDLib.
#[derive(Parser, Debug)]
#[command(name = "tdhead", version, about)]
struct Args {
    /// Telegram API ID obtained from https://my.telegram.org
    #[arg(long, env = "TDHEAD_API_ID")]
    api_id: i32,

    /// Telegram API hash obtained from https://my.telegram.org
    #[arg(long, env = "TDHEAD_API_HASH")]
    api_hash: String,

    /// Phone number in international format. Asked for when omitted.
    #[arg(long, env = "TDHEAD_PHONE")]
    phone: Option<String>,

    /// Where TDLib keeps its database.
    #[arg(long, default_value = "tdlib")]
    database_directory: PathBuf,

    /// Where TDLib keeps downloaded files. Defaults to the database directory.
    #[arg(long)]
    files_directory: Option<PathBuf>,

    /// Path to libtdjson. Defaults to the platform library name.
    #[arg(long, env = "TDHEAD_LIBRARY")]
    library: Option<PathBuf>,

    /// Every incoming message is appended here.
    #[arg(long, default_value = "messages.log")]
    log_file: PathBuf,

    /// Only write messages to the log file.
    #[arg(long)]
    no_console: bool,

    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    /// TDLib's own log verbosity (0 = fatal errors only).
    #[arg(long, default_value_t = 1)]
    verbosity: i32,
}

impl Args {
    fn config(&self) -> Config {
        let mut session = SessionStore::new(&self.database_directory);
        if let Some(files) = &self.files_directory {
            session = session.with_files_directory(files);
        }
        Config {
            api_id:          self.api_id,
            api_hash:        self.api_hash.clone(),
            phone:           self.phone.clone(),
            session,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            log_verbosity:   Some(self.verbosity),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() {
    // Enable logging: RUST_LOG=tdhead_client=debug tdhead ...
    if std::env::var("RUST_LOG").is_err() {
        // SAFETY: runs before anything else reads the environment
        unsafe { std::env::set_var("RUST_LOG", "tdhead_client=info,tdhead_app=info"); }
    }
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("\n✗ {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let library = match &args.library {
        Some(path) => TdJsonLibrary::load(path)?,
        None       => TdJsonLibrary::load_default()?,
    };

    let terminal = Arc::new(Terminal::new());
    let client = Client::start(
        ClientRegistry::global(),
        &library,
        args.config(),
        Arc::new(TerminalInput(terminal.clone())),
    ).await?;

    let outcome = tokio::select! {
        result = session(&client, &args, &terminal) => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nExiting...");
            Ok(())
        }
    };
    client.destroy().await;
    outcome
}

/// Login, then display and send until the user leaves or the client closes.
async fn session(client: &Client, args: &Args, terminal: &Terminal) -> Result<(), Box<dyn std::error::Error>> {
    client.wait_authenticated().await?;
    match client.get_me().await {
        Ok(me) => println!("✅ Signed in as {}", me.display_name()),
        Err(e) => tracing::warn!("[tdhead] getMe failed: {e}"),
    }

    let names = client.names().clone();
    let console = if args.no_console {
        let delivery = ConsoleDelivery::new(tokio::io::sink(), names).with_log_file(&args.log_file).await?;
        spawn_delivery(client.subscribe(), delivery)
    } else {
        let delivery = ConsoleDelivery::stdout(names).with_log_file(&args.log_file).await?;
        spawn_delivery(client.subscribe(), delivery)
    };
    tracing::info!("[tdhead] Logging messages to {}", args.log_file.display());

    println!("\n👂 Listening for messages (Ctrl+C to quit) …\n");
    let mut states = client.auth_states();
    tokio::select! {
        _ = send_loop(client, terminal) => {}
        _ = states.wait_for(|s| *s == Some(AuthorizationState::Closed)) => {
            println!("Client closed");
        }
    }
    console.abort();
    Ok(())
}

const EXIT_WORDS: [&str; 4] = ["exit", "quit", ":q", "q"];

async fn send_loop(client: &Client, terminal: &Terminal) {
    loop {
        let Some(target) = terminal.prompt("Enter chat ID or @username: ").await else { return };
        if EXIT_WORDS.contains(&target.to_lowercase().as_str()) {
            return;
        }
        if target.is_empty() {
            continue;
        }
        let Some(text) = terminal.prompt("Enter your message: ").await else { return };
        if text.is_empty() {
            println!("Nothing to send");
            continue;
        }
        match client.send_to(&target, &text).await {
            Ok(chat_id) => println!("💬 Sent to {chat_id}"),
            Err(e)      => println!("✗ Could not send to {target}: {e}"),
        }
    }
}

// ─── Terminal input ───────────────────────────────────────────────────────────

/// Stdin lines, read on a plain thread so a pending read never holds up
/// shutdown. Shared by the login prompts and the send loop.
struct Terminal {
    lines: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Terminal {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawned = std::thread::Builder::new()
            .name("tdhead-stdin".into())
            .spawn(move || {
                for line in io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::error!("[tdhead] Could not start the stdin reader: {e}");
        }
        Self { lines: Mutex::new(rx) }
    }

    /// Print `msg` and read one trimmed line. `None` at end of input.
    async fn prompt(&self, msg: &str) -> Option<String> {
        let mut lines = self.lines.lock().await;
        print!("{msg}");
        if let Err(e) = io::stdout().flush() {
            tracing::debug!("[tdhead] stdout flush failed: {e}");
        }
        lines.recv().await.map(|line| line.trim().to_string())
    }
}

struct TerminalInput(Arc<Terminal>);

#[async_trait]
impl InputProvider for TerminalInput {
    async fn request(&self, request: InputRequest) -> Option<String> {
        if let Some(error) = &request.error {
            println!("✗ {error}");
        }
        let label = match request.kind {
            InputKind::PhoneNumber => "Enter your phone number: ".to_string(),
            InputKind::Code        => "Enter the code you received: ".to_string(),
            InputKind::Password    => {
                let hint = request.hint.as_deref().filter(|h| !h.is_empty()).unwrap_or("(no hint)");
                format!("2FA password (hint: {hint}): ")
            }
            InputKind::FirstName   => "First name for the new account: ".to_string(),
            InputKind::LastName    => "Last name (optional): ".to_string(),
        };
        self.0.prompt(&label).await
    }
}
