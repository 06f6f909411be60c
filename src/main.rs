mod api;
mod auth;
mod config;
mod dates;
mod logging;
mod output;
mod realtime;
mod session;
mod state;
#[cfg(feature = "window")]
mod window;

use std::io::Read;

use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use crate::api::{ApiClient, DmApi, DmParams, DmTarget};
use crate::config::Config;
use crate::output::FriendListOutput;
use crate::session::Session;

#[derive(Parser)]
#[command(
    name = "tdm",
    version,
    about = "Twitter direct messages from the terminal",
    after_help = "Examples:\n  tdm\n  tdm watch --window\n  tdm received --count 20\n  tdm sent --since-id 240136858829479935\n  tdm show --id 240136858829479936\n  tdm send --to alice --text \"hello\"\n  echo hi | tdm send --user-id 42 --stdin\n  tdm delete --id 240136858829479936\n  tdm friends --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, global = true, help = "Output JSON instead of a table")]
    json: bool,

    #[arg(long, global = true, help = "Compact JSON (implies --json)")]
    compact: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Load recent messages, then follow the live stream (default)")]
    Watch(WatchArgs),
    #[command(about = "List direct messages sent to you")]
    Received(ListArgs),
    #[command(about = "List direct messages you sent")]
    Sent(ListArgs),
    #[command(about = "Fetch a single direct message by id")]
    Show(IdArgs),
    #[command(about = "Send a direct message")]
    Send(SendArgs),
    #[command(about = "Delete a direct message by id")]
    Delete(IdArgs),
    #[command(about = "List the accounts you follow")]
    Friends,
}

#[derive(Args, Default)]
struct WatchArgs {
    #[arg(long, help = "Keep running until a native window is closed instead of Ctrl-C")]
    window: bool,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, help = "Only messages newer than this id")]
    since_id: Option<i64>,

    #[arg(long, help = "Only messages at or older than this id")]
    max_id: Option<i64>,

    #[arg(long, help = "Maximum number of messages to return")]
    count: Option<u32>,
}

impl ListArgs {
    fn params(&self) -> DmParams {
        let mut params = DmParams {
            count: self.count,
            ..DmParams::default()
        };
        if let Some(id) = self.since_id {
            params = params.since_id(id);
        }
        if let Some(id) = self.max_id {
            params = params.max_id(id);
        }
        params
    }
}

#[derive(Args)]
struct IdArgs {
    #[arg(long, help = "Message id")]
    id: i64,
}

#[derive(Args)]
struct SendArgs {
    #[arg(
        long,
        value_name = "HANDLE",
        conflicts_with = "user_id",
        required_unless_present = "user_id",
        help = "Recipient screen name"
    )]
    to: Option<String>,

    #[arg(long, help = "Recipient user id")]
    user_id: Option<i64>,

    #[arg(
        long,
        conflicts_with = "stdin",
        required_unless_present = "stdin",
        help = "Message text"
    )]
    text: Option<String>,

    #[arg(long, help = "Read message text from stdin")]
    stdin: bool,
}

impl SendArgs {
    fn target(&self) -> Result<DmTarget, Box<dyn std::error::Error>> {
        match (&self.to, self.user_id) {
            (Some(handle), None) => Ok(DmTarget::ScreenName(handle.clone())),
            (None, Some(id)) => Ok(DmTarget::UserId(id)),
            _ => Err("Provide exactly one of --to or --user-id".into()),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init();
    let config = Config::load();
    let json = cli.json || cli.compact;
    let json_format = output::resolve_json_format(cli.compact);

    match cli.command.unwrap_or(Command::Watch(WatchArgs::default())) {
        Command::Watch(args) => watch(&config, args).await?,
        Command::Received(args) => {
            let api = client(&config)?;
            let messages = api.fetch_received(args.params()).await?;
            output::print_messages(&output::build_message_list(messages), json, json_format)?;
        }
        Command::Sent(args) => {
            let api = client(&config)?;
            let messages = api.fetch_sent(args.params()).await?;
            output::print_messages(&output::build_message_list(messages), json, json_format)?;
        }
        Command::Show(args) => {
            let api = client(&config)?;
            let message = api.fetch_by_id(args.id).await?;
            output::print_message_detail(&output::message_summary(message), json, json_format)?;
        }
        Command::Send(args) => {
            let target = args.target()?;
            let text = resolve_message_text(args.text, args.stdin)?;
            api::validate_text(&text)?;
            let api = client(&config)?;
            let message = api.send(&text, &target).await?;
            if json {
                output::print_json(&output::message_summary(message), json_format)?;
            } else {
                println!("Sent message {} to @{}", message.id, message.recipient_screen_name);
            }
        }
        Command::Delete(args) => {
            let api = client(&config)?;
            let message = api.delete(args.id).await?;
            if json {
                output::print_json(&output::message_summary(message), json_format)?;
            } else {
                println!("Deleted message {}", message.id);
            }
        }
        Command::Friends => {
            let api = client(&config)?;
            let friends = api.list_friends().await?;
            output::print_friends(&FriendListOutput { friends }, json, json_format)?;
        }
    }

    Ok(())
}

fn client(config: &Config) -> Result<ApiClient, api::ApiError> {
    ApiClient::new(&config.api_base_url, &config.stream_url, config.credentials.clone())
}

fn resolve_message_text(text: Option<String>, stdin: bool) -> Result<String, Box<dyn std::error::Error>> {
    if stdin {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        return Ok(buffer.trim_end_matches(['\r', '\n']).to_string());
    }
    text.ok_or_else(|| "Provide --text or --stdin".into())
}

async fn watch(config: &Config, args: WatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.window && cfg!(not(feature = "window")) {
        return Err("--window needs a build with window support (cargo build --features window)".into());
    }

    let mut session = Session::connect(config).await?;
    let added = session.bootstrap(config.bootstrap_count).await;
    {
        let chats = session.index().read().await;
        if chats.is_empty() {
            info!(user = %session.user().screen_name, "no direct messages yet");
        } else {
            info!(messages = added, conversations = chats.len(), "loaded recent messages");
        }
    }
    output::render(session.index()).await;

    session.open_stream();
    session.start_consumer()?;

    let waited = match args.window {
        #[cfg(feature = "window")]
        true => wait_for_window(&session),
        _ => wait_for_ctrl_c(&session).await,
    };
    session.close_stream().await?;
    waited
}

const STREAM_ENDED: &str = "user stream ended; see the log for the cause";

#[cfg(feature = "window")]
fn wait_for_window(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    debug!("running window event loop");
    // The event loop owns this thread until it exits; the runtime keeps
    // driving the stream tasks on its other workers.
    let exit = tokio::task::block_in_place(|| -> Result<window::ShellExit, window::WindowError> {
        let shell = window::WindowShell::init()?;
        let waker = shell.waker();
        let stream_ended = session.stream_ended();
        let watcher = tokio::spawn(async move {
            stream_ended.await;
            waker.stream_ended();
        });
        let exit = shell.run();
        watcher.abort();
        exit
    })?;
    match exit {
        window::ShellExit::Closed => {
            info!("window closed; shutting down");
            Ok(())
        }
        window::ShellExit::StreamEnded => Err(STREAM_ENDED.into()),
    }
}

async fn wait_for_ctrl_c(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    debug!("waiting for ctrl-c");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("shutting down");
            Ok(())
        }
        () = session.stream_ended() => Err(STREAM_ENDED.into()),
    }
}
