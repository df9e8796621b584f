use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use smartmark::callback::CallbackServer;
use smartmark::config::{DEFAULT_DATA_DIR, PREFERENCES_FILE};
use smartmark::models::BookmarkCard;
use smartmark::preferences::Preferences;
use smartmark::store::BookmarkChange;
use smartmark::{App, Config, FeedStatus, NoticeLevel, Screen};

/// SmartMark: your saved universe, organized.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding session.json and preferences.json.
    #[arg(long, env = "SMARTMARK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with Google.
    Login {
        /// Seconds to wait for the browser to come back.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// List your bookmarks, newest first.
    List,
    /// Save a bookmark.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        url: String,
        /// General, Dev, Design or Personal.
        #[arg(long, default_value = "General")]
        category: String,
    },
    /// Delete a bookmark by id.
    Delete {
        id: String,
        /// Skip the confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Sign out.
    Logout {
        /// Skip the confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Print changes as they happen until Ctrl-C.
    Watch,
    /// Show or toggle the light/dark theme.
    Theme {
        #[command(subcommand)]
        action: Option<ThemeAction>,
    },
}

#[derive(Subcommand, Debug)]
enum ThemeAction {
    Toggle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    setup_logging();

    let args = Args::parse();

    if let Command::Theme { action } = &args.command {
        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        // No Supabase settings needed just for the theme
        let mut preferences = Preferences::load(data_dir.join(PREFERENCES_FILE));
        let theme = match action {
            Some(ThemeAction::Toggle) => preferences.toggle_theme()?,
            None => preferences.theme(),
        };
        println!("{}", theme);
        return Ok(());
    }

    let mut config = Config::from_env().context("SUPABASE_URL and SUPABASE_ANON_KEY must be set")?;
    if let Some(data_dir) = args.data_dir {
        config = config.with_data_dir(data_dir);
    }
    // One-shot commands never open the Realtime socket
    let live = matches!(args.command, Command::Watch);
    let mut app = App::from_config(&config)?.with_live_updates(live);

    let result = run(&mut app, &config, args.command).await;
    print_notices(&app);
    result
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,smartmark=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(app: &mut App, config: &Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Login { timeout } => login(app, config, Duration::from_secs(timeout)).await,
        Command::List => {
            require_signed_in(app).await?;
            print_cards(&app.cards());
            println!("{} saved", app.saved_count());
            Ok(())
        }
        Command::Add { title, url, category } => {
            require_signed_in(app).await?;
            let created = app.create_bookmark(&title, &url, &category).await?;
            println!("Saved {} ({})", created.title, created.id);
            Ok(())
        }
        Command::Delete { id, yes } => {
            require_signed_in(app).await?;
            app.request_delete(&id);
            let title = app
                .cards()
                .into_iter()
                .find(|card| card.id == id)
                .map(|card| card.title)
                .unwrap_or_else(|| id.clone());
            if !yes && !confirm(&format!("Delete \"{}\"?", title)).await? {
                app.cancel_delete();
                return Ok(());
            }
            app.confirm_delete().await?;
            println!("Deleted {}", title);
            Ok(())
        }
        Command::Logout { yes } => {
            if app.start().await != Screen::Bookmarks {
                println!("Not signed in.");
                return Ok(());
            }
            app.request_sign_out();
            if !yes && !confirm("Sign out? You'll need to sign in again to access your bookmarks.").await? {
                app.cancel_sign_out();
                return Ok(());
            }
            // Local state is gone even if this fails
            let result = app.confirm_sign_out().await;
            println!("Signed out.");
            Ok(result?)
        }
        Command::Watch => watch(app).await,
        Command::Theme { .. } => Ok(()),
    }
}

async fn login(app: &mut App, config: &Config, timeout: Duration) -> anyhow::Result<()> {
    if app.start().await == Screen::Bookmarks {
        if let Some(user) = app.user() {
            println!("Already signed in as {}.", user.display_name().unwrap_or(&user.id));
        }
        return Ok(());
    }

    let site_url = &config.site_url;
    let port = site_url.port_or_known_default().unwrap_or(3000);
    let server = CallbackServer::bind(SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .with_context(|| format!("could not listen for the sign-in callback on port {}", port))?;

    let redirect = app.begin_login()?;
    println!("Open this link to sign in with Google:\n\n  {}\n", redirect.url);

    let code = server.wait_for_code(timeout).await?;
    app.complete_login(&code).await?;

    match app.user() {
        Some(user) => println!("Signed in as {}.", user.display_name().unwrap_or(&user.id)),
        None => bail!("sign-in did not produce a session"),
    }
    Ok(())
}

async fn watch(app: &mut App) -> anyhow::Result<()> {
    require_signed_in(app).await?;
    print_cards(&app.cards());
    println!("{} saved. Watching for changes, Ctrl-C to stop.", app.saved_count());
    print_notices(app);

    let mut events = app.feed_events();
    let mut status = app.feed_status();
    if *status.borrow_and_update() == FeedStatus::Stopped {
        bail!("live updates are unavailable");
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(BookmarkChange::Inserted(bookmark)) => {
                    println!("+ {}  {}  ({} saved)", bookmark.title, bookmark.url, app.saved_count());
                }
                Ok(BookmarkChange::Deleted(id)) => {
                    println!("- {}  ({} saved)", id, app.saved_count());
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "display fell behind the change feed");
                }
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => {
                print_notices(app);
                if changed.is_err() || *status.borrow_and_update() == FeedStatus::Stopped {
                    bail!("the change feed stopped");
                }
            }
        }
        print_notices(app);
    }
    Ok(())
}

async fn require_signed_in(app: &mut App) -> anyhow::Result<()> {
    match app.start().await {
        Screen::Bookmarks => Ok(()),
        _ => bail!("Not signed in. Run `smartmark login` first."),
    }
}

fn print_cards(cards: &[BookmarkCard]) {
    if cards.is_empty() {
        println!("No bookmarks yet. Add your first one with `smartmark add`.");
        return;
    }
    for card in cards {
        let host = if card.hostname.is_empty() { "-" } else { &card.hostname };
        println!("{:<10} {}  [{}]", card.category, card.title, host);
        println!("{:<10} {}  id={}", "", card.url, card.id);
    }
}

fn print_notices(app: &App) {
    for notice in app.take_notices() {
        match notice.level {
            NoticeLevel::Info => eprintln!("note: {}", notice.message),
            NoticeLevel::Error => eprintln!("error: {}", notice.message),
        }
    }
}

async fn confirm(question: &str) -> anyhow::Result<bool> {
    println!("{} [y/N]", question);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
