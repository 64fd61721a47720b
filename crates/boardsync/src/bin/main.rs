use boardsync::{BoardId, Color, Config, EditOutcome, Path, Peer, PeerError, Point};
use clap::Parser;
use std::ops::ControlFlow;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Whiteboard peer with a line-oriented console", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Address to accept peer connections on (overrides [peer].listen_addr)
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory server address (overrides [directory].addr)
    #[arg(short, long)]
    directory: Option<String>,

    /// Host other peers use to reach this one (overrides [peer].advertise_host)
    #[arg(long)]
    advertise_host: Option<String>,
}

const HELP: &str = "\
commands:
  new                      create a board and select it
  list                     list known boards
  select <board>           select a board
  share | unshare          toggle sharing of the selected board
  draw <colour> x,y ...    add a path (colour: black, red, #rrggbb)
  undo | clear             edit the selected board
  delete [board]           delete the selected or given board
  resubscribe <board>      reconnect a closed remote board
  show                     print the selected board
  quit";

enum Command {
    New,
    List,
    Select(BoardId),
    Share(bool),
    Draw(Path),
    Undo,
    Clear,
    Delete(Option<BoardId>),
    Resubscribe(BoardId),
    Show,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(Command::Help);
    };
    let board = |word: Option<&str>| -> Result<BoardId, String> {
        word.ok_or_else(|| format!("{} needs a board id", name))?
            .parse()
            .map_err(|e| format!("{}", e))
    };

    match name {
        "new" => Ok(Command::New),
        "list" | "ls" => Ok(Command::List),
        "select" => Ok(Command::Select(board(words.next())?)),
        "share" => Ok(Command::Share(true)),
        "unshare" => Ok(Command::Share(false)),
        "draw" => {
            let color: Color = words
                .next()
                .ok_or("draw needs a colour")?
                .parse()
                .map_err(|e| format!("{}", e))?;
            let points = words
                .map(|p| p.parse::<Point>().map_err(|e| format!("{}", e)))
                .collect::<Result<Vec<_>, _>>()?;
            Path::new(color, points)
                .map(Command::Draw)
                .map_err(|e| format!("{}", e))
        }
        "undo" => Ok(Command::Undo),
        "clear" => Ok(Command::Clear),
        "delete" => match words.next() {
            Some(word) => Ok(Command::Delete(Some(board(Some(word))?))),
            None => Ok(Command::Delete(None)),
        },
        "resubscribe" => Ok(Command::Resubscribe(board(words.next())?)),
        "show" => Ok(Command::Show),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command {:?}", other)),
    }
}

/// Run one console command; `Break` ends the session
async fn execute(peer: &Peer, command: Command) -> Result<ControlFlow<()>, PeerError> {
    match command {
        Command::New => {
            let id = peer.create_local_board().await?;
            println!("created {}", id);
        }
        Command::List => {
            let selected = peer.selected().await;
            for id in peer.list_board_names().await {
                let Some(info) = peer.board_info(&id).await else {
                    continue;
                };
                let marker = if selected.as_ref() == Some(&id) { "*" } else { " " };
                let role = match (info.is_remote, info.subscription) {
                    (true, Some(state)) => format!("remote {:?}", state),
                    (true, None) => "remote".to_string(),
                    (false, _) if info.is_shared => format!("shared, {} listeners", info.listeners),
                    (false, _) => "local".to_string(),
                };
                println!("{} {} v{} ({})", marker, id, info.snapshot.version, role);
            }
        }
        Command::Select(id) => {
            if !peer.select(&id).await {
                println!("no board {}", id);
            }
        }
        Command::Share(shared) => peer.set_shared(shared).await?,
        Command::Draw(path) => report(peer.append_path_locally(path).await?),
        Command::Undo => report(peer.undo_locally().await?),
        Command::Clear => report(peer.clear_locally().await?),
        Command::Delete(id) => {
            let id = match id {
                Some(id) => id,
                None => peer.selected().await.ok_or(PeerError::NoSelection)?,
            };
            peer.delete_board(&id).await?;
        }
        Command::Resubscribe(id) => peer.resubscribe(&id).await?,
        Command::Show => {
            let id = peer.selected().await.ok_or(PeerError::NoSelection)?;
            if let Some(info) = peer.board_info(&id).await {
                println!("{} v{}", id, info.snapshot.version);
                for path in &info.snapshot.paths {
                    println!("  {}", path);
                }
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(ControlFlow::Break(())),
    }
    Ok(ControlFlow::Continue(()))
}

fn report(outcome: EditOutcome) {
    if outcome == EditOutcome::Discarded {
        println!("edit discarded: the board changed underneath it");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.peer.listen_addr = listen;
    }
    if let Some(directory) = args.directory {
        config.directory.addr = directory;
    }
    if let Some(host) = args.advertise_host {
        config.peer.advertise_host = host;
    }

    let peer = Peer::start(config).await?;
    info!("Peer reachable at {}", peer.advertised_addr());

    let mut render = peer.watch_selected();
    tokio::spawn(async move {
        while render.changed().await.is_ok() {
            if let Some(snapshot) = render.borrow_and_update().as_ref() {
                debug!(board = %snapshot.id, version = snapshot.version, paths = snapshot.paths.len(), "redraw");
            }
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        match execute(&peer, command).await {
            Ok(ControlFlow::Break(())) => break,
            Ok(ControlFlow::Continue(())) => {}
            Err(e) => {
                warn!("{}", e);
                println!("error: {}", e);
            }
        }
    }

    peer.shutdown().await;
    Ok(())
}
