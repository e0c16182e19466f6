//! Line-oriented front end over a [`TriageSession`].

use std::fmt::Write as _;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::gateway::MetadataGateway;
use crate::extraction::ExtractionError;
use crate::model::{
    Bucket, ExtractionStatus, Item, MAX_RATING, MetadataUpdate, UnknownBucket, parse_tags,
};
use crate::session::{SessionError, TriageSession};
use crate::state::BulkOutcome;
use crate::sync::{SyncReport, SyncTrigger, TriggerOutcome};
use crate::token_provider::CredentialSource;

const HELP: &str = "\
commands:
  load [--refresh] [folder]      load a folder (default: the current one)
  ls [bucket]                    list a bucket, or counts of all buckets
  mv <bucket> <id>...            move items to a bucket
  reorder <bucket> <id>...       put items on top of a bucket, in order
  tag <id> <tag,tag,...>         replace an item's tags
  rate <id> quality|content <n>  rate an item from 0 to 5
  note <id> <text>               replace an item's notes
  rm <id>...                     delete items
  move-folder <folder> <id>...   move items to another folder
  folders [parent]               list folders to load or move into
  extract <id>                   read embedded metadata of a PNG (Ctrl-C cancels)
  sync                           push pending changes now
  hide                           flush as if the window was hidden
  status                         folder, counts and sync state
  tags                           tags used in this folder
  help                           this text
  quit                           flush and exit";

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("unknown command: {0} (try `help`)")]
    UnknownCommand(String),
    #[error("missing {0}")]
    MissingArgument(&'static str),
    #[error(transparent)]
    Bucket(#[from] UnknownBucket),
    #[error("rating must be quality or content followed by 0-5, got {0}")]
    InvalidRating(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RatingKind {
    Quality,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Load { folder: Option<String>, refresh: bool },
    List { bucket: Option<Bucket> },
    Assign { bucket: Bucket, ids: Vec<String> },
    Reorder { bucket: Bucket, ids: Vec<String> },
    Tag { id: String, tags: String },
    Rate { id: String, kind: RatingKind, value: u8 },
    Note { id: String, text: String },
    Delete { ids: Vec<String> },
    MoveFolder { folder: String, ids: Vec<String> },
    Folders { parent: Option<String> },
    Extract { id: String },
    Sync,
    Hide,
    Status,
    Tags,
    Help,
    Quit,
}

/// Parses one input line. Blank lines and `#` comments yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, ShellError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    let command = match name {
        "load" => {
            let mut refresh = false;
            let mut folder = None;
            for arg in args {
                if arg == "--refresh" || arg == "-r" {
                    refresh = true;
                } else {
                    folder = Some(arg.to_string());
                }
            }
            Command::Load { folder, refresh }
        }
        "ls" => Command::List {
            bucket: args.next().map(str::parse).transpose()?,
        },
        "mv" => {
            let bucket = args
                .next()
                .ok_or(ShellError::MissingArgument("bucket"))?
                .parse::<Bucket>()?;
            Command::Assign {
                bucket,
                ids: ids(args)?,
            }
        }
        "reorder" => {
            let bucket = args
                .next()
                .ok_or(ShellError::MissingArgument("bucket"))?
                .parse::<Bucket>()?;
            Command::Reorder {
                bucket,
                ids: ids(args)?,
            }
        }
        "tag" => {
            let (id, tags) = id_and_text(rest);
            Command::Tag {
                id: id.ok_or(ShellError::MissingArgument("item id"))?,
                tags,
            }
        }
        "rate" => {
            let id = args.next().ok_or(ShellError::MissingArgument("item id"))?;
            let kind = match args.next() {
                Some("quality" | "q") => RatingKind::Quality,
                Some("content" | "c") => RatingKind::Content,
                other => return Err(ShellError::InvalidRating(other.unwrap_or("nothing").into())),
            };
            let raw = args.next().ok_or(ShellError::MissingArgument("rating"))?;
            let value = raw
                .parse::<u8>()
                .ok()
                .filter(|value| *value <= MAX_RATING)
                .ok_or_else(|| ShellError::InvalidRating(raw.to_string()))?;
            Command::Rate {
                id: id.to_string(),
                kind,
                value,
            }
        }
        "note" => {
            let (id, text) = id_and_text(rest);
            Command::Note {
                id: id.ok_or(ShellError::MissingArgument("item id"))?,
                text,
            }
        }
        "rm" => Command::Delete { ids: ids(args)? },
        "move-folder" => {
            let folder = args.next().ok_or(ShellError::MissingArgument("folder"))?;
            Command::MoveFolder {
                folder: folder.to_string(),
                ids: ids(args)?,
            }
        }
        "folders" => Command::Folders {
            parent: args.next().map(str::to_string),
        },
        "extract" => Command::Extract {
            id: args
                .next()
                .ok_or(ShellError::MissingArgument("item id"))?
                .to_string(),
        },
        "sync" => Command::Sync,
        "hide" => Command::Hide,
        "status" => Command::Status,
        "tags" => Command::Tags,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(ShellError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

fn ids<'a>(args: impl Iterator<Item = &'a str>) -> Result<Vec<String>, ShellError> {
    let ids: Vec<String> = args.map(str::to_string).collect();
    if ids.is_empty() {
        return Err(ShellError::MissingArgument("item ids"));
    }
    Ok(ids)
}

fn id_and_text(rest: &str) -> (Option<String>, String) {
    match rest.split_once(char::is_whitespace) {
        Some((id, text)) => (Some(id.to_string()), text.trim().to_string()),
        None if rest.is_empty() => (None, String::new()),
        None => (Some(rest.to_string()), String::new()),
    }
}

/// Runs the shell until `quit`, end of input or Ctrl-C, then flushes.
pub async fn run<G, C>(session: &mut TriageSession<G, C>, config: &SessionConfig) -> anyhow::Result<()>
where
    G: MetadataGateway,
    C: CredentialSource,
{
    if let Some(folder) = config.folder.as_deref() {
        execute(
            session,
            Command::Load {
                folder: Some(folder.to_string()),
                refresh: false,
            },
        )
        .await
        .unwrap_or_else(|err| println!("error: {err}"));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(config.sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        let cancellable = matches!(command, Command::Extract { .. });
                        if let Err(err) = execute(session, command).await {
                            println!("error: {err}");
                        }
                        if cancellable {
                            // Ctrl-C during an extraction only cancelled it.
                            ctrl_c.set(tokio::signal::ctrl_c());
                        }
                    }
                    Ok(None) => {}
                    Err(err) => println!("{err}"),
                }
            }
            event = session.next_sync_event() => match event {
                Some(event) => {
                    if let Some(report) = session.handle_sync_event(event)? {
                        print_report(&report);
                    }
                }
                None => {
                    if let Some(report) = session.sync_worker_lost() {
                        print_report(&report);
                    }
                }
            },
            _ = ticker.tick() => {
                let outcome = session.trigger_sync(SyncTrigger::Interval);
                debug!(?outcome, "periodic sync");
            }
            _ = &mut ctrl_c => {
                info!("interrupted, flushing before exit");
                break;
            }
        }
    }

    for report in session.close().await? {
        print_report(&report);
    }
    let dirty = session.dirty_len();
    if dirty > 0 {
        println!("{dirty} change(s) could not be synced and will be retried next time");
    }
    Ok(())
}

async fn execute<G, C>(session: &mut TriageSession<G, C>, command: Command) -> Result<(), ShellError>
where
    G: MetadataGateway,
    C: CredentialSource,
{
    match command {
        Command::Load { folder, refresh } => {
            let folder = match folder {
                Some(folder) => folder,
                None => session.require_folder()?.to_string(),
            };
            let summary = session.load_folder(&folder, refresh).await?;
            let source = if summary.from_cache { " (cached)" } else { "" };
            println!("loaded {} item(s) from {folder}{source}", summary.items);
            print_counts(session);
        }
        Command::List { bucket: Some(bucket) } => {
            for item in session.store().current_bucket_contents(bucket) {
                println!("{}", describe(item));
            }
        }
        Command::List { bucket: None } => print_counts(session),
        Command::Assign { bucket, ids } => {
            let mut moved = 0;
            for id in &ids {
                if session.assign_to_bucket(id, bucket).await {
                    moved += 1;
                } else {
                    println!("no item {id}");
                }
            }
            println!("{moved} item(s) -> {bucket}");
        }
        Command::Reorder { bucket, ids } => {
            let touched = session.reorder_bucket(bucket, &ids).await;
            println!("reordered {touched} item(s) in {bucket}");
        }
        Command::Tag { id, tags } => {
            let update = MetadataUpdate {
                tags: Some(parse_tags(&tags)),
                ..MetadataUpdate::default()
            };
            report_update(session.update_metadata(&id, update).await, &id);
        }
        Command::Rate { id, kind, value } => {
            let update = match kind {
                RatingKind::Quality => MetadataUpdate {
                    quality_rating: Some(value),
                    ..MetadataUpdate::default()
                },
                RatingKind::Content => MetadataUpdate {
                    content_rating: Some(value),
                    ..MetadataUpdate::default()
                },
            };
            report_update(session.update_metadata(&id, update).await, &id);
        }
        Command::Note { id, text } => {
            let update = MetadataUpdate {
                notes: Some(text),
                ..MetadataUpdate::default()
            };
            report_update(session.update_metadata(&id, update).await, &id);
        }
        Command::Delete { ids } => {
            let outcome = session.delete_items(&ids).await;
            print_outcome("deleted", &outcome);
        }
        Command::MoveFolder { folder, ids } => {
            let outcome = session.move_to_folder(&ids, &folder).await;
            print_outcome(&format!("moved to {folder}"), &outcome);
        }
        Command::Folders { parent } => {
            let folders = session.list_folders(parent.as_deref()).await?;
            if folders.is_empty() {
                println!("no folders");
            }
            for folder in folders {
                match folder.child_count {
                    Some(count) => println!("{}\t{}\t({count})", folder.id, folder.name),
                    None => println!("{}\t{}", folder.id, folder.name),
                }
            }
        }
        Command::Extract { id } => {
            let abort = session.extraction_abort_handle();
            let extraction = session.extract(&id);
            tokio::pin!(extraction);
            let result = tokio::select! {
                result = &mut extraction => result,
                _ = tokio::signal::ctrl_c() => {
                    abort.abort();
                    extraction.await
                }
            };
            let metadata = match result {
                Err(SessionError::Extraction(ExtractionError::Cancelled)) => {
                    println!("extraction of {id} cancelled");
                    return Ok(());
                }
                other => other?,
            };
            if metadata.is_empty() {
                println!("no embedded metadata");
            }
            for (key, value) in metadata {
                println!("{key}: {value}");
            }
        }
        Command::Sync => print_trigger(session.trigger_sync(SyncTrigger::Explicit)),
        Command::Hide => print_trigger(session.trigger_sync(SyncTrigger::VisibilityHidden)),
        Command::Status => {
            println!("folder: {}", session.folder_id().unwrap_or("(none)"));
            print_counts(session);
            match session.sync_state() {
                Some(state) => println!("sync: {state:?}, {} pending", session.dirty_len()),
                None => println!("sync: inline writes"),
            }
        }
        Command::Tags => {
            let tags: Vec<String> = session.store().known_tags().into_iter().collect();
            println!("{}", tags.join(", "));
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn describe(item: &Item) -> String {
    let mut line = format!("{}\t{}", item.id, item.display_name);
    let user = &item.user;
    if !user.tags.is_empty() {
        let tags: Vec<&str> = user.tags.iter().map(String::as_str).collect();
        let _ = write!(line, "\t[{}]", tags.join(","));
    }
    if user.quality_rating > 0 || user.content_rating > 0 {
        let _ = write!(line, "\tq{} c{}", user.quality_rating, user.content_rating);
    }
    if !user.notes.is_empty() {
        let _ = write!(line, "\t\"{}\"", user.notes);
    }
    if item.extraction_status != ExtractionStatus::Pending {
        let _ = write!(line, "\t<{}>", item.extraction_status.as_str());
    }
    line
}

fn print_counts<G: MetadataGateway, C: CredentialSource>(session: &TriageSession<G, C>) {
    let counts: Vec<String> = session
        .store()
        .counts()
        .into_iter()
        .map(|(bucket, count)| format!("{bucket}: {count}"))
        .collect();
    println!("{}", counts.join("  "));
}

fn report_update(changed: bool, id: &str) {
    if changed {
        println!("updated {id}");
    } else {
        println!("no change for {id}");
    }
}

fn print_outcome(action: &str, outcome: &BulkOutcome) {
    println!("{} item(s) {action}", outcome.done.len());
    for (id, reason) in &outcome.failed {
        println!("  {id}: {reason}");
    }
}

fn print_trigger(outcome: TriggerOutcome) {
    match outcome {
        TriggerOutcome::Dispatched { items } => println!("syncing {items} item(s)"),
        TriggerOutcome::AlreadySyncing => println!("a sync is already running"),
        TriggerOutcome::NothingDirty => println!("nothing to sync"),
    }
}

fn print_report(report: &SyncReport) {
    if let Some(reason) = &report.aborted {
        println!("sync aborted ({reason}); {} item(s) kept for retry", report.failed_ids.len());
    } else if report.failed_ids.is_empty() {
        println!("synced {} item(s)", report.succeeded);
    } else {
        println!(
            "synced {} item(s), {} failed and will be retried",
            report.succeeded,
            report.failed_ids.len()
        );
    }
}
