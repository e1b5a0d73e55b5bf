//! CLI command definitions and handlers.
//!
//! Each subcommand is implemented as a function that takes the parsed
//! arguments and returns an `anyhow::Result<()>`. Alias normalization
//! happens on the raw argv before clap sees it, so `nugs gaps 1125`,
//! `nugs catalog gaps 1125` and `nugs 1125 latest` all land on their
//! canonical commands.

use std::io::IsTerminal;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::json;
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::api::dto::Container;
use crate::app::App;
use crate::catalog::gaps::{self, GapAnalysis};
use crate::catalog::{ARTIST_TTL, refresh_due};
use crate::config::{self, Config};
use crate::control::{self, CancelOutcome, hotkeys};
use crate::download::quality::{MediaKind, classify_media_url};
use crate::download::{self, OutputKind};
use crate::error::Error;

use super::json_out::{JsonDoc, JsonLevel};

/// nugs.net downloader and catalog manager
#[derive(Parser)]
#[command(name = "nugs", version, about, long_about = None)]
pub struct Cli {
    /// Emit a single JSON document instead of human output
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub json: Option<JsonLevel>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Download releases by URL or container id
    Get {
        /// URLs or container ids; a trailing audio|video|both selects output
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// List the tracks of a release or the items of a playlist
    List {
        /// A release/playlist URL or container id
        target: String,
    },
    /// Catalog cache operations
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
    /// Show the status of a running crawl
    Status,
    /// Cancel a crawl owned by another process
    Cancel,
    /// Generate a shell completion script
    Completion {
        /// Shell flavor
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Artist shortcut: `nugs <artist-id> latest|full [audio|video|both]`
    #[command(hide = true)]
    Artist {
        artist_id: u64,
        /// "latest" or "full"
        action: String,
        kind: Option<String>,
    },
}

/// Catalog subcommands
#[derive(Subcommand)]
pub enum CatalogCommands {
    /// Refresh the catalog cache from the service
    Update,
    /// Show cache files and freshness
    Cache,
    /// Show catalog statistics
    Stats,
    /// Show the most recent catalog entries
    Latest {
        /// How many entries (default 10); a trailing audio|video|both filters
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// List an artist's shows with their download state
    List {
        /// Artist ids, optionally followed by audio|video|both
        #[arg(required = true)]
        args: Vec<String>,
    },
    /// Find (and optionally fill) missing shows per artist
    Gaps {
        /// Artist ids, optionally followed by audio|video|both and "fill"
        #[arg(required = true)]
        args: Vec<String>,
        /// Print only the missing container ids
        #[arg(long = "ids-only")]
        ids_only: bool,
    },
    /// Coverage summary per artist
    Coverage {
        /// Artist ids; empty means every locally-cached artist
        args: Vec<String>,
    },
    /// Configure the catalog auto-refresh schedule
    Config {
        /// enable | disable | set key=value...
        #[arg(required = true)]
        args: Vec<String>,
    },
}

// ============================================================================
// Alias normalization
// ============================================================================

/// Rewrite user-facing aliases into canonical argv before clap parses.
///
/// - `update|cache|stats|latest|gaps|coverage ...` → `catalog <same> ...`
/// - `refresh ...` → `catalog config ...`
/// - `grab <artist-id> latest` → `<artist-id> latest`
/// - `<artist-id> latest|full [kind]` → `artist <id> <action> [kind]`
/// - a bare URL or container id list → `get ...`
pub fn normalize_args(mut args: Vec<String>) -> Vec<String> {
    if args.is_empty() {
        return args;
    }

    // Let the global flag lead: normalize whatever follows it.
    if args.len() >= 2 && args[0] == "--json" {
        let rest = normalize_args(args[2..].to_vec());
        let mut out = vec![args[0].clone(), args[1].clone()];
        out.extend(rest);
        return out;
    }

    if args[0] == "grab" {
        args.remove(0);
        if args.is_empty() {
            return args;
        }
    }

    const CATALOG_ALIASES: [&str; 6] = ["update", "cache", "stats", "latest", "gaps", "coverage"];
    if CATALOG_ALIASES.contains(&args[0].as_str()) {
        args.insert(0, "catalog".to_string());
        return args;
    }
    if args[0] == "refresh" {
        args[0] = "config".to_string();
        args.insert(0, "catalog".to_string());
        return args;
    }

    // Artist shortcut: a numeric first token followed by latest/full.
    if args.len() >= 2
        && args[0].chars().all(|c| c.is_ascii_digit())
        && matches!(args[1].as_str(), "latest" | "full")
    {
        args.insert(0, "artist".to_string());
        return args;
    }

    // A bare URL (or list of URLs/ids) is a download request.
    let looks_like_target =
        args[0].contains("://") || args[0].chars().all(|c| c.is_ascii_digit());
    let known_command = matches!(
        args[0].as_str(),
        "get" | "list" | "catalog" | "status" | "cancel" | "completion" | "artist" | "help"
    ) || args[0].starts_with('-');
    if looks_like_target && !known_command {
        args.insert(0, "get".to_string());
    }
    args
}

// ============================================================================
// Dispatch
// ============================================================================

/// Whether a command downloads (and so gets hotkeys, detach, refresh).
fn is_download_capable(command: &Commands) -> bool {
    match command {
        Commands::Get { .. } | Commands::Artist { .. } => true,
        Commands::Catalog {
            command: CatalogCommands::Gaps { args, .. },
        } => args.iter().any(|a| a == "fill"),
        _ => false,
    }
}

/// Run the parsed command.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let Some(command) = &cli.command else {
        print_welcome(cli.json.is_some());
        return Ok(());
    };

    // Headless download invocations re-spawn themselves detached.
    if is_download_capable(command) && cli.json.is_none() && control::detach_if_headless()? {
        return Ok(());
    }

    let rt = Runtime::new()?;
    match command {
        Commands::Get { targets } => cmd_get(&rt, targets, cli.json),
        Commands::List { target } => cmd_list(&rt, target, cli.json),
        Commands::Status => cmd_status(cli.json),
        Commands::Cancel => cmd_cancel(cli.json),
        Commands::Completion { shell } => cmd_completion(*shell),
        Commands::Artist {
            artist_id,
            action,
            kind,
        } => cmd_artist(&rt, *artist_id, action, kind.as_deref(), cli.json),
        Commands::Catalog { command } => match command {
            CatalogCommands::Update => cmd_catalog_update(&rt, cli.json),
            CatalogCommands::Cache => cmd_catalog_cache(cli.json),
            CatalogCommands::Stats => cmd_catalog_stats(cli.json),
            CatalogCommands::Latest { args } => cmd_catalog_latest(args, cli.json),
            CatalogCommands::List { args } => cmd_catalog_list(&rt, args, cli.json),
            CatalogCommands::Gaps { args, ids_only } => {
                cmd_catalog_gaps(&rt, args, *ids_only, cli.json)
            }
            CatalogCommands::Coverage { args } => cmd_catalog_coverage(&rt, args, cli.json),
            CatalogCommands::Config { args } => cmd_catalog_config(args, cli.json),
        },
    }
}

fn print_welcome(json: bool) {
    if json {
        return;
    }
    println!("nugs {} - nugs.net downloader and catalog manager", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Run `nugs help` for commands, or try:");
    println!("  nugs <url>                 download a release");
    println!("  nugs <artist-id> latest    grab an artist's newest show");
    println!("  nugs gaps <artist-id> fill download everything missing");
}

// ============================================================================
// Shared setup
// ============================================================================

/// Load config, prompting interactively on first run when attached.
fn load_config(interactive_ok: bool) -> anyhow::Result<Config> {
    match config::load()? {
        Some(config) => Ok(config),
        None if interactive_ok && std::io::stdin().is_terminal() => {
            Ok(config::first_run_prompt()?)
        }
        None => Err(Error::config(format!(
            "no config found; run `nugs` interactively once or create {}",
            config::config_path().unwrap_or_default().display()
        ))
        .into()),
    }
}

/// Build the app, verify tools, authenticate, and auto-refresh if due.
async fn setup_download_app(config: Config) -> anyhow::Result<App> {
    let mut app = App::new(config)?;
    app.check_tools(true).await?;
    app.login().await?;

    if refresh_due(
        app.cache.read_meta().as_ref(),
        &app.config.refresh,
        chrono::Utc::now(),
    ) {
        info!("catalog auto-refresh due");
        if let Err(e) = app.cache.refresh_from_service(&app.client).await {
            warn!("auto-refresh failed, continuing with the old cache: {e}");
        }
    }
    Ok(app)
}

/// Arm the control plane for a crawl: fresh control file, hotkeys when
/// attached, signal listener always.
fn arm_controls(app: &App, json: Option<JsonLevel>) {
    control::runtime_files::clear_control(app.cache.dir());
    hotkeys::spawn_signal_listener(app.controller.clone());
    if json.is_none() && std::io::stdin().is_terminal() && !control::is_detached() {
        hotkeys::spawn_hotkey_thread(app.controller.clone());
    }
}

/// Parsed mixed positional list: artist ids/names plus option words.
struct ArtistArgs {
    ids: Vec<u64>,
    names: Vec<String>,
    kind: OutputKind,
    fill: bool,
}

/// Split trailing option words out of a mixed positional list.
fn split_artist_args(args: &[String]) -> ArtistArgs {
    let mut parsed = ArtistArgs {
        ids: Vec::new(),
        names: Vec::new(),
        kind: OutputKind::Audio,
        fill: false,
    };
    for arg in args {
        if let Some(k) = OutputKind::parse(arg) {
            parsed.kind = k;
        } else if arg == "fill" {
            parsed.fill = true;
        } else if let Ok(id) = arg.parse() {
            parsed.ids.push(id);
        } else {
            parsed.names.push(arg.clone());
        }
    }
    parsed
}

/// Resolve artist name tokens to ids: local index first, then the
/// service's artist directory.
async fn resolve_artist_names(app: &App, parsed: &ArtistArgs) -> anyhow::Result<Vec<u64>> {
    let mut ids = parsed.ids.clone();
    for name in &parsed.names {
        if let Some(id) = app.cache.lookup_artist(name) {
            ids.push(id);
            continue;
        }
        let directory = app.client.get_artist_list().await?;
        let wanted = name.trim().to_lowercase();
        match directory
            .artists
            .iter()
            .find(|a| a.artist_name.trim().to_lowercase() == wanted)
        {
            Some(artist) => ids.push(artist.artist_id),
            None => {
                return Err(Error::config(format!("unknown artist {name:?}")).into());
            }
        }
    }
    Ok(ids)
}

fn print_batch_summary(app: &App, summary: &download::BatchSummary) {
    println!();
    println!(
        "Done: {} downloaded, {} skipped, {} failed{}",
        summary.succeeded,
        summary.skipped,
        summary.failed,
        if summary.cancelled { " (cancelled)" } else { "" },
    );
    let errors = app.controller.publisher().error_count();
    let warnings = app.controller.publisher().warning_count();
    if errors > 0 || warnings > 0 {
        println!("  {errors} errors, {warnings} warnings");
    }
}

fn emit_batch_json(summary: &download::BatchSummary, level: JsonLevel, command: &'static str) {
    JsonDoc::new(command)
        .ok(!summary.cancelled && summary.failed == 0)
        .summary(json!({
            "attempted": summary.attempted,
            "succeeded": summary.succeeded,
            "skipped": summary.skipped,
            "failed": summary.failed,
            "cancelled": summary.cancelled,
        }))
        .emit(level);
}

// ============================================================================
// Download commands
// ============================================================================

fn cmd_get(rt: &Runtime, targets: &[String], json: Option<JsonLevel>) -> anyhow::Result<()> {
    let config = load_config(json.is_none())?;

    rt.block_on(async {
        let app = setup_download_app(config).await?;
        arm_controls(&app, json);

        let (container_ids, kind) = resolve_targets(&app, targets).await?;
        if container_ids.is_empty() {
            return Err(Error::config("nothing to download").into());
        }

        let summary = download::run_batch(&app, &container_ids, kind).await?;
        match json {
            Some(level) => emit_batch_json(&summary, level, "get"),
            None => print_batch_summary(&app, &summary),
        }
        Ok(())
    })
}

/// Expand user targets (URLs, ids, artists, playlists) into container ids.
async fn resolve_targets(
    app: &App,
    targets: &[String],
) -> anyhow::Result<(Vec<u64>, OutputKind)> {
    let mut kind = OutputKind::parse(&app.config.quality.default_output).unwrap_or(OutputKind::Audio);
    let mut ids: Vec<u64> = Vec::new();

    for target in targets {
        if let Some(k) = OutputKind::parse(target) {
            kind = k;
            continue;
        }
        if let Ok(id) = target.parse::<u64>() {
            ids.push(id);
            continue;
        }
        let Some((media_kind, id)) = classify_media_url(target) else {
            warn!("unrecognized target {target:?}, skipping");
            app.controller.publisher().count_warning();
            continue;
        };
        match media_kind {
            MediaKind::PurchasedLivestream => {
                // Purchased streams carry the show in a query parameter
                // when shared from the player; the path id is a fallback.
                if target.contains("showID=") {
                    ids.push(crate::download::video::extract_show_id(target)?);
                } else {
                    ids.push(id);
                }
            }
            MediaKind::Album
            | MediaKind::Release
            | MediaKind::Video
            | MediaKind::VideoAlt
            | MediaKind::LivestreamA
            | MediaKind::LivestreamB
            | MediaKind::LivestreamC => ids.push(id),
            MediaKind::Artist => {
                let meta = app
                    .cache
                    .get_artist_meta_cached(&app.client, id, ARTIST_TTL)
                    .await?;
                ids.extend(meta.containers().iter().map(|c| c.container_id));
            }
            MediaKind::PlaylistUser | MediaKind::PlaylistLibrary | MediaKind::PlaylistCatalog => {
                let session = app.session()?;
                let playlist = app
                    .client
                    .get_playlist_meta(
                        id,
                        &app.config.auth.email,
                        &session.legacy.legacy_token,
                        media_kind == MediaKind::PlaylistCatalog,
                    )
                    .await?;
                for item in &playlist.items {
                    if item.container_id != 0 && !ids.contains(&item.container_id) {
                        ids.push(item.container_id);
                    }
                }
            }
        }
    }
    Ok((ids, kind))
}

fn cmd_artist(
    rt: &Runtime,
    artist_id: u64,
    action: &str,
    kind: Option<&str>,
    json: Option<JsonLevel>,
) -> anyhow::Result<()> {
    if !matches!(action, "latest" | "full") {
        return Err(Error::config(format!(
            "unknown artist action {action:?}; use latest or full"
        ))
        .into());
    }
    let config = load_config(json.is_none())?;
    let kind = kind
        .and_then(OutputKind::parse)
        .or_else(|| OutputKind::parse(&config.quality.default_output))
        .unwrap_or(OutputKind::Audio);

    rt.block_on(async {
        let app = setup_download_app(config).await?;
        arm_controls(&app, json);

        let meta = app
            .cache
            .get_artist_meta_cached(&app.client, artist_id, ARTIST_TTL)
            .await?;
        let containers = meta.containers();
        if containers.is_empty() {
            return Err(Error::config(format!("artist {artist_id} has no shows")).into());
        }

        let ids: Vec<u64> = match action {
            "latest" => {
                // Newest by performance date, falling back to catalog order.
                let newest = containers
                    .iter()
                    .max_by_key(|c| gaps::parse_performance_date(&c.performance_date))
                    .unwrap_or(&containers[0]);
                vec![newest.container_id]
            }
            _ => containers.iter().map(|c| c.container_id).collect(),
        };

        let summary = download::run_batch(&app, &ids, kind).await?;
        match json {
            Some(level) => emit_batch_json(&summary, level, "artist"),
            None => print_batch_summary(&app, &summary),
        }
        Ok(())
    })
}

// ============================================================================
// List
// ============================================================================

fn cmd_list(rt: &Runtime, target: &str, json: Option<JsonLevel>) -> anyhow::Result<()> {
    let config = load_config(json.is_none())?;

    rt.block_on(async {
        let container_id = if let Ok(id) = target.parse::<u64>() {
            id
        } else {
            match classify_media_url(target) {
                Some((MediaKind::PlaylistUser | MediaKind::PlaylistLibrary, id)) => {
                    return list_playlist(config, id, false, json).await;
                }
                Some((MediaKind::PlaylistCatalog, id)) => {
                    return list_playlist(config, id, true, json).await;
                }
                Some((_, id)) => id,
                None => {
                    return Err(Error::config(format!("unrecognized target {target:?}")).into());
                }
            }
        };

        let app = App::new(config)?;
        let container = app.client.get_container_meta(container_id).await?;

        match json {
            Some(level) => {
                JsonDoc::new("list")
                    .summary(json!({
                        "container_id": container.container_id,
                        "artist": container.artist_name,
                        "title": container.container_info,
                        "tracks": container.tracks.len(),
                    }))
                    .detail(&container)
                    .emit(level);
            }
            None => print_container(&container),
        }
        Ok(())
    })
}

async fn list_playlist(
    config: Config,
    playlist_id: u64,
    is_catalog: bool,
    json: Option<JsonLevel>,
) -> anyhow::Result<()> {
    let mut app = App::new(config)?;
    app.login().await?;
    let session = app.session()?;
    let playlist = app
        .client
        .get_playlist_meta(
            playlist_id,
            &app.config.auth.email,
            &session.legacy.legacy_token,
            is_catalog,
        )
        .await?;

    match json {
        Some(level) => {
            JsonDoc::new("list")
                .summary(json!({
                    "playlist_id": playlist.playlist_id,
                    "name": playlist.playlist_name,
                    "items": playlist.items.len(),
                }))
                .detail(&playlist)
                .emit(level);
        }
        None => {
            println!("{} ({} items)", playlist.playlist_name, playlist.items.len());
            for (i, item) in playlist.items.iter().enumerate() {
                println!("  {:3}. {} - {}", i + 1, item.artist_name, item.song_title);
            }
        }
    }
    Ok(())
}

fn print_container(container: &Container) {
    println!("{} - {}", container.artist_name, container.container_info);
    if !container.venue_name.is_empty() {
        println!(
            "  {} {} {}  ({})",
            container.venue_name,
            container.venue_city,
            container.venue_state,
            container.performance_date
        );
    }
    for track in &container.tracks {
        println!("  {:02}. {}", track.track_num, track.song_title);
    }
    if download::has_video_sku(container) {
        println!("  [video available]");
    }
}

// ============================================================================
// Status / Cancel / Completion
// ============================================================================

fn cmd_status(json: Option<JsonLevel>) -> anyhow::Result<()> {
    let cache_dir = config::cache_dir()
        .ok_or_else(|| Error::config("could not determine cache directory"))?;
    let status = control::runtime_files::read_status(&cache_dir);

    match json {
        Some(level) => {
            JsonDoc::new("status")
                .ok(status.is_some())
                .summary(status.as_ref().map(|s| {
                    json!({
                        "pid": s.pid,
                        "state": s.state,
                        "label": s.label,
                        "percentage": s.percentage,
                    })
                }))
                .detail(&status)
                .emit(level);
        }
        None => match status {
            Some(s) => {
                println!("State:    {:?}", s.state);
                println!("Label:    {}", s.label);
                println!("Progress: {:.1}% ({}/{})", s.percentage, s.current, s.total);
                println!("Owner:    pid {}", s.pid);
                println!("Updated:  {}", s.updated_at);
                if s.errors > 0 || s.warnings > 0 {
                    println!("Issues:   {} errors, {} warnings", s.errors, s.warnings);
                }
            }
            None => println!("No crawl has run yet."),
        },
    }
    Ok(())
}

fn cmd_cancel(json: Option<JsonLevel>) -> anyhow::Result<()> {
    let cache_dir = config::cache_dir()
        .ok_or_else(|| Error::config("could not determine cache directory"))?;
    let outcome = control::cancel_running(&cache_dir)?;

    match json {
        Some(level) => {
            let (ok, text) = describe_cancel(&outcome);
            JsonDoc::new("cancel")
                .ok(ok)
                .summary(json!({ "outcome": text }))
                .emit(level);
        }
        None => {
            let (_, text) = describe_cancel(&outcome);
            println!("{text}");
        }
    }
    Ok(())
}

fn describe_cancel(outcome: &CancelOutcome) -> (bool, String) {
    match outcome {
        CancelOutcome::NothingRunning => (false, "No crawl is running.".to_string()),
        CancelOutcome::StaleOwner(pid) => (
            false,
            format!("Previous owner (pid {pid}) is gone; nothing to cancel."),
        ),
        CancelOutcome::Requested { pid, signalled } => (
            true,
            format!(
                "Cancel requested for pid {pid}{}",
                if *signalled { " (signal sent)" } else { "" }
            ),
        ),
    }
}

fn cmd_completion(shell: Shell) -> anyhow::Result<()> {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "nugs", &mut std::io::stdout());
    Ok(())
}

// ============================================================================
// Catalog commands
// ============================================================================

fn cmd_catalog_update(rt: &Runtime, json: Option<JsonLevel>) -> anyhow::Result<()> {
    let config = load_config(json.is_none())?;
    rt.block_on(async {
        let app = App::new(config)?;
        let meta = app.cache.refresh_from_service(&app.client).await?;

        match json {
            Some(level) => {
                JsonDoc::new("catalog update").summary(&meta).emit(level);
            }
            None => {
                println!(
                    "✓ Catalog updated: {} shows, {} artists ({:.1}s)",
                    meta.total_shows, meta.total_artists, meta.update_duration
                );
            }
        }
        Ok(())
    })
}

fn cmd_catalog_cache(json: Option<JsonLevel>) -> anyhow::Result<()> {
    let cache_dir = config::cache_dir()
        .ok_or_else(|| Error::config("could not determine cache directory"))?;
    let cache = crate::catalog::CatalogCache::new(&cache_dir);
    let meta = cache.read_meta();

    let mut files: Vec<(String, u64)> = [
        crate::catalog::CATALOG_FILE,
        crate::catalog::META_FILE,
        crate::catalog::ARTISTS_INDEX_FILE,
        crate::catalog::CONTAINERS_INDEX_FILE,
    ]
    .iter()
    .map(|f| {
        let size = std::fs::metadata(cache_dir.join(f)).map(|m| m.len()).unwrap_or(0);
        (f.to_string(), size)
    })
    .collect();

    // The per-artist cache is a directory tree; sum it recursively.
    let artists_size: u64 = walkdir::WalkDir::new(cache_dir.join("artists"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();
    files.push(("artists/".to_string(), artists_size));

    match json {
        Some(level) => {
            JsonDoc::new("catalog cache")
                .ok(meta.is_some())
                .summary(&meta)
                .detail(json!({ "meta": meta, "files": files }))
                .emit(level);
        }
        None => {
            println!("Cache directory: {}", cache_dir.display());
            match &meta {
                Some(m) => {
                    println!("Last updated:   {}", m.last_updated);
                    println!("Shows:          {}", m.total_shows);
                    println!("Artists:        {}", m.total_artists);
                }
                None => println!("Catalog never updated; run `nugs update`."),
            }
            for (name, size) in &files {
                println!("  {:24} {}", name, crate::progress::render::human_bytes(*size));
            }
        }
    }
    Ok(())
}

fn cmd_catalog_stats(json: Option<JsonLevel>) -> anyhow::Result<()> {
    let cache_dir = config::cache_dir()
        .ok_or_else(|| Error::config("could not determine cache directory"))?;
    let cache = crate::catalog::CatalogCache::new(&cache_dir);
    let Some(meta) = cache.read_meta() else {
        return Err(Error::config("catalog never updated; run `nugs update`").into());
    };
    let index = cache.read_containers_index().unwrap_or_default();

    // Shows per artist, most prolific first.
    let mut per_artist: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for summary in index.values() {
        *per_artist.entry(summary.artist_name.as_str()).or_default() += 1;
    }
    let mut top: Vec<(&str, usize)> = per_artist.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    top.truncate(10);

    match json {
        Some(level) => {
            JsonDoc::new("catalog stats")
                .summary(json!({
                    "shows": meta.total_shows,
                    "artists": meta.total_artists,
                    "last_updated": meta.last_updated,
                }))
                .detail(json!({
                    "meta": meta,
                    "top_artists": top.iter().map(|(n, c)| json!({"artist": n, "shows": c})).collect::<Vec<_>>(),
                }))
                .emit(level);
        }
        None => {
            println!("Catalog: {} shows across {} artists", meta.total_shows, meta.total_artists);
            println!("Updated: {}", meta.last_updated);
            println!();
            println!("Most shows:");
            for (artist, count) in &top {
                println!("  {count:5}  {artist}");
            }
        }
    }
    Ok(())
}

fn cmd_catalog_latest(args: &[String], json: Option<JsonLevel>) -> anyhow::Result<()> {
    let mut count = 10usize;
    let mut kind: Option<OutputKind> = None;
    for arg in args {
        if let Some(k) = OutputKind::parse(arg) {
            kind = Some(k);
        } else if let Ok(n) = arg.parse() {
            count = n;
        }
    }

    let cache_dir = config::cache_dir()
        .ok_or_else(|| Error::config("could not determine cache directory"))?;
    let cache = crate::catalog::CatalogCache::new(&cache_dir);
    let Some(catalog) = cache.read_catalog() else {
        return Err(Error::config("catalog never updated; run `nugs update`").into());
    };

    let filtered: Vec<&Container> = catalog
        .iter()
        .filter(|c| match kind {
            Some(OutputKind::Video) => download::has_video_sku(c),
            Some(OutputKind::Audio) => !c.tracks.is_empty(),
            _ => true,
        })
        .take(count)
        .collect();

    match json {
        Some(level) => {
            JsonDoc::new("catalog latest")
                .summary(json!({ "count": filtered.len() }))
                .detail(
                    filtered
                        .iter()
                        .map(|c| {
                            json!({
                                "container_id": c.container_id,
                                "artist": c.artist_name,
                                "title": c.container_info,
                                "date": c.performance_date,
                            })
                        })
                        .collect::<Vec<_>>(),
                )
                .emit(level);
        }
        None => {
            for c in &filtered {
                println!(
                    "{:8}  {:12}  {} - {}",
                    c.container_id, c.performance_date, c.artist_name, c.container_info
                );
            }
        }
    }
    Ok(())
}

fn cmd_catalog_list(rt: &Runtime, args: &[String], json: Option<JsonLevel>) -> anyhow::Result<()> {
    let parsed = split_artist_args(args);
    let config = load_config(json.is_none())?;

    rt.block_on(async {
        let app = App::new(config)?;
        let artist_ids = resolve_artist_names(&app, &parsed).await?;
        if artist_ids.is_empty() {
            return Err(Error::config("no artists given").into());
        }
        for &artist_id in &artist_ids {
            let analysis = gaps::analyze_artist(&app, artist_id).await?;
            match json {
                Some(level) => {
                    JsonDoc::new("catalog list").summary(&analysis).detail(&analysis).emit(level);
                }
                None => {
                    println!(
                        "{} ({} shows, {} downloaded)",
                        analysis.artist_name, analysis.total, analysis.downloaded
                    );
                    let missing_ids: std::collections::HashSet<u64> =
                        analysis.missing.iter().map(|m| m.container_id).collect();
                    let meta = app
                        .cache
                        .get_artist_meta_cached(&app.client, artist_id, ARTIST_TTL)
                        .await?;
                    for c in meta.containers() {
                        let mark = if missing_ids.contains(&c.container_id) { "✗" } else { "✓" };
                        println!("  {mark} {:8}  {}", c.container_id, c.container_info);
                    }
                }
            }
        }
        Ok(())
    })
}

fn cmd_catalog_gaps(
    rt: &Runtime,
    args: &[String],
    ids_only: bool,
    json: Option<JsonLevel>,
) -> anyhow::Result<()> {
    let parsed = split_artist_args(args);
    let config = load_config(json.is_none())?;

    rt.block_on(async {
        if parsed.fill {
            let app = setup_download_app(config).await?;
            arm_controls(&app, json);
            let artist_ids = resolve_artist_names(&app, &parsed).await?;
            if artist_ids.is_empty() {
                return Err(Error::config("no artists given").into());
            }
            let summary = gaps::fill_gaps(&app, &artist_ids, parsed.kind).await?;

            match json {
                Some(level) => {
                    JsonDoc::new("catalog gaps").summary(&summary).emit(level);
                }
                None => {
                    println!();
                    println!(
                        "Gap fill: {} attempted, {} succeeded, {} failed, {} remaining{}",
                        summary.attempted,
                        summary.succeeded,
                        summary.failed,
                        summary.remaining,
                        if summary.cancelled { " (cancelled)" } else { "" },
                    );
                }
            }
            return Ok(());
        }

        let app = App::new(config)?;
        let artist_ids = resolve_artist_names(&app, &parsed).await?;
        if artist_ids.is_empty() {
            return Err(Error::config("no artists given").into());
        }
        let mut analyses: Vec<GapAnalysis> = Vec::new();
        for &artist_id in &artist_ids {
            analyses.push(gaps::analyze_artist(&app, artist_id).await?);
        }

        match json {
            Some(level) => {
                JsonDoc::new("catalog gaps")
                    .summary(json!({
                        "artists": analyses.len(),
                        "missing_total": analyses.iter().map(|a| a.missing.len()).sum::<usize>(),
                    }))
                    .detail(&analyses)
                    .emit(level);
            }
            None if ids_only => {
                for analysis in &analyses {
                    for show in &analysis.missing {
                        println!("{}", show.container_id);
                    }
                }
            }
            None => {
                for analysis in &analyses {
                    println!(
                        "{}: {}/{} downloaded ({:.0}% coverage){}",
                        analysis.artist_name,
                        analysis.downloaded,
                        analysis.total,
                        analysis.coverage(),
                        if analysis.stale_use { " [stale cache]" } else { "" },
                    );
                    for show in &analysis.missing {
                        println!(
                            "  ✗ {:8}  {:12}  {}",
                            show.container_id, show.performance_date, show.container_info
                        );
                    }
                    if analysis.missing.is_empty() {
                        println!("  ✓ complete");
                    }
                }
            }
        }
        Ok(())
    })
}

fn cmd_catalog_coverage(
    rt: &Runtime,
    args: &[String],
    json: Option<JsonLevel>,
) -> anyhow::Result<()> {
    let parsed = split_artist_args(args);
    let config = load_config(json.is_none())?;

    rt.block_on(async {
        let app = App::new(config)?;
        let mut artist_ids = resolve_artist_names(&app, &parsed).await?;

        // No ids: every artist with a local cache file.
        if artist_ids.is_empty() {
            let artists_dir = app.cache.dir().join("artists");
            if let Ok(entries) = std::fs::read_dir(&artists_dir) {
                for entry in entries.filter_map(|e| e.ok()) {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if let Some(id) = name
                        .strip_prefix("artist_")
                        .and_then(|s| s.strip_suffix(".json"))
                        .and_then(|s| s.parse().ok())
                    {
                        artist_ids.push(id);
                    }
                }
            }
            artist_ids.sort_unstable();
        }
        if artist_ids.is_empty() {
            return Err(Error::config(
                "no artists to analyze; pass ids or run `nugs gaps <id>` first",
            )
            .into());
        }

        let mut analyses = Vec::new();
        for &artist_id in &artist_ids {
            match gaps::analyze_artist(&app, artist_id).await {
                Ok(a) => analyses.push(a),
                Err(e) => warn!(artist_id, "coverage analysis failed: {e}"),
            }
        }

        match json {
            Some(level) => {
                JsonDoc::new("catalog coverage")
                    .summary(json!({
                        "artists": analyses.len(),
                        "total": analyses.iter().map(|a| a.total).sum::<usize>(),
                        "downloaded": analyses.iter().map(|a| a.downloaded).sum::<usize>(),
                    }))
                    .detail(&analyses)
                    .emit(level);
            }
            None => {
                for a in &analyses {
                    println!(
                        "{:6.1}%  {:4}/{:4}  {}",
                        a.coverage(),
                        a.downloaded,
                        a.total,
                        a.artist_name
                    );
                }
            }
        }
        Ok(())
    })
}

fn cmd_catalog_config(args: &[String], json: Option<JsonLevel>) -> anyhow::Result<()> {
    let mut config = load_config(json.is_none())?;

    match args[0].as_str() {
        "enable" => config.refresh.enabled = true,
        "disable" => config.refresh.enabled = false,
        "set" => {
            for pair in &args[1..] {
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(Error::config(format!("expected key=value, got {pair:?}")).into());
                };
                match key {
                    "time" => config.refresh.time = value.to_string(),
                    "timezone" => config.refresh.timezone = value.to_string(),
                    "interval" => config.refresh.interval = value.to_string(),
                    other => {
                        return Err(Error::config(format!(
                            "unknown refresh setting {other:?}; use time, timezone or interval"
                        ))
                        .into());
                    }
                }
            }
        }
        other => {
            return Err(Error::config(format!(
                "unknown config action {other:?}; use enable, disable or set"
            ))
            .into());
        }
    }

    config.validate()?;
    config::save(&config)?;

    match json {
        Some(level) => {
            JsonDoc::new("catalog config").summary(&ConfigEcho::from(&config)).emit(level);
        }
        None => {
            println!(
                "✓ Auto-refresh {} ({} {} {})",
                if config.refresh.enabled { "enabled" } else { "disabled" },
                config.refresh.interval,
                config.refresh.time,
                config.refresh.timezone,
            );
        }
    }
    Ok(())
}

/// Serializable echo of the refresh section for JSON output.
#[derive(serde::Serialize)]
struct ConfigEcho {
    enabled: bool,
    time: String,
    timezone: String,
    interval: String,
}

impl From<&Config> for ConfigEcho {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.refresh.enabled,
            time: config.refresh.time.clone(),
            timezone: config.refresh.timezone.clone(),
            interval: config.refresh.interval.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(args: &[&str]) -> Vec<String> {
        normalize_args(args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_normalize_catalog_aliases() {
        assert_eq!(norm(&["update"]), vec!["catalog", "update"]);
        assert_eq!(norm(&["gaps", "1125", "fill"]), vec!["catalog", "gaps", "1125", "fill"]);
        assert_eq!(norm(&["coverage"]), vec!["catalog", "coverage"]);
        assert_eq!(norm(&["stats"]), vec!["catalog", "stats"]);
    }

    #[test]
    fn test_normalize_refresh_alias() {
        assert_eq!(norm(&["refresh", "enable"]), vec!["catalog", "config", "enable"]);
        assert_eq!(
            norm(&["refresh", "set", "time=05:00"]),
            vec!["catalog", "config", "set", "time=05:00"]
        );
    }

    #[test]
    fn test_normalize_grab_alias() {
        assert_eq!(norm(&["grab", "1125", "latest"]), vec!["artist", "1125", "latest"]);
    }

    #[test]
    fn test_normalize_artist_shortcut() {
        assert_eq!(norm(&["1125", "latest"]), vec!["artist", "1125", "latest"]);
        assert_eq!(
            norm(&["1125", "full", "video"]),
            vec!["artist", "1125", "full", "video"]
        );
    }

    #[test]
    fn test_normalize_bare_targets_become_get() {
        assert_eq!(
            norm(&["https://play.nugs.net/release/23329"]),
            vec!["get", "https://play.nugs.net/release/23329"]
        );
        assert_eq!(norm(&["23329"]), vec!["get", "23329"]);
        assert_eq!(norm(&["23329", "23330", "video"]), vec!["get", "23329", "23330", "video"]);
    }

    #[test]
    fn test_normalize_leaves_canonical_commands() {
        assert_eq!(norm(&["status"]), vec!["status"]);
        assert_eq!(norm(&["catalog", "update"]), vec!["catalog", "update"]);
        assert_eq!(norm(&["completion", "bash"]), vec!["completion", "bash"]);
        assert_eq!(norm(&["--json", "minimal"]), vec!["--json", "minimal"]);
    }

    #[test]
    fn test_cli_parses_after_normalization() {
        let argv = {
            let mut v = vec!["nugs".to_string()];
            v.extend(norm(&["gaps", "1125", "fill"]));
            v
        };
        let cli = Cli::try_parse_from(&argv).unwrap();
        match cli.command {
            Some(Commands::Catalog {
                command: CatalogCommands::Gaps { args, ids_only },
            }) => {
                assert_eq!(args, vec!["1125", "fill"]);
                assert!(!ids_only);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_cli_parses_artist_shortcut() {
        let argv = {
            let mut v = vec!["nugs".to_string()];
            v.extend(norm(&["1125", "latest", "both"]));
            v
        };
        let cli = Cli::try_parse_from(&argv).unwrap();
        match cli.command {
            Some(Commands::Artist {
                artist_id,
                action,
                kind,
            }) => {
                assert_eq!(artist_id, 1125);
                assert_eq!(action, "latest");
                assert_eq!(kind.as_deref(), Some("both"));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_cli_global_json_flag() {
        let cli = Cli::try_parse_from(["nugs", "status", "--json", "extended"]).unwrap();
        assert_eq!(cli.json, Some(JsonLevel::Extended));
    }

    #[test]
    fn test_split_artist_args() {
        let args: Vec<String> = ["1125", "99", "video", "fill", "Test Artist"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = split_artist_args(&args);
        assert_eq!(parsed.ids, vec![1125, 99]);
        assert_eq!(parsed.names, vec!["Test Artist"]);
        assert_eq!(parsed.kind, OutputKind::Video);
        assert!(parsed.fill);
    }

    #[test]
    fn test_is_download_capable() {
        let get = Cli::try_parse_from(["nugs", "get", "1"]).unwrap();
        assert!(is_download_capable(get.command.as_ref().unwrap()));

        let status = Cli::try_parse_from(["nugs", "status"]).unwrap();
        assert!(!is_download_capable(status.command.as_ref().unwrap()));

        let gaps = Cli::try_parse_from(["nugs", "catalog", "gaps", "1125"]).unwrap();
        assert!(!is_download_capable(gaps.command.as_ref().unwrap()));

        let fill = Cli::try_parse_from(["nugs", "catalog", "gaps", "1125", "fill"]).unwrap();
        assert!(is_download_capable(fill.command.as_ref().unwrap()));
    }
}
