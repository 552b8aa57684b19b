//! Service bootstrap: config, logging, shared files, startup checks.

use anyhow::{bail, Context};
use downbeat_core::paths::ProjectPaths;
use downbeat_core::settings::Settings;
use downbeat_core::users::UserDirectory;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Load settings, resolve paths, initialize logging, load users.
fn initialize(root: &Path, config: &Path) -> anyhow::Result<(Settings, ProjectPaths, UserDirectory)> {
    let root = root
        .canonicalize()
        .with_context(|| format!("project root {} does not exist", root.display()))?;
    let config_path = if config.is_absolute() {
        config.to_path_buf()
    } else {
        root.join(config)
    };
    let settings = Settings::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;

    let paths = ProjectPaths::resolve(&root, &settings.paths, &settings.effective_log_path());
    paths
        .ensure_directories()
        .context("creating required directories")?;

    init_logging(&settings, &paths)?;

    let users_text = std::fs::read_to_string(&paths.users)
        .with_context(|| format!("users directory {} is missing", paths.users.display()))?;
    let users = UserDirectory::from_yaml(&users_text)
        .with_context(|| format!("parsing {}", paths.users.display()))?;
    if users.is_empty() {
        bail!("users directory {} has no users", paths.users.display());
    }
    tracing::info!(users = users.len(), root = %root.display(), "configuration loaded");

    Ok((settings, paths, users))
}

/// File + stdout logging with the configured level as the default filter.
fn init_logging(settings: &Settings, paths: &ProjectPaths) -> anyhow::Result<()> {
    let level = settings.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.logs)
        .with_context(|| format!("opening log file {}", paths.logs.display()))?;

    // try_init: a subscriber may already be installed when bootstrapping
    // runs under a test harness; keep that one.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file),
        )
        .try_init();
    Ok(())
}

/// Run the ingest service.
pub async fn run_ingest(root: &Path, config: &Path) -> anyhow::Result<()> {
    let (settings, paths, users) = initialize(root, config)?;
    let ctx = Arc::new(downbeat_ingest::IngestContext::build(settings, paths, users)?);

    // First token fetch happens eagerly so the service starts useful.
    if ctx.token.get().await.is_none() {
        tracing::warn!("no API token available at startup, will keep retrying in background");
    }
    downbeat_ingest::routes::serve(ctx).await
}

/// Run the scheduler service (scheduler loop + SSE server).
pub async fn run_scheduler(root: &Path, config: &Path) -> anyhow::Result<()> {
    let (settings, paths, users) = initialize(root, config)?;

    let binary = resolve_downloader_binary(&settings, &paths)?;
    tracing::info!(binary = %binary.display(), "downloader binary verified");

    let ctx = downbeat_scheduler::SchedulerContext::build(settings, paths, users, binary)?;

    // Start from a clean queue: stale records from a previous run cannot
    // be resumed because their subprocesses are gone.
    ctx.queue.reset().context("clearing task queue")?;
    ctx.errors
        .ensure_initialized()
        .context("initializing errors archive")?;

    let sse_ctx = Arc::clone(&ctx);
    let sse_server = tokio::spawn(async move { downbeat_scheduler::sse::serve(sse_ctx).await });

    downbeat_scheduler::scheduler::run(ctx).await;

    // The scheduler loop never returns; reaching this means it was
    // cancelled, so shut the SSE server down too.
    sse_server.abort();
    Ok(())
}

/// The downloader binary must exist and be executable before the
/// scheduler accepts work.
fn resolve_downloader_binary(settings: &Settings, paths: &ProjectPaths) -> anyhow::Result<PathBuf> {
    let configured = settings
        .downloader_binary
        .as_deref()
        .unwrap_or("bin/downloader");
    let path = if Path::new(configured).is_absolute() {
        PathBuf::from(configured)
    } else {
        paths.root.join(configured)
    };
    if !path.exists() {
        bail!("downloader binary not found: {}", path.display());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .permissions()
            .mode();
        if mode & 0o111 == 0 {
            bail!("downloader binary is not executable: {}", path.display());
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_minimal_project(dir: &Path) {
        std::fs::create_dir_all(dir.join("config")).unwrap();
        std::fs::write(
            dir.join("config/config.yaml"),
            r#"
upstream:
  api_base_url: https://amp-api.music.apple.com/v1/catalog
  token_fetch_url: https://music.apple.com
  token_fetch_js_regex: "/assets/index-legacy-[^/]+\\.js"
  token_fetch_token_regex: "eyJh[^\"]+"
  user_agent: Mozilla/5.0
  storefront_language_map:
    us: en-US
"#,
        )
        .unwrap();
        std::fs::write(dir.join("config/users.yaml"), "alice:\n  other_name: [Al]\n").unwrap();
    }

    #[test]
    fn missing_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = initialize(dir.path(), Path::new("config/config.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("config"));
    }

    #[test]
    fn missing_users_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_project(dir.path());
        std::fs::remove_file(dir.path().join("config/users.yaml")).unwrap();
        let err = initialize(dir.path(), Path::new("config/config.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("users"));
    }

    #[test]
    fn missing_downloader_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_project(dir.path());
        let (settings, paths, _users) =
            initialize(dir.path(), Path::new("config/config.yaml")).unwrap();
        let err = resolve_downloader_binary(&settings, &paths).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_downloader_fails() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        write_minimal_project(dir.path());
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        let binary = dir.path().join("bin/downloader");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o644)).unwrap();

        let (settings, paths, _users) =
            initialize(dir.path(), Path::new("config/config.yaml")).unwrap();
        let err = resolve_downloader_binary(&settings, &paths).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }
}
