//! Log-Forwarder Supervisor: builds the effective config, spawns the
//! external log-forwarder child process, watches for the signals that
//! require a restart, and reaps/respawns it with backoff (component H —
//! the largest single subsystem in the specification).
//!
//! The original agent built a config file as a side effect of a single
//! monolithic spawn routine; per §9's re-architecture note, that side
//! effect is isolated behind [`ConfigStore`] so tests can substitute an
//! in-memory store instead of touching the filesystem.

use crate::backoff::Backoff;
use crate::config::SupervisorConfig;
use crate::identity_context::{IdentityContext, Interest};
use crate::renderer::{render, ForwardConfig, LogSourceConfig, RenderedConfig};
use crate::sleeper::{sleep_cancellable, Sleeper, TokioSleeper};
use crate::telemetry::events::{AgentEvent, SupervisorEvent};
use crate::telemetry::sinks::emit_best_effort;
use crate::telemetry::TelemetrySink;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const CONFIG_PREFIX: &str = "nr_fb_config";
const LUA_FILTER_PREFIX: &str = "nr_fb_lua_filter";

/// Source of the user-facing YAML knobs (§1 treats the loader itself as an
/// external collaborator; this trait is the seam the supervisor depends on
/// so tests can supply fixed config without a real file).
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<(LogSourceConfig, ForwardConfig), crate::error::RenderError>;
}

/// Fixed in-memory config source, for tests and simple deployments.
#[derive(Debug, Clone)]
pub struct StaticConfigSource(pub LogSourceConfig, pub ForwardConfig);

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<(LogSourceConfig, ForwardConfig), crate::error::RenderError> {
        Ok((self.0.clone(), self.1.clone()))
    }
}

/// Reads `{ log: LogSourceConfig, forward: ForwardConfig }` from a single
/// YAML file on disk, re-read on every call (picking up edits without a
/// restart of the agent process itself).
#[derive(Debug, Clone)]
pub struct YamlFileConfigSource {
    pub path: PathBuf,
}

#[derive(serde::Deserialize)]
struct CombinedYaml {
    #[serde(default)]
    log: LogSourceConfig,
    #[serde(default)]
    forward: ForwardConfig,
}

impl ConfigSource for YamlFileConfigSource {
    fn load(&self) -> Result<(LogSourceConfig, ForwardConfig), crate::error::RenderError> {
        let text = std::fs::read_to_string(&self.path)?;
        let combined: CombinedYaml = serde_yaml::from_str(&text)
            .map_err(|e| crate::error::RenderError::InvalidConfig(e.to_string()))?;
        Ok((combined.log, combined.forward))
    }
}

/// Isolates the filesystem side effects of writing a rendered config to a
/// temp file and pruning old ones (§9's `configStore` re-architecture).
pub trait ConfigStore: Send + Sync {
    /// Write `text` to a fresh, uniquely-named temp file; return its path.
    fn write_temp(&self, text: &str) -> std::io::Result<PathBuf>;
    /// Delete config temp files beyond the `keep` most-recent (by mtime),
    /// along with any Lua-filter temp files they reference. Failures are
    /// aggregated and returned rather than treated as fatal.
    fn prune(&self, keep: usize) -> Vec<std::io::Error>;
}

/// Default, filesystem-backed [`ConfigStore`] under a single directory.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lua_filter_regex() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(&format!(r"\S*{LUA_FILTER_PREFIX}\S*")).expect("valid regex"))
    }

    fn prefixed_entries(&self, prefix: &str) -> std::io::Result<Vec<(PathBuf, std::time::SystemTime)>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(prefix) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            entries.push((entry.path(), modified));
        }
        Ok(entries)
    }
}

impl ConfigStore for FileConfigStore {
    fn write_temp(&self, text: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{CONFIG_PREFIX}-{}.conf", uuid::Uuid::new_v4()));
        std::fs::write(&path, text)?;
        Ok(path)
    }

    fn prune(&self, keep: usize) -> Vec<std::io::Error> {
        let mut errors = Vec::new();
        let mut configs = match self.prefixed_entries(CONFIG_PREFIX) {
            Ok(entries) => entries,
            Err(e) => return vec![e],
        };
        configs.sort_by_key(|(_, modified)| *modified);

        if configs.len() <= keep {
            return errors;
        }
        let stale_count = configs.len() - keep;
        for (path, _) in configs.into_iter().take(stale_count) {
            if let Ok(text) = std::fs::read_to_string(&path) {
                for referenced in Self::lua_filter_regex().find_iter(&text) {
                    let lua_path = self.dir.join(referenced.as_str());
                    if lua_path.exists() {
                        if let Err(e) = std::fs::remove_file(&lua_path) {
                            errors.push(e);
                        }
                    }
                }
            }
            if let Err(e) = std::fs::remove_file(&path) {
                errors.push(e);
            }
        }
        errors
    }
}

/// Single-slot hostname-change notifier (§9: a one-way observer, the same
/// shape as [`crate::identity_context::IdentityContext`]'s subscriber
/// registry, not a circular reference back into the supervisor).
#[derive(Clone)]
pub struct HostnameWatch {
    tx: Arc<watch::Sender<String>>,
    rx: watch::Receiver<String>,
}

impl HostnameWatch {
    pub fn new(initial: impl Into<String>) -> Self {
        let (tx, rx) = watch::channel(initial.into());
        Self { tx: Arc::new(tx), rx }
    }

    pub fn current(&self) -> String {
        self.rx.borrow().clone()
    }

    pub fn set(&self, new: impl Into<String>) {
        self.tx.send_if_modified(|current| {
            let new = new.into();
            if *current == new {
                false
            } else {
                *current = new;
                true
            }
        });
    }

    fn subscriber(&self) -> watch::Receiver<String> {
        self.rx.clone()
    }
}

/// Why the supervisor is about to terminate the running child and restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    IdentityChanged,
    HostnameChanged,
    ConfigDirChanged,
}

impl RestartCause {
    fn reason(self) -> &'static str {
        match self {
            RestartCause::IdentityChanged => "identity reconnect",
            RestartCause::HostnameChanged => "hostname change",
            RestartCause::ConfigDirChanged => "config directory change",
        }
    }
}

/// Build the exact argv the child log-forwarder is invoked with (§6):
/// `-c <cfg>`, `-e <native-output-plugin>`, one or more `-R <parsers>`,
/// and an optional verbose flag. Pure and independently testable.
pub fn build_args(cfg: &SupervisorConfig, tmp_path: &Path, external_parsers: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        tmp_path.display().to_string(),
        "-e".to_string(),
        cfg.native_output_plugin.clone(),
        "-R".to_string(),
        cfg.default_parsers_path.clone(),
    ];
    if let Some(parsers) = external_parsers {
        args.push("-R".to_string());
        args.push(parsers.to_string());
    }
    if cfg.verbose {
        args.push("-v".to_string());
    }
    args
}

/// Check that every path the child needs actually exists before spawning
/// (§4.H "platform-availability check"): the executable itself, the native
/// output plugin, and the default parsers file.
pub fn binaries_available(cfg: &SupervisorConfig) -> bool {
    Path::new(&cfg.binary_path).is_file()
        && Path::new(&cfg.native_output_plugin).exists()
        && Path::new(&cfg.default_parsers_path).exists()
}

/// Classify one line of child stdout/stderr by its bracketed level token
/// (`[error]`, `[warn]`, `[info]`, ...). Unrecognised noise (banners, ANSI
/// escapes, anything without a bracketed level) is suppressed per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLogLevel {
    Info,
    Warn,
    Error,
}

pub fn classify_line(line: &str) -> Option<ChildLogLevel> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)\[\s*(error|err|warn(?:ing)?|info|notice)\s*\]").expect("valid regex"));
    let caps = re.captures(line)?;
    match caps[1].to_ascii_lowercase().as_str() {
        "error" | "err" => Some(ChildLogLevel::Error),
        "warn" | "warning" => Some(ChildLogLevel::Warn),
        _ => Some(ChildLogLevel::Info),
    }
}

fn log_bridge_line(line: &str) {
    match classify_line(line) {
        Some(ChildLogLevel::Error) => tracing::error!(child_line = %line, "log-forwarder"),
        Some(ChildLogLevel::Warn) => tracing::warn!(child_line = %line, "log-forwarder"),
        Some(ChildLogLevel::Info) => tracing::info!(child_line = %line, "log-forwarder"),
        None => {}
    }
}

/// Drives the build -> run -> observe-for-change -> restart loop of §4.H.
pub struct Supervisor<S> {
    config: SupervisorConfig,
    identity: Arc<IdentityContext>,
    hostname: HostnameWatch,
    config_watcher: Option<crate::config_watcher::ConfigDirWatcher>,
    config_source: Arc<dyn ConfigSource>,
    config_store: Arc<dyn ConfigStore>,
    agent_guid_override: Option<String>,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
    spawn_attempts: AtomicU64,
    sink: S,
}

impl<S> Supervisor<S>
where
    S: TelemetrySink,
    S::Future: Send,
{
    pub fn new(
        config: SupervisorConfig,
        identity: Arc<IdentityContext>,
        hostname: HostnameWatch,
        config_watcher: Option<crate::config_watcher::ConfigDirWatcher>,
        config_source: Arc<dyn ConfigSource>,
        config_store: Arc<dyn ConfigStore>,
        sink: S,
    ) -> Self {
        let backoff = config.backoff.build();
        Self {
            config,
            identity,
            hostname,
            config_watcher,
            config_source,
            config_store,
            agent_guid_override: None,
            backoff,
            sleeper: Arc::new(TokioSleeper),
            spawn_attempts: AtomicU64::new(0),
            sink,
        }
    }

    async fn emit(&self, event: SupervisorEvent) {
        emit_best_effort(self.sink.clone(), AgentEvent::Supervisor(event)).await;
    }

    /// Run until `cancel` fires. Blocks first on the agent's first non-empty
    /// identity, then enters the steady-state build/run/restart loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        let identity = self.identity.clone();
        let first = identity.wait_for_non_empty(&cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        let _ = first;

        let mut reconnect_rx = self.identity.subscribe(Interest::RECONNECT);

        loop {
            if cancel.is_cancelled() {
                return;
            }

            if !binaries_available(&self.config) {
                sleep_cancellable(&*self.sleeper, self.backoff.next(), &cancel).await;
                continue;
            }

            let identity_snapshot = self.identity.get();
            let hostname = self.hostname.current();
            let guid = self.agent_guid_override.clone().unwrap_or_else(|| identity_snapshot.guid.clone());

            let rendered = match self.build_config(&guid, &hostname) {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to render log-forwarder config");
                    sleep_cancellable(&*self.sleeper, self.backoff.next(), &cancel).await;
                    continue;
                }
            };

            let tmp_path = match self.config_store.write_temp(&rendered.text) {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to write log-forwarder config temp file");
                    sleep_cancellable(&*self.sleeper, self.backoff.next(), &cancel).await;
                    continue;
                }
            };
            for err in self.config_store.prune(self.config.max_temp_files) {
                tracing::debug!(error = %err, "failed to prune old log-forwarder temp file");
            }

            let args = build_args(&self.config, &tmp_path, rendered.external_parsers_path.as_deref());
            let attempt = self.spawn_attempts.fetch_add(1, Ordering::SeqCst);
            self.emit(SupervisorEvent::PreRun { attempt }).await;

            let restart_requested = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let exit_code = Self::run_child_to_completion(
                &self.config,
                self.sink.clone(),
                &args,
                &cancel,
                &mut reconnect_rx,
                &self.hostname,
                &mut self.config_watcher,
                restart_requested.clone(),
            )
            .await;

            self.emit(SupervisorEvent::PostRun { exit_code }).await;

            if cancel.is_cancelled() {
                return;
            }

            if restart_requested.load(Ordering::SeqCst) {
                self.backoff.reset();
                continue;
            }

            sleep_cancellable(&*self.sleeper, self.backoff.next(), &cancel).await;
        }
    }

    fn build_config(&self, guid: &str, hostname: &str) -> Result<RenderedConfig, crate::error::RenderError> {
        let (log_cfg, forward_cfg) = self.config_source.load()?;
        render(&log_cfg, &forward_cfg, guid, hostname)
    }

    /// Spawn the child, stream its output through the log bridge, and race
    /// its natural exit against every restart trigger. Returns the exit
    /// code (`None` if it could not be determined).
    ///
    /// Takes every collaborator as an explicit parameter rather than
    /// `&mut self` so the restart-trigger `select!` below never needs a
    /// field-level borrow of `self` alongside an event emit that needs
    /// `self` as a whole.
    async fn run_child_to_completion(
        config: &SupervisorConfig,
        sink: S,
        args: &[String],
        cancel: &CancellationToken,
        reconnect_rx: &mut mpsc::Receiver<AgentEvent>,
        hostname: &HostnameWatch,
        config_watcher: &mut Option<crate::config_watcher::ConfigDirWatcher>,
        restart_requested: Arc<std::sync::atomic::AtomicBool>,
    ) -> Option<i32> {
        let mut cmd = Command::new(&config.binary_path);
        cmd.args(args)
            .env("NR_LICENSE_KEY_ENV_VAR", &config.license_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn log-forwarder");
                return None;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|s| tokio::spawn(Self::drain_lines(s)));
        let err_task = stderr.map(|s| tokio::spawn(Self::drain_lines(s)));

        let mut hostname_rx = hostname.subscriber();
        let grace_period = config.grace_period;

        let exit_code = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    Self::terminate_gracefully(&mut child, grace_period).await;
                    break Self::exit_code_of(&mut child).await;
                }
                event = reconnect_rx.recv() => {
                    if matches!(event, Some(AgentEvent::Identity(crate::telemetry::events::IdentityEvent::Reconnect { .. }))) {
                        restart_requested.store(true, Ordering::SeqCst);
                        emit_best_effort(sink.clone(), AgentEvent::Supervisor(SupervisorEvent::RestartRequested { reason: RestartCause::IdentityChanged.reason().into() })).await;
                        Self::terminate_gracefully(&mut child, grace_period).await;
                        break Self::exit_code_of(&mut child).await;
                    }
                }
                changed = hostname_rx.changed() => {
                    if changed.is_ok() {
                        restart_requested.store(true, Ordering::SeqCst);
                        emit_best_effort(sink.clone(), AgentEvent::Supervisor(SupervisorEvent::RestartRequested { reason: RestartCause::HostnameChanged.reason().into() })).await;
                        Self::terminate_gracefully(&mut child, grace_period).await;
                        break Self::exit_code_of(&mut child).await;
                    }
                }
                _ = Self::wait_config_dir(config_watcher), if config_watcher.is_some() => {
                    restart_requested.store(true, Ordering::SeqCst);
                    emit_best_effort(sink.clone(), AgentEvent::Supervisor(SupervisorEvent::RestartRequested { reason: RestartCause::ConfigDirChanged.reason().into() })).await;
                    Self::terminate_gracefully(&mut child, grace_period).await;
                    break Self::exit_code_of(&mut child).await;
                }
                status = child.wait() => {
                    break status.ok().and_then(|s| s.code());
                }
            }
        };

        if let Some(task) = out_task {
            let _ = task.await;
        }
        if let Some(task) = err_task {
            let _ = task.await;
        }

        exit_code
    }

    async fn wait_config_dir(watcher: &mut Option<crate::config_watcher::ConfigDirWatcher>) {
        match watcher {
            Some(w) => {
                w.changed().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    async fn exit_code_of(child: &mut Child) -> Option<i32> {
        match child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }

    async fn drain_lines<R: tokio::io::AsyncRead + Unpin>(reader: R) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log_bridge_line(&line);
        }
    }

    /// Send a graceful termination signal; if the child has not exited
    /// within `grace_period`, force-kill it.
    async fn terminate_gracefully(child: &mut Child, grace_period: Duration) {
        Self::send_graceful_signal(child);
        let graced = tokio::time::timeout(grace_period, child.wait()).await;
        if graced.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn send_graceful_signal(child: &Child) {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` is the live child's own pid; sending SIGTERM to a
            // process we own is the standard graceful-shutdown request.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn send_graceful_signal(child: &mut Child) {
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn source() -> StaticConfigSource {
        StaticConfigSource(
            LogSourceConfig {
                sources: vec![crate::renderer::LogSource {
                    name: "app".into(),
                    path: "/var/log/app.log".into(),
                    parser: None,
                }],
            },
            ForwardConfig {
                destinations: vec![crate::renderer::ForwardDestination {
                    name: "newrelic".into(),
                    endpoint: "log-api.newrelic.com".into(),
                }],
                external_parsers_path: None,
            },
        )
    }

    #[test]
    fn classify_line_recognizes_levels() {
        assert_eq!(classify_line("[error] connection refused"), Some(ChildLogLevel::Error));
        assert_eq!(classify_line("[warn] retrying"), Some(ChildLogLevel::Warn));
        assert_eq!(classify_line("[ info ] starting up"), Some(ChildLogLevel::Info));
    }

    #[test]
    fn classify_line_suppresses_unrecognised_noise() {
        assert_eq!(classify_line("Fluent Bit v2.1.0"), None);
        assert_eq!(classify_line("\x1b[32mOK\x1b[0m"), None);
    }

    #[test]
    fn build_args_includes_external_parsers_and_verbose() {
        let cfg = SupervisorConfig { verbose: true, ..Default::default() };
        let args = build_args(&cfg, Path::new("/tmp/cfg.conf"), Some("/tmp/extra.conf"));
        assert_eq!(
            args,
            vec![
                "-c", "/tmp/cfg.conf", "-e", &cfg.native_output_plugin, "-R", &cfg.default_parsers_path,
                "-R", "/tmp/extra.conf", "-v",
            ]
        );
    }

    #[test]
    fn build_args_omits_optional_flags_when_absent() {
        let cfg = SupervisorConfig::default();
        let args = build_args(&cfg, Path::new("/tmp/cfg.conf"), None);
        assert!(!args.contains(&"-v".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "-R").count(), 1);
    }

    #[test]
    fn binaries_available_requires_every_path_to_exist() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("fluent-bit");
        let plugin = dir.path().join("out_newrelic.so");
        let parsers = dir.path().join("parsers.conf");
        fs::write(&exe, "").unwrap();
        fs::write(&plugin, "").unwrap();
        fs::write(&parsers, "").unwrap();

        let cfg = SupervisorConfig {
            binary_path: exe.display().to_string(),
            native_output_plugin: plugin.display().to_string(),
            default_parsers_path: parsers.display().to_string(),
            ..Default::default()
        };
        assert!(binaries_available(&cfg));

        fs::remove_file(&parsers).unwrap();
        assert!(!binaries_available(&cfg));
    }

    #[test]
    fn file_config_store_prunes_beyond_retention() {
        let dir = TempDir::new().unwrap();
        let store = FileConfigStore::new(dir.path());
        let mut paths = Vec::new();
        for _ in 0..5 {
            paths.push(store.write_temp("dummy").unwrap());
            std::thread::sleep(Duration::from_millis(5));
        }

        let errors = store.prune(2);
        assert!(errors.is_empty());

        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&paths[3]));
        assert!(remaining.contains(&paths[4]));
    }

    #[test]
    fn file_config_store_deletes_referenced_lua_filters() {
        let dir = TempDir::new().unwrap();
        let store = FileConfigStore::new(dir.path());

        let lua_path = dir.path().join(format!("{LUA_FILTER_PREFIX}-abc.lua"));
        fs::write(&lua_path, "return 1").unwrap();

        let cfg_text = format!("[FILTER]\n    Script {}\n", lua_path.display());
        let cfg_path = store.write_temp(&cfg_text).unwrap();
        assert!(cfg_path.exists());

        // Push it past retention so the very next prune evicts it.
        store.write_temp("dummy").unwrap();
        let errors = store.prune(1);
        assert!(errors.is_empty());
        assert!(!cfg_path.exists());
        assert!(!lua_path.exists());
    }

    #[test]
    fn hostname_watch_set_is_idempotent() {
        let watch = HostnameWatch::new("host-a");
        let mut rx = watch.subscriber();
        watch.set("host-a");
        assert!(rx.has_changed().map(|c| !c).unwrap_or(true));

        watch.set("host-b");
        assert_eq!(watch.current(), "host-b");
    }

    #[tokio::test]
    async fn config_source_round_trips_through_render() {
        let src = source();
        let (log_cfg, forward_cfg) = src.load().unwrap();
        let rendered = render(&log_cfg, &forward_cfg, "GUID-1", "host-a").unwrap();
        assert!(rendered.text.contains("GUID-1"));
    }

    /// Scenario: an identity reconnect restarts the child with a config that
    /// embeds the new GUID, without waiting out any backoff delay.
    #[tokio::test]
    async fn identity_reconnect_restarts_child_with_new_guid() {
        use crate::entity::Identity;
        use crate::telemetry::sinks::MemorySink;
        use std::time::Duration as StdDuration;

        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("fake-fluent-bit");
        let plugin = dir.path().join("out_newrelic.so");
        let parsers = dir.path().join("parsers.conf");
        fs::write(&exe, "#!/bin/sh\nsleep 5\n").unwrap();
        fs::write(&plugin, "").unwrap();
        fs::write(&parsers, "").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = SupervisorConfig {
            binary_path: exe.display().to_string(),
            native_output_plugin: plugin.display().to_string(),
            default_parsers_path: parsers.display().to_string(),
            grace_period: StdDuration::from_millis(200),
            max_temp_files: 5,
            ..Default::default()
        };
        // The script's shebang ignores whatever argv `build_args` supplies
        // (`-c <cfg> -e <plugin> -R <parsers>`) and just sleeps, standing in
        // for a long-running child without caring about its own arguments.

        let identity = Arc::new(IdentityContext::new());
        identity.set(Identity { id: 1, guid: "GUID-1".into() });

        let sink = MemorySink::with_capacity(32);
        let supervisor = Supervisor::new(
            config,
            identity.clone(),
            HostnameWatch::new("host-a"),
            None,
            Arc::new(source()),
            Arc::new(FileConfigStore::new(dir.path())),
            sink.clone(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        tokio::time::sleep(StdDuration::from_millis(300)).await;
        identity.set(Identity { id: 1, guid: "GUID-2".into() });
        tokio::time::sleep(StdDuration::from_millis(500)).await;

        cancel.cancel();
        let _ = tokio::time::timeout(StdDuration::from_secs(2), handle).await;

        let pre_runs = sink
            .events()
            .iter()
            .filter(|e| matches!(e, AgentEvent::Supervisor(SupervisorEvent::PreRun { .. })))
            .count();
        assert!(pre_runs >= 2, "expected at least 2 PreRun events (initial + restart), got {pre_runs}");

        let restarts = sink
            .events()
            .iter()
            .filter(|e| matches!(e, AgentEvent::Supervisor(SupervisorEvent::RestartRequested { .. })))
            .count();
        assert!(restarts >= 1, "expected at least one restart request from the identity change");
    }
}
