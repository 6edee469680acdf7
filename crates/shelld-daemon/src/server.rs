//! The HTTP surface and the single-client session controller.
//!
//! Every authenticated endpoint is gated on the bound key. The engine is
//! synchronous; handlers bridge onto it with `spawn_blocking` so a long
//! start/execute/unlock never stalls the async workers.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::error;
use tracing::info;

use shelld_common::mutex_lock_or_recover;
use shelld_common::rwlock_read_or_recover;
use shelld_common::rwlock_write_or_recover;

use crate::config::Config;
use crate::error::DaemonError;
use crate::hooks::HookRunner;
use crate::shell::Shell;
use crate::shell::ShellError;
use crate::shell::ShellState;
use crate::signal_handler::SignalHandler;

pub const KEY_HEADER: &str = "x-shell-key";
pub const TIMEOUT_HEADER: &str = "x-command-timeout";

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const UNLOCK_RESPONSE_DELAY: Duration = Duration::from_millis(100);

/// Shared state behind every handler: the engine, the hook runner, the
/// bound key, and the idle-watchdog clock.
pub struct ServerState {
    shell: Shell,
    hooks: HookRunner,
    config: Config,
    key: RwLock<Option<String>>,
    last_activity: Mutex<Instant>,
}

impl ServerState {
    pub fn new(config: Config) -> Arc<Self> {
        let shell = Shell::new(
            config.shell.command.clone(),
            config.shell.working_directory.clone(),
            config.timeout.kill,
        );
        let hooks = HookRunner::new(
            config.hooks.shell.clone(),
            config.hooks.lock.clone(),
            config.hooks.unlock.clone(),
        );
        Arc::new(Self {
            shell,
            hooks,
            config,
            key: RwLock::new(None),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *mutex_lock_or_recover(&self.last_activity) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        mutex_lock_or_recover(&self.last_activity).elapsed()
    }

    fn bound_key(&self) -> Option<String> {
        rwlock_read_or_recover(&self.key).clone()
    }

    fn clear_key(&self) {
        *rwlock_write_or_recover(&self.key) = None;
    }
}

/// Runs the daemon until shutdown: signal, idle watchdog, or die-on-unlock.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    let state = ServerState::new(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _signals = SignalHandler::setup(shutdown_tx)?;

    spawn_idle_watchdog(Arc::clone(&state));

    let port = state.config.server.port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| DaemonError::Bind { port, source })?;
    info!(port, "server is ready");

    let app = router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_sequence(state, shutdown_rx))
        .await
        .map_err(|source| DaemonError::Serve { source })?;

    info!("server stopped");
    Ok(())
}

/// Waits for the shutdown trigger, then tears the session down before the
/// transport stops accepting requests: unlock hook under the shutdown
/// deadline, then engine unlock (SIGKILL after the kill grace).
async fn shutdown_sequence(state: Arc<ServerState>, mut shutdown_rx: watch::Receiver<bool>) {
    let _ = shutdown_rx.changed().await;

    let deadline = state.config.timeout.shutdown;
    let teardown = tokio::task::spawn_blocking(move || {
        let key = state.bound_key().unwrap_or_default();
        state.hooks.run_unlock(&key, Some(deadline));
        if let Err(err) = state.shell.unlock() {
            error!(error = %err, "the shell failed to unlock during shutdown");
        }
    });
    if let Err(err) = teardown.await {
        error!(error = %err, "the shutdown task failed");
    }
}

fn spawn_idle_watchdog(state: Arc<ServerState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let idle = state.idle_for();
            if idle > state.config.timeout.idle {
                info!(idle_secs = idle.as_secs(), "idle timeout exceeded, shutting down");
                raise_sigterm();
                return;
            }
        }
    });
}

fn raise_sigterm() {
    if let Err(err) = signal_hook::low_level::raise(signal_hook::consts::SIGTERM) {
        error!(error = %err, "failed to raise SIGTERM");
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/lock", post(handle_lock))
        .route("/execute", post(handle_execute))
        .route("/kill", post(handle_kill))
        .route("/unlock", post(handle_unlock))
        .route("/output", get(handle_output))
        .route("/state", get(handle_state))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Gate for `/lock`: the first presented key becomes the bound key, after
/// which the presented key must match it.
fn bind_or_match_key(state: &ServerState, headers: &HeaderMap) -> Result<String, Response> {
    let Some(provided) = header_value(headers, KEY_HEADER) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "the X-Shell-Key header is required",
        ));
    };

    let bound = {
        let mut key = rwlock_write_or_recover(&state.key);
        match key.as_ref() {
            Some(bound) => bound.clone(),
            None => {
                info!("the shell has been locked to a key");
                *key = Some(provided.clone());
                provided.clone()
            }
        }
    };

    if provided != bound {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "the provided key does not match the locked key",
        ));
    }

    state.touch();
    Ok(provided)
}

/// Gate for every other authenticated endpoint: a key must be bound and the
/// presented key must equal it.
fn match_key(state: &ServerState, headers: &HeaderMap) -> Result<String, Response> {
    let Some(provided) = header_value(headers, KEY_HEADER) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "the X-Shell-Key header is required",
        ));
    };

    let Some(bound) = state.bound_key() else {
        return Err(error_response(
            StatusCode::CONFLICT,
            "the shell has not been locked",
        ));
    };

    if provided != bound {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "the provided key does not match the locked key",
        ));
    }

    state.touch();
    Ok(provided)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

async fn handle_lock(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let key = match bind_or_match_key(&state, &headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let worker = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || {
        worker.hooks.run_lock(&key, None);
        worker.shell.start()
    })
    .await;

    match result {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(err)) => lock_failure_response(err),
        Err(err) => {
            error!(error = %err, "the lock task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "the shell could not be started",
            )
        }
    }
}

fn lock_failure_response(err: ShellError) -> Response {
    match err {
        ShellError::NotAvailable(ShellState::Locked | ShellState::Executing) => {
            error_response(StatusCode::CONFLICT, "the shell is already locked")
        }
        ShellError::NotAvailable(ShellState::Unrecoverable) => error_response(
            StatusCode::CONFLICT,
            "the shell is in an unrecoverable state",
        ),
        err => {
            error!(error = %err, "the shell failed to start");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "the shell could not be started",
            )
        }
    }
}

async fn handle_execute(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = match_key(&state, &headers) {
        return resp;
    }

    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "the command cannot be empty");
    }

    let timeout = match effective_timeout(&state.config, &headers) {
        Ok(timeout) => timeout,
        Err(resp) => return resp,
    };

    let command = body.to_vec();
    let worker = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || worker.shell.execute(&command, timeout)).await;

    match result {
        Ok(Ok(output)) => (StatusCode::OK, output).into_response(),
        Ok(Err(ShellError::Timeout)) => error_response(
            StatusCode::ACCEPTED,
            "the command timed out; the shell is busy and the command is still running",
        ),
        Ok(Err(err)) => execute_failure_response(err),
        Err(err) => {
            error!(error = %err, "the execute task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "the command could not be executed",
            )
        }
    }
}

fn execute_failure_response(err: ShellError) -> Response {
    match err {
        ShellError::NotLocked(ShellState::Available) => {
            error_response(StatusCode::CONFLICT, "the shell has not been locked")
        }
        ShellError::NotLocked(ShellState::Executing) => error_response(
            StatusCode::CONFLICT,
            "the shell is busy executing another command",
        ),
        ShellError::NotLocked(ShellState::Unrecoverable) => error_response(
            StatusCode::CONFLICT,
            "the shell is in an unrecoverable state",
        ),
        err => {
            error!(error = %err, "command execution failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "the command could not be executed",
            )
        }
    }
}

/// Resolves the per-call deadline: a positive `X-Command-Timeout` override
/// wins, clamped to the configured maximum; otherwise the configured
/// default applies. A malformed override is a client error.
fn effective_timeout(config: &Config, headers: &HeaderMap) -> Result<Duration, Response> {
    let Some(raw) = header_value(headers, TIMEOUT_HEADER) else {
        return Ok(config.timeout.command);
    };

    let parsed = humantime::parse_duration(&raw).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "the X-Command-Timeout header is invalid",
        )
    })?;

    let clamped = parsed.min(config.timeout.command_maximum);
    if clamped > Duration::ZERO {
        Ok(clamped)
    } else {
        Ok(config.timeout.command)
    }
}

async fn handle_kill(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = match_key(&state, &headers) {
        return resp;
    }

    let worker = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || worker.shell.kill()).await;

    match result {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(err)) => {
            error!(error = %err, "the interrupt could not be sent");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "the shell could not be killed",
            )
        }
        Err(err) => {
            error!(error = %err, "the kill task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "the shell could not be killed",
            )
        }
    }
}

async fn handle_unlock(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let key = match match_key(&state, &headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    if state.config.server.die_on_unlock {
        // shutdown mode: respond first, then re-enter the signal path;
        // the shutdown sequence runs the unlock hook
        tokio::spawn(async {
            tokio::time::sleep(UNLOCK_RESPONSE_DELAY).await;
            raise_sigterm();
        });
        return StatusCode::OK.into_response();
    }

    // recycle mode: terminate the shell, clear the key, keep serving
    let worker = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || {
        worker.hooks.run_unlock(&key, None);
        worker.shell.unlock()
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "the shell failed to unlock"),
        Err(err) => error!(error = %err, "the unlock task failed"),
    }

    state.clear_key();
    info!("the shell has been recycled and is available for a new client");
    StatusCode::OK.into_response()
}

// unconditional apart from the key gate: the slot stays readable in every
// engine state, including while a command is executing
async fn handle_output(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = match_key(&state, &headers) {
        return resp;
    }

    let worker = Arc::clone(&state);
    match tokio::task::spawn_blocking(move || worker.shell.last_output()).await {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(err) => {
            error!(error = %err, "the output task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "the output is unavailable")
        }
    }
}

async fn handle_state(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = match_key(&state, &headers) {
        return resp;
    }

    let worker = Arc::clone(&state);
    match tokio::task::spawn_blocking(move || worker.shell.state()).await {
        Ok(shell_state) => (StatusCode::OK, shell_state.to_string()).into_response(),
        Err(err) => {
            error!(error = %err, "the state task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "the state is unavailable")
        }
    }
}

async fn handle_health() -> StatusCode {
    StatusCode::OK
}
