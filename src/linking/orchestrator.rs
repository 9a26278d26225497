//! The linking state machine.
//!
//! [`Linker::request_link`] gates the request on the user's cooldown, opens an
//! ephemeral connection on a fresh auth directory and spawns one task per
//! attempt. That task consumes the connection's update stream:
//!
//! ```text
//! Created -> AwaitingCredential -> Authenticating -> Linked
//!                                                 \-> Failed | Expired
//! ```
//!
//! A linked connection is handed to a supervisor task that keeps the
//! registry's `active` flag in sync and reopens after transient disconnects.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::attempt::{AttemptState, LinkMode, LinkRequest, LinkingAttempt, SessionId};
use super::cooldown::{CooldownDecision, CooldownTracker};
use super::error::LinkError;
use super::maintenance::{MaintenanceScheduler, RestartAction};
use super::messenger::Messenger;
use super::pairing::{PairingNegotiator, PairingOutcome, format_pairing_code};
use super::protocol::{
    BrowserLabel, ConnectOptions, Connection, ConnectionState, ConnectionUpdate, DisconnectReason,
    OpenedConnection, ProtocolClient,
};
use super::qr::QrRenderer;
use super::registry::{ActiveConnections, SessionRecord, SessionRegistry};
use super::watchdog::{FinishLatch, TimeoutWatchdog, teardown};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Sent when an attempt expires or its connection drops before linking.
pub const CONNECT_FAILED_NOTICE: &str = "❌ Could not connect the sub-bot. Request a new code or QR to try again.";
/// Sent when no pairing code could be obtained for the number.
pub const NO_CODE_NOTICE: &str = "❌ Could not get a pairing code for that number. Check it and try again.";

/// Tunables of the linking engine.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub cooldown: Duration,
    pub restart_window: Duration,
    pub code_expiry: Duration,
    pub qr_expiry: Duration,
    /// Added to the mode budget before the watchdog fires.
    pub expiry_grace: Duration,
    pub pairing_attempts: u32,
    pub pairing_interval: Duration,
    /// Pause between a challenge and its first code request.
    pub pairing_warmup: Duration,
    /// Reopens allowed per attempt, and per outage of a linked session.
    pub max_reconnects: u32,
    pub restart_after_cooldown: bool,
    pub qr_max_size: u32,
    pub browser: BrowserLabel,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            restart_window: Duration::from_secs(3),
            code_expiry: Duration::from_secs(45),
            qr_expiry: Duration::from_secs(60),
            expiry_grace: Duration::from_secs(2),
            pairing_attempts: 6,
            pairing_interval: Duration::from_millis(800),
            pairing_warmup: Duration::from_millis(1200),
            max_reconnects: 2,
            restart_after_cooldown: true,
            qr_max_size: 512,
            browser: BrowserLabel::default(),
        }
    }
}

impl LinkSettings {
    /// Time the user has to complete pairing in `mode`.
    pub fn budget(&self, mode: LinkMode) -> Duration {
        match mode {
            LinkMode::Code => self.code_expiry,
            LinkMode::Qr => self.qr_expiry,
        }
    }
}

/// How an attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    Linked { identifier: String },
    Failed(LinkError),
    Expired,
}

/// A running attempt.
#[derive(Debug)]
pub struct AttemptHandle {
    pub session_id: SessionId,
    pub mode: LinkMode,
    join: JoinHandle<AttemptOutcome>,
}

impl AttemptHandle {
    /// Wait for the attempt to reach a terminal state.
    pub async fn outcome(self) -> AttemptOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Attempt {} task failed: {e}", self.session_id);
                AttemptOutcome::Failed(LinkError::Io(std::io::Error::other(e)))
            }
        }
    }
}

#[derive(Debug)]
pub enum LinkStart {
    /// The user is still cooling down.
    Denied { remaining: Duration },
    Started(AttemptHandle),
}

enum Terminal {
    Linked(String),
    Failed(LinkError),
    Expired,
}

/// Identifier used when the protocol did not report one.
pub fn fallback_identifier(session_id: &SessionId) -> String {
    format!("{session_id}@s.whatsapp.net")
}

/// Entry point of the engine. Shared by `Arc`.
pub struct Linker {
    protocol: Arc<dyn ProtocolClient>,
    messenger: Arc<dyn Messenger>,
    registry: Arc<SessionRegistry>,
    cooldown: Arc<CooldownTracker>,
    maintenance: Arc<MaintenanceScheduler>,
    active: Arc<ActiveConnections>,
    negotiator: PairingNegotiator,
    qr: QrRenderer,
    sessions_root: PathBuf,
    auth_root: PathBuf,
    settings: LinkSettings,
}

impl Linker {
    /// Build the engine over `sessions_root`, which holds `sessions.json`,
    /// `cooldowns.json` and `auth/<session_id>/`.
    pub fn new(
        protocol: Arc<dyn ProtocolClient>,
        messenger: Arc<dyn Messenger>,
        sessions_root: impl Into<PathBuf>,
        settings: LinkSettings,
    ) -> Self {
        let sessions_root = sessions_root.into();
        let maintenance = MaintenanceScheduler::new(
            &sessions_root,
            settings.cooldown,
            settings.restart_window,
            messenger.clone(),
        );

        Self {
            protocol,
            messenger,
            registry: Arc::new(SessionRegistry::new(sessions_root.join("sessions.json"))),
            cooldown: Arc::new(CooldownTracker::load(sessions_root.join("cooldowns.json"), settings.cooldown)),
            maintenance: Arc::new(maintenance),
            active: Arc::new(ActiveConnections::new()),
            negotiator: PairingNegotiator::new(settings.pairing_attempts, settings.pairing_interval),
            qr: QrRenderer::new(settings.qr_max_size),
            auth_root: sessions_root.join("auth"),
            sessions_root,
            settings,
        }
    }

    /// Replace the process exit used by the maintenance cycle.
    pub fn with_restart_action(mut self, action: RestartAction) -> Self {
        self.maintenance = Arc::new(
            MaintenanceScheduler::new(
                &self.sessions_root,
                self.settings.cooldown,
                self.settings.restart_window,
                self.messenger.clone(),
            )
            .with_restart_action(action),
        );
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn active(&self) -> &Arc<ActiveConnections> {
        &self.active
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceScheduler> {
        &self.maintenance
    }

    pub fn auth_root(&self) -> &Path {
        &self.auth_root
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            browser: self.settings.browser.clone(),
        }
    }

    /// Remove auth directories left behind by attempts a restart interrupted.
    pub fn sweep_orphans(&self) -> usize {
        self.maintenance.sweep_orphans(&self.auth_root, &self.registry)
    }

    /// Start a linking attempt for `request`.
    ///
    /// Returns once the connection is open; the attempt itself runs on its own
    /// task. Errors here mean nothing was started and nothing is left behind.
    pub async fn request_link(self: &Arc<Self>, request: LinkRequest) -> Result<LinkStart, LinkError> {
        let phone = request.phone.as_deref().map(str::trim).unwrap_or_default();
        if request.mode == LinkMode::Code && phone.is_empty() {
            return Err(LinkError::MissingPhone);
        }

        let now = Utc::now();
        if let CooldownDecision::Denied { remaining } = self.cooldown.check_and_reserve(&request.user_id, now) {
            info!("⏳ Link request from {} denied, {}ms left", request.user_id, remaining.as_millis());
            return Ok(LinkStart::Denied { remaining });
        }

        if self.settings.restart_after_cooldown {
            self.maintenance.schedule(request.chat_id);
        }

        let budget = self.settings.budget(request.mode) + self.settings.expiry_grace;
        let attempt = LinkingAttempt::new(SessionId::generate(now), request.mode, &self.auth_root, now, budget);
        info!(
            "🔗 [{}] New {} attempt for {} (budget {}s)",
            attempt.session_id,
            attempt.mode,
            request.user_id,
            budget.as_secs()
        );

        tokio::fs::create_dir_all(&attempt.auth_dir).await?;

        let opened = match self.protocol.open(&attempt.auth_dir, &self.connect_options()).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("[{}] Failed to open connection: {e}", attempt.session_id);
                if let Err(e) = tokio::fs::remove_dir_all(&attempt.auth_dir).await {
                    warn!("[{}] Failed to remove {}: {e}", attempt.session_id, attempt.auth_dir.display());
                }
                return Err(e.into());
            }
        };

        let session_id = attempt.session_id.clone();
        let mode = attempt.mode;
        let this = self.clone();
        let join = tokio::spawn(async move { this.run_attempt(attempt, request, opened, budget).await });

        Ok(LinkStart::Started(AttemptHandle { session_id, mode, join }))
    }

    async fn run_attempt(
        self: Arc<Self>,
        mut attempt: LinkingAttempt,
        request: LinkRequest,
        mut connection: OpenedConnection,
        budget: Duration,
    ) -> AttemptOutcome {
        // Expiry and the update loop race for the latch; the loser's result is dropped.
        let latch = Arc::new(FinishLatch::new());
        let (expire_tx, mut expired) = oneshot::channel();
        let expiry_latch = latch.clone();
        let watchdog = TimeoutWatchdog::arm(budget, move || {
            if expiry_latch.try_finish() {
                let _ = expire_tx.send(());
            }
        });
        let mut transient = Vec::new();

        if request.mode == LinkMode::Code {
            let text = format!("🔗 Preparing a pairing code for +{}...", request.phone.as_deref().unwrap_or_default());
            if let Some(id) = self.notify(&request, &text).await {
                transient.push(id);
            }
        }

        let mut terminal = self
            .drive(&mut attempt, &request, &mut connection, &mut transient, &mut expired)
            .await;
        watchdog.disarm();

        if !matches!(terminal, Terminal::Expired) && !latch.try_finish() {
            debug!("[{}] Expired while handling the last update", attempt.session_id);
            terminal = Terminal::Expired;
        }

        match terminal {
            Terminal::Linked(identifier) => {
                self.commit(&mut attempt, &request, connection, transient, identifier)
                    .await
            }
            Terminal::Failed(e) => self.abort(&mut attempt, &request, connection, transient, e).await,
            Terminal::Expired => {
                self.abort(&mut attempt, &request, connection, transient, LinkError::AttemptExpired)
                    .await
            }
        }
    }

    /// Consume updates until the attempt reaches a terminal state.
    async fn drive(
        &self,
        attempt: &mut LinkingAttempt,
        request: &LinkRequest,
        connection: &mut OpenedConnection,
        transient: &mut Vec<i64>,
        expired: &mut oneshot::Receiver<()>,
    ) -> Terminal {
        let mut reconnects = 0;

        loop {
            let update = tokio::select! {
                biased;

                _ = &mut *expired => return Terminal::Expired,
                update = connection.events.recv() => update,
            };

            let Some(update) = update else {
                warn!("[{}] Update stream ended", attempt.session_id);
                return Terminal::Failed(LinkError::ConnectionLost(None));
            };

            if let Some(challenge) = update.qr.as_deref() {
                transition(attempt, AttemptState::AwaitingCredential);
                match attempt.mode {
                    LinkMode::Code => {
                        let phone = request.phone.as_deref().unwrap_or_default();
                        let handle = connection.handle.clone();
                        let outcome = tokio::select! {
                            biased;

                            _ = &mut *expired => return Terminal::Expired,
                            outcome = async {
                                sleep(self.settings.pairing_warmup).await;
                                self.negotiator.negotiate(handle.as_ref(), phone).await
                            } => outcome,
                        };

                        match outcome {
                            PairingOutcome::Code(raw) => {
                                let text = format!(
                                    "🔑 Your pairing code: {}\n\nOpen Linked devices > Link with phone number and enter it. It expires in {}s.",
                                    format_pairing_code(&raw),
                                    self.settings.code_expiry.as_secs()
                                );
                                if let Some(id) = self.notify(request, &text).await {
                                    transient.push(id);
                                }
                            }
                            PairingOutcome::NotObtained => {
                                return Terminal::Failed(LinkError::NegotiationExhausted);
                            }
                        }
                    }
                    LinkMode::Qr => {
                        if let Some(id) = self.send_qr(attempt, request, challenge).await {
                            transient.push(id);
                        }
                    }
                }
            }

            if update.is_new_login {
                transition(attempt, AttemptState::Authenticating);
            }

            match update.connection {
                Some(ConnectionState::Open) => {
                    let identifier = update
                        .account_id
                        .clone()
                        .unwrap_or_else(|| fallback_identifier(&attempt.session_id));
                    return Terminal::Linked(identifier);
                }
                Some(ConnectionState::Close) => match update.last_disconnect {
                    Some(reason) if reason.is_recoverable() && reconnects < self.settings.max_reconnects => {
                        reconnects += 1;
                        info!(
                            "🔄 [{}] {reason}, reopening ({reconnects}/{})",
                            attempt.session_id, self.settings.max_reconnects
                        );
                        transition(attempt, AttemptState::Authenticating);
                        if let Err(e) = connection.handle.close().await {
                            debug!("[{}] Close before reopen failed: {e}", attempt.session_id);
                        }
                        match self.protocol.open(&attempt.auth_dir, &self.connect_options()).await {
                            Ok(reopened) => *connection = reopened,
                            Err(e) => return Terminal::Failed(e.into()),
                        }
                    }
                    reason => {
                        if reason == Some(DisconnectReason::LoggedOut) {
                            self.forget(&update, &attempt.session_id);
                        }
                        return Terminal::Failed(LinkError::ConnectionLost(reason));
                    }
                },
                Some(ConnectionState::Connecting) | None => {}
            }
        }
    }

    async fn send_qr(&self, attempt: &LinkingAttempt, request: &LinkRequest, payload: &str) -> Option<i64> {
        let image = match self.qr.render(payload) {
            Ok(image) => image,
            Err(e) => {
                warn!("[{}] {e}", attempt.session_id);
                return None;
            }
        };
        debug!("[{}] QR rendered {}x{}", attempt.session_id, image.width, image.height);

        let caption = format!(
            "📷 Scan this QR from Linked devices > Link a device. It expires in {}s.",
            self.settings.qr_expiry.as_secs()
        );
        match self
            .messenger
            .send_image(request.chat_id, image.png, Some(&caption), request.reply_to)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("[{}] QR not delivered: {e}", attempt.session_id);
                None
            }
        }
    }

    /// Remove the record an authenticated logged-out signal refers to.
    fn forget(&self, update: &ConnectionUpdate, session_id: &SessionId) {
        let identifier = update
            .account_id
            .clone()
            .unwrap_or_else(|| fallback_identifier(session_id));
        match self.registry.remove(&identifier) {
            Ok(true) => info!("🗑️ [{session_id}] Logged out, removed record {identifier}"),
            Ok(false) => {}
            Err(e) => warn!("[{session_id}] Failed to remove record {identifier}: {e}"),
        }
    }

    async fn commit(
        self: &Arc<Self>,
        attempt: &mut LinkingAttempt,
        request: &LinkRequest,
        connection: OpenedConnection,
        transient: Vec<i64>,
        identifier: String,
    ) -> AttemptOutcome {
        transition(attempt, AttemptState::Linked);

        let now = Utc::now();
        let record = SessionRecord {
            identifier: identifier.clone(),
            auth_directory: attempt.auth_dir.clone(),
            active: true,
            created_at: now,
            last_updated: now,
            browser_label: self.settings.browser.to_string(),
        };
        if let Err(e) = self.registry.add(record) {
            error!("[{}] Failed to persist session {identifier}: {e}", attempt.session_id);
        }

        self.notify(request, &format!("✅ Linked as sub-bot {identifier}")).await;
        self.retract(request.chat_id, &transient).await;

        let OpenedConnection { handle, events } = connection;
        self.active.insert(&identifier, handle.clone());
        info!("🤖 [{}] Linked {identifier} ({} live)", attempt.session_id, self.active.len());

        let this = self.clone();
        let auth_dir = attempt.auth_dir.clone();
        let supervised = identifier.clone();
        tokio::spawn(async move { this.supervise(supervised, auth_dir, handle, events).await });

        AttemptOutcome::Linked { identifier }
    }

    async fn abort(
        &self,
        attempt: &mut LinkingAttempt,
        request: &LinkRequest,
        connection: OpenedConnection,
        transient: Vec<i64>,
        error: LinkError,
    ) -> AttemptOutcome {
        let expired = matches!(error, LinkError::AttemptExpired);
        transition(attempt, if expired { AttemptState::Expired } else { AttemptState::Failed });

        let OpenedConnection { handle, events } = connection;
        teardown(attempt.session_id.as_str(), handle.as_ref(), &attempt.auth_dir, Some(events)).await;

        self.notify(request, failure_notice(&error)).await;
        self.retract(request.chat_id, &transient).await;

        warn!("[{}] {} ({error})", attempt.session_id, attempt.state);
        if expired {
            AttemptOutcome::Expired
        } else {
            AttemptOutcome::Failed(error)
        }
    }

    async fn notify(&self, request: &LinkRequest, text: &str) -> Option<i64> {
        match self.messenger.send_text(request.chat_id, text, request.reply_to).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Notice to chat {} not delivered: {e}", request.chat_id);
                None
            }
        }
    }

    async fn retract(&self, chat_id: i64, message_ids: &[i64]) {
        for &id in message_ids {
            if let Err(e) = self.messenger.delete_message(chat_id, id).await {
                debug!("Could not retract message {id}: {e}");
            }
        }
    }

    /// Watch a linked connection until it is logged out or gives up.
    async fn supervise(
        self: Arc<Self>,
        identifier: String,
        auth_dir: PathBuf,
        mut handle: Arc<dyn Connection>,
        mut events: mpsc::Receiver<ConnectionUpdate>,
    ) {
        let mut reconnects = 0;

        loop {
            let reason = loop {
                match events.recv().await {
                    Some(update) => match update.connection {
                        Some(ConnectionState::Close) => break update.last_disconnect,
                        Some(ConnectionState::Open) => reconnects = 0,
                        _ => {}
                    },
                    None => break None,
                }
            };

            if !self.active.holds(&identifier, &handle) {
                info!("🔌 {identifier} was linked again elsewhere, dropping the old connection");
                if let Err(e) = handle.close().await {
                    debug!("Close failed for {identifier}: {e}");
                }
                return;
            }

            match reason {
                Some(DisconnectReason::LoggedOut) => {
                    info!("👋 {identifier} logged out");
                    if self.active.remove_if_same(&identifier, &handle) {
                        if let Err(e) = self.registry.remove(&identifier) {
                            warn!("Failed to remove record {identifier}: {e}");
                        }
                    }
                    teardown(&identifier, handle.as_ref(), &auth_dir, Some(events)).await;
                    return;
                }
                Some(reason) if reason.is_transient() && reconnects < self.settings.max_reconnects => {
                    reconnects += 1;
                    warn!(
                        "🔌 {identifier} disconnected ({reason}), reopening ({reconnects}/{})",
                        self.settings.max_reconnects
                    );
                    self.mark_active(&identifier, false);
                    if let Err(e) = handle.close().await {
                        debug!("Close before reopen failed for {identifier}: {e}");
                    }
                    sleep(RECONNECT_DELAY).await;

                    if !self.active.holds(&identifier, &handle) {
                        info!("🔌 {identifier} was linked again while reconnecting, not reopening");
                        return;
                    }
                    match self.protocol.open(&auth_dir, &self.connect_options()).await {
                        Ok(reopened) => {
                            self.active.insert(&identifier, reopened.handle.clone());
                            handle = reopened.handle;
                            events = reopened.events;
                            self.mark_active(&identifier, true);
                        }
                        Err(e) => {
                            error!("Failed to reopen {identifier}: {e}");
                            self.active.remove_if_same(&identifier, &handle);
                            return;
                        }
                    }
                }
                reason => {
                    match reason {
                        Some(reason) => warn!("🔌 {identifier} closed ({reason}), giving up"),
                        None => warn!("🔌 {identifier} update stream ended"),
                    }
                    if self.active.remove_if_same(&identifier, &handle) {
                        self.mark_active(&identifier, false);
                    }
                    if let Err(e) = handle.close().await {
                        debug!("Close failed for {identifier}: {e}");
                    }
                    return;
                }
            }
        }
    }

    /// Log a linked session out and forget it. Returns false if it was unknown.
    pub async fn unlink(&self, identifier: &str) -> Result<bool, LinkError> {
        let record = self.registry.get(identifier);
        let live = self.active.remove(identifier);
        if record.is_none() && live.is_none() {
            return Ok(false);
        }

        if let Some(handle) = live {
            if let Err(e) = handle.logout().await {
                warn!("Logout of {identifier} failed: {e}");
            }
            if let Err(e) = handle.close().await {
                debug!("Close failed for {identifier}: {e}");
            }
        }

        if let Err(e) = self.registry.remove(identifier) {
            warn!("Failed to remove record {identifier}: {e}");
        }
        if let Some(record) = record {
            match tokio::fs::remove_dir_all(&record.auth_directory).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!("👋 Unlinked {identifier}");
        Ok(true)
    }

    fn mark_active(&self, identifier: &str, active: bool) {
        if let Err(e) = self.registry.set_active(identifier, active) {
            warn!("Failed to mark {identifier} active={active}: {e}");
        }
    }

    /// Reopen every active session from the registry. Returns how many came up.
    pub async fn restore_linked(self: &Arc<Self>) -> usize {
        let mut restored = 0;

        for record in self.registry.read_all().into_values().filter(|r| r.active) {
            if self.active.contains(&record.identifier) {
                continue;
            }

            match self.protocol.open(&record.auth_directory, &self.connect_options()).await {
                Ok(opened) => {
                    self.active.insert(&record.identifier, opened.handle.clone());
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.supervise(record.identifier, record.auth_directory, opened.handle, opened.events)
                            .await
                    });
                    restored += 1;
                }
                Err(e) => {
                    warn!("Failed to restore {}: {e}", record.identifier);
                    self.mark_active(&record.identifier, false);
                }
            }
        }

        if restored > 0 {
            info!("🤖 Restored {restored} linked session(s)");
        }
        restored
    }
}

/// The one notice a user sees when an attempt does not link.
pub fn failure_notice(error: &LinkError) -> &'static str {
    match error {
        LinkError::NegotiationExhausted => NO_CODE_NOTICE,
        _ => CONNECT_FAILED_NOTICE,
    }
}

fn transition(attempt: &mut LinkingAttempt, to: AttemptState) {
    if attempt.state != to {
        debug!("[{}] {} -> {}", attempt.session_id, attempt.state, to);
        attempt.state = to;
    }
}
